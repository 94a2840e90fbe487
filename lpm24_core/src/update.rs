//! Projection of rule changes onto the lookup arrays.
//!
//! Every function here runs under the writer lock. Readers may be walking
//! the same slots at any time, so each slot changes with a single store and
//! a new group is filled completely before the level-1 entry that points at
//! it is published with release ordering. A group that stops being
//! referenced is only handed back to the pool after its level-1 entry has
//! been overwritten.

use crate::constants::TBL8_GROUP_NUM_ENTRIES;
use crate::entry::{Tbl24Entry, Tbl8Entry};
use crate::errors::Error;
use crate::groups::{GroupPool, Recycle, Tables};
use crate::helpers::{depth_to_range, group_start, tbl24_index};
use log::{debug, error, trace};
use std::sync::atomic::Ordering;

/// The next-longest rule that takes over the range of a deleted one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cover {
    pub depth: u8,
    pub next_hop: u32,
}

/// Project a rule of depth 1..=24 over its level-1 range.
pub fn add_depth_small(tables: &Tables, ip_masked: u32, depth: u8, next_hop: u32) {
    let start = tbl24_index(ip_masked);
    let leaf = Tbl24Entry::Leaf { depth, next_hop };

    for i in start..start + depth_to_range(depth) {
        match tables.tbl24(i, Ordering::Relaxed) {
            Tbl24Entry::Invalid => tables.set_tbl24(i, leaf, Ordering::Release),
            Tbl24Entry::Leaf { depth: d, .. } if d <= depth => {
                tables.set_tbl24(i, leaf, Ordering::Release)
            }
            Tbl24Entry::Leaf { .. } => {}
            Tbl24Entry::Group { group } => {
                // Longer rules already live in the group; only fill the
                // slots they leave to us.
                let g = group_start(group);
                for j in g..g + TBL8_GROUP_NUM_ENTRIES {
                    if tables.tbl8(j).yields_to(depth) {
                        tables.set_tbl8(j, Tbl8Entry::leaf(depth, next_hop));
                    }
                }
            }
        }
    }
    trace!(
        "[UPDATE] projected {:#010x}/{} over {} level-1 slots",
        ip_masked,
        depth,
        depth_to_range(depth)
    );
}

/// Project a rule of depth 25..=32 into the extension group of its /24,
/// creating the group when there is none yet.
pub fn add_depth_big(
    tables: &Tables,
    pool: &mut GroupPool,
    ip_masked: u32,
    depth: u8,
    next_hop: u32,
) -> Result<(), Error> {
    let idx = tbl24_index(ip_masked);
    let offset = (ip_masked & 0xFF) as usize;
    let range = depth_to_range(depth);
    let leaf = Tbl8Entry::leaf(depth, next_hop);

    match tables.tbl24(idx, Ordering::Relaxed) {
        Tbl24Entry::Group { group } => {
            let g = group_start(group);
            for j in g + offset..g + offset + range {
                if tables.tbl8(j).yields_to(depth) {
                    tables.set_tbl8(j, leaf);
                }
            }
        }
        current => {
            let group = pool.allocate(tables)?;
            let g = group_start(group);
            // A leaf that covered the whole /24 keeps answering for the
            // slots the new rule does not take.
            if let Tbl24Entry::Leaf { depth, next_hop } = current {
                let inherited = Tbl8Entry::leaf(depth, next_hop);
                for j in g..g + TBL8_GROUP_NUM_ENTRIES {
                    tables.set_tbl8(j, inherited);
                }
            }
            for j in g + offset..g + offset + range {
                tables.set_tbl8(j, leaf);
            }
            tables.set_tbl24(idx, Tbl24Entry::Group { group }, Ordering::Release);
            debug!(
                "[UPDATE] group {} now extends level-1 slot {:#08x}",
                group, idx
            );
        }
    }
    Ok(())
}

/// Remove a rule of depth 1..=24, handing its range to `cover` if any.
pub fn delete_depth_small(tables: &Tables, ip_masked: u32, depth: u8, cover: Option<Cover>) {
    let start = tbl24_index(ip_masked);
    let replacement = match cover {
        Some(c) => Tbl24Entry::Leaf {
            depth: c.depth,
            next_hop: c.next_hop,
        },
        None => Tbl24Entry::Invalid,
    };

    for i in start..start + depth_to_range(depth) {
        match tables.tbl24(i, Ordering::Relaxed) {
            Tbl24Entry::Group { group } => {
                let g = group_start(group);
                for j in g..g + TBL8_GROUP_NUM_ENTRIES {
                    let e = tables.tbl8(j);
                    if e.depth > depth {
                        continue;
                    }
                    let next = match cover {
                        Some(c) => Tbl8Entry::leaf(c.depth, c.next_hop),
                        // Keep the depth so stale slots still order correctly.
                        None => Tbl8Entry { valid: false, ..e },
                    };
                    tables.set_tbl8(j, next);
                }
            }
            Tbl24Entry::Leaf { depth: d, .. } if d > depth => {}
            _ => tables.set_tbl24(i, replacement, Ordering::Release),
        }
    }
}

/// Remove a rule of depth 25..=32 from its group, then fold the group back
/// into level 1 if nothing in it needs a group any more.
pub fn delete_depth_big(
    tables: &Tables,
    pool: &mut GroupPool,
    ip_masked: u32,
    depth: u8,
    cover: Option<Cover>,
) -> Result<(), Error> {
    let idx = tbl24_index(ip_masked);
    let Tbl24Entry::Group { group } = tables.tbl24(idx, Ordering::Relaxed) else {
        error!(
            "[UPDATE] no group behind {:#010x}/{} at level-1 slot {:#08x}",
            ip_masked, depth, idx
        );
        debug_assert!(false, "deep rule without an extension group");
        return Ok(());
    };

    let g = group_start(group);
    let offset = (ip_masked & 0xFF) as usize;
    for j in g + offset..g + offset + depth_to_range(depth) {
        let e = tables.tbl8(j);
        if e.depth > depth {
            continue;
        }
        let next = match cover {
            Some(c) => Tbl8Entry::leaf(c.depth, c.next_hop),
            None => Tbl8Entry { valid: false, ..e },
        };
        tables.set_tbl8(j, next);
    }

    let relinked = match tables.recycle_check(group) {
        Recycle::InUse => return Ok(()),
        Recycle::Empty => Tbl24Entry::Invalid,
        Recycle::Collapse { depth, next_hop } => Tbl24Entry::Leaf { depth, next_hop },
    };
    // Readers must stop reaching the group before it can be reused.
    tables.set_tbl24(idx, relinked, Ordering::Release);
    debug!(
        "[UPDATE] group {} unlinked from level-1 slot {:#08x} ({:?})",
        group, idx, relinked
    );
    pool.release(tables, group)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::helpers::canonical;

    fn small(tables: &Tables, ip: u32, depth: u8, nh: u32) {
        add_depth_small(tables, canonical(ip, depth), depth, nh);
    }

    #[test]
    fn shorter_rule_does_not_override_longer() {
        let tables = Tables::new(1);
        small(&tables, 0x0A01_0000, 16, 2);
        small(&tables, 0x0A00_0000, 8, 1);
        assert_eq!(tables.lookup(0x0A01_0203), Some(2));
        assert_eq!(tables.lookup(0x0A02_0203), Some(1));
        assert_eq!(tables.lookup(0x0B00_0000), None);
    }

    #[test]
    fn deep_rule_inherits_covering_leaf() {
        let tables = Tables::new(1);
        let mut pool = GroupPool::new();
        small(&tables, 0x0A00_0000, 8, 1);
        add_depth_big(&tables, &mut pool, 0x0A01_0280, 25, 9).unwrap();
        assert_eq!(pool.in_use(), 1);
        assert_eq!(tables.lookup(0x0A01_0281), Some(9));
        assert_eq!(tables.lookup(0x0A01_0201), Some(1));
        // A later short rule fills only what the deep rule leaves.
        small(&tables, 0x0A01_0000, 16, 3);
        assert_eq!(tables.lookup(0x0A01_02FF), Some(9));
        assert_eq!(tables.lookup(0x0A01_0201), Some(3));
    }

    #[test]
    fn deep_rule_without_group_fails_cleanly() {
        let tables = Tables::new(1);
        let mut pool = GroupPool::new();
        add_depth_big(&tables, &mut pool, 0x0A01_0200, 32, 1).unwrap();
        assert_eq!(
            add_depth_big(&tables, &mut pool, 0x0B01_0200, 32, 2),
            Err(Error::OutOfSpace)
        );
        assert_eq!(tables.lookup(0x0B01_0200), None);
        assert_eq!(
            tables.tbl24(tbl24_index(0x0B01_0200), Ordering::Relaxed),
            Tbl24Entry::Invalid
        );
    }

    #[test]
    fn delete_big_collapses_back_to_leaf() {
        let tables = Tables::new(1);
        let mut pool = GroupPool::new();
        small(&tables, 0x0A00_0000, 8, 1);
        add_depth_big(&tables, &mut pool, 0x0A01_0203, 32, 7).unwrap();
        let cover = Cover {
            depth: 8,
            next_hop: 1,
        };
        delete_depth_big(&tables, &mut pool, 0x0A01_0203, 32, Some(cover)).unwrap();
        assert_eq!(pool.in_use(), 0);
        assert_eq!(
            tables.tbl24(tbl24_index(0x0A01_0203), Ordering::Relaxed),
            Tbl24Entry::Leaf {
                depth: 8,
                next_hop: 1
            }
        );
    }

    #[test]
    fn delete_big_without_cover_empties_group() {
        let tables = Tables::new(1);
        let mut pool = GroupPool::new();
        add_depth_big(&tables, &mut pool, 0x0A01_0200, 30, 7).unwrap();
        delete_depth_big(&tables, &mut pool, 0x0A01_0200, 30, None).unwrap();
        assert_eq!(pool.in_use(), 0);
        assert_eq!(tables.lookup(0x0A01_0201), None);
        assert_eq!(
            tables.tbl24(tbl24_index(0x0A01_0200), Ordering::Relaxed),
            Tbl24Entry::Invalid
        );
    }

    #[test]
    fn delete_small_reaches_into_groups() {
        let tables = Tables::new(1);
        let mut pool = GroupPool::new();
        small(&tables, 0x0A00_0000, 8, 1);
        small(&tables, 0x0A01_0000, 16, 2);
        add_depth_big(&tables, &mut pool, 0x0A01_0200, 26, 5).unwrap();

        delete_depth_small(
            &tables,
            0x0A01_0000,
            16,
            Some(Cover {
                depth: 8,
                next_hop: 1,
            }),
        );
        assert_eq!(tables.lookup(0x0A01_0201), Some(5));
        assert_eq!(tables.lookup(0x0A01_0250), Some(1));
        assert_eq!(tables.lookup(0x0A01_0301), Some(1));

        delete_depth_small(&tables, 0x0A00_0000, 8, None);
        assert_eq!(tables.lookup(0x0A01_0201), Some(5));
        assert_eq!(tables.lookup(0x0A01_0250), None);
        assert_eq!(tables.lookup(0x0A05_0000), None);
    }
}
