//! Level-1 / level-2 arrays and the extension-group allocator.
//!
//! Readers only ever touch [`Tables`]. Everything that decides which group
//! is free lives in [`GroupPool`], owned by the single writer.

use crate::constants::{MAX_DEPTH_TBL24, TBL24_NUM_ENTRIES, TBL8_GROUP_NUM_ENTRIES};
use crate::entry::{Tbl24Entry, Tbl8Entry};
use crate::errors::Error;
use crate::helpers::{group_start, tbl24_index};
use crate::qsbr::{DeferQueue, Qsbr};
use crate::types::{RcuConfig, ReclaimMode};
use log::{debug, error, info, warn};
use metrics::{counter, gauge};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Zero-filled atomics straight from the allocator; the level-1 array alone
/// is 64 MiB and mostly never touched.
fn zeroed_atomics(len: usize) -> Box<[AtomicU32]> {
    let raw: Box<[u32]> = vec![0u32; len].into_boxed_slice();
    // SAFETY: AtomicU32 has the same size, alignment and bit validity as
    // u32, so the allocation and its layout are reused unchanged.
    unsafe { Box::from_raw(Box::into_raw(raw) as *mut [AtomicU32]) }
}

/// The two lookup arrays.
pub struct Tables {
    tbl24: Box<[AtomicU32]>,
    tbl8: Box<[AtomicU32]>,
    number_groups: u32,
}

/// Verdict of a recycle scan over one group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recycle {
    /// Every slot is invalid.
    Empty,
    /// Every slot holds the same level-1-depth leaf.
    Collapse { depth: u8, next_hop: u32 },
    InUse,
}

impl Tables {
    pub fn new(number_groups: u32) -> Self {
        Self {
            tbl24: zeroed_atomics(TBL24_NUM_ENTRIES),
            tbl8: zeroed_atomics(number_groups as usize * TBL8_GROUP_NUM_ENTRIES),
            number_groups,
        }
    }

    pub fn number_groups(&self) -> u32 {
        self.number_groups
    }

    #[inline(always)]
    pub fn tbl24(&self, idx: usize, order: Ordering) -> Tbl24Entry {
        Tbl24Entry::unpack(self.tbl24[idx].load(order))
    }

    #[inline(always)]
    pub fn set_tbl24(&self, idx: usize, entry: Tbl24Entry, order: Ordering) {
        self.tbl24[idx].store(entry.pack(), order);
    }

    #[inline(always)]
    pub fn tbl8(&self, idx: usize) -> Tbl8Entry {
        Tbl8Entry::unpack(self.tbl8[idx].load(Ordering::Relaxed))
    }

    #[inline(always)]
    pub fn set_tbl8(&self, idx: usize, entry: Tbl8Entry) {
        self.tbl8[idx].store(entry.pack(), Ordering::Relaxed);
    }

    /// Single pass, no retries. The acquire load of the level-1 entry pairs
    /// with the release store that published it, so a group reached through
    /// a pointer is always fully initialised.
    #[inline]
    pub fn lookup(&self, ip: u32) -> Option<u32> {
        match self.tbl24(tbl24_index(ip), Ordering::Acquire) {
            Tbl24Entry::Invalid => None,
            Tbl24Entry::Leaf { next_hop, .. } => Some(next_hop),
            Tbl24Entry::Group { group } => {
                let e = self.tbl8(group_start(group) + (ip & 0xFF) as usize);
                e.valid.then_some(e.next_hop)
            }
        }
    }

    /// Linear scan for an unoccupied group; claims and clears it.
    fn claim_group(&self) -> Option<u32> {
        (0..self.number_groups)
            .find(|&g| !self.tbl8(group_start(g)).group_occupied)
            .inspect(|&g| {
                let start = group_start(g);
                for i in start..start + TBL8_GROUP_NUM_ENTRIES {
                    self.set_tbl8(i, Tbl8Entry::EMPTY);
                }
            })
    }

    /// Marks `group` unoccupied. Only valid once no reader can reach it.
    fn free_group(&self, group: u32) {
        let start = group_start(group);
        for i in start..start + TBL8_GROUP_NUM_ENTRIES {
            self.tbl8[i].store(0, Ordering::Relaxed);
        }
    }

    pub fn recycle_check(&self, group: u32) -> Recycle {
        let start = group_start(group);
        let slots = start..start + TBL8_GROUP_NUM_ENTRIES;
        let first = self.tbl8(start);

        if first.valid {
            // Only a rule that covered the whole /24 can be folded back.
            let uniform = first.depth <= MAX_DEPTH_TBL24
                && slots.clone().all(|i| {
                    let e = self.tbl8(i);
                    e.valid && e.depth == first.depth && e.next_hop == first.next_hop
                });
            return if uniform {
                Recycle::Collapse {
                    depth: first.depth,
                    next_hop: first.next_hop,
                }
            } else {
                Recycle::InUse
            };
        }

        if slots.skip(1).any(|i| self.tbl8(i).valid) {
            Recycle::InUse
        } else {
            Recycle::Empty
        }
    }

    pub fn clear_tbl24(&self) {
        for slot in self.tbl24.iter() {
            slot.store(0, Ordering::Release);
        }
    }

    pub fn clear_tbl8(&self) {
        for slot in self.tbl8.iter() {
            slot.store(0, Ordering::Relaxed);
        }
    }
}

/// Reclamation binding of a table.
enum Reclaimer {
    Sync(Arc<Qsbr>),
    Defer(DeferQueue),
}

/// Writer-side bookkeeping for extension groups.
pub struct GroupPool {
    in_use: u32,
    reclaimer: Option<Reclaimer>,
    // Unlinked groups the defer queue could not take yet.
    stranded: Vec<u32>,
}

impl GroupPool {
    pub fn new() -> Self {
        Self {
            in_use: 0,
            reclaimer: None,
            stranded: Vec::new(),
        }
    }

    pub fn in_use(&self) -> u32 {
        self.in_use
    }

    pub fn pending(&self) -> u32 {
        let queued = match &self.reclaimer {
            Some(Reclaimer::Defer(dq)) => dq.len() as u32,
            _ => 0,
        };
        queued + self.stranded.len() as u32
    }

    pub fn bind(&mut self, cfg: RcuConfig, number_groups: u32) -> Result<(), Error> {
        if self.reclaimer.is_some() {
            return Err(Error::AlreadyBound);
        }
        self.reclaimer = Some(match cfg.mode {
            ReclaimMode::Sync => Reclaimer::Sync(cfg.qsbr),
            ReclaimMode::DeferQueue {
                capacity,
                reclaim_threshold,
                reclaim_max,
            } => {
                let capacity = if capacity == 0 { number_groups } else { capacity };
                Reclaimer::Defer(DeferQueue::new(
                    cfg.qsbr,
                    capacity,
                    reclaim_threshold,
                    reclaim_max,
                )?)
            }
        });
        info!("[TBL8] reclamation bound: {:?}", cfg.mode);
        Ok(())
    }

    fn report(&self, tables: &Tables) {
        gauge!("lpm_free_groups").set((tables.number_groups() - self.in_use) as f64);
    }

    pub fn allocate(&mut self, tables: &Tables) -> Result<u32, Error> {
        let mut group = tables.claim_group();
        if group.is_none() && self.reclaimer.is_some() {
            debug!("[TBL8] pool exhausted, attempting one reclaim cycle");
            self.reclaim(tables);
            group = tables.claim_group();
        }
        match group {
            Some(g) => {
                self.in_use += 1;
                counter!("lpm_groups_allocated_total").increment(1);
                self.report(tables);
                debug!("[TBL8] allocated group {} ({} in use)", g, self.in_use);
                Ok(g)
            }
            None => {
                counter!("lpm_group_alloc_failures_total").increment(1);
                warn!(
                    "[TBL8] no free group among {} (pending reclaims: {})",
                    tables.number_groups(),
                    self.pending()
                );
                Err(Error::OutOfSpace)
            }
        }
    }

    /// Hands an unlinked group back. The caller must already have removed
    /// every level-1 reference to it.
    pub fn release(&mut self, tables: &Tables, group: u32) -> Result<(), Error> {
        let in_use = &mut self.in_use;
        let mut free = |g: u32| {
            tables.free_group(g);
            *in_use -= 1;
            counter!("lpm_groups_released_total").increment(1);
        };
        match &mut self.reclaimer {
            None => free(group),
            Some(Reclaimer::Sync(qsbr)) => {
                qsbr.synchronize();
                free(group);
            }
            Some(Reclaimer::Defer(dq)) => {
                while let Some(&old) = self.stranded.last() {
                    if dq.enqueue(old, &mut free).is_err() {
                        break;
                    }
                    self.stranded.pop();
                }
                if let Err(e) = dq.enqueue(group, &mut free) {
                    error!("[TBL8] failed to defer release of group {}", group);
                    self.stranded.push(group);
                    self.report(tables);
                    return Err(e);
                }
            }
        }
        self.report(tables);
        Ok(())
    }

    /// One reclaim cycle over the defer queue. Returns the groups freed.
    pub fn reclaim(&mut self, tables: &Tables) -> u32 {
        let Some(Reclaimer::Defer(dq)) = &mut self.reclaimer else {
            return 0;
        };
        let in_use = &mut self.in_use;
        let mut free = |g: u32| {
            tables.free_group(g);
            *in_use -= 1;
            counter!("lpm_groups_released_total").increment(1);
        };
        let (freed, _) = dq.reclaim(dq.reclaim_max(), &mut free);
        // Room may have opened up for groups that were turned away.
        while let Some(&old) = self.stranded.last() {
            if dq.enqueue(old, &mut free).is_err() {
                break;
            }
            self.stranded.pop();
        }
        self.report(tables);
        freed
    }

    /// Waits for readers and frees everything still pending.
    pub fn drain(&mut self, tables: &Tables) -> u32 {
        let qsbr = self.qsbr().cloned();
        let in_use = &mut self.in_use;
        let mut free = |g: u32| {
            tables.free_group(g);
            *in_use -= 1;
            counter!("lpm_groups_released_total").increment(1);
        };
        let mut freed = 0;
        if let Some(Reclaimer::Defer(dq)) = &mut self.reclaimer {
            freed += dq.drain(&mut free);
        }
        if !self.stranded.is_empty() {
            if let Some(q) = qsbr {
                q.synchronize();
            }
            for g in self.stranded.drain(..) {
                free(g);
                freed += 1;
            }
        }
        self.report(tables);
        freed
    }

    fn qsbr(&self) -> Option<&Arc<Qsbr>> {
        match &self.reclaimer {
            Some(Reclaimer::Sync(q)) => Some(q),
            Some(Reclaimer::Defer(dq)) => Some(dq.qsbr()),
            None => None,
        }
    }

    /// Forget every group. Level-1 must already be cleared; this waits for
    /// readers still inside a group before the pending queue is dropped.
    pub fn reset(&mut self, tables: &Tables) {
        if let Some(q) = self.qsbr().cloned() {
            q.synchronize();
        }
        if let Some(Reclaimer::Defer(dq)) = &mut self.reclaimer {
            dq.drain(|_| {});
        }
        self.stranded.clear();
        tables.clear_tbl8();
        self.in_use = 0;
        self.report(tables);
    }
}

impl Default for GroupPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_and_free_cycle() {
        let tables = Tables::new(2);
        let mut pool = GroupPool::new();
        let a = pool.allocate(&tables).unwrap();
        let b = pool.allocate(&tables).unwrap();
        assert_ne!(a, b);
        assert_eq!(pool.allocate(&tables), Err(Error::OutOfSpace));
        pool.release(&tables, a).unwrap();
        assert_eq!(pool.in_use(), 1);
        assert_eq!(pool.allocate(&tables), Ok(a));
    }

    #[test]
    fn recycle_verdicts() {
        let tables = Tables::new(1);
        let mut pool = GroupPool::new();
        let g = pool.allocate(&tables).unwrap();
        assert_eq!(tables.recycle_check(g), Recycle::Empty);

        let start = group_start(g);
        for i in start..start + TBL8_GROUP_NUM_ENTRIES {
            tables.set_tbl8(i, Tbl8Entry::leaf(16, 3));
        }
        assert_eq!(
            tables.recycle_check(g),
            Recycle::Collapse {
                depth: 16,
                next_hop: 3
            }
        );

        tables.set_tbl8(start + 200, Tbl8Entry::leaf(30, 4));
        assert_eq!(tables.recycle_check(g), Recycle::InUse);

        tables.set_tbl8(start + 200, Tbl8Entry::EMPTY);
        assert_eq!(tables.recycle_check(g), Recycle::InUse);
    }

    #[test]
    fn deferred_release_is_freed_by_reclaim() {
        let tables = Tables::new(1);
        let mut pool = GroupPool::new();
        let qsbr = Qsbr::new(1);
        pool.bind(
            RcuConfig {
                qsbr: Arc::clone(&qsbr),
                mode: ReclaimMode::DeferQueue {
                    capacity: 0,
                    reclaim_threshold: 1,
                    reclaim_max: 0,
                },
            },
            tables.number_groups(),
        )
        .unwrap();
        let g = pool.allocate(&tables).unwrap();
        pool.release(&tables, g).unwrap();
        assert_eq!(pool.pending(), 1);
        // No online readers, so the allocation-time reclaim frees it.
        assert_eq!(pool.allocate(&tables), Ok(g));
        assert_eq!(pool.pending(), 0);
    }
}
