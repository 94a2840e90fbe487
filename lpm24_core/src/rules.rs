//! Rule store: the authoritative list of (prefix, depth, next hop) rules.
//!
//! Rules sit in one flat array split into 32 contiguous windows, one per
//! depth, ordered by increasing depth. Non-empty windows are packed from
//! index 0 with no gaps; the `first_rule` of an empty window is stale and
//! never read.

use crate::constants::MAX_DEPTH;
use crate::errors::Error;
use crate::helpers::canonical;
use crate::types::{Rule, RuleInfo};
use log::trace;
use std::ops::Range;

/// What `RuleStore::add` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAdd {
    Inserted(u32),
    Updated { index: u32, previous_next_hop: u32 },
    Unchanged,
}

pub struct RuleStore {
    rules: Box<[Rule]>,
    info: [RuleInfo; MAX_DEPTH as usize],
}

impl RuleStore {
    pub fn new(max_rules: u32) -> Self {
        Self {
            rules: vec![Rule::default(); max_rules as usize].into_boxed_slice(),
            info: [RuleInfo::default(); MAX_DEPTH as usize],
        }
    }

    pub fn capacity(&self) -> u32 {
        self.rules.len() as u32
    }

    pub fn len(&self) -> u32 {
        self.info.iter().map(|w| w.used_rules).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    fn window(&self, depth: u8) -> Range<usize> {
        let w = self.info[depth as usize - 1];
        let first = w.first_rule as usize;
        first..first + w.used_rules as usize
    }

    pub fn get(&self, index: u32) -> Rule {
        self.rules[index as usize]
    }

    /// Index of the rule for an already-masked prefix.
    pub fn find(&self, ip_masked: u32, depth: u8) -> Option<u32> {
        self.window(depth)
            .find(|&i| self.rules[i].ip == ip_masked)
            .map(|i| i as u32)
    }

    /// Stores a rule, or updates the next hop of an existing one.
    ///
    /// Capacity is checked before any window is shifted, so a failed add
    /// leaves the store untouched.
    pub fn add(&mut self, ip_masked: u32, depth: u8, next_hop: u32) -> Result<RuleAdd, Error> {
        let d = depth as usize - 1;

        for i in self.window(depth) {
            let rule = &mut self.rules[i];
            if rule.ip == ip_masked {
                if rule.next_hop == next_hop {
                    return Ok(RuleAdd::Unchanged);
                }
                let previous_next_hop = rule.next_hop;
                rule.next_hop = next_hop;
                return Ok(RuleAdd::Updated {
                    index: i as u32,
                    previous_next_hop,
                });
            }
        }

        if self.len() >= self.capacity() {
            return Err(Error::OutOfSpace);
        }

        let rule_index = if self.info[d].used_rules > 0 {
            self.info[d].first_rule + self.info[d].used_rules
        } else {
            // Empty window: it starts where the nearest shallower
            // non-empty window ends.
            let start = self.info[..d]
                .iter()
                .rev()
                .find(|w| w.used_rules > 0)
                .map_or(0, |w| w.first_rule + w.used_rules);
            self.info[d].first_rule = start;
            start
        };

        // Make room: every deeper non-empty window moves its first rule to
        // just past its end, deepest first.
        for i in (d + 1..MAX_DEPTH as usize).rev() {
            let w = self.info[i];
            if w.used_rules > 0 {
                let first = w.first_rule as usize;
                self.rules[first + w.used_rules as usize] = self.rules[first];
                self.info[i].first_rule += 1;
            }
        }

        self.rules[rule_index as usize] = Rule {
            ip: ip_masked,
            next_hop,
        };
        self.info[d].used_rules += 1;
        trace!(
            "[RULES] stored {:#010x}/{} at index {}",
            ip_masked,
            depth,
            rule_index
        );
        Ok(RuleAdd::Inserted(rule_index))
    }

    /// Undoes an `Updated` add whose projection failed.
    pub fn restore_next_hop(&mut self, index: u32, next_hop: u32) {
        self.rules[index as usize].next_hop = next_hop;
    }

    /// Removes the rule at `index`, which must lie in the window of `depth`.
    pub fn delete(&mut self, index: u32, depth: u8) {
        let d = depth as usize - 1;
        let w = self.info[d];
        debug_assert!(w.used_rules > 0);
        debug_assert!(self.window(depth).contains(&(index as usize)));

        let last = (w.first_rule + w.used_rules - 1) as usize;
        self.rules[index as usize] = self.rules[last];

        // Close the hole: each deeper non-empty window moves its last rule
        // into the slot just before its first.
        for i in d + 1..MAX_DEPTH as usize {
            let w = self.info[i];
            if w.used_rules > 0 {
                let first = w.first_rule as usize;
                self.rules[first - 1] = self.rules[first + w.used_rules as usize - 1];
                self.info[i].first_rule -= 1;
            }
        }
        self.info[d].used_rules -= 1;
    }

    /// Most specific remaining rule strictly shallower than `depth` that
    /// covers `ip`. Returns its index and depth.
    pub fn find_covering(&self, ip: u32, depth: u8) -> Option<(u32, u8)> {
        (1..depth)
            .rev()
            .find_map(|prev| self.find(canonical(ip, prev), prev).map(|i| (i, prev)))
    }

    pub fn clear(&mut self) {
        self.info = [RuleInfo::default(); MAX_DEPTH as usize];
        self.rules.fill(Rule::default());
    }

    /// `(prefix, depth, next_hop)` for every rule, shallowest first.
    pub fn iter(&self) -> impl Iterator<Item = (u32, u8, u32)> + '_ {
        (1..=MAX_DEPTH).flat_map(move |depth| {
            self.window(depth)
                .map(move |i| (self.rules[i].ip, depth, self.rules[i].next_hop))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Non-empty windows must be packed from 0 in depth order.
    fn assert_packed(store: &RuleStore) {
        let mut next = 0;
        for w in store.info.iter().filter(|w| w.used_rules > 0) {
            assert_eq!(w.first_rule, next);
            next += w.used_rules;
        }
        assert_eq!(next, store.len());
    }

    #[test]
    fn add_keeps_windows_packed() {
        let mut store = RuleStore::new(16);
        store.add(0x0A00_0000, 8, 1).unwrap();
        store.add(0x0A01_0200, 24, 3).unwrap();
        store.add(0x0A01_0000, 16, 2).unwrap();
        store.add(0x0B00_0000, 8, 4).unwrap();
        store.add(0x0A01_0203, 32, 5).unwrap();
        assert_packed(&store);
        assert_eq!(store.len(), 5);

        let depths: Vec<u8> = store.iter().map(|(_, d, _)| d).collect();
        assert_eq!(depths, vec![8, 8, 16, 24, 32]);
        assert!(store.find(0x0A01_0000, 16).is_some());
        assert!(store.find(0x0A01_0000, 24).is_none());
    }

    #[test]
    fn duplicate_and_update() {
        let mut store = RuleStore::new(4);
        assert!(matches!(store.add(0x0A00_0000, 8, 1), Ok(RuleAdd::Inserted(_))));
        assert_eq!(store.add(0x0A00_0000, 8, 1), Ok(RuleAdd::Unchanged));
        assert!(matches!(
            store.add(0x0A00_0000, 8, 9),
            Ok(RuleAdd::Updated {
                previous_next_hop: 1,
                ..
            })
        ));
        assert_eq!(store.len(), 1);
        let idx = store.find(0x0A00_0000, 8).unwrap();
        assert_eq!(store.get(idx).next_hop, 9);
    }

    #[test]
    fn full_store_is_left_untouched() {
        let mut store = RuleStore::new(2);
        store.add(0x0A00_0000, 8, 1).unwrap();
        store.add(0x0A01_0000, 16, 2).unwrap();
        let before: Vec<_> = store.iter().collect();
        assert_eq!(store.add(0x0B00_0000, 4, 3), Err(Error::OutOfSpace));
        assert_eq!(store.iter().collect::<Vec<_>>(), before);
        // Updating an existing rule still works at capacity.
        assert!(store.add(0x0A00_0000, 8, 7).is_ok());
    }

    #[test]
    fn delete_compacts_deeper_windows() {
        let mut store = RuleStore::new(16);
        for (ip, depth) in [
            (0x0A00_0000, 8),
            (0x0B00_0000, 8),
            (0x0A01_0000, 16),
            (0x0A02_0000, 16),
            (0x0A01_0100, 24),
            (0x0A01_0101, 32),
        ] {
            store.add(ip, depth, ip).unwrap();
        }
        let idx = store.find(0x0A00_0000, 8).unwrap();
        store.delete(idx, 8);
        assert_packed(&store);
        assert_eq!(store.len(), 5);
        assert!(store.find(0x0A00_0000, 8).is_none());
        for (ip, depth) in [(0x0B00_0000, 8), (0x0A02_0000, 16), (0x0A01_0101, 32)] {
            let i = store.find(ip, depth).unwrap();
            assert_eq!(store.get(i).next_hop, ip);
        }
    }

    #[test]
    fn covering_rule_is_the_deepest_shallower_one() {
        let mut store = RuleStore::new(8);
        store.add(0x0A00_0000, 8, 1).unwrap();
        store.add(0x0A01_0000, 16, 2).unwrap();
        let (idx, depth) = store.find_covering(0x0A01_0203, 24).unwrap();
        assert_eq!(depth, 16);
        assert_eq!(store.get(idx).next_hop, 2);
        assert_eq!(store.find_covering(0x0A01_0203, 16).map(|(_, d)| d), Some(8));
        assert_eq!(store.find_covering(0x0A01_0203, 8), None);
    }
}
