//! Data structures shared across the table modules

use crate::constants::{DEFAULT_MAX_RULES, DEFAULT_NUMBER_GROUPS};
use crate::qsbr::Qsbr;
use std::sync::Arc;

/// One stored rule. The depth is implied by the window it lives in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rule {
    pub ip: u32, // masked prefix
    pub next_hop: u32,
}

/// Window of the rule array holding rules of one depth.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleInfo {
    pub used_rules: u32,
    pub first_rule: u32,
}

/// Sizing for a new table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LpmConfig {
    pub max_rules: u32,
    pub number_groups: u32,
}

impl LpmConfig {
    pub fn new(max_rules: u32, number_groups: u32) -> Self {
        Self {
            max_rules,
            number_groups,
        }
    }
}

impl Default for LpmConfig {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RULES, DEFAULT_NUMBER_GROUPS)
    }
}

/// How released extension groups wait for readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimMode {
    /// The writer blocks in `synchronize` on every release.
    Sync,
    /// Released groups queue up and are freed in batches.
    DeferQueue {
        /// 0 means one slot per extension group.
        capacity: u32,
        /// Queue length that triggers a batch reclaim. 0 reclaims on every
        /// enqueue.
        reclaim_threshold: u32,
        /// Items freed per batch; 0 means `DQ_RECLAIM_MAX`.
        reclaim_max: u32,
    },
}

/// Reclamation binding for a table.
#[derive(Clone)]
pub struct RcuConfig {
    pub qsbr: Arc<Qsbr>,
    pub mode: ReclaimMode,
}

/// Result of a successful `add`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// A new rule was stored.
    Inserted,
    /// The rule existed with another next hop, which was replaced.
    Updated,
    /// The identical rule was already present; nothing changed.
    Unchanged,
}

/// Point-in-time counters for a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LpmStats {
    pub rules: u32,
    pub max_rules: u32,
    pub groups_in_use: u32,
    pub number_groups: u32,
    pub pending_reclaims: u32,
}
