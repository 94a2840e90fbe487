//! Constants and configuration for the DIR-24-8 table

/// Deepest prefix length an IPv4 rule may carry.
pub const MAX_DEPTH: u8 = 32;
/// Prefixes up to this depth resolve in the level-1 table alone.
pub const MAX_DEPTH_TBL24: u8 = 24;

pub const TBL24_NUM_ENTRIES: usize = 1 << 24;
pub const TBL8_GROUP_NUM_ENTRIES: usize = 256;

/// Hard ceiling on extension groups: the group index shares the 24-bit
/// next-hop field of a level-1 entry.
pub const MAX_TBL8_NUM_GROUPS: u32 = 1 << 24;

/// Next hops are packed into 24 bits.
pub const MAX_NEXT_HOP: u32 = (1 << 24) - 1;

pub const NAME_SIZE: usize = 32;

pub const DEFAULT_MAX_RULES: u32 = 1024;
pub const DEFAULT_NUMBER_GROUPS: u32 = 256;

/// Upper bound on items freed by one defer-queue reclaim pass.
pub const DQ_RECLAIM_MAX: u32 = 16;
