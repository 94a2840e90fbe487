//! Helper functions for prefix arithmetic

use crate::constants::{MAX_DEPTH, MAX_DEPTH_TBL24, TBL8_GROUP_NUM_ENTRIES};

/// Netmask with `depth` leading ones. `depth` must be in 1..=32.
#[inline]
pub fn depth_to_mask(depth: u8) -> u32 {
    debug_assert!((1..=MAX_DEPTH).contains(&depth), "depth {depth} out of range");
    !0u32 << (MAX_DEPTH - depth)
}

/// Number of table slots a prefix of `depth` spans: level-1 slots for
/// depths up to 24, extension-group slots beyond.
#[inline]
pub fn depth_to_range(depth: u8) -> usize {
    debug_assert!((1..=MAX_DEPTH).contains(&depth), "depth {depth} out of range");
    if depth <= MAX_DEPTH_TBL24 {
        1 << (MAX_DEPTH_TBL24 - depth)
    } else {
        1 << (MAX_DEPTH - depth)
    }
}

// Canonicalise an address: zero host bits beyond `depth`.
#[inline(always)]
pub fn canonical(ip: u32, depth: u8) -> u32 {
    ip & depth_to_mask(depth)
}

#[inline(always)]
pub fn tbl24_index(ip: u32) -> usize {
    (ip >> 8) as usize
}

/// First slot of `group` inside the flat extension array.
#[inline(always)]
pub fn group_start(group: u32) -> usize {
    group as usize * TBL8_GROUP_NUM_ENTRIES
}

#[inline]
pub fn valid_depth(depth: u8) -> bool {
    (1..=MAX_DEPTH).contains(&depth)
}
