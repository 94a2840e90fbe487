//! Packed 4-byte table entries.
//!
//! Both table levels store one `u32` per slot so a single atomic store
//! publishes a whole entry:
//!
//! ```text
//!  31      26 25  24  23                    0
//! +----------+---+---+-----------------------+
//! |  depth   | G | V | next hop / group index |
//! +----------+---+---+-----------------------+
//! ```
//!
//! `V` is the valid bit. `G` is the discriminant on level 1 (set = the entry
//! points at an extension group) and the group-occupied flag on level 2.

const VALUE_MASK: u32 = 0x00FF_FFFF;
const VALID_BIT: u32 = 1 << 24;
const GROUP_BIT: u32 = 1 << 25;
const DEPTH_SHIFT: u32 = 26;

/// A level-1 slot, decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tbl24Entry {
    Invalid,
    /// The longest rule covering the whole /24 bucket.
    Leaf { depth: u8, next_hop: u32 },
    /// Resolution continues in extension group `group`.
    Group { group: u32 },
}

impl Tbl24Entry {
    #[inline(always)]
    pub fn pack(self) -> u32 {
        match self {
            Tbl24Entry::Invalid => 0,
            Tbl24Entry::Leaf { depth, next_hop } => {
                debug_assert!(next_hop <= VALUE_MASK);
                ((depth as u32) << DEPTH_SHIFT) | VALID_BIT | (next_hop & VALUE_MASK)
            }
            Tbl24Entry::Group { group } => {
                debug_assert!(group <= VALUE_MASK);
                GROUP_BIT | VALID_BIT | (group & VALUE_MASK)
            }
        }
    }

    #[inline(always)]
    pub fn unpack(raw: u32) -> Self {
        if raw & VALID_BIT == 0 {
            Tbl24Entry::Invalid
        } else if raw & GROUP_BIT != 0 {
            Tbl24Entry::Group {
                group: raw & VALUE_MASK,
            }
        } else {
            Tbl24Entry::Leaf {
                depth: (raw >> DEPTH_SHIFT) as u8,
                next_hop: raw & VALUE_MASK,
            }
        }
    }
}

/// A level-2 slot, decoded. Always leaf-shaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Tbl8Entry {
    pub valid: bool,
    pub depth: u8,
    pub next_hop: u32,
    /// Group-wide: the owning group is allocated. Replicated in every slot.
    pub group_occupied: bool,
}

impl Tbl8Entry {
    /// Free slot of an allocated group.
    pub const EMPTY: Tbl8Entry = Tbl8Entry {
        valid: false,
        depth: 0,
        next_hop: 0,
        group_occupied: true,
    };

    #[inline(always)]
    pub fn leaf(depth: u8, next_hop: u32) -> Self {
        Tbl8Entry {
            valid: true,
            depth,
            next_hop,
            group_occupied: true,
        }
    }

    #[inline(always)]
    pub fn pack(self) -> u32 {
        debug_assert!(self.next_hop <= VALUE_MASK);
        let mut raw = ((self.depth as u32) << DEPTH_SHIFT) | (self.next_hop & VALUE_MASK);
        if self.valid {
            raw |= VALID_BIT;
        }
        if self.group_occupied {
            raw |= GROUP_BIT;
        }
        raw
    }

    #[inline(always)]
    pub fn unpack(raw: u32) -> Self {
        Tbl8Entry {
            valid: raw & VALID_BIT != 0,
            depth: (raw >> DEPTH_SHIFT) as u8,
            next_hop: raw & VALUE_MASK,
            group_occupied: raw & GROUP_BIT != 0,
        }
    }

    /// Whether a rule of `depth` may overwrite this slot.
    #[inline(always)]
    pub fn yields_to(self, depth: u8) -> bool {
        !self.valid || self.depth <= depth
    }
}
