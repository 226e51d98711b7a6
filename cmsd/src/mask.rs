//! Fixed-width node bitsets.
//!
//! Every registered node owns one slot in the registry and therefore one bit
//! in a [`NodeMask`]. Masks are used for storage groups (which nodes export a
//! path), path presence (which nodes reported having a file) and the
//! registry's aggregate eligibility masks. All set operations are O(1).

use serde::{Deserialize, Serialize};
use std::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, BitXor, Not};

/// Number of slots a registry can hold.
pub const MAX_NODES: usize = 64;

#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeMask(u64);

impl NodeMask {
    pub const fn empty() -> Self {
        NodeMask(0)
    }

    pub const fn all() -> Self {
        NodeMask(u64::MAX)
    }

    /// Mask with only the bit for `slot` set. Slots beyond [`MAX_NODES`]
    /// produce an empty mask.
    pub const fn slot(slot: usize) -> Self {
        if slot < MAX_NODES {
            NodeMask(1 << slot)
        } else {
            NodeMask(0)
        }
    }

    pub const fn from_bits(bits: u64) -> Self {
        NodeMask(bits)
    }

    pub const fn bits(&self) -> u64 {
        self.0
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub const fn intersects(&self, other: NodeMask) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn contains(&self, other: NodeMask) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn has_slot(&self, slot: usize) -> bool {
        self.intersects(NodeMask::slot(slot))
    }

    pub fn insert(&mut self, other: NodeMask) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: NodeMask) {
        self.0 &= !other.0;
    }

    pub const fn count(&self) -> u32 {
        self.0.count_ones()
    }

    /// Iterate the slots whose bit is set, lowest first.
    pub fn slots(&self) -> impl Iterator<Item = usize> {
        let bits = self.0;
        (0..MAX_NODES).filter(move |slot| bits & (1 << slot) != 0)
    }
}

impl std::fmt::Debug for NodeMask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeMask({:#018x})", self.0)
    }
}

impl BitAnd for NodeMask {
    type Output = NodeMask;

    fn bitand(self, rhs: NodeMask) -> NodeMask {
        NodeMask(self.0 & rhs.0)
    }
}

impl BitAndAssign for NodeMask {
    fn bitand_assign(&mut self, rhs: NodeMask) {
        self.0 &= rhs.0;
    }
}

impl BitOr for NodeMask {
    type Output = NodeMask;

    fn bitor(self, rhs: NodeMask) -> NodeMask {
        NodeMask(self.0 | rhs.0)
    }
}

impl BitOrAssign for NodeMask {
    fn bitor_assign(&mut self, rhs: NodeMask) {
        self.0 |= rhs.0;
    }
}

impl BitXor for NodeMask {
    type Output = NodeMask;

    fn bitxor(self, rhs: NodeMask) -> NodeMask {
        NodeMask(self.0 ^ rhs.0)
    }
}

impl Not for NodeMask {
    type Output = NodeMask;

    fn not(self) -> NodeMask {
        NodeMask(!self.0)
    }
}

impl FromIterator<usize> for NodeMask {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        iter.into_iter()
            .fold(NodeMask::empty(), |mask, slot| mask | NodeMask::slot(slot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_ops() {
        let a: NodeMask = [0, 3, 5].into_iter().collect();
        let b: NodeMask = [3, 5, 9].into_iter().collect();

        assert_eq!((a & b).slots().collect::<Vec<_>>(), vec![3, 5]);
        assert_eq!((a | b).count(), 4);
        assert!(a.has_slot(0));
        assert!(!b.has_slot(0));
        assert!((a | b).contains(a));
        assert!(!a.contains(b));
    }

    #[test]
    fn test_out_of_range_slot_is_empty() {
        assert!(NodeMask::slot(MAX_NODES).is_empty());
        assert_eq!(NodeMask::slot(MAX_NODES - 1).count(), 1);
    }

    #[test]
    fn test_insert_remove() {
        let mut mask = NodeMask::empty();
        mask.insert(NodeMask::slot(7));
        mask.insert(NodeMask::slot(8));
        mask.remove(NodeMask::slot(7));
        assert_eq!(mask.slots().collect::<Vec<_>>(), vec![8]);
        assert_eq!(!NodeMask::all(), NodeMask::empty());
    }
}
