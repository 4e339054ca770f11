//! Volatile block container
//!
//! Buckets keep their free memory blocks in an ordered associative
//! container keyed by a packed 64-bit word. The size index occupies the
//! most significant bits so plain key order is size-then-address order,
//! which makes best-fit selection a successor search: the smallest key
//! greater than or equal to the requested one is the smallest sufficient
//! block at the lowest address.
//!
//! The reference implementation is a crit-bit tree; every operation is
//! O(k) in the key width. The container is not thread-safe, the enclosing
//! bucket serializes access.

use std::mem;

use crate::error::Error;
use crate::result::Result;

/// A free region tracked by the frontend: `(zone, chunk, unit offset,
/// size index)`. For chunk-granular blocks `block_off` is 0 and `size_idx`
/// counts chunks; for run blocks both are in units of the class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    pub zone_id: u16,
    pub chunk_id: u16,
    pub block_off: u16,
    pub size_idx: u16,
}

impl Block {
    pub fn new(zone_id: u16, chunk_id: u16, block_off: u16, size_idx: u16) -> Self {
        Block {
            zone_id,
            chunk_id,
            block_off,
            size_idx,
        }
    }

    /// The probe key for a best-fit lookup of `size_idx` units: all the
    /// address bits are zero, so any block of that size matches.
    pub fn for_size(size_idx: u16) -> Self {
        Block::new(0, 0, 0, size_idx)
    }

    /// Packs the block into its container key, size in the high bits.
    pub fn key(&self) -> u64 {
        (self.size_idx as u64) << 48
            | (self.block_off as u64) << 32
            | (self.chunk_id as u64) << 16
            | self.zone_id as u64
    }

    pub fn from_key(key: u64) -> Self {
        Block {
            size_idx: (key >> 48) as u16,
            block_off: (key >> 32) as u16,
            chunk_id: (key >> 16) as u16,
            zone_id: key as u16,
        }
    }
}

/// Operations a bucket requires from its container.
pub trait BlockContainer {
    fn insert(&mut self, block: Block) -> Result<()>;
    /// Removes and returns the smallest block at least as large as the
    /// request; among equal sizes, the lowest address.
    fn get_rm_bestfit(&mut self, request: Block) -> Option<Block>;
    fn get_rm_exact(&mut self, block: Block) -> Option<Block>;
    fn get_exact(&self, block: Block) -> bool;
    fn is_empty(&self) -> bool;
    fn clear(&mut self);
}

#[inline]
fn bit(key: u64, i: u32) -> usize {
    ((key >> i) & 1) as usize
}

enum Node {
    Leaf(u64),
    Inner(Box<Inner>),
}

struct Inner {
    /// Most significant bit on which the two subtrees differ. Every key in
    /// this subtree agrees on all bits above `diff`.
    diff: u32,
    slots: [Node; 2],
}

/// Crit-bit tree over packed block keys.
pub struct CritbitTree {
    root: Option<Node>,
    len: usize,
}

impl Default for CritbitTree {
    fn default() -> Self {
        Self::new()
    }
}

impl CritbitTree {
    pub fn new() -> Self {
        CritbitTree { root: None, len: 0 }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// The leaf reached by descending along the key's bits.
    fn closest(&self, key: u64) -> Option<u64> {
        let mut node = self.root.as_ref()?;
        loop {
            match node {
                Node::Leaf(k) => return Some(*k),
                Node::Inner(inn) => node = &inn.slots[bit(key, inn.diff)],
            }
        }
    }

    fn min_leaf(mut node: &Node) -> u64 {
        loop {
            match node {
                Node::Leaf(k) => return *k,
                Node::Inner(inn) => node = &inn.slots[0],
            }
        }
    }

    /// Smallest key `>= key`, if any.
    fn find_ge(&self, key: u64) -> Option<u64> {
        let closest = self.closest(key)?;
        if closest == key {
            return Some(key);
        }

        // `closest` agrees with the key on every bit above the critical
        // one, because the descent followed the key's bits through all the
        // higher branch points.
        let crit = 63 - (closest ^ key).leading_zeros();

        if bit(key, crit) == 0 {
            // The key is smaller at the deciding bit, so every key in the
            // subtree sharing the bits above `crit` is greater; the
            // smallest of them is the answer.
            let mut node = self.root.as_ref().unwrap();
            while let Node::Inner(inn) = node {
                if inn.diff <= crit {
                    break;
                }
                node = &inn.slots[bit(key, inn.diff)];
            }
            Some(Self::min_leaf(node))
        } else {
            // Every key sharing the bits above `crit` is smaller. The
            // successor lives in the right sibling of the deepest
            // left-turn on the descent path, where the tree first exceeds
            // the key.
            let mut node = self.root.as_ref().unwrap();
            let mut fallback = None;
            while let Node::Inner(inn) = node {
                if inn.diff <= crit {
                    break;
                }
                let d = bit(key, inn.diff);
                if d == 0 {
                    fallback = Some(&inn.slots[1]);
                }
                node = &inn.slots[d];
            }
            fallback.map(Self::min_leaf)
        }
    }

    fn insert_key(&mut self, key: u64) -> Result<()> {
        let Some(closest) = self.closest(key) else {
            self.root = Some(Node::Leaf(key));
            self.len += 1;
            return Ok(());
        };
        if closest == key {
            return Err(Error::Inval);
        }

        let diff = 63 - (closest ^ key).leading_zeros();
        let d = bit(key, diff);

        // Critical bits are kept sorted along every path, so the new node
        // goes above the first node with a smaller one.
        let mut node = self.root.as_mut().unwrap();
        loop {
            let descend = matches!(&*node, Node::Inner(inn) if inn.diff > diff);
            if !descend {
                break;
            }
            let here = node;
            let Node::Inner(inn) = here else { unreachable!() };
            node = &mut inn.slots[bit(key, inn.diff)];
        }

        let displaced = mem::replace(node, Node::Leaf(0));
        let slots = if d == 1 {
            [displaced, Node::Leaf(key)]
        } else {
            [Node::Leaf(key), displaced]
        };
        *node = Node::Inner(Box::new(Inner { diff, slots }));
        self.len += 1;
        Ok(())
    }

    /// Removes the exact key; the parent accessor collapses into the
    /// sibling subtree.
    fn remove_key(&mut self, key: u64) -> Option<u64> {
        let root = self.root.take()?;
        let (rest, removed) = Self::remove_node(root, key);
        self.root = rest;
        if removed.is_some() {
            self.len -= 1;
        }
        removed
    }

    fn remove_node(node: Node, key: u64) -> (Option<Node>, Option<u64>) {
        match node {
            Node::Leaf(k) => {
                if k == key {
                    (None, Some(k))
                } else {
                    (Some(Node::Leaf(k)), None)
                }
            }
            Node::Inner(mut inn) => {
                let d = bit(key, inn.diff);
                let child = mem::replace(&mut inn.slots[d], Node::Leaf(0));
                let (rest, removed) = Self::remove_node(child, key);
                match rest {
                    Some(child) => {
                        inn.slots[d] = child;
                        (Some(Node::Inner(inn)), removed)
                    }
                    None => {
                        let sibling = mem::replace(&mut inn.slots[1 - d], Node::Leaf(0));
                        (Some(sibling), removed)
                    }
                }
            }
        }
    }
}

impl BlockContainer for CritbitTree {
    fn insert(&mut self, block: Block) -> Result<()> {
        debug_assert_ne!(block.size_idx, 0);
        self.insert_key(block.key())
    }

    fn get_rm_bestfit(&mut self, request: Block) -> Option<Block> {
        let key = self.find_ge(request.key())?;
        self.remove_key(key);
        Some(Block::from_key(key))
    }

    fn get_rm_exact(&mut self, block: Block) -> Option<Block> {
        self.remove_key(block.key()).map(Block::from_key)
    }

    fn get_exact(&self, block: Block) -> bool {
        self.closest(block.key()) == Some(block.key())
    }

    fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    fn clear(&mut self) {
        self.root = None;
        self.len = 0;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn blk(zone: u16, chunk: u16, off: u16, size: u16) -> Block {
        Block::new(zone, chunk, off, size)
    }

    #[test]
    fn key_packing_orders_by_size_first() {
        let small_far = blk(9, 9, 9, 1);
        let big_near = blk(0, 0, 0, 2);
        assert!(small_far.key() < big_near.key());

        let b = blk(1, 2, 3, 4);
        assert_eq!(Block::from_key(b.key()), b);
    }

    #[test]
    fn insert_and_exact_match() {
        let mut t = CritbitTree::new();
        assert!(t.is_empty());

        let b = blk(0, 5, 0, 3);
        t.insert(b).unwrap();
        assert!(t.get_exact(b));
        assert!(!t.get_exact(blk(0, 6, 0, 3)));

        assert!(t.insert(b).is_err());

        assert_eq!(t.get_rm_exact(b), Some(b));
        assert!(t.is_empty());
        assert_eq!(t.get_rm_exact(b), None);
    }

    #[test]
    fn bestfit_returns_equal_or_larger() {
        let mut t = CritbitTree::new();
        t.insert(blk(0, 0, 0, 2)).unwrap();
        t.insert(blk(0, 8, 0, 8)).unwrap();

        assert_eq!(t.get_rm_bestfit(Block::for_size(4)), Some(blk(0, 8, 0, 8)));
        assert_eq!(t.get_rm_bestfit(Block::for_size(4)), None);
        assert_eq!(t.get_rm_bestfit(Block::for_size(1)), Some(blk(0, 0, 0, 2)));
    }

    #[test]
    fn bestfit_prefers_smallest_size() {
        // The descent alone would land on the larger block here; the
        // successor search must still find the 2-chunk one.
        let mut t = CritbitTree::new();
        t.insert(blk(0, 0, 0, 2)).unwrap();
        t.insert(blk(0, 0, 0, 3)).unwrap();
        assert_eq!(t.get_rm_bestfit(Block::for_size(1)), Some(blk(0, 0, 0, 2)));
    }

    #[test]
    fn bestfit_prefers_lowest_address_among_equal_sizes() {
        let mut t = CritbitTree::new();
        t.insert(blk(0, 40, 0, 4)).unwrap();
        t.insert(blk(0, 4, 0, 4)).unwrap();
        t.insert(blk(1, 2, 0, 4)).unwrap();

        assert_eq!(t.get_rm_bestfit(Block::for_size(4)), Some(blk(0, 4, 0, 4)));
        assert_eq!(t.get_rm_bestfit(Block::for_size(4)), Some(blk(0, 40, 0, 4)));
        assert_eq!(t.get_rm_bestfit(Block::for_size(4)), Some(blk(1, 2, 0, 4)));
    }

    #[test]
    fn bestfit_against_reference_model() {
        use rand::prelude::*;
        let mut rng = StdRng::seed_from_u64(42);

        let mut t = CritbitTree::new();
        let mut model: Vec<u64> = Vec::new();
        for _ in 0..400 {
            let b = blk(
                rng.gen_range(0..4),
                rng.gen_range(0..64),
                0,
                rng.gen_range(1..16),
            );
            if t.insert(b).is_ok() {
                model.push(b.key());
            }
        }

        for _ in 0..200 {
            let want: u16 = rng.gen_range(1..18);
            let req = Block::for_size(want);
            let expect = model.iter().copied().filter(|&k| k >= req.key()).min();
            let got = t.get_rm_bestfit(req).map(|b| b.key());
            assert_eq!(got, expect);
            if let Some(k) = got {
                model.retain(|&m| m != k);
            }
        }
    }

    #[test]
    fn clear_empties_the_tree() {
        let mut t = CritbitTree::new();
        for i in 0..32 {
            t.insert(blk(0, i, 0, (i % 7) + 1)).unwrap();
        }
        assert_eq!(t.len(), 32);
        t.clear();
        assert!(t.is_empty());
        assert_eq!(t.get_rm_bestfit(Block::for_size(1)), None);
    }
}
