//! Buckets and allocation classes
//!
//! A bucket aggregates the free blocks of one size class behind a lock. A
//! class describes the unit the bucket deals in: the huge class uses whole
//! chunks, run classes subdivide a chunk into `unit_size` units. Requests
//! are expressed in units; the bucket serves the best-fitting block and
//! splits run blocks itself, while chunk blocks are split persistently by
//! the backend.

use std::sync::Mutex;

use crate::container::{Block, BlockContainer, CritbitTree};
use crate::error::Error;
use crate::heap::layout::{run_units, ALLOC_HEADER_SIZE, CHUNK_SIZE, MAX_CHUNK};
use crate::result::Result;

/// Size of the class table. Class ids are indexes into it.
pub const MAX_ALLOC_CLASSES: usize = 8;

/// On-media header kind of a class.
///
/// `Compact` blocks embed a 16-byte size header, so any allocation can be
/// resolved back to its unit count. `Minimal` blocks carry no header and
/// are therefore restricted to single-unit allocations. `None` is the kind
/// of the chunk-granular class, whose size lives in the chunk header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderKind {
    None,
    Minimal,
    Compact,
}

impl HeaderKind {
    pub fn overhead(&self) -> usize {
        match self {
            HeaderKind::Compact => ALLOC_HEADER_SIZE,
            _ => 0,
        }
    }
}

/// One allocation class.
#[derive(Debug, Clone, Copy)]
pub struct AllocClass {
    pub unit_size: usize,
    pub units_per_block: u32,
    pub header: HeaderKind,
}

impl AllocClass {
    /// The huge class: chunk-granular allocations.
    pub fn huge() -> Self {
        AllocClass {
            unit_size: CHUNK_SIZE,
            units_per_block: 1,
            header: HeaderKind::None,
        }
    }

    pub fn is_chunk_granular(&self) -> bool {
        self.unit_size == CHUNK_SIZE
    }

    /// Units a run of this class holds per chunk.
    pub fn run_capacity(&self) -> usize {
        run_units(self.unit_size, self.units_per_block)
    }
}

/// A size range mapped onto a class by the CTL interface.
#[derive(Debug, Clone, Copy)]
pub struct ClassRange {
    pub class_id: usize,
    pub start: usize,
    pub end: usize,
}

/// Registry of allocation classes and the size ranges that select them.
pub struct ClassMap {
    classes: [Option<AllocClass>; MAX_ALLOC_CLASSES],
    ranges: Vec<ClassRange>,
    fail_no_matching_class: bool,
    granularity: usize,
    limit: usize,
}

impl Default for ClassMap {
    /// The default registry: the huge class at id 0, serving every size.
    fn default() -> Self {
        let mut classes = [None; MAX_ALLOC_CLASSES];
        classes[0] = Some(AllocClass::huge());
        ClassMap {
            classes,
            ranges: vec![ClassRange {
                class_id: 0,
                start: 1,
                end: usize::MAX,
            }],
            fail_no_matching_class: false,
            granularity: 1,
            limit: 0,
        }
    }
}

impl ClassMap {
    pub fn class(&self, id: usize) -> Option<AllocClass> {
        self.classes.get(id).copied().flatten()
    }

    pub fn register(&mut self, id: usize, class: AllocClass) -> Result<()> {
        // units host 64-bit words, so they must keep 8-byte alignment
        if id >= MAX_ALLOC_CLASSES
            || class.unit_size == 0
            || class.unit_size % 8 != 0
            || class.unit_size > CHUNK_SIZE
            || class.units_per_block == 0
        {
            return Err(Error::Inval);
        }
        self.classes[id] = Some(class);
        Ok(())
    }

    /// Drops every class and range; subsequent allocations are resolved
    /// against whatever the caller registers next.
    pub fn reset(&mut self, fail_no_matching_class: bool, granularity: usize, limit: usize) {
        self.classes = [None; MAX_ALLOC_CLASSES];
        self.ranges.clear();
        self.fail_no_matching_class = fail_no_matching_class;
        self.granularity = granularity.max(1);
        self.limit = limit;
    }

    pub fn map_range(&mut self, range: ClassRange) -> Result<()> {
        if self.class(range.class_id).is_none() || range.start == 0 || range.start > range.end {
            return Err(Error::Inval);
        }
        self.ranges.push(range);
        Ok(())
    }

    /// Maps an allocation size onto a class id.
    ///
    /// The size is rounded up to the map granularity before the range
    /// lookup; the first matching range wins. Without a match the request
    /// falls back to a chunk-granular class unless the map was reset with
    /// `fail_no_matching_class`.
    pub fn class_for_size(&self, size: usize) -> Result<usize> {
        if self.limit != 0 && size > self.limit {
            return self.fallback();
        }
        let rounded = size
            .checked_add(self.granularity - 1)
            .ok_or(Error::Inval)?
            / self.granularity
            * self.granularity;
        for r in &self.ranges {
            if rounded >= r.start && rounded <= r.end && self.class(r.class_id).is_some() {
                return Ok(r.class_id);
            }
        }
        self.fallback()
    }

    fn fallback(&self) -> Result<usize> {
        if self.fail_no_matching_class {
            return Err(Error::Inval);
        }
        self.classes
            .iter()
            .position(|c| matches!(c, Some(c) if c.is_chunk_granular()))
            .ok_or(Error::Inval)
    }
}

/// A volatile aggregator of the free blocks of one class.
pub struct Bucket {
    class_id: usize,
    class: AllocClass,
    tree: Mutex<CritbitTree>,
}

impl Bucket {
    pub fn new(class_id: usize, class: AllocClass) -> Self {
        Bucket {
            class_id,
            class,
            tree: Mutex::new(CritbitTree::new()),
        }
    }

    pub fn class_id(&self) -> usize {
        self.class_id
    }

    pub fn class(&self) -> AllocClass {
        self.class
    }

    pub fn unit_size(&self) -> usize {
        self.class.unit_size
    }

    pub fn is_run(&self) -> bool {
        !self.class.is_chunk_granular()
    }

    /// Units needed to serve `size` bytes.
    pub fn calc_units(&self, size: usize) -> Result<u16> {
        let units = (size - 1) / self.class.unit_size + 1;
        if units > MAX_CHUNK {
            return Err(Error::Nomem);
        }
        Ok(units as u16)
    }

    /// Removes the best-fitting block for `units`.
    ///
    /// Run blocks are split in place, the remainder going straight back to
    /// the container. Chunk blocks come back sized to the request; the
    /// caller performs the persistent split and recycles the remainder.
    pub fn get_object(&self, units: u16) -> Option<Block> {
        let mut tree = self.tree.lock().unwrap();
        let blk = tree.get_rm_bestfit(Block::for_size(units))?;
        if self.is_run() && blk.size_idx > units {
            let rest = Block::new(
                blk.zone_id,
                blk.chunk_id,
                blk.block_off + units,
                blk.size_idx - units,
            );
            tree.insert(rest).unwrap();
        }
        Some(Block::new(blk.zone_id, blk.chunk_id, blk.block_off, units))
    }

    /// Returns a free block to the bucket.
    pub fn add_object(&self, blk: Block) {
        debug_assert_ne!(blk.size_idx, 0);
        // a recycled block may coalesce with a neighbour some day; for now
        // duplicates are the only thing to guard against
        let _ = self.tree.lock().unwrap().insert(blk);
    }

    /// Removes a specific block, when present.
    pub fn remove_exact(&self, blk: Block) -> Option<Block> {
        self.tree.lock().unwrap().get_rm_exact(blk)
    }

    pub fn is_empty(&self) -> bool {
        self.tree.lock().unwrap().is_empty()
    }
}
