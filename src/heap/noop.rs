//! No-op backend
//!
//! A stand-in heap backend whose persistence operations do nothing and
//! whose guard operations only record what was asked of them. The frontend
//! unit tests run against it to exercise dispatch and bookkeeping without a
//! pool file.

use std::sync::Mutex;

use crate::container::Block;
use crate::heap::backend::{Backend, Located, ZoneEntry};
use crate::heap::layout::{ChunkHeader, SlotRecord};

/// Guard traffic observed by the no-op backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardEvent {
    Raised(usize, SlotRecord),
    Cleared(usize),
}

pub struct NoopBackend {
    mem: Mutex<Box<[u8]>>,
    base: *mut u8,
    pub events: Mutex<Vec<GuardEvent>>,
}

unsafe impl Send for NoopBackend {}
unsafe impl Sync for NoopBackend {}

impl NoopBackend {
    pub fn new(size: usize) -> Self {
        let mut mem = vec![0u8; size].into_boxed_slice();
        let base = mem.as_mut_ptr();
        NoopBackend {
            mem: Mutex::new(mem),
            base,
            events: Mutex::new(Vec::new()),
        }
    }
}

impl Backend for NoopBackend {
    fn base(&self) -> *mut u8 {
        self.base
    }

    fn pool_size(&self) -> usize {
        self.mem.lock().unwrap().len()
    }

    fn parse_next_zone(&self) -> Option<Vec<ZoneEntry>> {
        None
    }

    fn zones_active(&self) -> usize {
        0
    }

    fn prepare_chunk_block(&self, blk: Block) -> (Block, Option<Block>) {
        (blk, None)
    }

    fn set_chunk_state(&self, _blk: Block, _allocated: bool) -> bool {
        true
    }

    fn merge_chunks(&self, blk: Block, adjacent: Block) -> Block {
        Block::new(
            blk.zone_id,
            blk.chunk_id,
            0,
            blk.size_idx + adjacent.size_idx,
        )
    }

    fn chunk_after(&self, _blk: Block) -> Option<ChunkHeader> {
        None
    }

    fn create_run(&self, _blk: Block, _class_id: u32, _unit_size: u64, _nunits: usize) {}

    fn run_block_set(&self, _blk: Block, _block_size: u64, _occupied: bool) {}

    fn run_bit_is_set(&self, _zone_id: u16, _chunk_id: u16, _unit_idx: u16) -> bool {
        true
    }

    fn locate(&self, _off: u64) -> Option<Located> {
        None
    }

    fn set_guard(&self, arena_id: usize, rec: SlotRecord) {
        self.events
            .lock()
            .unwrap()
            .push(GuardEvent::Raised(arena_id, rec));
    }

    fn clear_guard(&self, arena_id: usize) {
        self.events
            .lock()
            .unwrap()
            .push(GuardEvent::Cleared(arena_id));
    }

    unsafe fn set_alloc_ptr(&self, ptr: *mut u64, value: u64) {
        *ptr = value;
    }

    unsafe fn publish_chunk_state(
        &self,
        _lane: usize,
        ptr: *mut u64,
        value: u64,
        _blk: Block,
        _allocated: bool,
    ) {
        *ptr = value;
    }

    fn copy_content(&self, _dest_off: u64, _src_off: u64, _len: usize) {}

    fn close(&self) {}
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn guards_are_recorded() {
        let b = NoopBackend::new(4096);
        b.set_guard(3, SlotRecord::Alloc { dest: 64 });
        b.clear_guard(3);

        let events = b.events.lock().unwrap();
        assert_eq!(
            *events,
            vec![
                GuardEvent::Raised(3, SlotRecord::Alloc { dest: 64 }),
                GuardEvent::Cleared(3),
            ]
        );
    }

    #[test]
    fn alloc_ptr_writes_through() {
        let b = NoopBackend::new(4096);
        let mut word = 0u64;
        unsafe { b.set_alloc_ptr(&mut word, 42) };
        assert_eq!(word, 42);
    }
}
