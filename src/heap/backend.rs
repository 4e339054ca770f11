//! Persistent backend
//!
//! The backend owns the mapped pool region and is the only writer of its
//! metadata. It guarantees that the region stays consistent across a crash
//! at any instruction boundary: an operation recorded in an info slot is
//! either finished or rolled back the next time the pool is opened.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use log::{debug, warn};
use memmap::MmapMut;

use crate::container::Block;
use crate::error::Error;
use crate::heap::layout::*;
use crate::ll;
use crate::redo::{RedoLog, RedoOp};
use crate::result::Result;
use crate::utils;

/// Width of the chunk-bitmap lock array.
pub const MAX_CHUNK_LOCKS: usize = 1024;

/// A free range discovered while parsing a zone.
#[derive(Debug)]
pub enum ZoneEntry {
    /// A free chunk-granular block.
    Free(Block),
    /// A run chunk with its class and the free unit ranges of its bitmap.
    Run {
        class_id: u32,
        block_size: u64,
        free: Vec<Block>,
    },
}

/// What a pool offset resolves to.
#[derive(Debug, Clone, Copy)]
pub enum Located {
    /// A live chunk-granular allocation.
    Chunk { block: Block },
    /// A unit inside a run chunk.
    Run {
        zone_id: u16,
        chunk_id: u16,
        class_id: u32,
        block_size: u64,
        unit_idx: u16,
    },
}

/// Operations the volatile frontend requires from a heap backend.
///
/// Two implementations exist: the persistent one below and the no-op one in
/// [`crate::heap::noop`] used to unit-test frontend logic.
pub trait Backend: Send + Sync {
    fn base(&self) -> *mut u8;
    fn pool_size(&self) -> usize;

    /// Parses one more zone into free ranges; `None` once every zone has
    /// been brought in.
    fn parse_next_zone(&self) -> Option<Vec<ZoneEntry>>;
    /// Number of zones brought into use so far.
    fn zones_active(&self) -> usize;

    /// Persistently splits the chunk under `blk` down to `blk.size_idx`
    /// chunks. Returns the final block and the split-off remainder, if any.
    fn prepare_chunk_block(&self, blk: Block) -> (Block, Option<Block>);
    /// Flips the `USED` flag of a chunk-granular block. Allocation zeroes
    /// the data area first. Returns false when the flag already had the
    /// requested state.
    fn set_chunk_state(&self, blk: Block, allocated: bool) -> bool;
    /// Grows `blk` over the immediately following free chunk block.
    fn merge_chunks(&self, blk: Block, adjacent: Block) -> Block;
    /// Reads the header of the chunk after `blk`, when one exists.
    fn chunk_after(&self, blk: Block) -> Option<ChunkHeader>;

    /// Converts a free chunk into a run of `nunits` units of `unit_size`.
    fn create_run(&self, blk: Block, class_id: u32, unit_size: u64, nunits: usize);
    /// Sets or clears the bitmap bits of a run block, with zeroing on
    /// allocation.
    fn run_block_set(&self, blk: Block, block_size: u64, occupied: bool);
    /// Reads one bit of a run bitmap.
    fn run_bit_is_set(&self, zone_id: u16, chunk_id: u16, unit_idx: u16) -> bool;

    /// Resolves a data offset to the allocation containing it.
    fn locate(&self, off: u64) -> Option<Located>;

    /// Raises the info-slot guard of an arena.
    fn set_guard(&self, arena_id: usize, rec: SlotRecord);
    /// Clears the info-slot guard of an arena.
    fn clear_guard(&self, arena_id: usize);
    /// Publishes a value into a destination word and persists it.
    ///
    /// Single-word crash-atomic, for the publishes that leave the chunk
    /// header untouched and do not need the redo log.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for writes; destinations inside the pool are
    /// the ones the recovery protocol can find again.
    unsafe fn set_alloc_ptr(&self, ptr: *mut u64, value: u64);
    /// Publishes the destination word and the `USED` flip of a
    /// chunk-granular block through the arena's two-entry redo lane, as
    /// one crash-atomic pair. Allocation zeroes the data area first.
    ///
    /// # Safety
    ///
    /// Same contract as [`Backend::set_alloc_ptr`].
    unsafe fn publish_chunk_state(
        &self,
        lane: usize,
        ptr: *mut u64,
        value: u64,
        blk: Block,
        allocated: bool,
    );

    /// Persistently copies allocation content between pool offsets.
    fn copy_content(&self, dest_off: u64, src_off: u64, len: usize);

    /// Transitions the pool to its closed state.
    fn close(&self);
}

/// The persistent backend over a memory-mapped pool file.
pub struct PersistentBackend {
    mmap: MmapMut,
    base: *mut u8,
    max_zone: usize,
    zones_exhausted: AtomicUsize,
    chunk_locks: Vec<Mutex<()>>,
}

// The raw base pointer is only dereferenced under the locking and guard
// protocol; the mapping itself lives as long as the backend.
unsafe impl Send for PersistentBackend {}
unsafe impl Sync for PersistentBackend {}

impl PersistentBackend {
    /// Opens the backend over an already-mapped pool region, running
    /// header verification, version checks and info-slot recovery.
    pub fn open(mut mmap: MmapMut, layout: &str) -> Result<Self> {
        let pool_size = mmap.len();
        if pool_size < MIN_POOL_SIZE || layout.len() > LAYOUT_NAME_MAX {
            return Err(Error::Inval);
        }
        let max_zone = max_zones(pool_size);
        if max_zone == 0 {
            debug!("pool of {} bytes is too small for a zone", pool_size);
            return Err(Error::Inval);
        }

        let base = mmap.as_mut_ptr();
        let mut chunk_locks = Vec::with_capacity(MAX_CHUNK_LOCKS);
        chunk_locks.resize_with(MAX_CHUNK_LOCKS, || Mutex::new(()));

        let backend = PersistentBackend {
            mmap,
            base,
            max_zone,
            zones_exhausted: AtomicUsize::new(0),
            chunk_locks,
        };
        backend.open_storage(layout)?;
        Ok(backend)
    }

    fn size(&self) -> usize {
        self.mmap.len()
    }

    fn header(&self) -> &mut PoolHeader {
        unsafe { &mut *(self.base as *mut PoolHeader) }
    }

    fn backup_header(&self, zone_idx: usize) -> &mut PoolHeader {
        unsafe { &mut *(self.base.add(zone_off(zone_idx)) as *mut PoolHeader) }
    }

    fn slot(&self, idx: usize) -> &mut InfoSlot {
        debug_assert!(idx < MAX_INFO_SLOT);
        unsafe {
            &mut *(self
                .base
                .add(INFO_SLOT_TABLE_OFF + idx * INFO_SLOT_SIZE) as *mut InfoSlot)
        }
    }

    fn chunk_header(&self, zone_idx: usize, chunk_idx: usize) -> &mut ChunkHeader {
        debug_assert!(chunk_idx < MAX_CHUNK);
        unsafe {
            &mut *(self.base.add(chunk_header_off(zone_idx, chunk_idx)) as *mut ChunkHeader)
        }
    }

    fn run_header(&self, zone_idx: usize, chunk_idx: usize) -> &mut RunHeader {
        unsafe { &mut *(self.base.add(chunk_data_off(zone_idx, chunk_idx)) as *mut RunHeader) }
    }

    fn chunk_lock(&self, zone_idx: usize, chunk_idx: usize) -> &Mutex<()> {
        &self.chunk_locks[(zone_idx << 16 | chunk_idx) % MAX_CHUNK_LOCKS]
    }

    fn zone_size(&self, zone_idx: usize) -> u32 {
        zone_size_idx(zone_idx, self.max_zone, self.size())
    }

    /// Copies one header over another through persistent memory.
    fn copy_header(&self, dest: &mut PoolHeader, src: &PoolHeader) {
        unsafe {
            ll::pmem_memcpy(
                dest as *mut PoolHeader as *mut u8,
                src as *const PoolHeader as *const u8,
                POOL_HEADER_SIZE,
            );
        }
    }

    /// Scans the backups for a valid header copy and restores the primary
    /// from it.
    fn recover_primary_header(&self) -> bool {
        for i in 0..self.max_zone {
            if self.backup_header(i).verify() {
                warn!("primary header broken, recovering from backup {}", i);
                let backup = *self.backup_header(i);
                self.copy_header(self.header(), &backup);
                return true;
            }
        }
        false
    }

    fn write_backup_headers(&self) {
        let primary = *self.header();
        for i in 0..self.max_zone {
            self.copy_header(self.backup_header(i), &primary);
        }
    }

    fn zero_info_slots(&self) {
        unsafe {
            ll::pmem_memset(
                self.base.add(INFO_SLOT_TABLE_OFF),
                0,
                MAX_INFO_SLOT * INFO_SLOT_SIZE,
            );
        }
    }

    /// Fresh-formats a zero-initialized region.
    fn write_pool_layout(&self, layout: &str) {
        self.zero_info_slots();
        let hdr = PoolHeader::fresh(self.size() as u64, layout);
        self.copy_header(self.header(), &hdr);
        self.write_backup_headers();
        self.reserve_lane_chunk();
    }

    /// Reserves the first chunk of zone 0 for the per-arena redo lanes.
    ///
    /// The chunk is marked used and never enters the free pool; the rest
    /// of the zone gets its header right away so the zone tiles from the
    /// moment the pool is formatted.
    fn reserve_lane_chunk(&self) {
        unsafe {
            ll::pmem_memset(
                self.base.add(lane_base()),
                0,
                MAX_INFO_SLOT * LANE_SIZE,
            );
        }
        let zone_size = self.zone_size(0);
        debug_assert!(zone_size > 1);
        let rest = self.chunk_header(0, 1);
        self.write_chunk_header(rest, zone_size - 1);
        let lanes = self.chunk_header(0, 0);
        self.write_chunk_header(lanes, 1);
        self.set_chunk_flag(lanes, CHUNK_FLAG_USED);
    }

    /// The redo lane owned by one arena.
    fn lane(&self, arena_id: usize) -> RedoLog {
        unsafe { RedoLog::new(self.base, self.size(), lane_off(arena_id), REDO_LANE_ENTRIES) }
    }

    /// Replays or discards every lane before the info slots are walked,
    /// so a committed publish is finished before its guard is judged.
    fn recover_lanes(&self) {
        for i in 0..MAX_INFO_SLOT {
            self.lane(i).recover();
        }
    }

    /// The pool offset of a destination word, when it lives inside the
    /// pool and a redo entry can name it.
    fn pool_offset_of(&self, ptr: *mut u64) -> Option<u64> {
        let addr = ptr as usize;
        let base = self.base as usize;
        if addr >= base && addr + 8 <= base + self.size() && (addr - base) % 8 == 0 {
            Some((addr - base) as u64)
        } else {
            None
        }
    }

    /// Changes the pool state in the primary header and waterfalls it into
    /// all of the backups.
    fn set_pool_state(&self, state: PoolState) {
        let hdr = self.header();
        hdr.state = state as u32;
        hdr.checksum = hdr.compute_checksum();
        ll::persist_obj(hdr, true);
        self.write_backup_headers();
    }

    /// Rejects pools this build cannot operate on.
    fn can_open_pool(&self, layout: &str) -> Result<()> {
        let h = self.header();
        if h.size != self.size() as u64 {
            debug!("pool size mismatch: header {} mapped {}", h.size, self.size());
            return Err(Error::Inval);
        }
        if h.major != BACKEND_MAJOR {
            debug!("incompatible backend version {}", h.major);
            return Err(Error::Inval);
        }
        if h.chunk_size != CHUNK_SIZE as u64 {
            debug!("chunk size {} differs from the compile-time constant", h.chunk_size);
            return Err(Error::Inval);
        }
        if h.chunks_per_zone != MAX_CHUNK as u64 {
            debug!("chunks per zone {} differs from the compile-time constant", h.chunks_per_zone);
            return Err(Error::Inval);
        }
        if h.layout() != layout.as_bytes() {
            debug!("pool layout mismatch");
            return Err(Error::Inval);
        }
        Ok(())
    }

    fn open_storage(&self, layout: &str) -> Result<()> {
        let valid = self.header().verify() || self.recover_primary_header();

        if valid {
            self.can_open_pool(layout)?;
        } else if utils::as_bytes(self.header()).iter().all(|&b| b == 0) {
            self.write_pool_layout(layout);
        } else {
            return Err(Error::Corrupt);
        }

        match self.header().state()? {
            PoolState::Closed => {
                #[cfg(debug_assertions)]
                for i in 0..MAX_INFO_SLOT {
                    debug_assert_eq!(self.slot(i).raw_type(), INFO_SLOT_TYPE_UNKNOWN);
                }
            }
            PoolState::Open => {
                self.recover_lanes();
                for i in 0..MAX_INFO_SLOT {
                    self.recover_info_slot(i)?;
                }
            }
            PoolState::Unknown => return Err(Error::Corrupt),
        }

        self.ensure_lane_chunk();
        self.set_pool_state(PoolState::Open);
        Ok(())
    }

    /// Pools formatted by this implementation always carry the lane
    /// reservation; a pool whose zone 0 was never used gets it here.
    fn ensure_lane_chunk(&self) {
        if !self.chunk_header(0, 0).is_live() {
            self.reserve_lane_chunk();
        }
    }

    /// Undoes or completes the operation recorded in one info slot.
    ///
    /// The actions are flushed with plain persists and written so that
    /// re-running them after another interruption converges on the same
    /// state.
    fn recover_info_slot(&self, idx: usize) -> Result<()> {
        let slot = self.slot(idx);
        if slot.is_clear() {
            return Ok(());
        }

        match slot.decode()? {
            SlotRecord::Unknown => {
                // a slot clear was interrupted, finish zeroing it
            }
            SlotRecord::Alloc { dest } => {
                if let Some(ptr) = self.dest_word(dest) {
                    let val = unsafe { *ptr };
                    if val != 0 {
                        debug!("rolling back interrupted alloc at {:x}", val);
                        self.clear_used_at(val);
                        unsafe { self.set_alloc_ptr(ptr, 0) };
                    }
                }
            }
            SlotRecord::Realloc { dest, old } => {
                if let Some(ptr) = self.dest_word(dest) {
                    let val = unsafe { *ptr };
                    if val != 0 && old != 0 && val != old {
                        debug!("rolling back interrupted realloc at {:x}", val);
                        self.clear_used_at(val);
                        unsafe { self.set_alloc_ptr(ptr, old) };
                        // the old chunk must stay live for the restored offset
                        self.set_used_at(old);
                    }
                }
            }
            SlotRecord::Free { addr } => {
                if let Some(ptr) = self.dest_word(addr) {
                    let val = unsafe { *ptr };
                    if val != 0 {
                        debug!("restoring chunk of interrupted free at {:x}", val);
                        self.set_used_at(val);
                    }
                }
            }
        }

        unsafe {
            ll::pmem_memset(slot as *mut InfoSlot as *mut u8, 0, INFO_SLOT_SIZE);
        }
        Ok(())
    }

    /// Resolves a recorded destination offset to its word, discarding
    /// records that no longer fit the pool.
    fn dest_word(&self, dest: u64) -> Option<*mut u64> {
        if dest % 8 != 0 || dest + 8 > self.size() as u64 {
            warn!("info slot destination {:x} out of pool bounds", dest);
            return None;
        }
        Some(unsafe { self.base.add(dest as usize) as *mut u64 })
    }

    /// Clears `USED` on the chunk holding `off`. Run chunks stay used for
    /// their whole lifetime, their units are reclaimed by the bitmap; the
    /// reserved lane chunk never rolls back.
    fn clear_used_at(&self, off: u64) {
        if let Some((z, c)) = self.chunk_for(off) {
            if z == 0 && c == 0 {
                return;
            }
            let hdr = self.chunk_header(z, c);
            if hdr.ty == CHUNK_TYPE_BASE {
                self.clear_chunk_flag(hdr, CHUNK_FLAG_USED);
            }
        }
    }

    fn set_used_at(&self, off: u64) {
        if let Some((z, c)) = self.chunk_for(off) {
            let hdr = self.chunk_header(z, c);
            if hdr.ty == CHUNK_TYPE_BASE || hdr.ty == CHUNK_TYPE_RUN {
                self.set_chunk_flag(hdr, CHUNK_FLAG_USED);
            }
        }
    }

    /// `chunk_by_offset` bounded by this pool's zones.
    fn chunk_for(&self, off: u64) -> Option<(usize, usize)> {
        if off >= self.size() as u64 {
            return None;
        }
        let (z, c, _) = chunk_by_offset(off)?;
        if z >= self.max_zone || c >= self.zone_size(z) as usize {
            return None;
        }
        Some((z, c))
    }

    fn set_chunk_flag(&self, c: &mut ChunkHeader, flag: u16) -> bool {
        if c.flags & flag != 0 {
            return false;
        }
        c.flags |= flag;
        ll::persist_obj(c, true);
        true
    }

    fn clear_chunk_flag(&self, c: &mut ChunkHeader, flag: u16) -> bool {
        if c.flags & flag == 0 {
            return false;
        }
        c.flags &= !flag;
        ll::persist_obj(c, true);
        true
    }

    /// Writes a valid chunk header. The magic goes in with a second
    /// persist so a torn write never yields a live header.
    fn write_chunk_header(&self, c: &mut ChunkHeader, size_idx: u32) {
        *c = ChunkHeader {
            magic: 0,
            type_specific: 0,
            ty: CHUNK_TYPE_BASE,
            flags: 0,
            size_idx,
        };
        ll::persist_obj(c, true);
        c.magic = CHUNK_HEADER_MAGIC;
        ll::persist_obj(&c.magic, true);
    }

    fn set_chunk_size(&self, c: &mut ChunkHeader, size_idx: u32) {
        debug_assert!(size_idx > 0);
        c.size_idx = size_idx;
        ll::persist_obj(c, true);
    }

    /// Free unit ranges of a run bitmap.
    fn run_free_ranges(&self, zone_id: u16, chunk_id: u16) -> Vec<Block> {
        let run = self.run_header(zone_id as usize, chunk_id as usize);
        let mut free = Vec::new();
        let mut start: Option<usize> = None;
        for i in 0..=RUN_MAX_UNITS {
            let occupied = if i == RUN_MAX_UNITS {
                true
            } else {
                run.bitmap[i / 64] >> (i % 64) & 1 != 0
            };
            match (occupied, start) {
                (false, None) => start = Some(i),
                (true, Some(s)) => {
                    free.push(Block::new(zone_id, chunk_id, s as u16, (i - s) as u16));
                    start = None;
                }
                _ => {}
            }
        }
        free
    }
}

impl Backend for PersistentBackend {
    fn base(&self) -> *mut u8 {
        self.base
    }

    fn pool_size(&self) -> usize {
        self.size()
    }

    fn parse_next_zone(&self) -> Option<Vec<ZoneEntry>> {
        // Serialized by the pool lock; one zone is brought in at a time.
        let idx = self.zones_exhausted.load(Ordering::Relaxed);
        if idx >= self.max_zone {
            return None;
        }
        self.zones_exhausted.store(idx + 1, Ordering::Relaxed);

        let zone_size = self.zone_size(idx) as usize;
        let mut entries = Vec::new();
        let mut i = 0;
        while i < zone_size {
            let c = self.chunk_header(idx, i);
            if !c.is_live() {
                debug_assert_eq!(i, 0);
                self.write_chunk_header(c, zone_size as u32);
            }
            match c.ty {
                CHUNK_TYPE_RUN => {
                    let run = self.run_header(idx, i);
                    entries.push(ZoneEntry::Run {
                        class_id: c.type_specific,
                        block_size: run.block_size,
                        free: self.run_free_ranges(idx as u16, i as u16),
                    });
                }
                _ => {
                    if !c.is_used() {
                        entries.push(ZoneEntry::Free(Block::new(
                            idx as u16,
                            i as u16,
                            0,
                            c.size_idx as u16,
                        )));
                    }
                }
            }
            i += c.size_idx as usize;
        }
        Some(entries)
    }

    fn zones_active(&self) -> usize {
        self.zones_exhausted.load(Ordering::Relaxed)
    }

    fn prepare_chunk_block(&self, blk: Block) -> (Block, Option<Block>) {
        let z = blk.zone_id as usize;
        let c_idx = blk.chunk_id as usize;
        let c = self.chunk_header(z, c_idx);
        let want = blk.size_idx as u32;

        let mut remainder = None;
        if want < c.size_idx {
            let nsize = c.size_idx - want;
            let nc_idx = c_idx + want as usize;
            let nc = self.chunk_header(z, nc_idx);
            // the remainder header must exist before the live one shrinks,
            // so a crash in between leaves it covered, not orphaned
            self.write_chunk_header(nc, nsize);
            self.set_chunk_size(c, want);
            remainder = Some(Block::new(blk.zone_id, nc_idx as u16, 0, nsize as u16));
        }

        (
            Block::new(blk.zone_id, blk.chunk_id, 0, c.size_idx as u16),
            remainder,
        )
    }

    fn set_chunk_state(&self, blk: Block, allocated: bool) -> bool {
        let z = blk.zone_id as usize;
        let c_idx = blk.chunk_id as usize;
        let c = self.chunk_header(z, c_idx);
        debug_assert!(c.is_live());
        if allocated {
            unsafe {
                ll::pmem_memset(
                    self.base.add(chunk_data_off(z, c_idx)),
                    0,
                    c.size_idx as usize * CHUNK_SIZE,
                );
            }
            self.set_chunk_flag(c, CHUNK_FLAG_USED)
        } else {
            self.clear_chunk_flag(c, CHUNK_FLAG_USED)
        }
    }

    fn merge_chunks(&self, blk: Block, adjacent: Block) -> Block {
        debug_assert_eq!(blk.zone_id, adjacent.zone_id);
        debug_assert_eq!(blk.chunk_id as usize + blk.size_idx as usize, adjacent.chunk_id as usize);

        let z = blk.zone_id as usize;
        let c = self.chunk_header(z, blk.chunk_id as usize);
        let grown = c.size_idx + adjacent.size_idx as u32;
        self.set_chunk_size(c, grown);
        // the swallowed region becomes allocation content
        unsafe {
            ll::pmem_memset(
                self.base
                    .add(chunk_data_off(z, adjacent.chunk_id as usize)),
                0,
                adjacent.size_idx as usize * CHUNK_SIZE,
            );
        }
        Block::new(blk.zone_id, blk.chunk_id, 0, grown as u16)
    }

    fn chunk_after(&self, blk: Block) -> Option<ChunkHeader> {
        let z = blk.zone_id as usize;
        let next = blk.chunk_id as usize + blk.size_idx as usize;
        if next >= self.zone_size(z) as usize {
            return None;
        }
        let hdr = *self.chunk_header(z, next);
        hdr.is_live().then_some(hdr)
    }

    fn create_run(&self, blk: Block, class_id: u32, unit_size: u64, nunits: usize) {
        debug_assert_eq!(blk.size_idx, 1);
        let z = blk.zone_id as usize;
        let c_idx = blk.chunk_id as usize;

        // run metadata first: a crash before the header flip leaves a
        // plain free chunk
        let run = self.run_header(z, c_idx);
        run.block_size = unit_size;
        run.bitmap = [0; RUN_BITMAP_WORDS];
        for i in nunits..RUN_MAX_UNITS {
            run.bitmap[i / 64] |= 1 << (i % 64);
        }
        ll::persist_obj(run, true);

        let c = self.chunk_header(z, c_idx);
        c.ty = CHUNK_TYPE_RUN;
        c.type_specific = class_id;
        ll::persist_obj(c, true);
        c.flags |= CHUNK_FLAG_USED;
        ll::persist_obj(c, true);
    }

    fn run_block_set(&self, blk: Block, block_size: u64, occupied: bool) {
        let z = blk.zone_id as usize;
        let c_idx = blk.chunk_id as usize;
        let _guard = self.chunk_lock(z, c_idx).lock().unwrap();

        if occupied {
            unsafe {
                ll::pmem_memset(
                    self.base.add(
                        chunk_data_off(z, c_idx)
                            + RUN_DATA_OFF
                            + blk.block_off as usize * block_size as usize,
                    ),
                    0,
                    blk.size_idx as usize * block_size as usize,
                );
            }
        }

        let run = self.run_header(z, c_idx);
        let start = blk.block_off as usize;
        let end = start + blk.size_idx as usize;
        debug_assert!(end <= RUN_MAX_UNITS);
        for i in start..end {
            if occupied {
                run.bitmap[i / 64] |= 1 << (i % 64);
            } else {
                run.bitmap[i / 64] &= !(1 << (i % 64));
            }
        }
        ll::persist_range(
            &run.bitmap[start / 64] as *const u64 as *const u8,
            ((end - 1) / 64 - start / 64 + 1) * 8,
            true,
        );
    }

    fn run_bit_is_set(&self, zone_id: u16, chunk_id: u16, unit_idx: u16) -> bool {
        let run = self.run_header(zone_id as usize, chunk_id as usize);
        let i = unit_idx as usize;
        debug_assert!(i < RUN_MAX_UNITS);
        run.bitmap[i / 64] >> (i % 64) & 1 != 0
    }

    fn locate(&self, off: u64) -> Option<Located> {
        if off as usize >= self.size() {
            return None;
        }
        let (z, c_idx, within) = chunk_by_offset(off)?;
        if z >= self.max_zone || c_idx >= self.zone_size(z) as usize {
            return None;
        }
        let c = self.chunk_header(z, c_idx);
        if !c.is_live() || !c.is_used() {
            return None;
        }
        match c.ty {
            CHUNK_TYPE_RUN => {
                let run = self.run_header(z, c_idx);
                if within < RUN_DATA_OFF || run.block_size == 0 {
                    return None;
                }
                let unit_idx = (within - RUN_DATA_OFF) / run.block_size as usize;
                Some(Located::Run {
                    zone_id: z as u16,
                    chunk_id: c_idx as u16,
                    class_id: c.type_specific,
                    block_size: run.block_size,
                    unit_idx: unit_idx as u16,
                })
            }
            _ => {
                if within != 0 {
                    return None;
                }
                Some(Located::Chunk {
                    block: Block::new(z as u16, c_idx as u16, 0, c.size_idx as u16),
                })
            }
        }
    }

    fn set_guard(&self, arena_id: usize, rec: SlotRecord) {
        let slot = self.slot(arena_id);
        debug_assert!(slot.is_clear(), "arena {} guard already raised", arena_id);
        *slot = InfoSlot::encode(rec);
        ll::persist_obj(slot, true);
    }

    fn clear_guard(&self, arena_id: usize) {
        let slot = self.slot(arena_id);
        unsafe {
            ll::pmem_memset(slot as *mut InfoSlot as *mut u8, 0, INFO_SLOT_SIZE);
        }
    }

    unsafe fn set_alloc_ptr(&self, ptr: *mut u64, value: u64) {
        *ptr = value;
        ll::persist_obj(&*ptr, true);
    }

    unsafe fn publish_chunk_state(
        &self,
        lane: usize,
        ptr: *mut u64,
        value: u64,
        blk: Block,
        allocated: bool,
    ) {
        let z = blk.zone_id as usize;
        let c_idx = blk.chunk_id as usize;
        let c = self.chunk_header(z, c_idx);
        debug_assert!(c.is_live());

        if allocated {
            ll::pmem_memset(
                self.base.add(chunk_data_off(z, c_idx)),
                0,
                c.size_idx as usize * CHUNK_SIZE,
            );
        }

        match self.pool_offset_of(ptr) {
            Some(dest) => {
                // one entry publishes the offset, the other flips the
                // flag word of the chunk header; the pair lands with a
                // single checksummed store
                let flags_word = chunk_flags_word_off(z, c_idx) as u64;
                let log = self.lane(lane);
                if allocated {
                    log.store(&[
                        (dest, value, RedoOp::Set),
                        (flags_word, CHUNK_USED_FLAG_WORD, RedoOp::Or),
                    ]);
                } else {
                    log.store(&[
                        (dest, 0, RedoOp::Set),
                        (flags_word, !CHUNK_USED_FLAG_WORD, RedoOp::And),
                    ]);
                }
                log.process();
            }
            None => {
                // a redo entry cannot name a word outside the pool, and
                // recovery could not find it again either; plain ordered
                // persists are all such a destination gets
                if allocated {
                    self.set_alloc_ptr(ptr, value);
                    self.set_chunk_flag(c, CHUNK_FLAG_USED);
                } else {
                    self.clear_chunk_flag(c, CHUNK_FLAG_USED);
                    self.set_alloc_ptr(ptr, 0);
                }
            }
        }
    }

    fn copy_content(&self, dest_off: u64, src_off: u64, len: usize) {
        debug_assert!(dest_off as usize + len <= self.size());
        debug_assert!(src_off as usize + len <= self.size());
        unsafe {
            ll::pmem_memcpy(
                self.base.add(dest_off as usize),
                self.base.add(src_off as usize),
                len,
            );
        }
    }

    fn close(&self) {
        // closing with threads still inside an operation is a programming
        // error
        #[cfg(debug_assertions)]
        for i in 0..MAX_INFO_SLOT {
            debug_assert_eq!(
                self.slot(i).raw_type(),
                INFO_SLOT_TYPE_UNKNOWN,
                "closing pool with a pending info slot"
            );
        }
        self.set_pool_state(PoolState::Closed);
    }
}

/// Checks the consistency of a pool region without opening it.
///
/// A single valid header, either the primary or one of the backups, is
/// enough for the pool to be recoverable; every info slot must parse and
/// every zone's live chunk headers must tile it exactly.
pub fn consistency_check(base: *const u8, size: usize) -> bool {
    if size < MIN_POOL_SIZE {
        return false;
    }

    let header = |off: usize| unsafe { &*(base.add(off) as *const PoolHeader) };

    let mut valid_header = header(0).verify();
    if !valid_header {
        debug!("no valid primary header");
    }

    let mut ok = true;
    for i in 0..MAX_INFO_SLOT {
        let slot =
            unsafe { &*(base.add(INFO_SLOT_TABLE_OFF + i * INFO_SLOT_SIZE) as *const InfoSlot) };
        if !slot.check(size) {
            debug!("info slot {} is inconsistent", i);
            ok = false;
        }
    }

    let max_zone = max_zones(size);
    for z in 0..max_zone {
        if header(zone_off(z)).verify() {
            valid_header = true;
        } else {
            debug!("no valid backup header in zone {}", z);
        }
        ok &= check_zone(base, z, zone_size_idx(z, max_zone, size));
    }

    ok && valid_header
}

/// Verifies that the live chunk headers of a zone tile it exactly.
pub(crate) fn check_zone(base: *const u8, zone_idx: usize, size_idx: u32) -> bool {
    let size_idx = size_idx as usize;
    let mut i = 0;
    while i < size_idx {
        let c = unsafe { &*(base.add(chunk_header_off(zone_idx, i)) as *const ChunkHeader) };
        if !c.is_live() {
            // an unused zone has no headers at all; a hole in the middle
            // is corruption
            if i == 0 {
                return true;
            }
            debug!("zone {} chunk {}: invalid header magic", zone_idx, i);
            return false;
        }
        if c.ty == CHUNK_TYPE_UNKNOWN || c.ty >= MAX_CHUNK_TYPE {
            debug!("zone {} chunk {}: invalid type", zone_idx, i);
            return false;
        }
        if c.size_idx == 0 {
            debug!("zone {} chunk {}: nil size", zone_idx, i);
            return false;
        }
        if c.size_idx as usize > size_idx {
            debug!("zone {} chunk {}: size bigger than the zone", zone_idx, i);
            return false;
        }
        i += c.size_idx as usize;
    }

    if i != size_idx {
        debug!("zone {}: misaligned chunk headers", zone_idx);
        return false;
    }
    true
}
