//! Pool frontend
//!
//! The pool is the top-level allocator handle. It owns the backend over the
//! mapped file, the global buckets, the arena table and the allocation
//! class registry, and it implements the public `pmalloc`/`pfree`/
//! `prealloc`/`pdirect` surface with crash-safe publish semantics: every
//! mutation of a user-visible destination word happens between the raise
//! and the clear of the calling arena's info-slot guard.

use std::cell::Cell;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, Once, OnceLock};

use log::debug;
use memmap::{MmapMut, MmapOptions};

use crate::arena::Arena;
use crate::bucket::{AllocClass, Bucket, ClassMap, HeaderKind};
use crate::container::Block;
use crate::error::Error;
use crate::heap::backend::{consistency_check, Backend, Located, PersistentBackend, ZoneEntry};
use crate::heap::layout::{
    chunk_data_off, AllocHeader, PoolHeader, SlotRecord, CHUNK_SIZE, CHUNK_TYPE_BASE,
    LAYOUT_NAME_MAX, MAX_INFO_SLOT, MIN_POOL_SIZE, RUN_DATA_OFF, RUN_MAX_UNITS,
};
use crate::ll;
use crate::result::Result;
use crate::stat::Stats;
use crate::utils;

/// Maximum number of arenas, bounded by the width of the info-slot table.
pub const MAX_ARENAS: usize = MAX_INFO_SLOT;

/// Prefault toggles, set through the CTL tree and consulted at map time.
pub(crate) static PREFAULT_AT_CREATE: AtomicBool = AtomicBool::new(false);
pub(crate) static PREFAULT_AT_OPEN: AtomicBool = AtomicBool::new(false);

// Shared between pools, so the arena distribution may not be ideal when
// several pools are open at once.
thread_local! {
    static ARENA_ID: Cell<Option<usize>> = const { Cell::new(None) };
}

static LOG_INIT: Once = Once::new();

/// Configures the `log` facade from `CINNABAR_LOG_LEVEL` and
/// `CINNABAR_LOG_FILE`, once per process.
fn init_logging() {
    LOG_INIT.call_once(|| {
        let mut builder = env_logger::Builder::new();
        if let Ok(level) = std::env::var("CINNABAR_LOG_LEVEL") {
            builder.parse_filters(&level);
        }
        if let Ok(path) = std::env::var("CINNABAR_LOG_FILE") {
            if let Ok(file) = std::fs::File::create(&path) {
                builder.target(env_logger::Target::Pipe(Box::new(file)));
            }
        }
        let _ = builder.try_init();
    });
}

/// A byte offset from the pool base. `0` denotes null.
///
/// Pool offsets are the only currency of the allocator: they stay valid
/// across close/open cycles and resolve to a raw pointer through
/// [`Pool::pdirect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PoolOffset(u64);

impl PoolOffset {
    pub const NULL: PoolOffset = PoolOffset(0);

    pub fn new(off: u64) -> Self {
        PoolOffset(off)
    }

    pub fn get(self) -> u64 {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// A live allocation resolved from a pool offset.
struct Resolved {
    block: Block,
    /// The published offset it was resolved from.
    off: u64,
    /// `None` for chunk-granular allocations.
    class_id: Option<usize>,
    class: AllocClass,
    usable: usize,
}

/// A freshly obtained block, ready to be published.
struct NewBlock {
    block: Block,
    publish_off: u64,
    usable: usize,
    class_id: Option<usize>,
    class: AllocClass,
}

/// Persistent memory pool handle.
pub struct Pool {
    backend: Box<dyn Backend>,
    /// Free chunks, the feedstock of every class.
    chunk_bucket: Bucket,
    /// Global per-class buckets for run classes.
    global_buckets: [OnceLock<Bucket>; crate::bucket::MAX_ALLOC_CLASSES],
    arenas: Vec<OnceLock<Arena>>,
    classes: Mutex<ClassMap>,
    /// Covers arena assignment and zone refill.
    lock: Mutex<()>,
    stats: Stats,
    closed: AtomicBool,
}

impl Pool {
    /// Creates a pool file of `size` bytes with the given layout name and
    /// unix `mode`, formats it and opens it.
    pub fn create<P: AsRef<Path>>(path: P, layout: &str, size: u64, mode: u32) -> Result<Pool> {
        init_logging();
        if (size as usize) < MIN_POOL_SIZE || layout.len() > LAYOUT_NAME_MAX {
            return Err(Error::Inval);
        }
        utils::create_file(&path, size, mode)?;
        Self::map_and_open(path, layout, PREFAULT_AT_CREATE.load(Ordering::Relaxed))
    }

    /// Opens an existing pool, verifying its header, version and layout
    /// name and running info-slot recovery when the previous run did not
    /// close cleanly.
    pub fn open<P: AsRef<Path>>(path: P, layout: &str) -> Result<Pool> {
        init_logging();
        Self::map_and_open(path, layout, PREFAULT_AT_OPEN.load(Ordering::Relaxed))
    }

    fn map_and_open<P: AsRef<Path>>(path: P, layout: &str, prefault: bool) -> Result<Pool> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut mmap: MmapMut = unsafe { MmapOptions::new().map_mut(&file)? };

        if prefault {
            let len = mmap.len();
            let base = mmap.as_mut_ptr();
            for off in (0..len).step_by(4096) {
                unsafe {
                    std::ptr::read_volatile(base.add(off));
                }
            }
        }

        let backend = PersistentBackend::open(mmap, layout)?;

        let mut arenas = Vec::with_capacity(MAX_ARENAS);
        arenas.resize_with(MAX_ARENAS, OnceLock::new);

        let pool = Pool {
            backend: Box::new(backend),
            chunk_bucket: Bucket::new(usize::MAX, AllocClass::huge()),
            global_buckets: std::array::from_fn(|_| OnceLock::new()),
            arenas,
            classes: Mutex::new(ClassMap::default()),
            lock: Mutex::new(()),
            stats: Stats::new(),
            closed: AtomicBool::new(false),
        };

        {
            let _guard = pool.lock.lock().unwrap();
            pool.fill_next_zone();
        }

        Ok(pool)
    }

    /// Checks the consistency of a pool file without opening it.
    pub fn check<P: AsRef<Path>>(path: P, layout: &str) -> Result<bool> {
        init_logging();
        let file = OpenOptions::new().read(true).open(path)?;
        let mmap = unsafe { MmapOptions::new().map(&file)? };
        if mmap.len() < MIN_POOL_SIZE {
            return Ok(false);
        }
        let hdr = unsafe { &*(mmap.as_ptr() as *const PoolHeader) };
        if hdr.verify() && hdr.layout() != layout.as_bytes() {
            return Err(Error::Inval);
        }
        Ok(consistency_check(mmap.as_ptr(), mmap.len()))
    }

    /// Transitions the pool to its closed state and unmaps it.
    pub fn close(self) -> Result<()> {
        self.backend.close();
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Drops the handle without the clean-shutdown state transition, as a
    /// power failure would. The next open runs recovery. Meant for
    /// crash-consistency testing.
    pub fn crash(self) {
        self.closed.store(true, Ordering::Relaxed);
    }

    /// Resolves a pool offset to a raw pointer. No persistence.
    pub fn pdirect(&self, off: PoolOffset) -> *mut u8 {
        debug_assert!((off.get() as usize) < self.backend.pool_size());
        unsafe { self.backend.base().add(off.get() as usize) }
    }

    /// Usable size of the live allocation published at `off`.
    pub fn alloc_usable_size(&self, off: PoolOffset) -> Result<usize> {
        if off.is_null() {
            return Err(Error::Inval);
        }
        self.resolve(off.get())
            .map(|r| r.usable)
            .ok_or(Error::Inval)
    }

    /// Reads or writes a dotted-name parameter of this pool.
    pub fn ctl(
        &self,
        name: &str,
        read_arg: Option<&mut crate::ctl::CtlArg>,
        write_arg: Option<&mut crate::ctl::CtlArg>,
    ) -> Result<()> {
        crate::ctl::ctl(Some(self), name, read_arg, write_arg)
    }

    /// Acquires a new object from the pool.
    ///
    /// On success the pool offset of the new object is written persistently
    /// to `*ptr`. `*ptr` must be null on entry.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads and writes. For the operation to be
    /// recoverable after a power failure the destination word has to live
    /// inside this pool.
    pub unsafe fn pmalloc(&self, ptr: *mut u64, size: usize) -> Result<()> {
        if size == 0 || *ptr != 0 {
            return Err(Error::Inval);
        }

        let arena = self.select_arena()?;
        arena.guard_up(
            self.backend.as_ref(),
            SlotRecord::Alloc {
                dest: self.dest_off(ptr),
            },
        );
        let res = self.alloc_into(arena, ptr, size);
        arena.guard_down(self.backend.as_ref());
        res
    }

    /// Releases an object back to the pool.
    ///
    /// On success null is written persistently to `*ptr`. Releasing a
    /// destination that does not name a live allocation is a double free:
    /// reported in debug builds, absorbed in release builds.
    ///
    /// # Safety
    ///
    /// Same contract as [`Pool::pmalloc`].
    pub unsafe fn pfree(&self, ptr: *mut u64) -> Result<()> {
        let off = *ptr;
        if off == 0 {
            return Ok(());
        }

        let Some(cur) = self.resolve(off) else {
            return self.double_free();
        };

        let arena = self.select_arena()?;
        arena.guard_up(
            self.backend.as_ref(),
            SlotRecord::Free {
                addr: self.dest_off(ptr),
            },
        );

        match cur.class_id {
            None => {
                // the null publish and the flag clear land as one redo
                // pair; recovery sees the free either whole or not at all
                self.backend
                    .publish_chunk_state(arena.id(), ptr, 0, cur.block, false);
                self.chunk_bucket.add_object(cur.block);
            }
            Some(class_id) => {
                // run chunks stay used, so the null publish leads and the
                // bitmap follows
                self.backend.set_alloc_ptr(ptr, 0);
                self.backend
                    .run_block_set(cur.block, cur.class.unit_size as u64, false);
                arena.bucket(class_id, cur.class).add_object(cur.block);
            }
        }
        self.stats.add_freed(cur.usable as u64);

        arena.guard_down(self.backend.as_ref());
        Ok(())
    }

    /// Resizes or acquires an object.
    ///
    /// `size == 0` frees, a null `*ptr` allocates. A shrinking or
    /// still-fitting request is a no-op. Growth extends in place into the
    /// adjacent free chunk when possible and falls back to
    /// allocate-copy-release; the destination word always carries a valid
    /// offset, old or new.
    ///
    /// # Safety
    ///
    /// Same contract as [`Pool::pmalloc`].
    pub unsafe fn prealloc(&self, ptr: *mut u64, size: usize) -> Result<()> {
        if size == 0 {
            return self.pfree(ptr);
        }
        let off = *ptr;
        if off == 0 {
            return self.pmalloc(ptr, size);
        }

        let Some(cur) = self.resolve(off) else {
            return Err(Error::Inval);
        };
        if cur.usable >= size {
            return Ok(());
        }

        let arena = self.select_arena()?;
        arena.guard_up(
            self.backend.as_ref(),
            SlotRecord::Realloc {
                dest: self.dest_off(ptr),
                old: off,
            },
        );
        let res = self.realloc_impl(arena, ptr, size, &cur);
        arena.guard_down(self.backend.as_ref());
        res
    }

    unsafe fn alloc_into(&self, arena: &Arena, ptr: *mut u64, size: usize) -> Result<()> {
        let nb = self.alloc_block(size)?;
        self.publish_new(arena, ptr, &nb);
        self.stats.add_allocated(nb.usable as u64);
        Ok(())
    }

    /// Makes a fresh block visible at the destination word.
    ///
    /// A chunk-granular block travels through the arena's two-entry redo
    /// lane: the offset publish and the used-flag flip commit as one
    /// crash-atomic pair. A run block leaves its chunk header alone, so
    /// the publish is a single word and the bitmap follows; recovery of
    /// an interrupted run allocation rolls the destination back to null.
    unsafe fn publish_new(&self, arena: &Arena, ptr: *mut u64, nb: &NewBlock) {
        match nb.class_id {
            None => {
                self.backend
                    .publish_chunk_state(arena.id(), ptr, nb.publish_off, nb.block, true);
            }
            Some(_) => {
                self.backend.set_alloc_ptr(ptr, nb.publish_off);
                self.mark_run_allocated(nb);
            }
        }
    }

    unsafe fn realloc_impl(
        &self,
        arena: &Arena,
        ptr: *mut u64,
        size: usize,
        cur: &Resolved,
    ) -> Result<()> {
        if cur.class_id.is_none() && self.try_extend(cur, size)? {
            return Ok(());
        }

        let nb = self.alloc_block(size)?;
        self.publish_new(arena, ptr, &nb);
        self.backend.copy_content(nb.publish_off, cur.off, cur.usable);
        self.stats.add_allocated(nb.usable as u64);

        // release the old object; the guard still covers us, so a crash
        // here rolls everything back to the old offset
        match cur.class_id {
            None => {
                self.backend.set_chunk_state(cur.block, false);
                self.chunk_bucket.add_object(cur.block);
            }
            Some(class_id) => {
                self.backend
                    .run_block_set(cur.block, cur.class.unit_size as u64, false);
                arena.bucket(class_id, cur.class).add_object(cur.block);
            }
        }
        self.stats.add_freed(cur.usable as u64);
        Ok(())
    }

    /// Grows a chunk-granular allocation over the immediately following
    /// free chunk. The published offset does not move.
    fn try_extend(&self, cur: &Resolved, size: usize) -> Result<bool> {
        let needed = self.chunk_bucket.calc_units(size)?;

        let Some(next) = self.backend.chunk_after(cur.block) else {
            return Ok(false);
        };
        if next.is_used() || next.ty != CHUNK_TYPE_BASE {
            return Ok(false);
        }
        if (cur.block.size_idx as u32) + next.size_idx < needed as u32 {
            return Ok(false);
        }

        let adjacent = Block::new(
            cur.block.zone_id,
            cur.block.chunk_id + cur.block.size_idx,
            0,
            next.size_idx as u16,
        );
        if self.chunk_bucket.remove_exact(adjacent).is_none() {
            // the neighbour is owned by someone else right now
            return Ok(false);
        }

        let merged = self.backend.merge_chunks(cur.block, adjacent);
        debug_assert!(merged.size_idx >= needed);
        let want = Block::new(merged.zone_id, merged.chunk_id, 0, needed);
        let (got, remainder) = self.backend.prepare_chunk_block(want);
        if let Some(rest) = remainder {
            self.chunk_bucket.add_object(rest);
        }
        self.stats.add_allocated(
            (got.size_idx - cur.block.size_idx) as u64 * CHUNK_SIZE as u64,
        );
        Ok(true)
    }

    /// Pulls a block for `size` bytes out of the bucket hierarchy.
    fn alloc_block(&self, size: usize) -> Result<NewBlock> {
        let (class_id, class) = {
            let map = self.classes.lock().unwrap();
            let id = map.class_for_size(size)?;
            (id, map.class(id).ok_or(Error::Inval)?)
        };

        if class.is_chunk_granular() {
            let units = self.chunk_bucket.calc_units(size)?;
            let blk = self.get_chunk_block(units)?;
            let (blk, remainder) = self.backend.prepare_chunk_block(blk);
            if let Some(rest) = remainder {
                self.chunk_bucket.add_object(rest);
            }
            let usable = blk.size_idx as usize * CHUNK_SIZE;
            Ok(NewBlock {
                block: blk,
                publish_off: chunk_data_off(blk.zone_id as usize, blk.chunk_id as usize) as u64,
                usable,
                class_id: None,
                class,
            })
        } else {
            let overhead = class.header.overhead();
            let bucket = self.global_bucket(class_id, class);
            let units = bucket.calc_units(size + overhead)?;
            if overhead == 0 && units > 1 {
                // headerless blocks cannot be resolved back to their unit
                // count, they are single-unit by construction
                return Err(Error::Inval);
            }
            let blk = self.get_run_block(class_id, class, units)?;
            let unit = class.unit_size;
            let start = chunk_data_off(blk.zone_id as usize, blk.chunk_id as usize)
                + RUN_DATA_OFF
                + blk.block_off as usize * unit;
            Ok(NewBlock {
                block: blk,
                publish_off: (start + overhead) as u64,
                usable: blk.size_idx as usize * unit - overhead,
                class_id: Some(class_id),
                class,
            })
        }
    }

    fn mark_run_allocated(&self, nb: &NewBlock) {
        self.backend
            .run_block_set(nb.block, nb.class.unit_size as u64, true);
        if nb.class.header == HeaderKind::Compact {
            let start = nb.publish_off as usize - nb.class.header.overhead();
            unsafe {
                let hdr = self.backend.base().add(start) as *mut AllocHeader;
                (*hdr) = AllocHeader {
                    size: (nb.block.size_idx as usize * nb.class.unit_size) as u64,
                    extra: 0,
                };
                ll::persist_obj(&*hdr, true);
            }
        }
    }

    /// Serves `units` chunks, parsing further zones as the feedstock runs
    /// dry.
    fn get_chunk_block(&self, units: u16) -> Result<Block> {
        loop {
            if let Some(blk) = self.chunk_bucket.get_object(units) {
                return Ok(blk);
            }
            let _guard = self.lock.lock().unwrap();
            if let Some(blk) = self.chunk_bucket.get_object(units) {
                return Ok(blk);
            }
            if !self.fill_next_zone() {
                debug!("chunk feedstock exhausted ({} units wanted)", units);
                return Err(Error::Nomem);
            }
        }
    }

    /// Serves `units` of a run class: the private bucket first, then the
    /// global bucket, then the other arenas' caches, and finally a fresh
    /// run carved out of a free chunk.
    fn get_run_block(&self, class_id: usize, class: AllocClass, units: u16) -> Result<Block> {
        let capacity = class.run_capacity();
        if units as usize > capacity {
            return Err(Error::Nomem);
        }
        let arena = self.select_arena()?;

        loop {
            if let Some(blk) = arena.bucket(class_id, class).get_object(units) {
                return Ok(blk);
            }
            if let Some(blk) = self.global_bucket(class_id, class).get_object(units) {
                return Ok(blk);
            }
            for slot in &self.arenas {
                if let Some(other) = slot.get() {
                    if other.id() != arena.id() {
                        if let Some(bucket) = other.bucket_if_init(class_id) {
                            if let Some(blk) = bucket.get_object(units) {
                                return Ok(blk);
                            }
                        }
                    }
                }
            }

            let chunk = self.get_chunk_block(1)?;
            let (chunk, remainder) = self.backend.prepare_chunk_block(chunk);
            if let Some(rest) = remainder {
                self.chunk_bucket.add_object(rest);
            }
            self.backend
                .create_run(chunk, class_id as u32, class.unit_size as u64, capacity);
            arena.bucket(class_id, class).add_object(Block::new(
                chunk.zone_id,
                chunk.chunk_id,
                0,
                capacity as u16,
            ));
        }
    }

    fn global_bucket(&self, class_id: usize, class: AllocClass) -> &Bucket {
        self.global_buckets[class_id].get_or_init(|| Bucket::new(class_id, class))
    }

    /// Brings one more zone's free ranges into the buckets. Caller holds
    /// the pool lock.
    fn fill_next_zone(&self) -> bool {
        let Some(entries) = self.backend.parse_next_zone() else {
            return false;
        };
        for entry in entries {
            match entry {
                ZoneEntry::Free(blk) => self.chunk_bucket.add_object(blk),
                ZoneEntry::Run {
                    class_id,
                    block_size,
                    free,
                } => {
                    let class = self.classes.lock().unwrap().class(class_id as usize);
                    match class {
                        Some(c) if c.unit_size as u64 == block_size => {
                            let bucket = self.global_bucket(class_id as usize, c);
                            for blk in free {
                                bucket.add_object(blk);
                            }
                        }
                        _ => debug!("ignoring run of unregistered class {}", class_id),
                    }
                }
            }
        }
        true
    }

    /// Resolves a published offset back to its allocation.
    fn resolve(&self, off: u64) -> Option<Resolved> {
        match self.backend.locate(off)? {
            Located::Chunk { block } => Some(Resolved {
                block,
                off,
                class_id: None,
                class: AllocClass::huge(),
                usable: block.size_idx as usize * CHUNK_SIZE,
            }),
            Located::Run {
                zone_id,
                chunk_id,
                class_id,
                block_size,
                ..
            } => {
                let class = self.classes.lock().unwrap().class(class_id as usize)?;
                if class.unit_size as u64 != block_size {
                    return None;
                }
                let overhead = class.header.overhead();
                let data =
                    (chunk_data_off(zone_id as usize, chunk_id as usize) + RUN_DATA_OFF) as u64;
                let start = off.checked_sub(overhead as u64)?;
                if start < data || (start - data) % block_size != 0 {
                    return None;
                }
                let unit_idx = ((start - data) / block_size) as usize;
                if unit_idx >= RUN_MAX_UNITS
                    || !self.backend.run_bit_is_set(zone_id, chunk_id, unit_idx as u16)
                {
                    return None;
                }

                let units = match class.header {
                    HeaderKind::Compact => {
                        let hdr =
                            unsafe { &*(self.backend.base().add(start as usize) as *const AllocHeader) };
                        if hdr.size == 0 || hdr.size % block_size != 0 {
                            return None;
                        }
                        (hdr.size / block_size) as usize
                    }
                    _ => 1,
                };
                if unit_idx + units > RUN_MAX_UNITS {
                    return None;
                }

                Some(Resolved {
                    block: Block::new(zone_id, chunk_id, unit_idx as u16, units as u16),
                    off,
                    class_id: Some(class_id as usize),
                    class,
                    usable: units * class.unit_size - overhead,
                })
            }
        }
    }

    fn double_free(&self) -> Result<()> {
        debug!("object already free (double free?)");
        if cfg!(debug_assertions) {
            Err(Error::DoubleFree)
        } else {
            Ok(())
        }
    }

    fn dest_off(&self, ptr: *mut u64) -> u64 {
        (ptr as u64).wrapping_sub(self.backend.base() as u64)
    }

    /// The arena serving the current thread, assigned on first use to the
    /// least-loaded one.
    fn select_arena(&self) -> Result<&Arena> {
        let cached = ARENA_ID.with(|c| c.get());
        if let Some(id) = cached {
            if let Some(arena) = self.arenas[id].get() {
                return Ok(arena);
            }
        }
        self.select_thread_arena_slow(cached)
    }

    fn select_thread_arena_slow(&self, cached: Option<usize>) -> Result<&Arena> {
        let _guard = self.lock.lock().unwrap();
        let id = cached.unwrap_or_else(|| self.select_arena_id());
        let arena = self.arenas[id].get_or_init(|| Arena::new(id));
        arena.attach_thread();
        ARENA_ID.with(|c| c.set(Some(id)));
        Ok(arena)
    }

    /// The first empty arena slot, or the one with the fewest attached
    /// threads.
    fn select_arena_id(&self) -> usize {
        let mut id = 0;
        let mut min_threads = u32::MAX;
        for (i, slot) in self.arenas.iter().enumerate() {
            match slot.get() {
                None => return i,
                Some(arena) => {
                    if arena.associated_threads() < min_threads {
                        min_threads = arena.associated_threads();
                        id = i;
                    }
                }
            }
        }
        id
    }

    pub(crate) fn stats(&self) -> &Stats {
        &self.stats
    }

    pub(crate) fn zones_active(&self) -> usize {
        self.backend.zones_active()
    }

    pub(crate) fn classes(&self) -> &Mutex<ClassMap> {
        &self.classes
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Relaxed) {
            self.backend.close();
        }
    }
}
