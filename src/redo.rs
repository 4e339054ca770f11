//! Redo log: crash-atomic multi-word publishes
//!
//! A redo log is a short persistent array of `(offset, value)` updates that
//! is either applied in full or not at all. The caller stages every entry
//! and publishes them with a single checksummed store; on recovery a log
//! with a valid checksum is replayed, anything else is discarded. Entries
//! are idempotent (`set`, `and`, `or`), so replaying an already-processed
//! log is harmless.
//!
//! The three low bits of the on-media offset word are reserved: bit 0 is
//! the finish flag of the last entry, bits 1-2 carry the operation. The
//! remaining bits are the byte offset of the target word from the pool
//! base.

use crate::error::Error;
use crate::ll;
use crate::result::Result;

const REDO_FINISH_FLAG: u64 = 1;
const REDO_OPERATION_SHIFT: u64 = 1;
const REDO_OPERATION_MASK: u64 = 0b11 << REDO_OPERATION_SHIFT;
const REDO_FLAG_MASK: u64 = !(REDO_FINISH_FLAG | REDO_OPERATION_MASK);

/// Primitive 64-bit update applied by a redo entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum RedoOp {
    Set = 0,
    And = 1,
    Or = 2,
}

impl RedoOp {
    fn from_raw(raw: u64) -> Result<Self> {
        match raw {
            0 => Ok(RedoOp::Set),
            1 => Ok(RedoOp::And),
            2 => Ok(RedoOp::Or),
            _ => Err(Error::Corrupt),
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
struct RedoHeader {
    checksum: u64,
    next: u64,
    capacity: u64,
    unused: u64,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct RedoEntry {
    offset: u64,
    value: u64,
}

impl RedoEntry {
    fn create(offset: u64, value: u64, op: RedoOp) -> Self {
        debug_assert_eq!(offset & !REDO_FLAG_MASK, 0, "offset collides with flag bits");
        RedoEntry {
            offset: offset | ((op as u64) << REDO_OPERATION_SHIFT),
            value,
        }
    }

    fn offset(&self) -> u64 {
        self.offset & REDO_FLAG_MASK
    }

    fn operation(&self) -> Result<RedoOp> {
        RedoOp::from_raw((self.offset & REDO_OPERATION_MASK) >> REDO_OPERATION_SHIFT)
    }

    fn is_last(&self) -> bool {
        self.offset & REDO_FINISH_FLAG != 0
    }
}

const HEADER_SIZE: usize = std::mem::size_of::<RedoHeader>();
const ENTRY_SIZE: usize = std::mem::size_of::<RedoEntry>();

/// A view over one persistent redo log region inside the pool.
///
/// The region holds a [`RedoHeader`] followed by `capacity` entries. Each
/// concurrent caller owns its own log; the view itself provides no
/// synchronization.
pub struct RedoLog {
    base: *mut u8,
    pool_size: usize,
    log_off: usize,
    capacity: usize,
}

impl RedoLog {
    /// Creates a view of the log region at `log_off`.
    ///
    /// # Safety
    ///
    /// `base..base+pool_size` must be a valid mapping, the log region
    /// (header plus `capacity` entries) must lie inside it at a
    /// cache-line-aligned offset, and the caller must have exclusive access
    /// to the region for the lifetime of the view.
    pub unsafe fn new(base: *mut u8, pool_size: usize, log_off: usize, capacity: usize) -> Self {
        debug_assert_eq!(log_off % ll::CACHE_LINE_SIZE, 0);
        debug_assert!(log_off + HEADER_SIZE + capacity * ENTRY_SIZE <= pool_size);
        debug_assert!(capacity > 0);
        RedoLog {
            base,
            pool_size,
            log_off,
            capacity,
        }
    }

    fn header(&self) -> *mut RedoHeader {
        unsafe { self.base.add(self.log_off) as *mut RedoHeader }
    }

    fn entry(&self, i: usize) -> *mut RedoEntry {
        debug_assert!(i < self.capacity);
        unsafe { self.base.add(self.log_off + HEADER_SIZE + i * ENTRY_SIZE) as *mut RedoEntry }
    }

    /// Zeroes the log metadata so no stale log is replayed.
    pub fn init(&self) {
        unsafe {
            let h = self.header();
            (*h).checksum = 0;
            (*h).next = 0;
            ll::persist_obj(&*h, true);
        }
    }

    /// Stages `updates` and publishes them with one crash-atomic store.
    ///
    /// The entries and the header are assembled in a volatile buffer, the
    /// checksum is computed over that buffer, and the whole block is copied
    /// into the log region. A crash mid-copy leaves an invalid checksum and
    /// the log is discarded on recovery; once the checksum is persisted the
    /// log is committed.
    pub fn store(&self, updates: &[(u64, u64, RedoOp)]) {
        assert!(!updates.is_empty() && updates.len() <= self.capacity);

        let nentries = updates.len();
        let mut buf = vec![0u8; HEADER_SIZE + nentries * ENTRY_SIZE];

        for (i, &(offset, value, op)) in updates.iter().enumerate() {
            let mut e = RedoEntry::create(offset, value, op);
            if i == nentries - 1 {
                e.offset |= REDO_FINISH_FLAG;
            }
            let at = HEADER_SIZE + i * ENTRY_SIZE;
            buf[at..at + 8].copy_from_slice(&e.offset.to_le_bytes());
            buf[at + 8..at + 16].copy_from_slice(&e.value.to_le_bytes());
        }

        let hdr = RedoHeader {
            checksum: 0,
            next: 0,
            capacity: self.capacity as u64,
            unused: 0,
        };
        buf[0..8].copy_from_slice(&hdr.checksum.to_le_bytes());
        buf[8..16].copy_from_slice(&hdr.next.to_le_bytes());
        buf[16..24].copy_from_slice(&hdr.capacity.to_le_bytes());
        buf[24..32].copy_from_slice(&hdr.unused.to_le_bytes());

        let checksum = crate::utils::checksum(&buf, 0);
        buf[0..8].copy_from_slice(&checksum.to_le_bytes());

        unsafe {
            ll::pmem_memcpy(self.base.add(self.log_off), buf.as_ptr(), buf.len());
        }
    }

    /// Counts the committed entries and the number of finish flags.
    fn nflags(&self) -> (usize, usize) {
        let mut nentries = 0;
        let mut nflags = 0;
        for i in 0..self.capacity {
            let e = unsafe { *self.entry(i) };
            if e.is_last() {
                if nflags == 0 {
                    nentries = i + 1;
                }
                nflags += 1;
            }
        }
        (nentries, nflags)
    }

    /// Validates that every committed entry targets a word inside the pool.
    pub fn check(&self) -> Result<()> {
        let (nentries, nflags) = self.nflags();
        if nflags > 1 {
            log::debug!("redo log has too many finish flags");
            return Err(Error::Corrupt);
        }
        for i in 0..nentries {
            let e = unsafe { *self.entry(i) };
            let off = e.offset();
            e.operation()?;
            if off == 0 || off + 8 > self.pool_size as u64 {
                log::debug!("redo log entry {} has invalid offset {:x}", i, off);
                return Err(Error::Corrupt);
            }
        }
        Ok(())
    }

    /// Applies every committed entry to its target and retires the log.
    pub fn process(&self) {
        #[cfg(debug_assertions)]
        self.check().unwrap();

        let (nentries, _) = self.nflags();
        debug_assert!(nentries > 0);

        for i in 0..nentries {
            let e = unsafe { *self.entry(i) };
            self.apply(&e);
        }
        ll::sfence();

        // Dropping the finish flag invalidates the log; replay stops here.
        unsafe {
            let last = self.entry(nentries - 1);
            (*last).offset = 0;
            ll::persist_obj(&(*last).offset, true);
        }
    }

    fn apply(&self, e: &RedoEntry) {
        let off = e.offset();
        let target = unsafe { &mut *(self.base.add(off as usize) as *mut u64) };
        match e.operation().unwrap_or(RedoOp::Set) {
            RedoOp::And => *target &= e.value,
            RedoOp::Or => *target |= e.value,
            RedoOp::Set => *target = e.value,
        }
        ll::persist_obj(target, false);
    }

    /// Replays the log after a restart: a committed log (valid checksum,
    /// exactly one finish flag) is processed, anything else is discarded.
    pub fn recover(&self) {
        let (nentries, nflags) = self.nflags();
        if nentries == 0 || nflags != 1 {
            self.init();
            return;
        }

        let len = HEADER_SIZE + nentries * ENTRY_SIZE;
        let block =
            unsafe { std::slice::from_raw_parts(self.base.add(self.log_off), len) };
        if !crate::utils::checksum_valid(block, 0) {
            self.init();
            return;
        }

        if self.check().is_ok() {
            self.process();
        } else {
            self.init();
        }
    }
}
