//! On-media format of the persistent heap
//!
//! The pool is a flat byte region with a fixed layout:
//!
//! ```text
//! +--------------------+ 0
//! | primary header     | 1024 B
//! +--------------------+ 1024
//! | info slots         | 1024 x 32 B
//! +--------------------+ 33 KiB
//! | zone 0             | backup header + 65535 chunk headers + chunk data
//! +--------------------+
//! | zone 1 ...         | the final zone may hold fewer chunks
//! +--------------------+
//! ```
//!
//! Everything in this module describes bytes as they appear on media; no
//! volatile state lives here. All multi-byte fields are little-endian as
//! laid down by the native byte order of the supported targets.

use crate::error::Error;
use crate::result::Result;
use crate::utils;

/// Signature at the start of every pool header.
pub const POOL_SIGNATURE: [u8; POOL_SIGNATURE_LEN] = *b"MEMORY_POOL_HDR\0";
pub const POOL_SIGNATURE_LEN: usize = 16;

/// On-media format version implemented by this build.
pub const BACKEND_MAJOR: u64 = 1;
pub const BACKEND_MINOR: u64 = 0;

/// Chunk indexes are stored on 16 bits, hence the limit; it's still plenty.
pub const MAX_CHUNK: usize = 65535;

/// The unit of coarse-grained allocation. Compile-time constant; pools
/// created with a different chunk size are rejected at open.
pub const CHUNK_SIZE: usize = 256 * 1024;

/// Width of the info-slot table. One slot per arena, slot index == arena id.
pub const MAX_INFO_SLOT: usize = 1024;

/// Magic carried by every live chunk header.
pub const CHUNK_HEADER_MAGIC: u32 = 0xC3F0;

/// Zones smaller than this are not worth managing and are rejected.
pub const ZONE_MIN_SIZE: usize = 32 * CHUNK_SIZE;

/// Smallest acceptable pool file.
pub const MIN_POOL_SIZE: usize = 2 * 1024 * 1024;

/// Maximum length of the layout name embedded in the header.
pub const LAYOUT_NAME_MAX: usize = 64;

pub const POOL_HEADER_SIZE: usize = 1024;
pub const INFO_SLOT_SIZE: usize = 32;
pub const CHUNK_HEADER_SIZE: usize = 16;
const RESERVED_SIZE: usize = 952;

/// Offset of the checksum field inside the pool header.
pub const HEADER_CHECKSUM_OFF: usize = POOL_HEADER_SIZE - 8;

/// Start of the info-slot table.
pub const INFO_SLOT_TABLE_OFF: usize = POOL_HEADER_SIZE;

/// Start of the first zone.
pub const ZONE_BASE_OFF: usize = INFO_SLOT_TABLE_OFF + MAX_INFO_SLOT * INFO_SLOT_SIZE;

/// Backup header plus the chunk-header grid, before any chunk data.
pub const ZONE_META_SIZE: usize = POOL_HEADER_SIZE + MAX_CHUNK * CHUNK_HEADER_SIZE;

/// Size of one fully populated zone.
pub const ZONE_FULL_SIZE: usize = ZONE_META_SIZE + MAX_CHUNK * CHUNK_SIZE;

/// State word of the pool header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PoolState {
    Unknown = 0,
    Open = 1,
    Closed = 2,
}

impl PoolState {
    pub fn from_raw(raw: u32) -> Result<Self> {
        match raw {
            0 => Ok(PoolState::Unknown),
            1 => Ok(PoolState::Open),
            2 => Ok(PoolState::Closed),
            _ => Err(Error::Corrupt),
        }
    }
}

/// Pool header, duplicated as the backup header of every zone.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct PoolHeader {
    pub signature: [u8; POOL_SIGNATURE_LEN],
    pub flags: u32,
    pub state: u32,
    pub major: u64,
    pub minor: u64,
    pub size: u64,
    pub chunk_size: u64,
    pub chunks_per_zone: u64,
    pub reserved: [u8; RESERVED_SIZE],
    pub checksum: u64,
}

impl PoolHeader {
    /// A fresh header for a pool of `size` bytes, in the `Closed` state,
    /// with `layout` embedded at the start of the reserved region and the
    /// checksum filled in.
    pub fn fresh(size: u64, layout: &str) -> Self {
        let mut hdr = PoolHeader {
            signature: POOL_SIGNATURE,
            flags: 0,
            state: PoolState::Closed as u32,
            major: BACKEND_MAJOR,
            minor: BACKEND_MINOR,
            size,
            chunk_size: CHUNK_SIZE as u64,
            chunks_per_zone: MAX_CHUNK as u64,
            reserved: [0; RESERVED_SIZE],
            checksum: 0,
        };
        let name = layout.as_bytes();
        hdr.reserved[..name.len()].copy_from_slice(name);
        hdr.checksum = hdr.compute_checksum();
        hdr
    }

    pub fn compute_checksum(&self) -> u64 {
        utils::checksum(utils::as_bytes(self), HEADER_CHECKSUM_OFF)
    }

    /// A header is valid when its checksum holds and it carries the
    /// signature.
    pub fn verify(&self) -> bool {
        self.checksum == self.compute_checksum() && self.signature == POOL_SIGNATURE
    }

    pub fn state(&self) -> Result<PoolState> {
        PoolState::from_raw(self.state)
    }

    /// The layout name embedded at creation time.
    pub fn layout(&self) -> &[u8] {
        let end = self.reserved[..LAYOUT_NAME_MAX]
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(LAYOUT_NAME_MAX);
        &self.reserved[..end]
    }
}

/// Discriminants of the info-slot record types.
pub const INFO_SLOT_TYPE_UNKNOWN: u32 = 0;
pub const INFO_SLOT_TYPE_ALLOC: u32 = 1;
pub const INFO_SLOT_TYPE_REALLOC: u32 = 2;
pub const INFO_SLOT_TYPE_FREE: u32 = 3;

/// The in-flight operation recorded by an info slot.
///
/// Offsets are byte offsets from the pool base: `dest` locates the
/// destination word of the operation, `old` is the pre-existing value of
/// that word for a reallocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotRecord {
    Unknown,
    Alloc { dest: u64 },
    Realloc { dest: u64, old: u64 },
    Free { addr: u64 },
}

/// One entry of the info-slot table.
///
/// A fixed 32-byte record; the typed view is [`SlotRecord`]. Unused payload
/// words must be zero so that a torn slot clear is recognisable.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct InfoSlot {
    ty: u32,
    reserved: u32,
    payload: [u64; 3],
}

impl InfoSlot {
    pub fn encode(rec: SlotRecord) -> Self {
        let (ty, payload) = match rec {
            SlotRecord::Unknown => (INFO_SLOT_TYPE_UNKNOWN, [0, 0, 0]),
            SlotRecord::Alloc { dest } => (INFO_SLOT_TYPE_ALLOC, [dest, 0, 0]),
            SlotRecord::Realloc { dest, old } => (INFO_SLOT_TYPE_REALLOC, [dest, old, 0]),
            SlotRecord::Free { addr } => (INFO_SLOT_TYPE_FREE, [addr, 0, 0]),
        };
        InfoSlot {
            ty,
            reserved: 0,
            payload,
        }
    }

    pub fn decode(&self) -> Result<SlotRecord> {
        match self.ty {
            INFO_SLOT_TYPE_UNKNOWN => Ok(SlotRecord::Unknown),
            INFO_SLOT_TYPE_ALLOC => Ok(SlotRecord::Alloc {
                dest: self.payload[0],
            }),
            INFO_SLOT_TYPE_REALLOC => Ok(SlotRecord::Realloc {
                dest: self.payload[0],
                old: self.payload[1],
            }),
            INFO_SLOT_TYPE_FREE => Ok(SlotRecord::Free {
                addr: self.payload[0],
            }),
            _ => Err(Error::Corrupt),
        }
    }

    /// True when the slot is fully zeroed, i.e. no residue of an
    /// interrupted operation or clear remains.
    pub fn is_clear(&self) -> bool {
        self.ty == INFO_SLOT_TYPE_UNKNOWN
            && self.reserved == 0
            && self.payload == [0, 0, 0]
    }

    pub fn raw_type(&self) -> u32 {
        self.ty
    }

    /// Consistency check of a single slot against the pool bounds. An
    /// `Unknown` slot may carry garbage (interrupted clear); any typed slot
    /// must have zeroed reserve words and in-bounds offsets.
    pub fn check(&self, pool_size: usize) -> bool {
        match self.decode() {
            Err(_) => false,
            Ok(SlotRecord::Unknown) => true,
            Ok(rec) => {
                if self.reserved != 0 {
                    return false;
                }
                let in_bounds = |off: u64| off <= pool_size as u64;
                match rec {
                    SlotRecord::Alloc { dest } => self.payload[1] == 0
                        && self.payload[2] == 0
                        && in_bounds(dest),
                    SlotRecord::Realloc { dest, old } => {
                        self.payload[2] == 0 && in_bounds(dest) && in_bounds(old)
                    }
                    SlotRecord::Free { addr } => {
                        self.payload[1] == 0 && self.payload[2] == 0 && in_bounds(addr)
                    }
                    SlotRecord::Unknown => unreachable!(),
                }
            }
        }
    }
}

/// Chunk types.
pub const CHUNK_TYPE_UNKNOWN: u16 = 0;
pub const CHUNK_TYPE_BASE: u16 = 1;
pub const CHUNK_TYPE_RUN: u16 = 2;
pub const CHUNK_TYPE_BITMAP: u16 = 3;
pub const MAX_CHUNK_TYPE: u16 = 4;

/// Chunk flags.
pub const CHUNK_FLAG_USED: u16 = 0x0001;
pub const CHUNK_FLAG_ZEROED: u16 = 0x0002;

/// Header of one chunk. When a chunk spans N chunk slots only the first
/// header is live; the following N-1 headers are implicitly covered.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct ChunkHeader {
    pub magic: u32,
    pub type_specific: u32,
    pub ty: u16,
    pub flags: u16,
    pub size_idx: u32,
}

impl ChunkHeader {
    pub fn is_live(&self) -> bool {
        self.magic == CHUNK_HEADER_MAGIC
    }

    pub fn is_used(&self) -> bool {
        self.flags & CHUNK_FLAG_USED != 0
    }
}

/// Size of one redo lane: a redo header plus two entries.
pub const LANE_SIZE: usize = 64;

/// Entries per lane: one publishes the user-visible pool-offset, the
/// other rewrites the flag word of the target chunk header.
pub const REDO_LANE_ENTRIES: usize = 2;

/// Start of the per-arena redo lanes. The lanes live in the data area of
/// the first chunk of zone 0, which fresh format reserves for them,
/// rounded up to a cache line.
pub const fn lane_base() -> usize {
    (ZONE_BASE_OFF + ZONE_META_SIZE + LANE_SIZE - 1) & !(LANE_SIZE - 1)
}

/// Byte offset of the redo lane owned by arena `arena_id`.
pub fn lane_off(arena_id: usize) -> usize {
    debug_assert!(arena_id < MAX_INFO_SLOT);
    lane_base() + arena_id * LANE_SIZE
}

/// Byte offset of the 64-bit word of a chunk header that carries the
/// type, flags and size index, the target of redo entries flipping the
/// flag bits.
pub fn chunk_flags_word_off(zone_idx: usize, chunk_idx: usize) -> usize {
    chunk_header_off(zone_idx, chunk_idx) + 8
}

/// The `USED` flag as seen in that 64-bit word.
pub const CHUNK_USED_FLAG_WORD: u64 = (CHUNK_FLAG_USED as u64) << 16;

/// Allocation header of compact-header classes, embedded at the start of
/// the block; the published offset points just past it.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct AllocHeader {
    /// Real size of the block in bytes (units times unit size).
    pub size: u64,
    pub extra: u64,
}

pub const ALLOC_HEADER_SIZE: usize = 16;

/// Subdivision header at the start of a run chunk's data area.
///
/// Bit set means the unit is occupied; bits past the last real unit are
/// pre-set by the final-word mask so the free scan never yields them.
#[repr(C)]
pub struct RunHeader {
    pub block_size: u64,
    pub bitmap: [u64; RUN_BITMAP_WORDS],
}

pub const RUN_BITMAP_WORDS: usize = 16;
pub const RUN_MAX_UNITS: usize = RUN_BITMAP_WORDS * 64;

/// First usable byte of a run chunk's data area, past the run header,
/// rounded up to a cache line.
pub const RUN_DATA_OFF: usize = 192;

/// Number of units a run of the given unit size can hold.
pub fn run_units(unit_size: usize, units_per_block: u32) -> usize {
    let fit = (CHUNK_SIZE - RUN_DATA_OFF) / unit_size;
    fit.min(RUN_MAX_UNITS).min(units_per_block as usize)
}

/// Number of zones a pool of `rawsize` bytes holds. A trailing remainder
/// of `ZONE_MIN_SIZE` bytes or less is not worth a zone and stays unused.
pub fn max_zones(rawsize: usize) -> usize {
    let mut rawsize = rawsize;
    let mut max_zone = 0;
    while rawsize > ZONE_MIN_SIZE {
        max_zone += 1;
        rawsize -= rawsize.min(ZONE_FULL_SIZE);
    }
    max_zone
}

/// Byte offset of zone `zone_idx`.
pub fn zone_off(zone_idx: usize) -> usize {
    ZONE_BASE_OFF + zone_idx * ZONE_FULL_SIZE
}

/// Byte offset of the header of chunk `chunk_idx` in zone `zone_idx`.
pub fn chunk_header_off(zone_idx: usize, chunk_idx: usize) -> usize {
    zone_off(zone_idx) + POOL_HEADER_SIZE + chunk_idx * CHUNK_HEADER_SIZE
}

/// Byte offset of the data of chunk `chunk_idx` in zone `zone_idx`.
pub fn chunk_data_off(zone_idx: usize, chunk_idx: usize) -> usize {
    zone_off(zone_idx) + ZONE_META_SIZE + chunk_idx * CHUNK_SIZE
}

/// Number of chunks in zone `zone_idx`. All zones are full except possibly
/// the last, whose count reflects the truncated tail of the pool.
pub fn zone_size_idx(zone_idx: usize, max_zone: usize, pool_size: usize) -> u32 {
    if zone_idx + 1 < max_zone {
        return MAX_CHUNK as u32;
    }
    let data = pool_size - zone_off(zone_idx) - ZONE_META_SIZE;
    (data / CHUNK_SIZE).min(MAX_CHUNK) as u32
}

/// Locates the chunk containing a pool offset by pure arithmetic on the
/// layout constants. Returns `(zone_idx, chunk_idx, offset-within-chunk)`,
/// or `None` when the offset does not land in any chunk data area.
pub fn chunk_by_offset(data_offset: u64) -> Option<(usize, usize, usize)> {
    let off = data_offset as usize;
    if off < ZONE_BASE_OFF {
        return None;
    }
    let rel = off - ZONE_BASE_OFF;
    let zone_idx = rel / ZONE_FULL_SIZE;
    let zrel = rel % ZONE_FULL_SIZE;
    if zrel < ZONE_META_SIZE {
        return None;
    }
    let crel = zrel - ZONE_META_SIZE;
    Some((zone_idx, crel / CHUNK_SIZE, crel % CHUNK_SIZE))
}

#[cfg(test)]
mod test {
    use super::*;
    use std::mem::size_of;

    #[test]
    fn design_compliance() {
        assert_eq!(size_of::<PoolHeader>(), 1024);
        assert_eq!(size_of::<InfoSlot>(), 32);
        assert_eq!(size_of::<ChunkHeader>(), 16);
        assert_eq!(ZONE_BASE_OFF, 33 * 1024);
        assert_eq!(POOL_SIGNATURE.len(), 16);
        assert_eq!(&POOL_SIGNATURE[..15], b"MEMORY_POOL_HDR");
    }

    #[test]
    fn fresh_header_verifies() {
        let hdr = PoolHeader::fresh(64 * 1024 * 1024, "test");
        assert!(hdr.verify());
        assert_eq!(hdr.layout(), b"test");
        assert_eq!(hdr.state().unwrap(), PoolState::Closed);

        let mut broken = hdr;
        broken.size += 1;
        assert!(!broken.verify());
    }

    #[test]
    fn slot_round_trip() {
        let recs = [
            SlotRecord::Unknown,
            SlotRecord::Alloc { dest: 0x1234 },
            SlotRecord::Realloc {
                dest: 0x1234,
                old: 0x5678,
            },
            SlotRecord::Free { addr: 0x9abc },
        ];
        for rec in recs {
            let slot = InfoSlot::encode(rec);
            assert_eq!(slot.decode().unwrap(), rec);
            assert!(slot.check(1 << 20));
        }
        assert!(InfoSlot::encode(SlotRecord::Unknown).is_clear());
        assert!(!InfoSlot::encode(SlotRecord::Free { addr: 1 }).is_clear());
    }

    #[test]
    fn slot_check_rejects_out_of_bounds() {
        let slot = InfoSlot::encode(SlotRecord::Alloc { dest: 1 << 30 });
        assert!(!slot.check(1 << 20));
        let slot = InfoSlot {
            ty: 99,
            reserved: 0,
            payload: [0; 3],
        };
        assert!(!slot.check(1 << 20));
    }

    #[test]
    fn zone_counting() {
        assert_eq!(max_zones(ZONE_MIN_SIZE), 0);
        assert_eq!(max_zones(ZONE_MIN_SIZE + 1), 1);
        assert_eq!(max_zones(64 * 1024 * 1024), 1);
        assert_eq!(max_zones(ZONE_FULL_SIZE), 1);
        assert_eq!(max_zones(ZONE_FULL_SIZE + ZONE_MIN_SIZE + 1), 2);
        assert_eq!(max_zones(2 * ZONE_FULL_SIZE), 2);
    }

    #[test]
    fn trailing_zone_is_truncated() {
        let pool_size = 64 * 1024 * 1024;
        let n = max_zones(pool_size);
        let idx = zone_size_idx(0, n, pool_size);
        assert!(idx > 0 && (idx as usize) < MAX_CHUNK);
        // every chunk of the zone must fit inside the pool
        let end = chunk_data_off(0, idx as usize - 1) + CHUNK_SIZE;
        assert!(end <= pool_size);
        let over = chunk_data_off(0, idx as usize) + CHUNK_SIZE;
        assert!(over > pool_size);
    }

    #[test]
    fn chunk_offset_round_trip() {
        for (z, c) in [(0usize, 0usize), (0, 17), (1, 42), (2, MAX_CHUNK - 1)] {
            let off = chunk_data_off(z, c) as u64;
            assert_eq!(chunk_by_offset(off), Some((z, c, 0)));
            assert_eq!(chunk_by_offset(off + 100), Some((z, c, 100)));
        }
        assert_eq!(chunk_by_offset(0), None);
        assert_eq!(chunk_by_offset((ZONE_BASE_OFF + 10) as u64), None);
    }

    #[test]
    fn lane_geometry() {
        assert_eq!(lane_base() % LANE_SIZE, 0);
        assert!(lane_base() >= chunk_data_off(0, 0));
        // every lane fits inside the reserved first chunk
        let end = lane_off(MAX_INFO_SLOT - 1) + LANE_SIZE;
        assert!(end <= chunk_data_off(0, 0) + CHUNK_SIZE);
        assert_eq!(lane_off(0), lane_base());
        assert_eq!(lane_off(3) - lane_off(2), LANE_SIZE);
    }

    #[test]
    fn chunk_flags_word_reaches_the_flags() {
        // the flags field sits at bits 16..32 of the third header word
        assert_eq!(chunk_flags_word_off(0, 0), chunk_header_off(0, 0) + 8);
        assert_eq!(chunk_flags_word_off(0, 0) % 8, 0);
        assert_eq!(CHUNK_USED_FLAG_WORD, 1 << 16);
    }

    #[test]
    fn run_unit_math() {
        let units = run_units(128, 1000);
        assert_eq!(units, 1000);
        let units = run_units(128, 5000);
        assert_eq!(units, RUN_MAX_UNITS);
        let units = run_units(CHUNK_SIZE / 2, 1000);
        assert_eq!(units, 1);
    }
}
