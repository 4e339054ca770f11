//! Checksums and byte-level helpers

use std::fs::OpenOptions;
use std::path::Path;

use crate::result::Result;

/// Computes the Fletcher-64 checksum of `data`, skipping the 8-byte
/// checksum field located at `skip_off`.
///
/// The field is skipped rather than zeroed so the checksum can be verified
/// in place without copying the header aside. `data` must be a multiple of
/// 4 bytes long and `skip_off` must be 8-aligned within it.
pub fn checksum(data: &[u8], skip_off: usize) -> u64 {
    debug_assert_eq!(data.len() % 4, 0);
    debug_assert_eq!(skip_off % 4, 0);
    debug_assert!(skip_off + 8 <= data.len());

    let mut lo: u32 = 0;
    let mut hi: u32 = 0;
    for (i, word) in data.chunks_exact(4).enumerate() {
        let off = i * 4;
        if off == skip_off || off == skip_off + 4 {
            continue;
        }
        lo = lo.wrapping_add(u32::from_le_bytes([word[0], word[1], word[2], word[3]]));
        hi = hi.wrapping_add(lo);
    }
    ((hi as u64) << 32) | lo as u64
}

/// Verifies the checksum stored at `skip_off` inside `data`.
pub fn checksum_valid(data: &[u8], skip_off: usize) -> bool {
    let stored = u64::from_le_bytes(data[skip_off..skip_off + 8].try_into().unwrap());
    checksum(data, skip_off) == stored
}

/// Reinterprets an object as its raw bytes.
pub fn as_bytes<T: ?Sized>(x: &T) -> &[u8] {
    let ptr: *const T = x;
    unsafe { std::slice::from_raw_parts(ptr as *const u8, std::mem::size_of_val(x)) }
}

/// Reinterprets a raw address as a reference.
///
/// # Safety
///
/// `addr` must point at a valid, properly aligned `T` that outlives `'a`.
#[inline(always)]
pub unsafe fn read_addr<'a, T>(addr: u64) -> &'a mut T {
    debug_assert_ne!(addr, 0, "null dereferencing");
    &mut *(addr as *mut T)
}

/// Creates (or truncates) a pool file of the given size.
pub(crate) fn create_file<P: AsRef<Path>>(path: P, size: u64, mode: u32) -> Result<()> {
    let mut opts = OpenOptions::new();
    opts.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(mode);
    }
    let file = opts.open(path)?;
    file.set_len(size)?;
    Ok(())
}
