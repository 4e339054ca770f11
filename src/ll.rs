//! Low-level persistence primitives
//!
//! Every store to the pool that has to survive a power failure goes through
//! one of the helpers in this module. The default path flushes the affected
//! cache lines with `clflush`; the `use_clflushopt`/`use_clwb` features
//! switch to the weakly-ordered variants (which additionally require a store
//! fence), and `use_msync` falls back to `msync(2)` for mappings that are
//! not backed by real persistent memory.

#![allow(unused)]

use std::mem;

/// Cache line size assumed by the flush loop.
pub const CACHE_LINE_SIZE: usize = 64;

#[cfg(target_arch = "x86_64")]
use std::arch::x86_64::{_mm_mfence, _mm_sfence};

/// Flushes the cache lines covering `len` bytes at `ptr` back to memory.
#[inline(always)]
pub fn clflush<T: ?Sized>(ptr: *const T, len: usize) {
    #[cfg(not(feature = "no_persist"))]
    {
        let mut start = ptr as *const u8 as usize;
        let end = start + len;
        start &= !(CACHE_LINE_SIZE - 1);

        while start < end {
            #[cfg(target_arch = "x86_64")]
            unsafe {
                #[cfg(not(any(feature = "use_clflushopt", feature = "use_clwb")))]
                {
                    std::arch::x86_64::_mm_clflush(start as *const u8);
                }
                #[cfg(all(feature = "use_clflushopt", not(feature = "use_clwb")))]
                {
                    std::arch::asm!("clflushopt [{}]", in(reg) start);
                }
                #[cfg(all(feature = "use_clwb", not(feature = "use_clflushopt")))]
                {
                    std::arch::asm!("clwb [{}]", in(reg) start);
                }
                #[cfg(all(feature = "use_clwb", feature = "use_clflushopt"))]
                {
                    compile_error!("Please select only one of clflushopt and clwb");
                }
            }
            start += CACHE_LINE_SIZE;
        }
    }
}

/// Synchronizes caches and memories and acts like a write barrier
#[inline(always)]
pub fn persist_range(ptr: *const u8, len: usize, fence: bool) {
    #[cfg(not(feature = "no_persist"))]
    {
        #[cfg(not(feature = "use_msync"))]
        {
            clflush(ptr, len);
            if fence {
                sfence();
            }
        }

        #[cfg(feature = "use_msync")]
        unsafe {
            let off = ptr as usize;
            let end = off + len;
            let off = (off >> 12) << 12;
            let len = end - off;
            if libc::msync(
                off as *mut libc::c_void,
                len,
                libc::MS_SYNC | libc::MS_INVALIDATE,
            ) != 0
            {
                panic!("msync failed");
            }
        }
    }
}

/// Synchronizes the cache lines of a whole object back to memory
#[inline(always)]
pub fn persist_obj<T: ?Sized>(obj: &T, fence: bool) {
    persist_range(obj as *const T as *const u8, mem::size_of_val(obj), fence);
}

/// Copies `len` bytes and persists the destination range.
///
/// The stand-in for a non-temporal `memcpy` into persistent memory.
///
/// # Safety
///
/// `dest` and `src` must be valid for `len` bytes and must not overlap.
#[inline]
pub unsafe fn pmem_memcpy(dest: *mut u8, src: *const u8, len: usize) {
    std::ptr::copy_nonoverlapping(src, dest, len);
    persist_range(dest, len, true);
}

/// Fills `len` bytes with `c` and persists the destination range.
///
/// # Safety
///
/// `dest` must be valid for `len` bytes.
#[inline]
pub unsafe fn pmem_memset(dest: *mut u8, c: u8, len: usize) {
    std::ptr::write_bytes(dest, c, len);
    persist_range(dest, len, true);
}

/// Store fence
#[inline(always)]
pub fn sfence() {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        _mm_sfence();
    }
}

/// Memory fence
#[inline]
pub fn mfence() {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        _mm_mfence();
    }
}
