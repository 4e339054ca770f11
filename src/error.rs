//! Allocator error taxonomy

use thiserror::Error;

/// Errors reported at the public allocator surface.
#[derive(Debug, Error)]
pub enum Error {
    /// The pool cannot satisfy the request even after falling back and
    /// draining the per-arena caches.
    #[error("out of persistent memory")]
    Nomem,

    /// Malformed CTL name, wrong argument combination, zero-sized or
    /// pre-published allocation, unknown class id, out-of-range offset, or
    /// version mismatch.
    #[error("invalid argument")]
    Inval,

    /// No valid primary or backup header, torn chunk headers, or an info
    /// slot that cannot be interpreted.
    #[error("pool is corrupt")]
    Corrupt,

    /// The target of a `pfree` is not a live allocation.
    #[error("double free")]
    DoubleFree,

    /// Underlying mmap or file I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// The small integer kind of the error, for callers that speak errno.
    pub fn kind(&self) -> i32 {
        match self {
            Error::Nomem => libc::ENOMEM,
            Error::Inval => libc::EINVAL,
            Error::Corrupt => libc::EBADF,
            Error::DoubleFree => libc::EFAULT,
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

/// A `Result` with the allocator error type
pub mod result {
    pub type Result<T> = std::result::Result<T, super::Error>;
}
