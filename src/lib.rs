//! *cinnabar* is an early-stage persistent-memory object store built around
//! a crash-consistent allocator. A pool is a memory-mapped file; the
//! allocator turns it into a recoverable, multi-threaded heap whose
//! metadata survives a power failure at any instruction boundary.
//!
//! # Architecture
//!
//! The allocator is split into two distinguishable parts, a volatile
//! frontend and a persistent backend:
//!
//! * The **frontend** ([`Pool`]) tracks free memory in per-class
//!   [buckets](crate::bucket) keyed by a best-fit
//!   [container](crate::container), and spreads threads across
//!   [arenas](crate::arena) to keep lock contention down.
//! * The **backend** ([`heap`]) owns the on-media format: a checksummed
//!   pool header (duplicated into per-zone backups), a table of info
//!   slots, and zones of 256 KiB chunks that are split, merged and
//!   subdivided into runs as allocations come and go.
//!
//! Crash consistency rests on two cooperating mechanisms. Every public
//! operation records its intent in the calling arena's persistent *info
//! slot* before touching the user-visible destination word, so a crash in
//! the middle is rolled back or completed on the next open. The offset
//! publish and the chunk-header rewrite of a chunk-granular operation
//! ride the arena's two-entry [`redo`] lane, a checksummed batch of
//! 64-bit updates that commits with a single store and is replayed or
//! discarded whole on recovery.
//!
//! # Example
//!
//! ```no_run
//! use cinnabar::Pool;
//!
//! let pool = Pool::create("foo.pool", "example", 64 * 1024 * 1024, 0o600).unwrap();
//! let mut obj = 0u64;
//! unsafe {
//!     pool.pmalloc(&mut obj, 1024).unwrap();
//!     let data = pool.pdirect(cinnabar::PoolOffset::new(obj));
//!     *data = 17;
//!     pool.pfree(&mut obj).unwrap();
//! }
//! pool.close().unwrap();
//! ```
//!
//! Pool offsets, not raw pointers, are what an application stores inside
//! the pool; see [`PoolOffset`]. Statistics and allocation-class tuning
//! are reachable through the dotted-name [`ctl`] interface.
//!
//! # Environment
//!
//! * `CINNABAR_LOG_LEVEL` — log level filter for the `log` facade.
//! * `CINNABAR_LOG_FILE` — redirect log output into a file.

pub mod arena;
pub mod bucket;
pub mod container;
pub mod ctl;
pub mod heap;
pub mod ll;
pub mod redo;
pub mod stat;
pub mod utils;

mod error;
mod pool;

pub use bucket::{AllocClass, ClassRange, HeaderKind, MAX_ALLOC_CLASSES};
pub use ctl::{ctl, AllocClassDesc, AllocClassParams, AllocClassRange, CtlArg};
pub use error::{result, Error};
pub use pool::{Pool, PoolOffset, MAX_ARENAS};
pub use redo::{RedoLog, RedoOp};
