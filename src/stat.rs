//! Heap statistics

use std::sync::atomic::{AtomicU64, Ordering};

/// Cumulative allocation counters of one pool, readable through the CTL
/// tree. The counters record usable (unit-rounded) bytes and use relaxed
/// atomics; they are monotonic and never folded into each other.
#[derive(Default)]
pub struct Stats {
    allocated: AtomicU64,
    freed: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_allocated(&self, bytes: u64) {
        self.allocated.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_freed(&self, bytes: u64) {
        self.freed.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn allocated(&self) -> u64 {
        self.allocated.load(Ordering::Relaxed)
    }

    pub fn freed(&self) -> u64 {
        self.freed.load(Ordering::Relaxed)
    }
}
