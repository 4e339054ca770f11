//! Arenas: thread-affine allocator front-ends
//!
//! Each arena owns one persistent info slot (the slot index is the arena
//! id) and a private set of buckets that soak up freed blocks from the
//! threads attached to it. Raising and lowering the info-slot guard around
//! a destination-word mutation is what makes the public operations
//! recoverable.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;

use crate::bucket::{AllocClass, Bucket, MAX_ALLOC_CLASSES};
use crate::heap::backend::Backend;
use crate::heap::layout::SlotRecord;

pub struct Arena {
    id: usize,
    associated_threads: AtomicU32,
    buckets: [OnceLock<Bucket>; MAX_ALLOC_CLASSES],
}

impl Arena {
    pub fn new(id: usize) -> Self {
        Arena {
            id,
            associated_threads: AtomicU32::new(0),
            buckets: std::array::from_fn(|_| OnceLock::new()),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn attach_thread(&self) {
        self.associated_threads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn associated_threads(&self) -> u32 {
        self.associated_threads.load(Ordering::Relaxed)
    }

    /// The arena-private bucket of a class, created on first use.
    pub fn bucket(&self, class_id: usize, class: AllocClass) -> &Bucket {
        self.buckets[class_id].get_or_init(|| Bucket::new(class_id, class))
    }

    /// The private bucket of a class, only if it was ever populated.
    pub fn bucket_if_init(&self, class_id: usize) -> Option<&Bucket> {
        self.buckets.get(class_id)?.get()
    }

    /// Records the intent of an in-flight operation in the arena's info
    /// slot. Persisted before any chunk-header mutation.
    pub fn guard_up(&self, backend: &dyn Backend, rec: SlotRecord) {
        backend.set_guard(self.id, rec);
    }

    /// Retires the info slot once the operation's publishes are durable.
    pub fn guard_down(&self, backend: &dyn Backend) {
        backend.clear_guard(self.id);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::heap::noop::{GuardEvent, NoopBackend};

    #[test]
    fn guard_cycle_reaches_the_backend() {
        let backend = NoopBackend::new(4096);
        let arena = Arena::new(7);

        arena.guard_up(&backend, SlotRecord::Free { addr: 128 });
        arena.guard_down(&backend);

        let events = backend.events.lock().unwrap();
        assert_eq!(
            *events,
            vec![
                GuardEvent::Raised(7, SlotRecord::Free { addr: 128 }),
                GuardEvent::Cleared(7),
            ]
        );
    }

    #[test]
    fn private_buckets_are_lazy() {
        let arena = Arena::new(0);
        assert!(arena.bucket_if_init(2).is_none());
        let b = arena.bucket(2, AllocClass::huge());
        assert_eq!(b.class_id(), 2);
        assert!(arena.bucket_if_init(2).is_some());
    }

    #[test]
    fn thread_accounting() {
        let arena = Arena::new(0);
        assert_eq!(arena.associated_threads(), 0);
        arena.attach_thread();
        arena.attach_thread();
        assert_eq!(arena.associated_threads(), 2);
    }
}
