//! Per-thread execution-core identity.
//!
//! The allocator partitions its free lists per core, and needs the calling
//! thread's shard selection to stay fixed for the duration of a call. On
//! bare metal that is done by disabling preemption around `cpuid()`; hosted,
//! the same requirement is met by pinning each thread to a shard index in a
//! thread-local, so the identity cannot change mid-operation.

use core::cell::Cell;
use core::sync::atomic::{AtomicUsize, Ordering};

/// The next identity to hand out to a thread that never picked one.
static NEXT_CORE: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    /// The calling thread's core identity, once assigned.
    static CORE: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Pin the calling thread to the given core identity.
///
/// An external scheduler (or a test) that knows which logical stream a
/// thread represents can use this to override the round-robin assignment.
pub fn pin(id: usize) {
    CORE.with(|core| core.set(Some(id)));
}

/// The calling thread's core identity, reduced into `ncores` shards.
///
/// Assigned round-robin on first use and stable for the lifetime of the
/// thread afterwards.
pub fn current(ncores: usize) -> usize {
    CORE.with(|core| match core.get() {
        Some(id) => id,
        None => {
            let id = NEXT_CORE.fetch_add(1, Ordering::Relaxed);
            core.set(Some(id));
            id
        }
    }) % ncores
}
