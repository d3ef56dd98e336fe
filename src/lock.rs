//! Serialisation for the global heap storage
//!
//! The heap itself is single-threaded by construction; the only
//! concurrency this crate ever sees is the `GlobalAlloc` adapter being
//! reachable from more than one context in a hosted build. A heap
//! critical section is one region sweep or one ring splice, never
//! blocks, and never re-enters the lock, so a bare test-and-set that
//! spins in place covers it. There is no queueing and no backoff
//! ladder to tune.

use core::hint::spin_loop;
use core::sync::atomic::{AtomicBool, Ordering};

/// Lock scoping access to the type-erased global heap.
///
/// Closure-scoped rather than guard-based: every caller holds the lock
/// for exactly one heap operation, and a panic under the lock is a heap
/// fatal, after which nothing runs anyway.
pub(crate) struct HeapLock {
    held: AtomicBool,
}

impl HeapLock {
    pub(crate) const fn new() -> Self {
        Self {
            held: AtomicBool::new(false),
        }
    }

    /// Run `f` while holding the lock.
    pub(crate) fn with<T>(&self, f: impl FnOnce() -> T) -> T {
        while self.held.swap(true, Ordering::Acquire) {
            spin_loop();
        }
        let result = f();
        self.held.store(false, Ordering::Release);
        result
    }
}
