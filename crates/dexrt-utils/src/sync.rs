//! Basic synchronization primitives.
//!
//! This module provides a unified surface for the locks and atomics used
//! throughout the workspace so that low-level crates do not depend on the
//! linker subsystem. Lock types come from `parking_lot`.
use std::cell::Cell;

pub use parking_lot::{
    Condvar, MappedRwLockReadGuard, MappedRwLockWriteGuard, Mutex, MutexGuard, RwLock,
    RwLockReadGuard, RwLockWriteGuard,
};

pub use std::sync::{
    Arc, Weak,
    atomic::{
        AtomicBool, AtomicI8, AtomicI16, AtomicI32, AtomicI64, AtomicIsize, AtomicPtr, AtomicU8,
        AtomicU16, AtomicU32, AtomicU64, AtomicUsize, Ordering,
    },
};

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Cached runtime thread ID for the current thread.
    static RUNTIME_THREAD_ID: Cell<u64> = const { Cell::new(0) };
}

/// Returns a stable, non-zero identifier for the calling thread.
///
/// IDs are assigned lazily on first use and are never reused within a
/// process. Zero is reserved to mean "no thread".
pub fn current_thread_id() -> u64 {
    RUNTIME_THREAD_ID.with(|id| {
        let mut v = id.get();
        if v == 0 {
            v = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
            id.set(v);
        }
        v
    })
}
