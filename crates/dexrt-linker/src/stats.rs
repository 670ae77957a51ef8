//! Linker counters.
//!
//! All counters use `Ordering::Relaxed`; they are independent and never
//! synchronize memory between threads.
use dexrt_utils::sync::{AtomicU64, Ordering};
use serde::Serialize;

#[derive(Debug, Default)]
pub struct LinkerStats {
    pub classes_defined: AtomicU64,
    pub classes_retired: AtomicU64,
    pub arrays_synthesized: AtomicU64,
    pub proxies_synthesized: AtomicU64,
    pub class_init_count: AtomicU64,
    /// Total wall time spent running class initializers, in nanoseconds.
    pub class_init_time_ns: AtomicU64,
    pub type_cache_hits: AtomicU64,
    pub type_cache_misses: AtomicU64,
    pub method_cache_hits: AtomicU64,
    pub method_cache_misses: AtomicU64,
    pub field_cache_hits: AtomicU64,
    pub field_cache_misses: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct LinkerStatsSnapshot {
    pub classes_defined: u64,
    pub classes_retired: u64,
    pub arrays_synthesized: u64,
    pub proxies_synthesized: u64,
    pub class_init_count: u64,
    pub class_init_time_ns: u64,
    pub type_cache_hits: u64,
    pub type_cache_misses: u64,
    pub method_cache_hits: u64,
    pub method_cache_misses: u64,
    pub field_cache_hits: u64,
    pub field_cache_misses: u64,
}

impl LinkerStats {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, value: u64) {
        counter.fetch_add(value, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> LinkerStatsSnapshot {
        LinkerStatsSnapshot {
            classes_defined: self.classes_defined.load(Ordering::Relaxed),
            classes_retired: self.classes_retired.load(Ordering::Relaxed),
            arrays_synthesized: self.arrays_synthesized.load(Ordering::Relaxed),
            proxies_synthesized: self.proxies_synthesized.load(Ordering::Relaxed),
            class_init_count: self.class_init_count.load(Ordering::Relaxed),
            class_init_time_ns: self.class_init_time_ns.load(Ordering::Relaxed),
            type_cache_hits: self.type_cache_hits.load(Ordering::Relaxed),
            type_cache_misses: self.type_cache_misses.load(Ordering::Relaxed),
            method_cache_hits: self.method_cache_hits.load(Ordering::Relaxed),
            method_cache_misses: self.method_cache_misses.load(Ordering::Relaxed),
            field_cache_hits: self.field_cache_hits.load(Ordering::Relaxed),
            field_cache_misses: self.field_cache_misses.load(Ordering::Relaxed),
        }
    }
}
