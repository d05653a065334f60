//! Per-namespace hit/miss accounting.
//!
//! Counters are kept twice: as atomics for the `stats()` snapshot served by
//! the admin API, and as `metrics` counters labelled by namespace.

use std::sync::atomic::{AtomicU64, Ordering};

use metrics::counter;
use serde::Serialize;

use super::memory::MemoryStats;

const METRIC_MEMORY_HIT_TOTAL: &str = "strata_cache_memory_hit_total";
const METRIC_MEMORY_MISS_TOTAL: &str = "strata_cache_memory_miss_total";
const METRIC_KV_HIT_TOTAL: &str = "strata_cache_kv_hit_total";
const METRIC_KV_MISS_TOTAL: &str = "strata_cache_kv_miss_total";
const METRIC_KV_ERROR_TOTAL: &str = "strata_cache_kv_error_total";
const METRIC_SOURCE_LOAD_TOTAL: &str = "strata_cache_source_load_total";

/// Point-in-time statistics for one namespace.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub memory_hits: u64,
    pub memory_misses: u64,
    pub kv_hits: u64,
    pub kv_misses: u64,
    /// Loads served by the source of truth through `get_or_set`.
    pub source_loads: u64,
    pub total_requests: u64,
    /// Percentage of requests served by either tier.
    pub hit_rate: f64,
    pub memory_bytes: usize,
    pub entry_count: usize,
}

#[derive(Debug)]
pub(crate) struct StatsRecorder {
    namespace: String,
    memory_hits: AtomicU64,
    memory_misses: AtomicU64,
    kv_hits: AtomicU64,
    kv_misses: AtomicU64,
    source_loads: AtomicU64,
    total_requests: AtomicU64,
}

impl StatsRecorder {
    pub(crate) fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            memory_hits: AtomicU64::new(0),
            memory_misses: AtomicU64::new(0),
            kv_hits: AtomicU64::new(0),
            kv_misses: AtomicU64::new(0),
            source_loads: AtomicU64::new(0),
            total_requests: AtomicU64::new(0),
        }
    }

    fn bump(&self, cell: &AtomicU64, metric: &'static str) {
        cell.fetch_add(1, Ordering::Relaxed);
        counter!(metric, "namespace" => self.namespace.clone()).increment(1);
    }

    pub(crate) fn request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn memory_hit(&self) {
        self.bump(&self.memory_hits, METRIC_MEMORY_HIT_TOTAL);
    }

    pub(crate) fn memory_miss(&self) {
        self.bump(&self.memory_misses, METRIC_MEMORY_MISS_TOTAL);
    }

    pub(crate) fn kv_hit(&self) {
        self.bump(&self.kv_hits, METRIC_KV_HIT_TOTAL);
    }

    pub(crate) fn kv_miss(&self) {
        self.bump(&self.kv_misses, METRIC_KV_MISS_TOTAL);
    }

    pub(crate) fn kv_error(&self) {
        counter!(METRIC_KV_ERROR_TOTAL, "namespace" => self.namespace.clone()).increment(1);
    }

    pub(crate) fn source_load(&self) {
        self.bump(&self.source_loads, METRIC_SOURCE_LOAD_TOTAL);
    }

    pub(crate) fn reset(&self) {
        for cell in [
            &self.memory_hits,
            &self.memory_misses,
            &self.kv_hits,
            &self.kv_misses,
            &self.source_loads,
            &self.total_requests,
        ] {
            cell.store(0, Ordering::Relaxed);
        }
    }

    pub(crate) fn snapshot(&self, memory: MemoryStats) -> CacheStats {
        let memory_hits = self.memory_hits.load(Ordering::Relaxed);
        let kv_hits = self.kv_hits.load(Ordering::Relaxed);
        let total_requests = self.total_requests.load(Ordering::Relaxed);
        let hit_rate = if total_requests == 0 {
            0.0
        } else {
            (memory_hits + kv_hits) as f64 / total_requests as f64 * 100.0
        };

        CacheStats {
            memory_hits,
            memory_misses: self.memory_misses.load(Ordering::Relaxed),
            kv_hits,
            kv_misses: self.kv_misses.load(Ordering::Relaxed),
            source_loads: self.source_loads.load(Ordering::Relaxed),
            total_requests,
            hit_rate,
            memory_bytes: memory.bytes,
            entry_count: memory.entries,
        }
    }
}
