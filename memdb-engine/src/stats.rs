//! Engine counters and the stats surface.
//!
//! Monotonic counters are atomics so the hot path never takes the
//! engine mutex just to count; the gauges (`cached_records`,
//! `dirty_records`, `tables`) are computed under the mutex at snapshot
//! time so they are exact at the moment of the call.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Monotonic counters maintained by the engine.
#[derive(Debug, Default)]
pub(crate) struct EngineMetrics {
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub inserts: AtomicU64,
    /// Entries cleanly persisted by flush passes.
    pub flushes: AtomicU64,
    pub evictions: AtomicU64,
    /// Cumulative store failures across all paths.
    pub store_errors: AtomicU64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot the monotonic counters; gauges are filled by the caller
    /// while it holds the engine mutex.
    pub fn snapshot(
        &self,
        cached_records: usize,
        dirty_records: usize,
        tables: usize,
        uptime_secs: i64,
    ) -> StatsSnapshot {
        StatsSnapshot {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            inserts: self.inserts.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
            cached_records,
            dirty_records,
            tables,
            uptime_secs,
        }
    }
}

/// Point-in-time view of engine statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub inserts: u64,
    pub flushes: u64,
    pub evictions: u64,
    pub store_errors: u64,
    /// Current size of the in-memory index.
    pub cached_records: usize,
    /// Entries whose latest mutation has not been persisted.
    pub dirty_records: usize,
    /// Registered tables.
    pub tables: usize,
    pub uptime_secs: i64,
}

impl StatsSnapshot {
    /// Fraction of reads served from memory (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let metrics = EngineMetrics::new();
        metrics.cache_hits.fetch_add(2, Ordering::Relaxed);
        metrics.flushes.fetch_add(5, Ordering::Relaxed);

        let snapshot = metrics.snapshot(3, 1, 2, 60);
        assert_eq!(snapshot.cache_hits, 2);
        assert_eq!(snapshot.flushes, 5);
        assert_eq!(snapshot.cached_records, 3);
        assert_eq!(snapshot.dirty_records, 1);
        assert_eq!(snapshot.tables, 2);
    }

    #[test]
    fn test_hit_rate() {
        let metrics = EngineMetrics::new();
        metrics.cache_hits.fetch_add(80, Ordering::Relaxed);
        metrics.cache_misses.fetch_add(20, Ordering::Relaxed);
        let snapshot = metrics.snapshot(0, 0, 0, 0);
        assert!((snapshot.hit_rate() - 0.8).abs() < 0.001);

        let empty = EngineMetrics::new().snapshot(0, 0, 0, 0);
        assert!((empty.hit_rate() - 0.0).abs() < 0.001);
    }
}
