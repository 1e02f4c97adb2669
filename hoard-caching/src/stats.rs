//! Backend statistics

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Point-in-time statistics of a backend
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Total number of get requests
    pub total_gets: u64,

    /// Gets that found a live value
    pub hits: u64,

    /// Gets that found nothing (or an expired value)
    pub misses: u64,

    /// Total number of set requests
    pub total_sets: u64,

    /// Total number of windowed increments
    pub window_increments: u64,

    /// Entries dropped through expiry, delete or clear
    pub evictions: u64,

    /// Current number of live entries
    pub entry_count: usize,

    /// Hit rate (0.0 to 1.0)
    pub hit_rate: f64,

    /// Average get latency in microseconds
    pub avg_get_latency_us: Option<f64>,

    /// Average set latency in microseconds
    pub avg_set_latency_us: Option<f64>,
}

/// Lock-free statistics collector shared by a backend's operations
#[derive(Debug, Default)]
pub struct StatsCollector {
    total_gets: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    total_sets: AtomicU64,
    window_increments: AtomicU64,
    evictions: AtomicU64,
    total_get_latency_ns: AtomicU64,
    total_set_latency_ns: AtomicU64,
}

impl StatsCollector {
    pub fn record_hit(&self) {
        self.total_gets.fetch_add(1, Ordering::Relaxed);
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.total_gets.fetch_add(1, Ordering::Relaxed);
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_set(&self, started: Instant) {
        self.total_sets.fetch_add(1, Ordering::Relaxed);
        self.total_set_latency_ns
            .fetch_add(elapsed_ns(started), Ordering::Relaxed);
    }

    pub fn record_get_latency(&self, started: Instant) {
        self.total_get_latency_ns
            .fetch_add(elapsed_ns(started), Ordering::Relaxed);
    }

    pub fn record_window_increment(&self) {
        self.window_increments.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evictions(&self, count: u64) {
        self.evictions.fetch_add(count, Ordering::Relaxed);
    }

    /// Snapshot the counters together with the backend's current entry count
    pub fn snapshot(&self, entry_count: usize) -> CacheStats {
        let total_gets = self.total_gets.load(Ordering::Relaxed);
        let hits = self.hits.load(Ordering::Relaxed);
        let total_sets = self.total_sets.load(Ordering::Relaxed);

        CacheStats {
            total_gets,
            hits,
            misses: self.misses.load(Ordering::Relaxed),
            total_sets,
            window_increments: self.window_increments.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entry_count,
            hit_rate: ratio(hits, total_gets).unwrap_or(0.0),
            avg_get_latency_us: ratio(self.total_get_latency_ns.load(Ordering::Relaxed), total_gets)
                .map(|ns| ns / 1000.0),
            avg_set_latency_us: ratio(self.total_set_latency_ns.load(Ordering::Relaxed), total_sets)
                .map(|ns| ns / 1000.0),
        }
    }
}

fn elapsed_ns(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_nanos()).unwrap_or(u64::MAX)
}

fn ratio(numerator: u64, denominator: u64) -> Option<f64> {
    (denominator > 0).then(|| numerator as f64 / denominator as f64)
}

/// Shared stats collector
pub type SharedStatsCollector = Arc<StatsCollector>;

/// Create a new shared stats collector
pub fn create_stats_collector() -> SharedStatsCollector {
    Arc::new(StatsCollector::default())
}
