//! In-process backend with clock-driven hard expiry

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::{
    backend::{slide_window, Backend, Slot},
    clock::{shift_forward, system_clock, SharedClock},
    stats::{create_stats_collector, SharedStatsCollector},
    CacheResult, CacheStats,
};

/// Shortest interval accepted by [`InMemoryBackend::start_purge_task`]
pub const MIN_PURGE_INTERVAL: Duration = Duration::from_millis(10);

/// Stored entry with expiry metadata
#[derive(Debug, Clone)]
struct StoredEntry {
    slot: Slot,
    expires_at: Option<DateTime<Utc>>,
}

impl StoredEntry {
    fn new(slot: Slot, now: DateTime<Utc>, expire: Option<Duration>) -> Self {
        Self {
            slot,
            expires_at: expire.map(|ttl| shift_forward(now, ttl)),
        }
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| now >= expires_at)
    }
}

/// In-memory backend.
///
/// Every operation runs under a single write or read lock, which makes
/// `slice_incr` atomic across concurrent callers in this process. Expired
/// entries are dropped lazily on access and by [`InMemoryBackend::purge_expired`].
pub struct InMemoryBackend {
    store: Arc<RwLock<HashMap<String, StoredEntry>>>,
    clock: SharedClock,
    stats: SharedStatsCollector,
}

impl InMemoryBackend {
    /// Create a backend driven by the wall clock
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    /// Create a backend whose expiry follows `clock`
    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            store: Arc::new(RwLock::new(HashMap::new())),
            clock,
            stats: create_stats_collector(),
        }
    }

    /// Drop every expired entry, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut store = self.store.write();
        let before = store.len();
        store.retain(|_, entry| !entry.is_expired(now));
        let purged = before - store.len();
        self.stats.record_evictions(purged as u64);
        purged
    }

    /// Start a background purge task.
    ///
    /// Intervals shorter than [`MIN_PURGE_INTERVAL`] are raised to it.
    pub fn start_purge_task(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let period = interval.max(MIN_PURGE_INTERVAL);
        if period != interval {
            log::warn!("Purge interval {:?} too short, using {:?}", interval, period);
        }

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                interval.tick().await;
                let purged = self.purge_expired();
                if purged > 0 {
                    log::debug!("Purged {} expired entries", purged);
                }
            }
        })
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for InMemoryBackend {
    async fn get(&self, key: &str) -> CacheResult<Option<Value>> {
        let start = Instant::now();
        let now = self.clock.now();

        let result = {
            let store = self.store.read();
            match store.get(key) {
                Some(entry) if !entry.is_expired(now) => Some(entry.slot.to_value()),
                _ => None,
            }
        };

        let result = match result {
            Some(value) => {
                self.stats.record_hit();
                Some(value?)
            }
            None => {
                // Drop the expired entry, if that is why we missed
                let mut store = self.store.write();
                if store.get(key).is_some_and(|entry| entry.is_expired(now)) {
                    store.remove(key);
                    self.stats.record_evictions(1);
                }
                self.stats.record_miss();
                None
            }
        };

        self.stats.record_get_latency(start);
        Ok(result)
    }

    async fn set(&self, key: &str, value: Value, expire: Option<Duration>) -> CacheResult<()> {
        let start = Instant::now();
        let entry = StoredEntry::new(Slot::Value(value), self.clock.now(), expire);

        self.store.write().insert(key.to_string(), entry);

        self.stats.record_set(start);
        Ok(())
    }

    async fn slice_incr(
        &self,
        key: &str,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        max_value: u64,
        expire: Duration,
    ) -> CacheResult<u64> {
        let now = self.clock.now();
        let mut store = self.store.write();

        let mut events = match store.remove(key) {
            Some(entry) if !entry.is_expired(now) => entry.slot.into_events(),
            _ => Vec::new(),
        };
        let count = slide_window(&mut events, window_start, window_end, max_value);

        store.insert(
            key.to_string(),
            StoredEntry::new(Slot::Window(events), now, Some(expire)),
        );
        self.stats.record_window_increment();

        Ok(count)
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        let now = self.clock.now();
        let removed = self.store.write().remove(key);

        match removed {
            Some(entry) => {
                self.stats.record_evictions(1);
                Ok(!entry.is_expired(now))
            }
            None => Ok(false),
        }
    }

    async fn clear(&self) -> CacheResult<()> {
        let mut store = self.store.write();
        self.stats.record_evictions(store.len() as u64);
        store.clear();
        Ok(())
    }

    async fn len(&self) -> CacheResult<usize> {
        let now = self.clock.now();
        let store = self.store.read();
        Ok(store.values().filter(|entry| !entry.is_expired(now)).count())
    }

    async fn stats(&self) -> CacheResult<CacheStats> {
        let len = self.len().await?;
        Ok(self.stats.snapshot(len))
    }

    fn name(&self) -> &'static str {
        "inmemory"
    }
}
