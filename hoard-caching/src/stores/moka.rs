//! Moka-based backend with per-entry expiry

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use moka::future::Cache as MokaInner;
use moka::ops::compute::Op;
use moka::Expiry;
use serde_json::Value;
use std::time::{Duration, Instant};

use crate::{
    backend::{slide_window, Backend, Slot},
    stats::{create_stats_collector, SharedStatsCollector},
    CacheResult, CacheStats,
};

/// Value kept in moka together with its hard lifetime
#[derive(Debug, Clone)]
struct MokaSlot {
    slot: Slot,
    expire: Option<Duration>,
}

/// Reads each entry's lifetime from the entry itself
struct SlotExpiry;

impl Expiry<String, MokaSlot> for SlotExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &MokaSlot,
        _created_at: Instant,
    ) -> Option<Duration> {
        value.expire
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &MokaSlot,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        value.expire
    }
}

/// Moka-backed backend.
///
/// Capacity-bound eviction is moka's. Hard expiry uses moka's own monotonic
/// time, while window timestamps come from the caller.
pub struct MokaBackend {
    inner: MokaInner<String, MokaSlot>,
    stats: SharedStatsCollector,
}

impl MokaBackend {
    /// Create a backend holding at most `max_capacity` entries
    pub fn new(max_capacity: u64) -> Self {
        let inner = MokaInner::builder()
            .max_capacity(max_capacity)
            .expire_after(SlotExpiry)
            .build();

        Self {
            inner,
            stats: create_stats_collector(),
        }
    }

    /// Let moka apply pending evictions and expirations now
    pub async fn run_pending_tasks(&self) {
        self.inner.run_pending_tasks().await;
    }
}

#[async_trait]
impl Backend for MokaBackend {
    async fn get(&self, key: &str) -> CacheResult<Option<Value>> {
        let start = Instant::now();

        let result = match self.inner.get(key).await {
            Some(stored) => {
                self.stats.record_hit();
                Some(stored.slot.to_value()?)
            }
            None => {
                self.stats.record_miss();
                None
            }
        };

        self.stats.record_get_latency(start);
        Ok(result)
    }

    async fn set(&self, key: &str, value: Value, expire: Option<Duration>) -> CacheResult<()> {
        let start = Instant::now();

        self.inner
            .insert(
                key.to_string(),
                MokaSlot {
                    slot: Slot::Value(value),
                    expire,
                },
            )
            .await;

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
        let mut count = 0;

        // and_compute_with serializes computations per key
        let _ = self
            .inner
            .entry(key.to_string())
            .and_compute_with(|current| {
                let mut events = current
                    .map(|entry| entry.into_value().slot.into_events())
                    .unwrap_or_default();
                count = slide_window(&mut events, window_start, window_end, max_value);

                std::future::ready(Op::Put(MokaSlot {
                    slot: Slot::Window(events),
                    expire: Some(expire),
                }))
            })
            .await;

        self.stats.record_window_increment();
        Ok(count)
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        let removed = self.inner.remove(key).await.is_some();
        if removed {
            self.stats.record_evictions(1);
        }
        Ok(removed)
    }

    async fn clear(&self) -> CacheResult<()> {
        self.stats.record_evictions(self.inner.entry_count());
        self.inner.invalidate_all();
        self.inner.run_pending_tasks().await;
        Ok(())
    }

    async fn len(&self) -> CacheResult<usize> {
        self.inner.run_pending_tasks().await;
        Ok(self.inner.entry_count() as usize)
    }

    async fn stats(&self) -> CacheResult<CacheStats> {
        let len = self.len().await?;
        Ok(self.stats.snapshot(len))
    }

    fn name(&self) -> &'static str {
        "moka"
    }
}
