//! The storage capability contract consumed by the caching policies

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::time::Duration;

use crate::{CacheResult, CacheStats};

/// Storage backend shared by every policy wrapped around it.
///
/// Each method is a single atomic operation from the caller's point of view;
/// the policies never hold a lock across two calls. Implementations may live
/// in-process or behind a network hop.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Get the stored value for `key`.
    ///
    /// A miss is `Ok(None)` and never an error. A stored JSON `null` is a
    /// legitimate value and comes back as `Some(Value::Null)`.
    async fn get(&self, key: &str) -> CacheResult<Option<Value>>;

    /// Store `value` under `key`, replacing any previous value.
    ///
    /// `expire` is the hard lifetime; `None` keeps the value until it is
    /// deleted or evicted.
    async fn set(&self, key: &str, value: Value, expire: Option<Duration>) -> CacheResult<()>;

    /// Atomically record the event at `window_end` and return the number of
    /// events inside the window.
    ///
    /// Events at or before `window_start` are dropped. The new event is only
    /// stored while the count is below `max_value`, so the returned count is
    /// accurate up to `max_value`. The whole key expires after `expire`
    /// without further increments.
    async fn slice_incr(
        &self,
        key: &str,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        max_value: u64,
        expire: Duration,
    ) -> CacheResult<u64>;

    /// Remove `key`, returning whether a live value was removed
    async fn delete(&self, key: &str) -> CacheResult<bool>;

    /// Remove every entry
    async fn clear(&self) -> CacheResult<()>;

    /// Number of live entries
    async fn len(&self) -> CacheResult<usize>;

    /// Check if the backend holds no live entries
    async fn is_empty(&self) -> CacheResult<bool> {
        Ok(self.len().await? == 0)
    }

    /// Backend statistics
    async fn stats(&self) -> CacheResult<CacheStats>;

    /// Short name used in logs
    fn name(&self) -> &'static str;
}

/// What a store keeps under one key.
///
/// Windows are kept as decoded timestamps so `slice_incr` does not re-parse
/// them on every call; `get` renders them as a JSON array of RFC 3339 strings.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Slot {
    Value(Value),
    Window(Vec<DateTime<Utc>>),
}

impl Slot {
    pub(crate) fn to_value(&self) -> CacheResult<Value> {
        match self {
            Slot::Value(value) => Ok(value.clone()),
            Slot::Window(events) => Ok(serde_json::to_value(events)?),
        }
    }

    /// Reinterpret the slot as a window.
    ///
    /// A plain value that does not decode as a timestamp list starts a fresh
    /// window.
    pub(crate) fn into_events(self) -> Vec<DateTime<Utc>> {
        match self {
            Slot::Window(events) => events,
            Slot::Value(value) => serde_json::from_value(value).unwrap_or_default(),
        }
    }
}

/// Slide `events` to the window `(window_start, window_end]` and record one
/// event at `window_end`, returning the resulting count.
///
/// Events newer than `window_end` (written by a concurrent caller whose clock
/// read happened later) stay in the window and are counted.
pub(crate) fn slide_window(
    events: &mut Vec<DateTime<Utc>>,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    max_value: u64,
) -> u64 {
    events.retain(|at| *at > window_start);
    if (events.len() as u64) < max_value {
        events.push(window_end);
    }
    events.len() as u64
}
