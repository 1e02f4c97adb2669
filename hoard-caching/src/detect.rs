//! Notifications for values served from the cache instead of computed

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Emitted whenever a policy returns a stored value without running the
/// wrapped computation, both for fresh hits and stale fallbacks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectEvent {
    /// Resolved cache key
    pub key: String,
    /// Resolved hard TTL
    pub ttl: Duration,
    /// Resolved soft TTL
    pub soft_ttl: Duration,
    /// Policy name, e.g. `soft`
    pub name: &'static str,
    /// Key template of the wrapped function
    pub template: String,
}

/// Sink for [`DetectEvent`]s
pub trait CacheDetect: Send + Sync {
    fn on_detect(&self, event: &DetectEvent);
}

/// Logs each event at debug level
#[derive(Debug, Default, Clone, Copy)]
pub struct LogDetect;

impl CacheDetect for LogDetect {
    fn on_detect(&self, event: &DetectEvent) {
        log::debug!(
            "{} cache served {} (template {}, ttl {:?}, soft ttl {:?})",
            event.name,
            event.key,
            event.template,
            event.ttl,
            event.soft_ttl
        );
    }
}

/// Keeps every event in memory
#[derive(Debug, Default)]
pub struct RecordingDetect {
    events: Mutex<Vec<DetectEvent>>,
}

impl RecordingDetect {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Events recorded so far
    pub fn events(&self) -> Vec<DetectEvent> {
        self.events.lock().clone()
    }

    /// Drain the recorded events
    pub fn take(&self) -> Vec<DetectEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl CacheDetect for RecordingDetect {
    fn on_detect(&self, event: &DetectEvent) {
        self.events.lock().push(event.clone());
    }
}
