//! Caching primitives for Hoard
//!
//! This crate provides the storage contract shared by every policy, two
//! backend implementations, and the soft-TTL caching policy that serves stale
//! values when a recomputation fails.

pub mod backend;
pub mod clock;
pub mod config;
pub mod detect;
pub mod errors;
pub mod key;
pub mod single_flight;
pub mod soft;
pub mod stats;
pub mod stores;
pub mod ttl;

// Re-export main types
pub use backend::Backend;
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{BackendConfig, BackendKind, CacheConfig, SoftCacheConfig, Validatable};
pub use detect::{CacheDetect, DetectEvent, LogDetect, RecordingDetect};
pub use errors::{CacheError, CacheResult};
pub use key::{CallArgs, KeyTemplate, TemplateRegistry};
pub use soft::{CachedSoftEntry, ErrorKind, SoftCache, SoftCacheBuilder, SoftCached, SoftError};
pub use stats::CacheStats;
pub use ttl::Ttl;

// Re-export store implementations
pub use stores::InMemoryBackend;

#[cfg(feature = "moka")]
pub use stores::MokaBackend;

/// Create a default in-memory backend on the system clock
pub fn create_default_backend() -> std::sync::Arc<dyn Backend> {
    std::sync::Arc::new(InMemoryBackend::new())
}

/// Create a bounded moka backend
#[cfg(feature = "moka")]
pub fn create_moka_backend(max_capacity: u64) -> std::sync::Arc<dyn Backend> {
    std::sync::Arc::new(MokaBackend::new(max_capacity))
}
