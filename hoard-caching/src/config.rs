//! Policy and backend configuration

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::backend::Backend;
use crate::clock::SharedClock;
use crate::stores::InMemoryBackend;
use crate::{CacheError, CacheResult};

/// Configuration that can check itself after loading
pub trait Validatable {
    fn validate(&self) -> CacheResult<()>;

    /// Section name used in error messages
    fn domain_name(&self) -> &'static str;

    fn validation_error(&self, message: impl Into<String>) -> CacheError {
        CacheError::InvalidConfiguration(format!("{}: {}", self.domain_name(), message.into()))
    }
}

/// Soft-TTL policy configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SoftCacheConfig {
    /// Hard lifetime of stored entries
    #[serde(with = "duration")]
    pub ttl: Duration,

    /// Freshness window, 0.33 of `ttl` when absent
    #[serde(default, with = "optional_duration")]
    pub soft_ttl: Option<Duration>,

    /// Key namespace
    #[serde(default = "default_soft_prefix")]
    pub prefix: String,

    /// Collapse concurrent recomputations of one key
    #[serde(default)]
    pub single_flight: bool,
}

impl SoftCacheConfig {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            soft_ttl: None,
            prefix: default_soft_prefix(),
            single_flight: false,
        }
    }
}

impl Validatable for SoftCacheConfig {
    fn validate(&self) -> CacheResult<()> {
        if self.ttl.is_zero() {
            return Err(self.validation_error("ttl must be positive"));
        }

        if let Some(soft_ttl) = self.soft_ttl {
            if soft_ttl > self.ttl {
                return Err(self.validation_error(format!(
                    "soft_ttl {} exceeds ttl {}",
                    humantime::format_duration(soft_ttl),
                    humantime::format_duration(self.ttl)
                )));
            }
        }

        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "soft"
    }
}

/// Storage implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Locked hash map, follows the injected clock
    #[default]
    InMemory,

    /// Bounded moka cache, expires on wall-clock time
    Moka,
}

/// Backend selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub kind: BackendKind,

    /// Entry bound for bounded backends
    #[serde(default = "default_max_capacity")]
    pub max_capacity: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::default(),
            max_capacity: default_max_capacity(),
        }
    }
}

impl BackendConfig {
    /// Construct the configured backend
    pub fn build(&self, clock: SharedClock) -> CacheResult<Arc<dyn Backend>> {
        self.validate()?;

        match self.kind {
            BackendKind::InMemory => Ok(Arc::new(InMemoryBackend::with_clock(clock))),
            #[cfg(feature = "moka")]
            BackendKind::Moka => Ok(Arc::new(crate::stores::MokaBackend::new(self.max_capacity))),
            #[cfg(not(feature = "moka"))]
            BackendKind::Moka => Err(self.validation_error("moka support is not compiled in")),
        }
    }
}

impl Validatable for BackendConfig {
    fn validate(&self) -> CacheResult<()> {
        if self.kind == BackendKind::Moka && self.max_capacity == 0 {
            return Err(self.validation_error("max_capacity must be positive"));
        }
        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "backend"
    }
}

/// Backend plus soft policy, as loaded from a file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub backend: BackendConfig,

    pub soft: SoftCacheConfig,
}

impl CacheConfig {
    /// Parse and validate YAML
    pub fn from_yaml(yaml: &str) -> CacheResult<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }
}

impl Validatable for CacheConfig {
    fn validate(&self) -> CacheResult<()> {
        self.backend.validate()?;
        self.soft.validate()?;
        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "cache"
    }
}

fn default_soft_prefix() -> String {
    crate::soft::DEFAULT_PREFIX.to_string()
}

fn default_max_capacity() -> u64 {
    10_000
}

/// Durations written either as humantime text (`"10m"`) or integer seconds
pub mod duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Seconds(u64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        humantime_serde::serialize(value, serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Seconds(secs) => Ok(Duration::from_secs(secs)),
            Repr::Text(text) => humantime::parse_duration(text.trim()).map_err(serde::de::Error::custom),
        }
    }
}

/// [`duration`] for optional fields
pub mod optional_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    struct Wrapped(#[serde(with = "super::duration")] Duration);

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        humantime_serde::serialize(value, serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<Wrapped>::deserialize(deserializer)?.map(|Wrapped(duration)| duration))
    }
}
