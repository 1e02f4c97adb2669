//! Soft-TTL caching policy
//!
//! Every stored entry carries a soft expiry next to the value. Before the
//! soft expiry the value is served without running the computation. After
//! it, the computation runs again; if it fails with a recoverable error the
//! stale value is served instead, until the backend's hard expiry removes
//! the entry.

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::{
    backend::Backend,
    clock::{shift_forward, system_clock, SharedClock},
    config::SoftCacheConfig,
    detect::{CacheDetect, DetectEvent, LogDetect},
    key::{CallArgs, KeyTemplate, TemplateRegistry, TemplateSpec},
    single_flight::SingleFlight,
    ttl::{Ttl, DEFAULT_SOFT_TTL_RATIO},
    CacheError, CacheResult,
};

/// Key prefix used when none is configured
pub const DEFAULT_PREFIX: &str = "soft";

/// Policy name reported in detection events
pub const POLICY_NAME: &str = "soft";

/// Decides whether a successful result is stored
pub type Condition<T> = Arc<dyn Fn(&T, &CallArgs, &str) -> bool + Send + Sync>;

/// Decides whether a failure may be answered with a stale value
pub type Recover<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

/// What the soft policy stores under a key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedSoftEntry<T> {
    /// After this instant the value is only used as a fallback
    pub soft_expire_at: DateTime<Utc>,
    /// The memoized result
    pub value: T,
}

impl<T> CachedSoftEntry<T> {
    /// Fresh entries are served without recomputation; an entry expiring
    /// exactly now is already stale
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.soft_expire_at > now
    }
}

/// Errors classified into kinds, for building recoverable sets
pub trait ErrorKind {
    type Kind: PartialEq + Send + Sync + 'static;

    fn kind(&self) -> Self::Kind;
}

/// Recover only from errors whose kind is in `kinds`
pub fn recover_kinds<E: ErrorKind>(kinds: Vec<E::Kind>) -> Recover<E> {
    Arc::new(move |error: &E| kinds.contains(&error.kind()))
}

/// Failure of a soft-cached call
#[derive(Debug, thiserror::Error)]
pub enum SoftError<E> {
    /// The backend failed; never answered with a stale value
    #[error("Cache backend error: {0}")]
    Backend(#[from] CacheError),

    /// The computation failed and no stale value could be served
    #[error("Computation failed: {0}")]
    Compute(E),
}

impl<E> SoftError<E> {
    /// The computation's error, if that is what failed
    pub fn into_compute(self) -> Option<E> {
        match self {
            SoftError::Compute(error) => Some(error),
            SoftError::Backend(_) => None,
        }
    }

    pub fn is_backend(&self) -> bool {
        matches!(self, SoftError::Backend(_))
    }
}

/// Soft-TTL policy bound to one wrapped computation
pub struct SoftCache<T, E> {
    backend: Arc<dyn Backend>,
    ttl: Ttl,
    soft_ttl: Ttl,
    template: KeyTemplate,
    condition: Condition<T>,
    recover: Recover<E>,
    detect: Arc<dyn CacheDetect>,
    clock: SharedClock,
    single_flight: Option<SingleFlight>,
}

impl<T, E> SoftCache<T, E>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    /// Start building a policy storing results in `backend` for `ttl`
    pub fn builder(backend: Arc<dyn Backend>, ttl: impl Into<Ttl>) -> SoftCacheBuilder<T, E> {
        SoftCacheBuilder::new(backend, ttl.into())
    }

    /// The key template bound to this policy
    pub fn template(&self) -> &KeyTemplate {
        &self.template
    }

    /// Run `compute` through the policy for one call.
    ///
    /// `compute` is only invoked when no fresh entry exists. Its future is
    /// awaited before anything is written, so a cancelled call writes nothing.
    pub async fn call<F, Fut>(&self, args: &CallArgs, compute: F) -> Result<T, SoftError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let ttl = self.ttl.resolve(args);
        let soft_ttl = self.soft_ttl.resolve(args);
        let key = self.template.resolve(args);

        let cached = match self.read(&key).await? {
            Some(entry) if entry.is_fresh(self.clock.now()) => {
                debug!("Soft cache hit for {}", key);
                self.detect(&key, ttl, soft_ttl);
                return Ok(entry.value);
            }
            other => other,
        };

        let (cached, _flight) = match &self.single_flight {
            Some(flights) => {
                let flight = flights.acquire(&key).await;
                // Another caller may have refreshed the key while we waited
                match self.read(&key).await? {
                    Some(entry) if entry.is_fresh(self.clock.now()) => {
                        debug!("Soft cache hit for {} after waiting on recompute", key);
                        self.detect(&key, ttl, soft_ttl);
                        return Ok(entry.value);
                    }
                    latest => (latest, Some(flight)),
                }
            }
            None => (cached, None),
        };

        match compute().await {
            Ok(result) => {
                if (self.condition)(&result, args, &key) {
                    self.write(&key, &result, ttl, soft_ttl).await?;
                } else {
                    debug!("Result for {} rejected by condition, not stored", key);
                }
                Ok(result)
            }
            Err(error) => match cached {
                Some(entry) if (self.recover)(&error) => {
                    warn!("Computation for {} failed, serving stale value", key);
                    self.detect(&key, ttl, soft_ttl);
                    Ok(entry.value)
                }
                _ => Err(SoftError::Compute(error)),
            },
        }
    }

    /// Wrap `func` so each call goes through this policy
    pub fn wrap<F>(self, func: F) -> SoftCached<T, E, F> {
        SoftCached { policy: self, func }
    }

    async fn read(&self, key: &str) -> CacheResult<Option<CachedSoftEntry<T>>> {
        let Some(stored) = self.backend.get(key).await? else {
            debug!("Soft cache miss for {}", key);
            return Ok(None);
        };

        match serde_json::from_value(stored) {
            Ok(entry) => Ok(Some(entry)),
            Err(e) => {
                warn!("Ignoring undecodable soft cache entry for {}: {}", key, e);
                Ok(None)
            }
        }
    }

    async fn write(&self, key: &str, result: &T, ttl: Duration, soft_ttl: Duration) -> CacheResult<()> {
        let entry = CachedSoftEntry {
            soft_expire_at: shift_forward(self.clock.now(), soft_ttl),
            value: result,
        };
        let value = serde_json::to_value(&entry)?;
        self.backend.set(key, value, Some(ttl)).await
    }

    fn detect(&self, key: &str, ttl: Duration, soft_ttl: Duration) {
        self.detect.on_detect(&DetectEvent {
            key: key.to_string(),
            ttl,
            soft_ttl,
            name: POLICY_NAME,
            template: self.template.to_string(),
        });
    }
}

/// A function bound to a [`SoftCache`]
pub struct SoftCached<T, E, F> {
    policy: SoftCache<T, E>,
    func: F,
}

impl<T, E, F, Fut> SoftCached<T, E, F>
where
    T: Serialize + DeserializeOwned + Send + Sync,
    F: Fn(CallArgs) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    pub async fn call(&self, args: CallArgs) -> Result<T, SoftError<E>> {
        let func = &self.func;
        let owned = args.clone();
        self.policy.call(&args, move || func(owned)).await
    }

    pub fn policy(&self) -> &SoftCache<T, E> {
        &self.policy
    }
}

/// Builder for [`SoftCache`]
pub struct SoftCacheBuilder<T, E> {
    backend: Arc<dyn Backend>,
    ttl: Ttl,
    soft_ttl: Option<Ttl>,
    template: TemplateSpec,
    prefix: String,
    condition: Condition<T>,
    recover: Recover<E>,
    detect: Arc<dyn CacheDetect>,
    clock: SharedClock,
    registry: Option<Arc<TemplateRegistry>>,
    single_flight: bool,
}

impl<T, E> SoftCacheBuilder<T, E>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    fn new(backend: Arc<dyn Backend>, ttl: Ttl) -> Self {
        Self {
            backend,
            ttl,
            soft_ttl: None,
            template: TemplateSpec::default(),
            prefix: DEFAULT_PREFIX.to_string(),
            condition: Arc::new(|_, _, _| true),
            recover: Arc::new(|_| true),
            detect: Arc::new(LogDetect),
            clock: system_clock(),
            registry: None,
            single_flight: false,
        }
    }

    /// Start from a loaded configuration
    pub fn from_config(backend: Arc<dyn Backend>, config: &SoftCacheConfig) -> Self {
        let mut builder = Self::new(backend, Ttl::Fixed(config.ttl))
            .prefix(config.prefix.clone())
            .single_flight(config.single_flight);
        builder.soft_ttl = config.soft_ttl.map(Ttl::Fixed);
        builder
    }

    /// Freshness window; defaults to 0.33 of the TTL
    pub fn soft_ttl(mut self, soft_ttl: impl Into<Ttl>) -> Self {
        self.soft_ttl = Some(soft_ttl.into());
        self
    }

    /// Explicit key template, e.g. `"user:{id}"`
    pub fn key(mut self, template: impl Into<String>) -> Self {
        self.template.key = Some(template.into());
        self
    }

    /// Name and positional parameter names of the wrapped function
    pub fn function<S: AsRef<str>>(mut self, name: impl Into<String>, params: &[S]) -> Self {
        self.template.function = Some(name.into());
        self.template.params = params.iter().map(|p| p.as_ref().to_string()).collect();
        self
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Only store results accepted by `condition(result, args, key)`
    pub fn condition<C>(mut self, condition: C) -> Self
    where
        C: Fn(&T, &CallArgs, &str) -> bool + Send + Sync + 'static,
    {
        self.condition = Arc::new(condition);
        self
    }

    /// Only serve stale values for failures accepted by `recover`
    pub fn recover<R>(mut self, recover: R) -> Self
    where
        R: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.recover = Arc::new(recover);
        self
    }

    /// Only serve stale values for failures of these kinds
    pub fn recover_kinds(mut self, kinds: Vec<E::Kind>) -> Self
    where
        E: ErrorKind,
    {
        self.recover = recover_kinds(kinds);
        self
    }

    pub fn detect(mut self, detect: Arc<dyn CacheDetect>) -> Self {
        self.detect = detect;
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Register the template with `registry` on build
    pub fn registry(mut self, registry: Arc<TemplateRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Let only one caller per key recompute at a time (in this process)
    pub fn single_flight(mut self, enabled: bool) -> Self {
        self.single_flight = enabled;
        self
    }

    pub fn build(self) -> CacheResult<SoftCache<T, E>> {
        let soft_ttl = self
            .soft_ttl
            .unwrap_or_else(|| self.ttl.scale(DEFAULT_SOFT_TTL_RATIO));

        if let (Some(ttl), Some(soft)) = (self.ttl.as_fixed(), soft_ttl.as_fixed()) {
            if soft > ttl {
                return Err(CacheError::InvalidConfiguration(format!(
                    "soft ttl {:?} exceeds ttl {:?}",
                    soft, ttl
                )));
            }
        }

        let template = self.template.build(&self.prefix)?;
        if let Some(registry) = &self.registry {
            registry.register(self.template.registry_name(&template), template.clone());
        }

        Ok(SoftCache {
            backend: self.backend,
            ttl: self.ttl,
            soft_ttl,
            template,
            condition: self.condition,
            recover: self.recover,
            detect: self.detect,
            clock: self.clock,
            single_flight: self.single_flight.then(SingleFlight::new),
        })
    }
}
