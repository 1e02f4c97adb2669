//! Sliding-window rate limiting
//!
//! Every call records its timestamp in a window stored in the shared
//! backend. When the window already holds `limit` events from the last
//! `period`, the rejection action runs instead of the computation. The
//! window lives in the backend, so every process sharing it shares the
//! limit.

use chrono::{DateTime, Utc};
use hoard_caching::backend::Backend;
use hoard_caching::clock::{shift_back, system_clock, SharedClock};
use hoard_caching::config::{duration, Validatable};
use hoard_caching::key::{CallArgs, KeyTemplate, TemplateRegistry, TemplateSpec};
use hoard_caching::ttl::Ttl;
use hoard_caching::{CacheError, CacheResult};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Key prefix used when none is configured
pub const DEFAULT_PREFIX: &str = "srate";

/// Runs when a call exceeds the limit; `Ok(())` lets the call through
pub type RejectAction = Arc<dyn Fn(&CallArgs) -> Result<(), RateLimitError> + Send + Sync>;

/// A call was rejected because its window is full.
///
/// Retrying after the oldest event in the window ages out may succeed.
#[derive(Debug, Clone, Default, PartialEq, Eq, thiserror::Error)]
#[error("Rate limit reached{}", key_suffix(.key))]
pub struct RateLimitError {
    /// Window key of the rejected call
    pub key: Option<String>,
}

impl RateLimitError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_key(key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
        }
    }
}

fn key_suffix(key: &Option<String>) -> String {
    key.as_deref().map(|key| format!(" for {key}")).unwrap_or_default()
}

/// Failure of a rate-limited call
#[derive(Debug, thiserror::Error)]
pub enum RateLimitedError<E> {
    /// The window could not be updated
    #[error("Rate limit backend error: {0}")]
    Backend(#[from] CacheError),

    /// The rejection action aborted the call
    #[error(transparent)]
    RateLimit(RateLimitError),

    /// The computation itself failed
    #[error("Computation failed: {0}")]
    Compute(E),
}

impl<E> RateLimitedError<E> {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, RateLimitedError::RateLimit(_))
    }

    /// The computation's error, if that is what failed
    pub fn into_compute(self) -> Option<E> {
        match self {
            RateLimitedError::Compute(error) => Some(error),
            _ => None,
        }
    }
}

/// Rate limiter configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Calls allowed per window
    pub limit: u64,

    /// Window length
    #[serde(with = "duration")]
    pub period: Duration,

    /// Key namespace
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

fn default_prefix() -> String {
    DEFAULT_PREFIX.to_string()
}

impl RateLimitConfig {
    pub fn new(limit: u64, period: Duration) -> Self {
        Self {
            limit,
            period,
            prefix: default_prefix(),
        }
    }

    pub fn from_yaml(yaml: &str) -> CacheResult<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }
}

impl Validatable for RateLimitConfig {
    fn validate(&self) -> CacheResult<()> {
        if self.limit == 0 {
            return Err(self.validation_error("limit must be positive"));
        }
        if self.period.is_zero() {
            return Err(self.validation_error("period must be positive"));
        }
        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "rate_limit"
    }
}

/// Sliding-window limiter bound to one wrapped computation
pub struct SlidingRateLimiter {
    backend: Arc<dyn Backend>,
    limit: u64,
    period: Ttl,
    template: KeyTemplate,
    action: RejectAction,
    clock: SharedClock,
}

impl SlidingRateLimiter {
    /// Start building a limiter allowing `limit` calls per `period`.
    ///
    /// `period` may be a [`Ttl::Dynamic`] resolved from each call's arguments.
    pub fn builder(
        backend: Arc<dyn Backend>,
        limit: u64,
        period: impl Into<Ttl>,
    ) -> SlidingRateLimiterBuilder {
        SlidingRateLimiterBuilder::new(backend, limit, period.into(), default_prefix())
    }

    /// Start from a loaded configuration
    pub fn from_config(backend: Arc<dyn Backend>, config: &RateLimitConfig) -> SlidingRateLimiterBuilder {
        SlidingRateLimiterBuilder::new(
            backend,
            config.limit,
            Ttl::Fixed(config.period),
            config.prefix.clone(),
        )
    }

    pub fn template(&self) -> &KeyTemplate {
        &self.template
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn period(&self) -> &Ttl {
        &self.period
    }

    /// Run `compute` if the call fits in its window.
    ///
    /// The call is recorded whether or not it is admitted. `compute` is not
    /// invoked when the rejection action aborts.
    pub async fn call<F, Fut, T, E>(&self, args: &CallArgs, compute: F) -> Result<T, RateLimitedError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let period = self.period.resolve(args);
        let key = self.template.resolve(args);
        let now = self.clock.now();

        // One slot above the limit is enough to tell a rejection apart
        let count = self
            .backend
            .slice_incr(&key, shift_back(now, period), now, self.limit.saturating_add(1), period)
            .await?;

        if count > self.limit {
            info!("Rate limit reached for {}", key);
            if let Err(mut rejection) = (self.action)(args) {
                rejection.key.get_or_insert(key);
                return Err(RateLimitedError::RateLimit(rejection));
            }
            debug!("Rejection action let {} through", key);
        }

        compute().await.map_err(RateLimitedError::Compute)
    }

    /// Wrap `func` so each call goes through this limiter
    pub fn wrap<F>(self, func: F) -> RateLimited<F> {
        RateLimited { limiter: self, func }
    }

    /// Events in the current window for these arguments, without recording
    pub async fn count(&self, args: &CallArgs) -> CacheResult<u64> {
        let key = self.template.resolve(args);
        let Some(stored) = self.backend.get(&key).await? else {
            return Ok(0);
        };

        let events: Vec<DateTime<Utc>> = match serde_json::from_value(stored) {
            Ok(events) => events,
            Err(e) => {
                warn!("Ignoring undecodable rate window for {}: {}", key, e);
                return Ok(0);
            }
        };

        let start = shift_back(self.clock.now(), self.period.resolve(args));
        Ok(events.iter().filter(|event| **event > start).count() as u64)
    }

    /// Forget the window for these arguments
    pub async fn reset(&self, args: &CallArgs) -> CacheResult<bool> {
        let key = self.template.resolve(args);
        debug!("Resetting rate window {}", key);
        self.backend.delete(&key).await
    }
}

impl fmt::Debug for SlidingRateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlidingRateLimiter")
            .field("backend", &self.backend.name())
            .field("limit", &self.limit)
            .field("period", &self.period)
            .field("template", &self.template.as_str())
            .finish()
    }
}

/// A function bound to a [`SlidingRateLimiter`]
pub struct RateLimited<F> {
    limiter: SlidingRateLimiter,
    func: F,
}

impl<F> RateLimited<F> {
    pub async fn call<Fut, T, E>(&self, args: CallArgs) -> Result<T, RateLimitedError<E>>
    where
        F: Fn(CallArgs) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let func = &self.func;
        let owned = args.clone();
        self.limiter.call(&args, move || func(owned)).await
    }

    pub fn limiter(&self) -> &SlidingRateLimiter {
        &self.limiter
    }
}

/// Builder for [`SlidingRateLimiter`]
pub struct SlidingRateLimiterBuilder {
    backend: Arc<dyn Backend>,
    limit: u64,
    period: Ttl,
    prefix: String,
    template: TemplateSpec,
    action: RejectAction,
    clock: SharedClock,
    registry: Option<Arc<TemplateRegistry>>,
}

impl SlidingRateLimiterBuilder {
    fn new(backend: Arc<dyn Backend>, limit: u64, period: Ttl, prefix: String) -> Self {
        Self {
            backend,
            limit,
            period,
            prefix,
            template: TemplateSpec::default(),
            action: Arc::new(|_| Err(RateLimitError::new())),
            clock: system_clock(),
            registry: None,
        }
    }

    /// Explicit key template, e.g. `"login:{user}"`
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

    /// Replace the default rejection, which aborts with [`RateLimitError`]
    pub fn action<A>(mut self, action: A) -> Self
    where
        A: Fn(&CallArgs) -> Result<(), RateLimitError> + Send + Sync + 'static,
    {
        self.action = Arc::new(action);
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

    pub fn build(self) -> CacheResult<SlidingRateLimiter> {
        self.validate()?;

        let template = self.template.build(&self.prefix)?;
        if let Some(registry) = &self.registry {
            registry.register(self.template.registry_name(&template), template.clone());
        }

        match self.period.as_fixed() {
            Some(period) => debug!(
                "Rate limiting {} to {} calls per {}",
                template,
                self.limit,
                humantime::format_duration(period)
            ),
            None => debug!(
                "Rate limiting {} to {} calls per argument-dependent period",
                template, self.limit
            ),
        }

        Ok(SlidingRateLimiter {
            backend: self.backend,
            limit: self.limit,
            period: self.period,
            template,
            action: self.action,
            clock: self.clock,
        })
    }
}

impl Validatable for SlidingRateLimiterBuilder {
    fn validate(&self) -> CacheResult<()> {
        if self.limit == 0 {
            return Err(self.validation_error("limit must be positive"));
        }
        // Dynamic periods are only known per call
        if self.period.as_fixed().is_some_and(|period| period.is_zero()) {
            return Err(self.validation_error("period must be positive"));
        }
        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "rate_limit"
    }
}
