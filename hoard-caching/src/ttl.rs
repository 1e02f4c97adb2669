//! Duration specifications resolved per call

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::key::CallArgs;
use crate::{CacheError, CacheResult};

/// Ratio of the hard TTL used as soft TTL when none is configured
pub const DEFAULT_SOFT_TTL_RATIO: f64 = 0.33;

type TtlFn = dyn Fn(&CallArgs) -> Duration + Send + Sync;

/// A lifetime that is either fixed or computed from the call's arguments
#[derive(Clone)]
pub enum Ttl {
    /// Same lifetime for every call
    Fixed(Duration),
    /// Lifetime computed from each call's arguments
    Dynamic(Arc<TtlFn>),
}

impl Ttl {
    pub fn from_secs(secs: u64) -> Self {
        Ttl::Fixed(Duration::from_secs(secs))
    }

    /// Lifetime derived from the call's arguments
    pub fn dynamic<F>(f: F) -> Self
    where
        F: Fn(&CallArgs) -> Duration + Send + Sync + 'static,
    {
        Ttl::Dynamic(Arc::new(f))
    }

    /// Parse a human readable duration such as `"90s"`, `"10m"` or `"1h 30m"`
    pub fn parse(spec: &str) -> CacheResult<Self> {
        humantime::parse_duration(spec.trim())
            .map(Ttl::Fixed)
            .map_err(|e| CacheError::InvalidTtl(spec.to_string(), e.to_string()))
    }

    /// Resolve to a concrete lifetime for this call
    pub fn resolve(&self, args: &CallArgs) -> Duration {
        match self {
            Ttl::Fixed(duration) => *duration,
            Ttl::Dynamic(f) => f(args),
        }
    }

    /// The lifetime if it does not depend on arguments
    pub fn as_fixed(&self) -> Option<Duration> {
        match self {
            Ttl::Fixed(duration) => Some(*duration),
            Ttl::Dynamic(_) => None,
        }
    }

    /// A TTL that resolves to `factor` times this one
    pub fn scale(&self, factor: f64) -> Ttl {
        match self {
            Ttl::Fixed(duration) => Ttl::Fixed(scale_duration(*duration, factor)),
            Ttl::Dynamic(f) => {
                let f = f.clone();
                Ttl::dynamic(move |args| scale_duration(f(args), factor))
            }
        }
    }
}

/// `duration * factor`; non-finite or negative factors give zero
pub fn scale_duration(duration: Duration, factor: f64) -> Duration {
    Duration::try_from_secs_f64(duration.as_secs_f64() * factor).unwrap_or(Duration::ZERO)
}

impl fmt::Debug for Ttl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ttl::Fixed(duration) => f.debug_tuple("Fixed").field(duration).finish(),
            Ttl::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

impl From<Duration> for Ttl {
    fn from(duration: Duration) -> Self {
        Ttl::Fixed(duration)
    }
}

impl FromStr for Ttl {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ttl::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_human_durations() {
        assert_eq!(Ttl::parse("90s").unwrap().as_fixed(), Some(Duration::from_secs(90)));
        assert_eq!(
            Ttl::parse("1h 30m").unwrap().as_fixed(),
            Some(Duration::from_secs(5400))
        );
        assert_eq!(
            "250ms".parse::<Ttl>().unwrap().as_fixed(),
            Some(Duration::from_millis(250))
        );
        assert!(matches!(Ttl::parse("soon"), Err(CacheError::InvalidTtl(..))));
    }

    #[test]
    fn test_dynamic_ttl_resolves_from_args() {
        let ttl = Ttl::dynamic(|args| {
            let premium = args.get("premium").and_then(|v| v.as_bool()).unwrap_or(false);
            Duration::from_secs(if premium { 600 } else { 60 })
        });

        let premium = CallArgs::new().kwarg("premium", true);
        let regular = CallArgs::new().kwarg("premium", false);

        assert_eq!(ttl.resolve(&premium), Duration::from_secs(600));
        assert_eq!(ttl.resolve(&regular), Duration::from_secs(60));
        // Resolution is idempotent
        assert_eq!(ttl.resolve(&premium), ttl.resolve(&premium));
        assert_eq!(ttl.as_fixed(), None);
    }

    #[test]
    fn test_scale() {
        let ttl = Ttl::from_secs(100).scale(DEFAULT_SOFT_TTL_RATIO);
        assert_eq!(ttl.as_fixed(), Some(Duration::from_secs(33)));

        let dynamic = Ttl::dynamic(|args| {
            Duration::from_secs(args.positional(0).and_then(|v| v.as_u64()).unwrap_or(0))
        })
        .scale(0.5);
        assert_eq!(dynamic.resolve(&CallArgs::new().arg(json!(10))), Duration::from_secs(5));

        assert_eq!(scale_duration(Duration::from_secs(1), -1.0), Duration::ZERO);
        assert_eq!(scale_duration(Duration::from_secs(1), f64::NAN), Duration::ZERO);
    }
}
