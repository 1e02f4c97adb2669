//! Building both policies from YAML configuration

use anyhow::Result;
use hoard_caching::{
    BackendKind, CacheConfig, CacheError, CallArgs, ManualClock, SoftCache, SoftCacheBuilder,
    Validatable,
};
use hoard_resilience::{RateLimitConfig, SlidingRateLimiter};
use serde::Deserialize;
use std::time::Duration;

/// Application settings embedding both sections
#[derive(Debug, Deserialize)]
struct Settings {
    cache: CacheConfig,
    rate_limit: RateLimitConfig,
}

const SETTINGS: &str = r#"
cache:
  backend:
    kind: moka
    max_capacity: 2000
  soft:
    ttl: 1h
    soft_ttl: 5m
    prefix: catalog
    single_flight: true
rate_limit:
  limit: 2
  period: 30s
"#;

#[test]
fn test_settings_parse() -> Result<()> {
    let settings: Settings = serde_yaml::from_str(SETTINGS)?;
    settings.cache.validate()?;
    settings.rate_limit.validate()?;

    assert_eq!(settings.cache.backend.kind, BackendKind::Moka);
    assert_eq!(settings.cache.backend.max_capacity, 2000);
    assert_eq!(settings.cache.soft.ttl, Duration::from_secs(3600));
    assert_eq!(settings.cache.soft.soft_ttl, Some(Duration::from_secs(300)));
    assert_eq!(settings.cache.soft.prefix, "catalog");
    assert!(settings.cache.soft.single_flight);
    assert_eq!(settings.rate_limit.period, Duration::from_secs(30));
    assert_eq!(settings.rate_limit.prefix, "srate");

    Ok(())
}

#[test]
fn test_invalid_sections_are_reported_by_name() {
    let err = CacheConfig::from_yaml("soft:\n  ttl: 10s\n  soft_ttl: 1m\n").unwrap_err();
    assert!(matches!(&err, CacheError::InvalidConfiguration(msg) if msg.starts_with("soft:")));

    let err = RateLimitConfig::from_yaml("limit: 3\nperiod: 0s\n").unwrap_err();
    assert!(err.to_string().contains("rate_limit: period must be positive"));
}

#[tokio::test]
async fn test_policies_from_settings() -> Result<()> {
    let settings: Settings = serde_yaml::from_str(SETTINGS)?;
    let clock = ManualClock::starting_now();
    let backend = settings.cache.backend.build(clock.shared())?;
    assert_eq!(backend.name(), "moka");

    let cache: SoftCache<u64, std::io::Error> =
        SoftCacheBuilder::from_config(backend.clone(), &settings.cache.soft)
            .key("stock:{item}")
            .clock(clock.shared())
            .build()?;
    assert_eq!(cache.template().as_str(), "catalog:stock:{item}");

    let item = CallArgs::new().kwarg("item", "widget");
    assert_eq!(cache.call(&item, || async { Ok(7) }).await?, 7);
    assert_eq!(cache.call(&item, || async { Ok(8) }).await?, 7);
    assert!(backend.get("catalog:stock:widget").await?.is_some());

    let limiter = SlidingRateLimiter::from_config(backend.clone(), &settings.rate_limit)
        .key("stock:{item}")
        .clock(clock.shared())
        .build()?;
    assert_eq!(limiter.limit(), 2);
    assert_eq!(limiter.period().as_fixed(), Some(Duration::from_secs(30)));

    for expected in [true, true, false] {
        let admitted = limiter
            .call(&item, || async { Ok::<_, std::io::Error>(()) })
            .await
            .is_ok();
        assert_eq!(admitted, expected);
    }

    Ok(())
}
