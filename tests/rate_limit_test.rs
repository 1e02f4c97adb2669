//! Sliding-window limiter over both backends, alone and in front of a soft cache

use anyhow::Result;
use chrono::{DateTime, TimeDelta, Utc};
use hoard_caching::{
    Backend, BackendConfig, BackendKind, CallArgs, Clock, ManualClock, SoftCache, SoftError,
};
use hoard_resilience::{RateLimitConfig, RateLimitedError, SlidingRateLimiter};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Helper to suppress logging output during test execution
fn init_quiet_logging() {
    use std::sync::Once;
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::WARN)
            .with_target(false)
            .without_time()
            .try_init();
    });
}

fn backend(kind: BackendKind, clock: &ManualClock) -> Result<Arc<dyn Backend>> {
    let config = BackendConfig {
        kind,
        ..BackendConfig::default()
    };
    Ok(config.build(clock.shared())?)
}

fn client(id: &str) -> CallArgs {
    CallArgs::new().kwarg("client", id)
}

fn at(clock: &ManualClock, start: DateTime<Utc>, secs: i64) {
    clock.set(start + TimeDelta::seconds(secs));
}

#[derive(Debug, thiserror::Error)]
#[error("upstream failed")]
struct UpstreamError;

#[tokio::test]
async fn test_sliding_window_on_every_backend() -> Result<()> {
    init_quiet_logging();

    for kind in [BackendKind::InMemory, BackendKind::Moka] {
        let clock = ManualClock::starting_now();
        let start = clock.now();
        let limiter = SlidingRateLimiter::builder(backend(kind, &clock)?, 3, Duration::from_secs(10))
            .key("api:{client}")
            .clock(clock.shared())
            .build()?;

        let mut outcomes = Vec::new();
        for t in [0, 1, 2, 3, 11] {
            at(&clock, start, t);
            let result = limiter
                .call(&client("acme"), || async { Ok::<_, UpstreamError>(t) })
                .await;
            outcomes.push(result.is_ok());
        }

        assert_eq!(outcomes, vec![true, true, true, false, true], "{:?}", kind);
    }

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_burst_admits_exactly_limit_on_every_backend() -> Result<()> {
    init_quiet_logging();

    for kind in [BackendKind::InMemory, BackendKind::Moka] {
        let clock = ManualClock::starting_now();
        let limit = 10;
        let limiter = Arc::new(
            SlidingRateLimiter::builder(backend(kind, &clock)?, limit, Duration::from_secs(60))
                .key("burst:{client}")
                .clock(clock.shared())
                .build()?,
        );
        let computed = Arc::new(AtomicU32::new(0));

        let handles: Vec<_> = (0..limit + 15)
            .map(|_| {
                let limiter = limiter.clone();
                let computed = computed.clone();
                tokio::spawn(async move {
                    limiter
                        .call(&client("acme"), || async move {
                            computed.fetch_add(1, Ordering::SeqCst);
                            Ok::<_, UpstreamError>(())
                        })
                        .await
                })
            })
            .collect();

        let mut admitted = 0;
        let mut rejected = 0;
        for result in futures::future::join_all(handles).await {
            match result? {
                Ok(()) => admitted += 1,
                Err(RateLimitedError::RateLimit(_)) => rejected += 1,
                Err(other) => return Err(other.into()),
            }
        }

        assert_eq!(admitted, limit, "{:?}", kind);
        assert_eq!(rejected, 15, "{:?}", kind);
        assert_eq!(computed.load(Ordering::SeqCst) as u64, limit);
        // The window stores at most limit + 1 events
        assert_eq!(limiter.count(&client("acme")).await?, limit + 1);
    }

    Ok(())
}

#[tokio::test]
async fn test_limiter_in_front_of_soft_cache() -> Result<()> {
    init_quiet_logging();
    let clock = ManualClock::starting_now();
    let backend = backend(BackendKind::InMemory, &clock)?;
    let upstream_calls = AtomicU32::new(0);

    let limiter = SlidingRateLimiter::from_config(
        backend.clone(),
        &RateLimitConfig::new(2, Duration::from_secs(60)),
    )
    .key("report:{client}")
    .clock(clock.shared())
    .build()?;
    let cache: SoftCache<String, UpstreamError> = SoftCache::builder(backend, Duration::from_secs(600))
        .key("report:{client}")
        .clock(clock.shared())
        .build()?;

    let fetch = |args: CallArgs| {
        let cache = &cache;
        let upstream_calls = &upstream_calls;
        async move {
            cache
                .call(&args, || async {
                    upstream_calls.fetch_add(1, Ordering::SeqCst);
                    Ok("monthly report".to_string())
                })
                .await
        }
    };

    // Cached hits still count against the limit
    for _ in 0..2 {
        let report = limiter
            .call(&client("acme"), || fetch(client("acme")))
            .await
            .map_err(|e| anyhow::anyhow!("{}", e))?;
        assert_eq!(report, "monthly report");
    }
    let err = limiter
        .call(&client("acme"), || fetch(client("acme")))
        .await
        .unwrap_err();
    assert!(err.is_rate_limited());
    assert_eq!(upstream_calls.load(Ordering::SeqCst), 1);

    // Limiter and cache use distinct prefixes on the shared backend
    assert!(limiter.reset(&client("acme")).await?);
    let report = limiter
        .call(&client("acme"), || fetch(client("acme")))
        .await;
    assert!(matches!(report, Ok(ref r) if r == "monthly report"));
    assert_eq!(upstream_calls.load(Ordering::SeqCst), 1);

    Ok(())
}

#[tokio::test]
async fn test_compute_failure_passes_through() -> Result<()> {
    init_quiet_logging();
    let clock = ManualClock::starting_now();
    let cache: SoftCache<String, UpstreamError> =
        SoftCache::builder(backend(BackendKind::InMemory, &clock)?, Duration::from_secs(60))
            .key("report:{client}")
            .clock(clock.shared())
            .build()?;
    let limiter = SlidingRateLimiter::builder(backend(BackendKind::Moka, &clock)?, 5, Duration::from_secs(10))
        .key("report:{client}")
        .clock(clock.shared())
        .build()?;

    let args = client("acme");
    let err = limiter
        .call(&args, || cache.call(&args, || async { Err(UpstreamError) }))
        .await
        .unwrap_err();

    match err {
        RateLimitedError::Compute(SoftError::Compute(UpstreamError)) => {}
        other => panic!("expected the upstream failure, got {:?}", other),
    }

    Ok(())
}
