//! Resilience patterns for Hoard
//!
//! This crate provides a distributed sliding-window rate limiter built on
//! the storage contract of `hoard-caching`.

pub mod rate_limit;

// Re-export commonly used types
pub use rate_limit::{
    RateLimitConfig, RateLimitError, RateLimited, RateLimitedError, RejectAction, SlidingRateLimiter,
    SlidingRateLimiterBuilder,
};
