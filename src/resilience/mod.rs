//! Resilience patterns for protecting calls to unreliable dependencies.
//!
//! This module provides the admission-control and failure-handling half of
//! the crate:
//! - **Circuit Breaker**: three-state failure gate that short-circuits calls
//!   to a failing dependency and probes for recovery
//! - **Retry**: exponential backoff with optional jitter and cooperative
//!   cancellation
//! - **Rate Limiting**: token bucket admission control, global or per-key
//! - **Timeout**: deadline-bounded execution that signals, but never forces,
//!   cancellation
//!
//! The pieces compose from the outside in: a timeout around a retry around a
//! breaker around a rate-limited operation. Nothing mandates that order;
//! each primitive is independently usable.
//!
//! # Examples
//!
//! ```rust
//! use std::time::Duration;
//!
//! use ballast::resilience::{CircuitBreaker, CircuitBreakerConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = CircuitBreakerConfig::builder()
//!     .max_failures(3)
//!     .reset_timeout(Duration::from_secs(30))
//!     .build()?;
//! let breaker = CircuitBreaker::new(config)?;
//!
//! let value = breaker.execute(|| async { Ok::<_, std::io::Error>(42) }).await?;
//! assert_eq!(value, 42);
//! # Ok(())
//! # }
//! ```

pub mod circuit_breaker;
pub mod rate_limiter;
pub mod retry;
pub mod timeout;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerConfigBuilder, CircuitBreakerMetrics,
    CircuitState, ResilienceError, ResilienceResult,
};
pub use rate_limiter::{
    KeyedRateLimiter, TokenBucket, TokenBucketConfig, TokenBucketConfigBuilder,
};
pub use retry::{retry, retry_with_breaker, RetryError, RetryPolicy, RetryPolicyBuilder};
pub use timeout::with_timeout;
