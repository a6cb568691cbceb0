//! Resilience and background-execution primitives.
//!
//! `ballast` is the reliability core a serving layer links against: a bounded
//! worker pool for deferred jobs, a three-state circuit breaker, an
//! exponential-backoff retry engine, token-bucket rate limiting (global and
//! per-key), and a deadline-bounded timeout wrapper.
//!
//! The components are independently usable; none of them requires the others.
//! Callers that want the full belt-and-braces treatment compose them from the
//! outside in:
//!
//! ```text
//! with_timeout(retry(breaker.execute(bucket-admitted op)))
//! ```
//!
//! or submit such a wrapped operation as the body of a worker-pool job.
//! Every primitive is an explicitly constructed value owned by the caller;
//! the crate installs no global state and no logging subscriber. All state is
//! per-process: nothing here coordinates across nodes or survives a restart.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::complexity, clippy::suspicious)]

pub mod clock;
pub mod config;
pub mod pool;
pub mod resilience;

pub use clock::{Clock, MockClock, SystemClock};
pub use config::{ConfigError, ConfigResult, CoreConfig};
pub use pool::{
    BoxedError, Job, JobHandler, JobStatus, PoolError, WorkerPool, WorkerPoolConfig,
    WorkerPoolConfigBuilder,
};
pub use resilience::{
    retry, retry_with_breaker, with_timeout, CircuitBreaker, CircuitBreakerConfig,
    CircuitBreakerConfigBuilder, CircuitBreakerMetrics, CircuitState, KeyedRateLimiter,
    ResilienceError, ResilienceResult, RetryError, RetryPolicy, RetryPolicyBuilder, TokenBucket,
    TokenBucketConfig, TokenBucketConfigBuilder,
};
