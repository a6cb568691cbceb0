//! Retry with exponential backoff.
//!
//! [`retry`] re-invokes a fallible operation until it succeeds, the attempt
//! ceiling is reached, or the caller's cancellation token fires during a
//! backoff sleep. Delays follow `min(max_delay, initial_delay * multiplier^k)`
//! with optional equal jitter, which draws the effective delay uniformly
//! from `[delay / 2, delay]` so the configured upper bound always holds.
//!
//! The engine treats every failure as retriable; separating transient from
//! permanent errors is the caller's job. An operation that wants to stop
//! retrying early returns `Ok` carrying its own failure payload, keeping the
//! engine agnostic of domain error taxonomies.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::circuit_breaker::{CircuitBreaker, ResilienceError};
use crate::clock::Clock;
use crate::config::{ConfigError, ConfigResult};

/// Errors returned by the retry engine.
#[derive(Debug, Error)]
pub enum RetryError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Every attempt failed; carries the last error observed.
    #[error("all {attempts} retry attempts exhausted")]
    Exhausted {
        attempts: u32,
        #[source]
        source: E,
    },

    /// The cancellation token fired during a backoff sleep.
    #[error("retry cancelled while backing off")]
    Cancelled,
}

/// Backoff policy: attempt ceiling plus the delay sequence parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Factor applied to the delay after each failed attempt.
    pub multiplier: f64,
    /// Randomize each delay within `[delay / 2, delay]`.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: false,
        }
    }
}

impl RetryPolicy {
    /// Create a policy builder.
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::new()
    }

    /// Validate the policy.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid("max_attempts must be at least 1"));
        }
        if self.multiplier < 1.0 {
            return Err(ConfigError::invalid("multiplier must be at least 1.0"));
        }
        if self.initial_delay > self.max_delay {
            return Err(ConfigError::invalid("initial_delay must not exceed max_delay"));
        }
        Ok(())
    }

    /// Delay before re-attempting after `attempt` failures (zero-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let scaled = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = scaled.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped).min(self.max_delay)
    }

    /// `delay_for` with jitter applied when enabled.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let delay = self.delay_for(attempt);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let nanos = delay.as_nanos() as u64;
        Duration::from_nanos(rand::thread_rng().gen_range(nanos / 2..=nanos))
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Default)]
pub struct RetryPolicyBuilder {
    policy: RetryPolicy,
}

impl RetryPolicyBuilder {
    pub fn new() -> Self {
        Self { policy: RetryPolicy::default() }
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.policy.max_attempts = attempts;
        self
    }

    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.policy.initial_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.policy.max_delay = delay;
        self
    }

    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.policy.multiplier = multiplier;
        self
    }

    pub fn jitter(mut self, jitter: bool) -> Self {
        self.policy.jitter = jitter;
        self
    }

    pub fn build(self) -> ConfigResult<RetryPolicy> {
        self.policy.validate()?;
        Ok(self.policy)
    }
}

/// Re-invoke `operation` under `policy` until it succeeds, attempts run out,
/// or `cancel` fires during a backoff sleep.
///
/// On exhaustion the last error is returned inside
/// [`RetryError::Exhausted`]. Cancellation during a sleep returns
/// [`RetryError::Cancelled`] without another attempt; an attempt already in
/// progress is never interrupted.
pub async fn retry<F, Fut, T, E>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::error::Error + Send + Sync + 'static,
{
    let mut attempt: u32 = 0;
    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(retries = attempt, "operation succeeded after retries");
                }
                return Ok(value);
            }
            Err(error) => {
                attempt += 1;
                if attempt >= policy.max_attempts {
                    warn!(attempts = attempt, error = %error, "retry attempts exhausted");
                    return Err(RetryError::Exhausted { attempts: attempt, source: error });
                }

                let delay = policy.backoff_delay(attempt - 1);
                debug!(attempt, ?delay, error = %error, "operation failed, backing off");
                tokio::select! {
                    _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

/// Retry an operation that is itself guarded by a circuit breaker.
///
/// A rejected call (circuit open) counts as a failed attempt, so the backoff
/// naturally paces recovery probes.
pub async fn retry_with_breaker<C, F, Fut, T, E>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    breaker: &CircuitBreaker<C>,
    mut operation: F,
) -> Result<T, RetryError<ResilienceError<E>>>
where
    C: Clock,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::error::Error + Send + Sync + 'static,
{
    retry(policy, cancel, || {
        let fut = operation();
        breaker.execute(move || fut)
    })
    .await
}
