//! Aggregate configuration and environment loading.
//!
//! Each primitive carries its own config type with a builder and
//! `validate()`; this module bundles them into a single [`CoreConfig`] that
//! an embedding service can deserialize or load from the environment.
//!
//! ## Environment variables
//!
//! All variables are optional; unset variables keep their defaults.
//!
//! - `BALLAST_WORKER_COUNT`: pool executor count
//! - `BALLAST_QUEUE_SIZE`: pool queue capacity
//! - `BALLAST_HANDLER_DEADLINE_SECS`: per-job execution deadline in seconds
//! - `BALLAST_BREAKER_MAX_FAILURES`: consecutive failures before opening
//! - `BALLAST_BREAKER_RESET_TIMEOUT_MS`: open-state cooldown in milliseconds
//! - `BALLAST_RETRY_MAX_ATTEMPTS`: retry attempt ceiling
//! - `BALLAST_RETRY_INITIAL_DELAY_MS`: first backoff delay in milliseconds
//! - `BALLAST_RETRY_MAX_DELAY_MS`: backoff delay cap in milliseconds
//! - `BALLAST_RETRY_MULTIPLIER`: backoff multiplier
//! - `BALLAST_BUCKET_MAX_TOKENS`: token bucket ceiling
//! - `BALLAST_BUCKET_REFILL_INTERVAL_MS`: one-token refill interval in
//!   milliseconds

use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::pool::WorkerPoolConfig;
use crate::resilience::{CircuitBreakerConfig, RetryPolicy, TokenBucketConfig};

/// Configuration validation error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {message}")]
    Invalid { message: String },
}

impl ConfigError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid { message: message.into() }
    }
}

/// Result type for configuration construction and validation.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Bundled configuration for every primitive in the crate.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub pool: WorkerPoolConfig,
    pub breaker: CircuitBreakerConfig,
    pub retry: RetryPolicy,
    pub bucket: TokenBucketConfig,
}

impl CoreConfig {
    /// Load configuration from `BALLAST_*` environment variables, falling
    /// back to defaults for anything unset.
    ///
    /// # Errors
    /// Returns [`ConfigError`] when a variable is present but malformed, or
    /// when the resulting configuration fails validation.
    pub fn from_env() -> ConfigResult<Self> {
        let mut config = Self::default();

        if let Some(count) = env_parse::<usize>("BALLAST_WORKER_COUNT")? {
            config.pool.worker_count = count;
        }
        if let Some(size) = env_parse::<usize>("BALLAST_QUEUE_SIZE")? {
            config.pool.queue_size = size;
        }
        if let Some(secs) = env_parse::<u64>("BALLAST_HANDLER_DEADLINE_SECS")? {
            config.pool.handler_deadline = Duration::from_secs(secs);
        }

        if let Some(failures) = env_parse::<u32>("BALLAST_BREAKER_MAX_FAILURES")? {
            config.breaker.max_failures = failures;
        }
        if let Some(millis) = env_parse::<u64>("BALLAST_BREAKER_RESET_TIMEOUT_MS")? {
            config.breaker.reset_timeout = Duration::from_millis(millis);
        }

        if let Some(attempts) = env_parse::<u32>("BALLAST_RETRY_MAX_ATTEMPTS")? {
            config.retry.max_attempts = attempts;
        }
        if let Some(millis) = env_parse::<u64>("BALLAST_RETRY_INITIAL_DELAY_MS")? {
            config.retry.initial_delay = Duration::from_millis(millis);
        }
        if let Some(millis) = env_parse::<u64>("BALLAST_RETRY_MAX_DELAY_MS")? {
            config.retry.max_delay = Duration::from_millis(millis);
        }
        if let Some(multiplier) = env_parse::<f64>("BALLAST_RETRY_MULTIPLIER")? {
            config.retry.multiplier = multiplier;
        }

        if let Some(tokens) = env_parse::<u64>("BALLAST_BUCKET_MAX_TOKENS")? {
            config.bucket.max_tokens = tokens;
        }
        if let Some(millis) = env_parse::<u64>("BALLAST_BUCKET_REFILL_INTERVAL_MS")? {
            config.bucket.refill_interval = Duration::from_millis(millis);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate every component configuration.
    pub fn validate(&self) -> ConfigResult<()> {
        self.pool.validate()?;
        self.breaker.validate()?;
        self.retry.validate()?;
        self.bucket.validate()?;
        Ok(())
    }
}

/// Parse an optional environment variable, reporting the offending key on
/// parse failure.
fn env_parse<T>(key: &str) -> ConfigResult<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| ConfigError::invalid(format!("{key}: {e}"))),
        Err(_) => Ok(None),
    }
}
