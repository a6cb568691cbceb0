//! Token bucket rate limiting.
//!
//! A bucket holds up to `max_tokens` tokens and gains one token per
//! `refill_interval`. Callers either poll with [`TokenBucket::try_acquire`]
//! or block with [`TokenBucket::acquire`] until a token frees up or a
//! deadline fires. The bucket never fails an operation; it only denies
//! admission.
//!
//! Refill is lazy: token count is brought up to date on every access, and
//! `last_refill` advances by whole consumed intervals rather than snapping
//! to `now`, so sub-interval accumulation is never dropped.
//!
//! [`KeyedRateLimiter`] maintains one bucket per caller key (an IP, a user
//! id, an API key) with lazy creation, for per-client admission control.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{ResilienceError, ResilienceResult};
use crate::clock::{Clock, SystemClock};
use crate::config::{ConfigError, ConfigResult};

/// Configuration for a token bucket.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TokenBucketConfig {
    /// Maximum number of tokens the bucket can hold.
    pub max_tokens: u64,
    /// Time to accrue one token.
    pub refill_interval: Duration,
}

impl Default for TokenBucketConfig {
    fn default() -> Self {
        Self { max_tokens: 100, refill_interval: Duration::from_millis(100) }
    }
}

impl TokenBucketConfig {
    /// Create a configuration builder.
    pub fn builder() -> TokenBucketConfigBuilder {
        TokenBucketConfigBuilder::new()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_tokens == 0 {
            return Err(ConfigError::invalid("max_tokens must be greater than 0"));
        }
        if self.refill_interval.is_zero() {
            return Err(ConfigError::invalid("refill_interval must be greater than zero"));
        }
        Ok(())
    }
}

/// Builder for [`TokenBucketConfig`].
#[derive(Debug, Default)]
pub struct TokenBucketConfigBuilder {
    config: TokenBucketConfig,
}

impl TokenBucketConfigBuilder {
    pub fn new() -> Self {
        Self { config: TokenBucketConfig::default() }
    }

    pub fn max_tokens(mut self, tokens: u64) -> Self {
        self.config.max_tokens = tokens;
        self
    }

    pub fn refill_interval(mut self, interval: Duration) -> Self {
        self.config.refill_interval = interval;
        self
    }

    pub fn build(self) -> ConfigResult<TokenBucketConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: u64,
    last_refill: Instant,
}

/// Token bucket rate limiter.
///
/// Refill and decrement happen under one mutex, so when two acquirers race
/// for the last token exactly one wins. A freshly constructed bucket starts
/// full. Clones share state.
pub struct TokenBucket<C: Clock = SystemClock> {
    config: TokenBucketConfig,
    state: Arc<Mutex<BucketState>>,
    clock: Arc<C>,
}

impl<C: Clock> Clone for TokenBucket<C> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            state: Arc::clone(&self.state),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl TokenBucket<SystemClock> {
    /// Create a bucket on the system clock.
    pub fn new(config: TokenBucketConfig) -> ConfigResult<Self> {
        Self::with_clock(config, SystemClock)
    }
}

impl<C: Clock> TokenBucket<C> {
    /// Create a bucket with a custom clock.
    pub fn with_clock(config: TokenBucketConfig, clock: C) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self::from_parts(config, Arc::new(clock)))
    }

    /// Internal constructor for pre-validated configuration.
    fn from_parts(config: TokenBucketConfig, clock: Arc<C>) -> Self {
        let state =
            Arc::new(Mutex::new(BucketState { tokens: config.max_tokens, last_refill: clock.now() }));
        Self { config, state, clock }
    }

    fn lock(&self) -> MutexGuard<'_, BucketState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Credit whole elapsed intervals, advancing `last_refill` by exactly
    /// the intervals consumed so partial progress carries over.
    fn refill(&self, state: &mut BucketState) {
        let now = self.clock.now();
        let elapsed = now.duration_since(state.last_refill);
        let interval = self.config.refill_interval.as_nanos();
        let intervals = (elapsed.as_nanos() / interval) as u64;

        if intervals > 0 {
            state.tokens = state.tokens.saturating_add(intervals).min(self.config.max_tokens);
            let leftover = Duration::from_nanos((elapsed.as_nanos() % interval) as u64);
            state.last_refill = now - leftover;
        }
    }

    /// Try to consume one token without blocking.
    ///
    /// Returns `true` iff a token was consumed.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.lock();
        self.refill(&mut state);

        if state.tokens > 0 {
            state.tokens -= 1;
            true
        } else {
            debug!("rate limit: no tokens available");
            false
        }
    }

    /// Block until a token is available, the deadline fires, or the caller
    /// cancels.
    ///
    /// Sleeps at most one refill interval between polls so cancellation and
    /// the deadline are observed promptly.
    pub async fn acquire(
        &self,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> ResilienceResult<(), Infallible> {
        let started = Instant::now();
        loop {
            if self.try_acquire() {
                return Ok(());
            }

            let elapsed = started.elapsed();
            if elapsed >= deadline {
                return Err(ResilienceError::Timeout { timeout: deadline });
            }

            let wait = self.config.refill_interval.min(deadline - elapsed);
            tokio::select! {
                _ = cancel.cancelled() => return Err(ResilienceError::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Current token count after a lazy refill; observational.
    pub fn available_tokens(&self) -> u64 {
        let mut state = self.lock();
        self.refill(&mut state);
        state.tokens
    }

    /// Restore the bucket to full capacity.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.tokens = self.config.max_tokens;
        state.last_refill = self.clock.now();
    }
}

/// Per-key rate limiter with lazily created buckets.
///
/// All buckets share one configuration and clock. A bucket is created the
/// first time its key is seen and lives for the lifetime of the limiter;
/// there is no eviction.
pub struct KeyedRateLimiter<C: Clock = SystemClock> {
    config: TokenBucketConfig,
    buckets: RwLock<HashMap<String, TokenBucket<C>>>,
    clock: Arc<C>,
}

impl KeyedRateLimiter<SystemClock> {
    /// Create a keyed limiter on the system clock.
    pub fn new(config: TokenBucketConfig) -> ConfigResult<Self> {
        Self::with_clock(config, SystemClock)
    }
}

impl<C: Clock> KeyedRateLimiter<C> {
    /// Create a keyed limiter with a custom clock.
    pub fn with_clock(config: TokenBucketConfig, clock: C) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self { config, buckets: RwLock::new(HashMap::new()), clock: Arc::new(clock) })
    }

    /// Try to consume one token from `key`'s bucket, creating the bucket on
    /// first sight of the key.
    pub fn try_acquire(&self, key: &str) -> bool {
        self.bucket(key).try_acquire()
    }

    /// Handle to `key`'s bucket, creating it if absent.
    pub fn bucket(&self, key: &str) -> TokenBucket<C> {
        if let Ok(buckets) = self.buckets.read() {
            if let Some(bucket) = buckets.get(key) {
                return bucket.clone();
            }
        }

        let mut buckets = self.buckets.write().unwrap_or_else(PoisonError::into_inner);
        buckets
            .entry(key.to_string())
            .or_insert_with(|| {
                debug!(key, "creating rate limit bucket");
                TokenBucket::from_parts(self.config.clone(), Arc::clone(&self.clock))
            })
            .clone()
    }

    /// Number of keys with a live bucket.
    pub fn bucket_count(&self) -> usize {
        self.buckets.read().map(|b| b.len()).unwrap_or(0)
    }
}
