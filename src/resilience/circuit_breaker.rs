//! Three-state circuit breaker.
//!
//! The breaker monitors consecutive failures of a protected operation and,
//! once a threshold is reached, short-circuits further calls for a cooldown
//! period. After the cooldown a single probe call is admitted; its outcome
//! decides whether the circuit closes again or stays open.
//!
//! State transitions are serialized through one mutex, so concurrent callers
//! observe a single total order of transitions. In half-open state exactly
//! one probe is in flight at a time; concurrent calls are rejected with
//! [`ResilienceError::CircuitOpen`] until the probe resolves.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::{ConfigError, ConfigResult};

/// Errors produced by the resilience layer.
///
/// Generic over the protected operation's error type `E` so the original
/// failure is preserved as a source instead of being stringified.
#[derive(Debug, Error)]
pub enum ResilienceError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Circuit breaker is open; the call was rejected without running.
    #[error("circuit breaker is open, rejecting calls")]
    CircuitOpen,

    /// The operation did not complete within its deadline.
    #[error("operation timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    /// Admission was denied because no token was available.
    #[error("rate limit exceeded")]
    RateLimited,

    /// The caller's cancellation signal fired while waiting.
    #[error("operation cancelled")]
    Cancelled,

    /// The protected operation itself failed.
    #[error("operation failed")]
    OperationFailed {
        #[source]
        source: E,
    },
}

/// Result type for resilience-wrapped operations.
pub type ResilienceResult<T, E> = Result<T, ResilienceError<E>>;

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Allowing traffic.
    Closed,
    /// Rejecting traffic until the reset timeout elapses.
    Open,
    /// Admitting a single probe to test recovery.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub max_failures: u32,
    /// Cooldown after which an open circuit admits a probe.
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self { max_failures: 5, reset_timeout: Duration::from_secs(60) }
    }
}

impl CircuitBreakerConfig {
    /// Create a configuration builder.
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder::new()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_failures == 0 {
            return Err(ConfigError::invalid("max_failures must be greater than 0"));
        }
        if self.reset_timeout.is_zero() {
            return Err(ConfigError::invalid("reset_timeout must be greater than zero"));
        }
        Ok(())
    }
}

/// Builder for [`CircuitBreakerConfig`].
#[derive(Debug, Default)]
pub struct CircuitBreakerConfigBuilder {
    config: CircuitBreakerConfig,
}

impl CircuitBreakerConfigBuilder {
    pub fn new() -> Self {
        Self { config: CircuitBreakerConfig::default() }
    }

    pub fn max_failures(mut self, failures: u32) -> Self {
        self.config.max_failures = failures;
        self
    }

    pub fn reset_timeout(mut self, timeout: Duration) -> Self {
        self.config.reset_timeout = timeout;
        self
    }

    pub fn build(self) -> ConfigResult<CircuitBreakerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Point-in-time snapshot of breaker counters for monitoring.
#[derive(Debug, Clone)]
pub struct CircuitBreakerMetrics {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub total_calls: u64,
    pub rejected_calls: u64,
    pub last_failure: Option<Instant>,
}

/// Mutable breaker state, guarded by a single mutex so every transition is
/// linearizable with respect to `execute`.
#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    probe_in_flight: bool,
    total_calls: u64,
    rejected_calls: u64,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure: None,
            probe_in_flight: false,
            total_calls: 0,
            rejected_calls: 0,
        }
    }
}

/// Ticket handed out by admission; records whether the admitted call is the
/// half-open probe whose outcome drives the next transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Regular,
    Probe,
}

/// Circuit breaker protecting calls to an unreliable dependency.
///
/// Cloning is cheap and clones share state, so one breaker can guard a
/// dependency across many tasks.
pub struct CircuitBreaker<C: Clock = SystemClock> {
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<BreakerState>>,
    clock: Arc<C>,
}

impl<C: Clock> fmt::Debug for CircuitBreaker<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

impl<C: Clock> Clone for CircuitBreaker<C> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            inner: Arc::clone(&self.inner),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl CircuitBreaker<SystemClock> {
    /// Create a breaker with the given configuration on the system clock.
    pub fn new(config: CircuitBreakerConfig) -> ConfigResult<Self> {
        Self::with_clock(config, SystemClock)
    }
}

impl<C: Clock> CircuitBreaker<C> {
    /// Create a breaker with a custom clock.
    pub fn with_clock(config: CircuitBreakerConfig, clock: C) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            inner: Arc::new(Mutex::new(BreakerState::new())),
            clock: Arc::new(clock),
        })
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Decide whether a call may proceed, transitioning Open to Half-Open
    /// when the reset timeout has elapsed.
    fn try_admit(&self) -> Option<Admission> {
        let mut state = self.lock();
        state.total_calls += 1;

        match state.state {
            CircuitState::Closed => Some(Admission::Regular),
            CircuitState::Open => {
                let cooled_down = match state.last_failure {
                    Some(at) => self.clock.now().duration_since(at) > self.config.reset_timeout,
                    None => true,
                };
                if cooled_down {
                    state.state = CircuitState::HalfOpen;
                    state.probe_in_flight = true;
                    info!("circuit breaker half-open, admitting probe");
                    Some(Admission::Probe)
                } else {
                    state.rejected_calls += 1;
                    None
                }
            }
            CircuitState::HalfOpen => {
                if state.probe_in_flight {
                    state.rejected_calls += 1;
                    None
                } else {
                    state.probe_in_flight = true;
                    Some(Admission::Probe)
                }
            }
        }
    }

    fn record_success(&self, admission: Admission) {
        let mut state = self.lock();
        match admission {
            Admission::Probe => {
                state.probe_in_flight = false;
                state.state = CircuitState::Closed;
                state.consecutive_failures = 0;
                info!("circuit breaker closed after successful probe");
            }
            Admission::Regular => {
                state.consecutive_failures = 0;
            }
        }
    }

    fn record_failure(&self, admission: Admission) {
        let mut state = self.lock();
        let now = self.clock.now();
        state.last_failure = Some(now);

        match admission {
            Admission::Probe => {
                state.probe_in_flight = false;
                state.state = CircuitState::Open;
                warn!("circuit breaker reopened after failed probe");
            }
            Admission::Regular => {
                state.consecutive_failures += 1;
                if state.state == CircuitState::Closed
                    && state.consecutive_failures >= self.config.max_failures
                {
                    state.state = CircuitState::Open;
                    warn!(
                        failures = state.consecutive_failures,
                        "circuit breaker opened"
                    );
                }
            }
        }
    }

    /// Execute an async operation under breaker protection.
    ///
    /// The operation runs only if admission is granted; its outcome drives
    /// the next state transition. A rejected call returns
    /// [`ResilienceError::CircuitOpen`] without invoking the operation.
    #[instrument(skip(self, operation))]
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> ResilienceResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let Some(admission) = self.try_admit() else {
            debug!(state = %self.state(), "circuit breaker rejecting call");
            return Err(ResilienceError::CircuitOpen);
        };

        match operation().await {
            Ok(value) => {
                self.record_success(admission);
                Ok(value)
            }
            Err(error) => {
                self.record_failure(admission);
                warn!(error = %error, "circuit breaker recorded failure");
                Err(ResilienceError::OperationFailed { source: error })
            }
        }
    }

    /// Execute a synchronous operation under breaker protection.
    ///
    /// Same admission and transition rules as [`execute`](Self::execute);
    /// useful when wrapping non-async work such as an HTTP middleware body.
    pub fn call<F, T, E>(&self, operation: F) -> ResilienceResult<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let Some(admission) = self.try_admit() else {
            debug!(state = %self.state(), "circuit breaker rejecting call");
            return Err(ResilienceError::CircuitOpen);
        };

        match operation() {
            Ok(value) => {
                self.record_success(admission);
                Ok(value)
            }
            Err(error) => {
                self.record_failure(admission);
                warn!(error = %error, "circuit breaker recorded failure");
                Err(ResilienceError::OperationFailed { source: error })
            }
        }
    }

    /// Current state; observational only.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Force the breaker back to Closed with all counters zeroed.
    ///
    /// Intended for operator intervention and tests.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.state = CircuitState::Closed;
        state.consecutive_failures = 0;
        state.last_failure = None;
        state.probe_in_flight = false;
        info!("circuit breaker manually reset");
    }

    /// Snapshot of the breaker counters.
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let state = self.lock();
        CircuitBreakerMetrics {
            state: state.state,
            consecutive_failures: state.consecutive_failures,
            total_calls: state.total_calls,
            rejected_calls: state.rejected_calls,
            last_failure: state.last_failure,
        }
    }
}

impl Default for CircuitBreaker<SystemClock> {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default()).expect("default config should be valid")
    }
}
