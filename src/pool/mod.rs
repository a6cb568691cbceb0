//! Bounded worker pool for background job execution.
//!
//! A fixed set of executors drains a bounded FIFO queue and dispatches each
//! job to the handler registered for its kind. The lifecycle is one-way:
//! `Unstarted -> Running -> Stopped`. Handlers are frozen into an immutable
//! table at start, so dispatch never races registration.
//!
//! Backpressure is the bounded queue and nothing else: [`WorkerPool::submit`]
//! fails fast with [`PoolError::QueueFull`] instead of blocking. Callers
//! that want to wait put a [`TokenBucket`](crate::resilience::TokenBucket)
//! in front of `submit`.
//!
//! [`WorkerPool::stop`] is graceful: executors finish the job they are
//! working on, jobs still queued are discarded (marked failed), and a
//! handler panic is contained at the executor boundary rather than taking
//! the worker down.
//!
//! # Examples
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use ballast::pool::{BoxedError, Job, JobHandler, WorkerPool, WorkerPoolConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! struct SendEmail;
//!
//! #[async_trait]
//! impl JobHandler for SendEmail {
//!     async fn handle(&self, job: &Job, _cancel: CancellationToken) -> Result<(), BoxedError> {
//!         let recipient: String = job.payload()?;
//!         // ... deliver the email ...
//!         let _ = recipient;
//!         Ok(())
//!     }
//! }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = WorkerPool::new(WorkerPoolConfig::default())?;
//! pool.register_handler("send_email", Arc::new(SendEmail))?;
//! pool.start()?;
//!
//! let job = Arc::new(Job::new("job-1", "send_email", &"ops@example.com")?);
//! pool.submit(Arc::clone(&job))?;
//!
//! pool.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod job;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

pub use job::{BoxedError, Job, JobHandler, JobStatus};

use crate::config::{ConfigError, ConfigResult};

/// Configuration for the worker pool.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// Number of executor tasks.
    pub worker_count: usize,
    /// Capacity of the bounded job queue.
    pub queue_size: usize,
    /// Deadline signalled to each handler invocation.
    pub handler_deadline: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_count: 5,
            queue_size: 100,
            handler_deadline: Duration::from_secs(300),
        }
    }
}

impl WorkerPoolConfig {
    /// Create a configuration builder.
    pub fn builder() -> WorkerPoolConfigBuilder {
        WorkerPoolConfigBuilder::new()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.worker_count == 0 {
            return Err(ConfigError::invalid("worker_count must be at least 1"));
        }
        if self.queue_size == 0 {
            return Err(ConfigError::invalid("queue_size must be at least 1"));
        }
        if self.handler_deadline.is_zero() {
            return Err(ConfigError::invalid("handler_deadline must be greater than zero"));
        }
        Ok(())
    }
}

/// Builder for [`WorkerPoolConfig`].
#[derive(Debug, Default)]
pub struct WorkerPoolConfigBuilder {
    config: WorkerPoolConfig,
}

impl WorkerPoolConfigBuilder {
    pub fn new() -> Self {
        Self { config: WorkerPoolConfig::default() }
    }

    pub fn worker_count(mut self, count: usize) -> Self {
        self.config.worker_count = count;
        self
    }

    pub fn queue_size(mut self, size: usize) -> Self {
        self.config.queue_size = size;
        self
    }

    pub fn handler_deadline(mut self, deadline: Duration) -> Self {
        self.config.handler_deadline = deadline;
        self
    }

    pub fn build(self) -> ConfigResult<WorkerPoolConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Errors returned by pool lifecycle and submission operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    /// The pool is unstarted or stopped; submissions are rejected.
    #[error("worker pool is not running")]
    NotRunning,

    /// The bounded queue is full; backpressure hint to the submitter.
    #[error("job queue is full")]
    QueueFull,

    /// Handler registration attempted after the table was frozen at start.
    #[error("handlers must be registered before the pool is started")]
    AlreadyStarted,

    /// Start attempted after the pool was stopped; the lifecycle is one-way.
    #[error("worker pool has been stopped and cannot be restarted")]
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Unstarted,
    Running,
    Stopped,
}

type HandlerMap = HashMap<String, Arc<dyn JobHandler>>;
type SharedReceiver = Arc<tokio::sync::Mutex<mpsc::Receiver<Arc<Job>>>>;

/// State mutated by lifecycle operations, behind one mutex so concurrent
/// start/stop/submit/register calls serialize.
struct Shared {
    phase: Phase,
    handlers: HandlerMap,
    queue_tx: Option<mpsc::Sender<Arc<Job>>>,
    queue_rx: Option<SharedReceiver>,
    workers: Vec<JoinHandle<()>>,
}

/// Fixed-size worker pool draining a bounded job queue.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    shared: Mutex<Shared>,
    cancel: CancellationToken,
}

impl WorkerPool {
    /// Create an unstarted pool with the given configuration.
    pub fn new(config: WorkerPoolConfig) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            shared: Mutex::new(Shared {
                phase: Phase::Unstarted,
                handlers: HashMap::new(),
                queue_tx: None,
                queue_rx: None,
                workers: Vec::new(),
            }),
            cancel: CancellationToken::new(),
        })
    }

    /// Create an unstarted pool with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(WorkerPoolConfig::default()).expect("default config should be valid")
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register the handler for a job kind.
    ///
    /// Registering the same kind twice overwrites silently. The table is
    /// frozen when the pool starts; registration afterwards is an error.
    pub fn register_handler(
        &self,
        kind: impl Into<String>,
        handler: Arc<dyn JobHandler>,
    ) -> Result<(), PoolError> {
        let mut shared = self.lock();
        if shared.phase != Phase::Unstarted {
            return Err(PoolError::AlreadyStarted);
        }
        shared.handlers.insert(kind.into(), handler);
        Ok(())
    }

    /// Start the pool, launching `worker_count` executors.
    ///
    /// Starting a running pool is a no-op; starting a stopped pool is
    /// rejected.
    #[instrument(skip(self))]
    pub fn start(&self) -> Result<(), PoolError> {
        let mut shared = self.lock();
        match shared.phase {
            Phase::Running => return Ok(()),
            Phase::Stopped => return Err(PoolError::Stopped),
            Phase::Unstarted => {}
        }

        let handlers = Arc::new(std::mem::take(&mut shared.handlers));
        let (tx, rx) = mpsc::channel(self.config.queue_size);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        for worker_id in 0..self.config.worker_count {
            let handle = tokio::spawn(worker_loop(
                worker_id,
                Arc::clone(&rx),
                Arc::clone(&handlers),
                self.config.handler_deadline,
                self.cancel.clone(),
            ));
            shared.workers.push(handle);
        }

        shared.queue_tx = Some(tx);
        shared.queue_rx = Some(rx);
        shared.phase = Phase::Running;
        info!(workers = self.config.worker_count, queue = self.config.queue_size, "worker pool started");
        Ok(())
    }

    /// Submit a job for execution.
    ///
    /// Non-blocking: a full queue is reported as [`PoolError::QueueFull`]
    /// immediately. The caller keeps its `Arc<Job>` to observe the terminal
    /// status.
    pub fn submit(&self, job: Arc<Job>) -> Result<(), PoolError> {
        let shared = self.lock();
        if shared.phase != Phase::Running {
            return Err(PoolError::NotRunning);
        }
        let Some(tx) = shared.queue_tx.as_ref() else {
            return Err(PoolError::NotRunning);
        };

        match tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(job)) => {
                debug!(job_id = job.id(), "job queue full, rejecting submission");
                Err(PoolError::QueueFull)
            }
            Err(TrySendError::Closed(_)) => Err(PoolError::NotRunning),
        }
    }

    /// Stop the pool, waiting for in-flight jobs to finish.
    ///
    /// Jobs still queued are not executed: they are drained after the
    /// executors exit and marked failed. Stopping an unstarted or stopped
    /// pool is a no-op.
    #[instrument(skip(self))]
    pub async fn stop(&self) {
        let (queue_rx, workers) = {
            let mut shared = self.lock();
            if shared.phase != Phase::Running {
                return;
            }
            shared.phase = Phase::Stopped;
            shared.queue_tx = None;
            (shared.queue_rx.take(), std::mem::take(&mut shared.workers))
        };

        info!("stopping worker pool");
        self.cancel.cancel();

        for handle in workers {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    warn!("worker task panicked during shutdown");
                }
            }
        }

        if let Some(rx) = queue_rx {
            let mut discarded = 0_usize;
            if let Ok(mut rx) = rx.try_lock() {
                while let Ok(job) = rx.try_recv() {
                    job.mark_failed("worker pool stopped before execution");
                    discarded += 1;
                }
            }
            if discarded > 0 {
                warn!(discarded, "discarded queued jobs at shutdown");
            }
        }

        info!("worker pool stopped");
    }

    /// Whether the pool is currently running.
    pub fn is_running(&self) -> bool {
        self.lock().phase == Phase::Running
    }

    /// Best-effort count of jobs waiting in the queue.
    pub fn queued_jobs(&self) -> usize {
        let shared = self.lock();
        shared
            .queue_tx
            .as_ref()
            .map(|tx| tx.max_capacity() - tx.capacity())
            .unwrap_or(0)
    }
}

/// Executor loop: drain the shared queue until the stop signal fires.
async fn worker_loop(
    worker_id: usize,
    queue_rx: SharedReceiver,
    handlers: Arc<HandlerMap>,
    handler_deadline: Duration,
    cancel: CancellationToken,
) {
    info!(worker_id, "worker started");
    loop {
        let job = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            job = next_job(&queue_rx) => match job {
                Some(job) => job,
                None => break,
            },
        };
        execute_job(worker_id, job, &handlers, handler_deadline).await;
    }
    info!(worker_id, "worker stopped");
}

/// Pop one job off the shared receiver. `recv` is cancel-safe, so dropping
/// this future at the stop signal loses no job.
async fn next_job(queue_rx: &SharedReceiver) -> Option<Arc<Job>> {
    queue_rx.lock().await.recv().await
}

/// Run one job to a terminal status.
///
/// The handler executes in its own task so a panic is observed as a
/// `JoinError` and converted to a failure instead of unwinding the
/// executor. The deadline is delivered through the cancellation token;
/// the handler is never aborted.
async fn execute_job(
    worker_id: usize,
    job: Arc<Job>,
    handlers: &Arc<HandlerMap>,
    handler_deadline: Duration,
) {
    info!(worker_id, job_id = job.id(), kind = job.kind(), "processing job");

    let Some(handler) = handlers.get(job.kind()) else {
        warn!(worker_id, job_id = job.id(), kind = job.kind(), "no handler for job type");
        job.mark_failed(format!("no handler for job type: {}", job.kind()));
        return;
    };

    job.mark_running();

    let cancel = CancellationToken::new();
    let deadline_timer = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(handler_deadline).await;
            cancel.cancel();
        })
    };

    let outcome = {
        let handler = Arc::clone(handler);
        let job = Arc::clone(&job);
        let cancel = cancel.clone();
        tokio::spawn(async move { handler.handle(job.as_ref(), cancel).await }).await
    };
    deadline_timer.abort();

    match outcome {
        Ok(Ok(())) => {
            info!(worker_id, job_id = job.id(), "job completed");
            job.mark_completed();
        }
        Ok(Err(error)) => {
            warn!(worker_id, job_id = job.id(), error = %error, "job failed");
            job.mark_failed(error.to_string());
        }
        Err(join_error) if join_error.is_panic() => {
            warn!(worker_id, job_id = job.id(), "job handler panicked");
            job.mark_failed("handler panicked");
        }
        Err(_) => {
            job.mark_failed("handler task was cancelled");
        }
    }
}
