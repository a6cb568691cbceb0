//! Jobs and job handlers.
//!
//! A [`Job`] is a unit of deferred work: a caller-supplied id, a kind tag
//! that routes to a registered handler, and an opaque JSON payload. The
//! payload is stored as serialized bytes and decoded by the handler with
//! [`Job::payload`], so a payload mismatch surfaces as a deserialization
//! error instead of a runtime type cast.
//!
//! Status lives behind interior locks: the submitter keeps its `Arc<Job>`
//! to observe progress while the executing worker is the only mutator.
//! Once a job reaches a terminal status it is immutable.

use std::fmt;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

/// Boxed error type returned by job handlers.
pub type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    /// Queued, not yet picked up by a worker.
    Pending,
    /// A worker is executing the handler.
    Running,
    /// Terminal: the handler returned success.
    Completed,
    /// Terminal: dispatch or the handler failed.
    Failed,
}

impl JobStatus {
    /// Whether the status is terminal (`Completed` or `Failed`).
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A unit of deferred work submitted to the worker pool.
#[derive(Debug)]
pub struct Job {
    id: String,
    kind: String,
    payload: Vec<u8>,
    created_at: DateTime<Utc>,
    status: RwLock<JobStatus>,
    error: RwLock<Option<String>>,
}

impl Job {
    /// Create a job with a serialized payload.
    ///
    /// `id` is caller-supplied and opaque to the pool; `kind` selects the
    /// handler at dispatch time.
    ///
    /// # Errors
    /// Returns the serialization error when the payload cannot be encoded.
    pub fn new<P: Serialize>(
        id: impl Into<String>,
        kind: impl Into<String>,
        payload: &P,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: id.into(),
            kind: kind.into(),
            payload: serde_json::to_vec(payload)?,
            created_at: Utc::now(),
            status: RwLock::new(JobStatus::Pending),
            error: RwLock::new(None),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Decode the payload into the type the handler declared.
    ///
    /// # Errors
    /// Returns the deserialization error on a payload mismatch.
    pub fn payload<P: DeserializeOwned>(&self) -> Result<P, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }

    /// Current status.
    pub fn status(&self) -> JobStatus {
        *self.status.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Terminal error message, if the job failed.
    pub fn error(&self) -> Option<String> {
        self.error.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub(crate) fn mark_running(&self) {
        let mut status = self.status.write().unwrap_or_else(PoisonError::into_inner);
        if *status == JobStatus::Pending {
            *status = JobStatus::Running;
        }
    }

    pub(crate) fn mark_completed(&self) {
        let mut status = self.status.write().unwrap_or_else(PoisonError::into_inner);
        if !status.is_terminal() {
            *status = JobStatus::Completed;
        }
    }

    pub(crate) fn mark_failed(&self, reason: impl Into<String>) {
        let mut status = self.status.write().unwrap_or_else(PoisonError::into_inner);
        if status.is_terminal() {
            return;
        }
        *status = JobStatus::Failed;
        *self.error.write().unwrap_or_else(PoisonError::into_inner) = Some(reason.into());
    }
}

/// Capability to execute jobs of a given kind.
///
/// Handlers are registered before the pool starts and may be invoked from
/// any executor, so implementations must not rely on implicitly shared
/// mutable state. The `cancel` token fires when the handler-execution
/// deadline elapses; long-running handlers should observe it.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job, cancel: CancellationToken) -> Result<(), BoxedError>;
}
