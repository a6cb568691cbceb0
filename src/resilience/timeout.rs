//! Deadline-bounded execution.
//!
//! [`with_timeout`] runs an operation as its own task and returns whichever
//! arrives first: the operation's result or the deadline. On timeout the
//! operation is *signalled* through its [`CancellationToken`] but never
//! aborted; a handler that ignores the signal keeps running to completion in
//! the background, and the caller has no claim on its eventual side effects.
//!
//! Completion is reported over a oneshot channel, so a late finish never
//! blocks or leaks the spawned task.

use std::future::Future;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::{ResilienceError, ResilienceResult};

/// Run `operation` under `duration`, returning [`ResilienceError::Timeout`]
/// if the deadline fires first.
///
/// The operation receives a [`CancellationToken`] that is cancelled when the
/// deadline fires; observing it is cooperative. The same token discipline is
/// used by the retry engine and the worker pool, so one operation body
/// composes under all three.
pub async fn with_timeout<F, Fut, T, E>(duration: Duration, operation: F) -> ResilienceResult<T, E>
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    let cancel = CancellationToken::new();
    let (tx, rx) = oneshot::channel();

    let fut = operation(cancel.clone());
    tokio::spawn(async move {
        // the receiver may be gone after a timeout; that is fine
        let _ = tx.send(fut.await);
    });

    tokio::select! {
        completed = rx => match completed {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => Err(ResilienceError::OperationFailed { source: error }),
            Err(_) => {
                warn!("operation task terminated without reporting a result");
                Err(ResilienceError::Cancelled)
            }
        },
        _ = tokio::time::sleep(duration) => {
            cancel.cancel();
            warn!(deadline = ?duration, "operation exceeded its deadline");
            Err(ResilienceError::Timeout { timeout: duration })
        }
    }
}
