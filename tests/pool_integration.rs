//! Integration tests for the worker pool.
//!
//! Covers dispatch, backpressure, the concurrency cap, graceful shutdown,
//! panic containment, and the handler-deadline signal with real executors
//! and real time.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use ballast::pool::{
    BoxedError, Job, JobHandler, JobStatus, PoolError, WorkerPool, WorkerPoolConfig,
};
use tokio_util::sync::CancellationToken;

/// Wait until `predicate` holds or the timeout expires.
async fn wait_for(timeout: Duration, mut predicate: impl FnMut() -> bool) {
    let started = Instant::now();
    while !predicate() {
        assert!(started.elapsed() < timeout, "condition not reached within {timeout:?}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Handler that sleeps for a fixed time, tracking start/finish counts and
/// the peak number of concurrent invocations.
struct SleepHandler {
    sleep: Duration,
    started: AtomicU32,
    finished: AtomicU32,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl SleepHandler {
    fn new(sleep: Duration) -> Arc<Self> {
        Arc::new(Self {
            sleep,
            started: AtomicU32::new(0),
            finished: AtomicU32::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl JobHandler for SleepHandler {
    async fn handle(&self, _job: &Job, _cancel: CancellationToken) -> Result<(), BoxedError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        tokio::time::sleep(self.sleep).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn job(id: &str, kind: &str) -> Arc<Job> {
    Arc::new(Job::new(id, kind, &()).expect("unit payload should encode"))
}

/// With N=2 and Q=3, two jobs dispatch immediately, three queue, and a
/// sixth submission is refused with `QueueFull`.
#[tokio::test(flavor = "multi_thread")]
async fn backpressure_rejects_when_queue_is_full() {
    let config = WorkerPoolConfig::builder().worker_count(2).queue_size(3).build().unwrap();
    let pool = WorkerPool::new(config).unwrap();
    let handler = SleepHandler::new(Duration::from_millis(200));
    pool.register_handler("sleep", Arc::clone(&handler) as Arc<dyn JobHandler>).unwrap();
    pool.start().unwrap();

    // two jobs reach the workers
    pool.submit(job("j1", "sleep")).unwrap();
    pool.submit(job("j2", "sleep")).unwrap();
    wait_for(Duration::from_secs(1), || handler.started.load(Ordering::SeqCst) == 2).await;

    // three more fill the queue while both workers are busy
    pool.submit(job("j3", "sleep")).unwrap();
    pool.submit(job("j4", "sleep")).unwrap();
    pool.submit(job("j5", "sleep")).unwrap();

    let overflow = pool.submit(job("j6", "sleep"));
    assert_eq!(overflow, Err(PoolError::QueueFull));

    pool.stop().await;
}

/// At most N handler invocations are in flight at once, and every accepted
/// job reaches a terminal status.
#[tokio::test(flavor = "multi_thread")]
async fn concurrency_never_exceeds_worker_count() {
    let config = WorkerPoolConfig::builder().worker_count(2).queue_size(10).build().unwrap();
    let pool = WorkerPool::new(config).unwrap();
    let handler = SleepHandler::new(Duration::from_millis(30));
    pool.register_handler("sleep", Arc::clone(&handler) as Arc<dyn JobHandler>).unwrap();
    pool.start().unwrap();

    let jobs: Vec<_> = (0..6).map(|i| job(&format!("j{i}"), "sleep")).collect();
    for j in &jobs {
        pool.submit(Arc::clone(j)).unwrap();
    }

    wait_for(Duration::from_secs(2), || handler.finished.load(Ordering::SeqCst) == 6).await;
    assert!(handler.peak_in_flight.load(Ordering::SeqCst) <= 2);
    assert!(jobs.iter().all(|j| j.status() == JobStatus::Completed));

    pool.stop().await;
}

/// `stop` waits for the in-flight handler to finish, the job completes, and
/// post-stop submissions are rejected.
#[tokio::test(flavor = "multi_thread")]
async fn stop_waits_for_in_flight_jobs() {
    let config = WorkerPoolConfig::builder().worker_count(2).queue_size(10).build().unwrap();
    let pool = WorkerPool::new(config).unwrap();
    let handler = SleepHandler::new(Duration::from_millis(200));
    pool.register_handler("sleep", Arc::clone(&handler) as Arc<dyn JobHandler>).unwrap();
    pool.start().unwrap();

    let slow = job("slow", "sleep");
    pool.submit(Arc::clone(&slow)).unwrap();
    wait_for(Duration::from_secs(1), || handler.started.load(Ordering::SeqCst) == 1).await;

    let stop_started = Instant::now();
    pool.stop().await;

    assert!(stop_started.elapsed() >= Duration::from_millis(150), "stop returned too early");
    assert_eq!(slow.status(), JobStatus::Completed);
    assert_eq!(pool.submit(job("late", "sleep")), Err(PoolError::NotRunning));
}

/// Jobs still queued when the pool stops are not executed; they are marked
/// failed instead of being silently dropped.
#[tokio::test(flavor = "multi_thread")]
async fn stop_discards_queued_jobs() {
    let config = WorkerPoolConfig::builder().worker_count(1).queue_size(10).build().unwrap();
    let pool = WorkerPool::new(config).unwrap();
    let handler = SleepHandler::new(Duration::from_millis(200));
    pool.register_handler("sleep", Arc::clone(&handler) as Arc<dyn JobHandler>).unwrap();
    pool.start().unwrap();

    let running = job("running", "sleep");
    let queued = job("queued", "sleep");
    pool.submit(Arc::clone(&running)).unwrap();
    wait_for(Duration::from_secs(1), || handler.started.load(Ordering::SeqCst) == 1).await;
    pool.submit(Arc::clone(&queued)).unwrap();

    pool.stop().await;

    assert_eq!(running.status(), JobStatus::Completed);
    assert_eq!(queued.status(), JobStatus::Failed);
    assert!(queued.error().unwrap_or_default().contains("stopped"));
}

/// An unknown job kind fails at dispatch time without touching a handler,
/// and the worker keeps serving later jobs.
#[tokio::test(flavor = "multi_thread")]
async fn unknown_kind_fails_without_handler() {
    let config = WorkerPoolConfig::builder().worker_count(1).queue_size(10).build().unwrap();
    let pool = WorkerPool::new(config).unwrap();
    let handler = SleepHandler::new(Duration::from_millis(1));
    pool.register_handler("known", Arc::clone(&handler) as Arc<dyn JobHandler>).unwrap();
    pool.start().unwrap();

    let stray = job("stray", "unknown");
    let good = job("good", "known");
    pool.submit(Arc::clone(&stray)).unwrap();
    pool.submit(Arc::clone(&good)).unwrap();

    wait_for(Duration::from_secs(1), || good.status() == JobStatus::Completed).await;
    assert_eq!(stray.status(), JobStatus::Failed);
    assert!(stray.error().unwrap_or_default().contains("no handler for job type"));

    pool.stop().await;
}

/// A panicking handler is converted into a failed job; the executor
/// survives and processes subsequent jobs.
#[tokio::test(flavor = "multi_thread")]
async fn handler_panic_is_contained() {
    struct PanicHandler;

    #[async_trait]
    impl JobHandler for PanicHandler {
        async fn handle(&self, _job: &Job, _cancel: CancellationToken) -> Result<(), BoxedError> {
            panic!("handler bug");
        }
    }

    let config = WorkerPoolConfig::builder().worker_count(1).queue_size(10).build().unwrap();
    let pool = WorkerPool::new(config).unwrap();
    let sleeper = SleepHandler::new(Duration::from_millis(1));
    pool.register_handler("explode", Arc::new(PanicHandler)).unwrap();
    pool.register_handler("sleep", Arc::clone(&sleeper) as Arc<dyn JobHandler>).unwrap();
    pool.start().unwrap();

    let doomed = job("doomed", "explode");
    let survivor = job("survivor", "sleep");
    pool.submit(Arc::clone(&doomed)).unwrap();
    pool.submit(Arc::clone(&survivor)).unwrap();

    wait_for(Duration::from_secs(1), || survivor.status() == JobStatus::Completed).await;
    assert_eq!(doomed.status(), JobStatus::Failed);
    assert!(doomed.error().unwrap_or_default().contains("panicked"));

    pool.stop().await;
}

/// A single worker preserves submission order.
#[tokio::test(flavor = "multi_thread")]
async fn single_worker_preserves_fifo_order() {
    struct RecordingHandler {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl JobHandler for RecordingHandler {
        async fn handle(&self, job: &Job, _cancel: CancellationToken) -> Result<(), BoxedError> {
            self.seen.lock().expect("test lock").push(job.id().to_string());
            Ok(())
        }
    }

    let config = WorkerPoolConfig::builder().worker_count(1).queue_size(10).build().unwrap();
    let pool = WorkerPool::new(config).unwrap();
    let recorder = Arc::new(RecordingHandler { seen: Mutex::new(Vec::new()) });
    pool.register_handler("record", Arc::clone(&recorder) as Arc<dyn JobHandler>).unwrap();
    pool.start().unwrap();

    let jobs: Vec<_> = (0..5).map(|i| job(&format!("j{i}"), "record")).collect();
    for j in &jobs {
        pool.submit(Arc::clone(j)).unwrap();
    }

    wait_for(Duration::from_secs(1), || {
        jobs.iter().all(|j| j.status() == JobStatus::Completed)
    })
    .await;

    let seen = recorder.seen.lock().expect("test lock").clone();
    assert_eq!(seen, vec!["j0", "j1", "j2", "j3", "j4"]);

    pool.stop().await;
}

/// The handler-execution deadline is delivered through the cancellation
/// token; a cooperative handler observes it and the pool moves on.
#[tokio::test(flavor = "multi_thread")]
async fn handler_deadline_signals_cancellation() {
    struct DeadlineAwareHandler {
        cancelled: AtomicU32,
    }

    #[async_trait]
    impl JobHandler for DeadlineAwareHandler {
        async fn handle(&self, _job: &Job, cancel: CancellationToken) -> Result<(), BoxedError> {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.cancelled.fetch_add(1, Ordering::SeqCst);
                    Err("deadline exceeded".into())
                }
                _ = tokio::time::sleep(Duration::from_secs(30)) => Ok(()),
            }
        }
    }

    let config = WorkerPoolConfig::builder()
        .worker_count(1)
        .queue_size(10)
        .handler_deadline(Duration::from_millis(50))
        .build()
        .unwrap();
    let pool = WorkerPool::new(config).unwrap();
    let handler = Arc::new(DeadlineAwareHandler { cancelled: AtomicU32::new(0) });
    pool.register_handler("slow", Arc::clone(&handler) as Arc<dyn JobHandler>).unwrap();
    pool.start().unwrap();

    let doomed = job("doomed", "slow");
    pool.submit(Arc::clone(&doomed)).unwrap();

    wait_for(Duration::from_secs(2), || doomed.status() == JobStatus::Failed).await;
    assert_eq!(handler.cancelled.load(Ordering::SeqCst), 1);
    assert!(doomed.error().unwrap_or_default().contains("deadline"));

    pool.stop().await;
}

/// Every successfully submitted job reaches exactly one terminal status.
#[tokio::test(flavor = "multi_thread")]
async fn accepted_jobs_reach_a_terminal_status() {
    let config = WorkerPoolConfig::builder().worker_count(3).queue_size(50).build().unwrap();
    let pool = WorkerPool::new(config).unwrap();
    let handler = SleepHandler::new(Duration::from_millis(2));
    pool.register_handler("sleep", Arc::clone(&handler) as Arc<dyn JobHandler>).unwrap();
    pool.start().unwrap();

    let mut accepted = Vec::new();
    for i in 0..40 {
        let j = job(&format!("j{i}"), "sleep");
        if pool.submit(Arc::clone(&j)).is_ok() {
            accepted.push(j);
        }
    }

    wait_for(Duration::from_secs(5), || {
        accepted.iter().all(|j| j.status().is_terminal())
    })
    .await;
    assert!(accepted.iter().all(|j| j.status() == JobStatus::Completed));

    pool.stop().await;
}
