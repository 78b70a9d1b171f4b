//! Worker pool consuming conversion jobs.
//!
//! Each worker is an independent loop holding at most one message at a time.
//! Workers share nothing but the queue and the storage root; the only
//! coordination is queue delivery plus the atomic rename of outputs.
//!
//! Per message: `Received -> Processing -> {Completed | AlreadyDone |
//! Requeued | Discarded}`. A message is acknowledged only after its output is
//! confirmed on disk.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::converter::{ConversionError, ConversionInvoker};
use crate::job::{ConversionJob, JobOutcome, DEFAULT_MAX_ATTEMPTS};
use crate::queue::{Delivery, JobQueue, QueueError};
use crate::storage::SharedStorage;
use crate::telemetry;

/// How long a receive waits before the loop re-checks for shutdown.
const RECEIVE_WAIT: Duration = Duration::from_secs(5);

/// Heartbeat cadence, in processed messages.
const HEARTBEAT_EVERY: u64 = 10;

/// Exponential backoff for queue connection failures.
#[derive(Debug, Clone)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    failures: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: 0,
        }
    }

    /// Delay before the next attempt: `base * 2^failures`, capped at `max`.
    pub fn next_delay(&mut self) -> Duration {
        let factor = 2u32.saturating_pow(self.failures.min(16));
        self.failures = self.failures.saturating_add(1);
        self.base.saturating_mul(factor).min(self.max)
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }
}

#[derive(Clone)]
pub struct Worker {
    invoker: ConversionInvoker,
    storage: SharedStorage,
    max_attempts: u32,
    receive_wait: Duration,
}

impl Worker {
    pub fn new(invoker: ConversionInvoker, storage: SharedStorage) -> Self {
        Self {
            invoker,
            storage,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            receive_wait: RECEIVE_WAIT,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Upper bound on how long an idle worker takes to notice shutdown.
    pub fn with_receive_wait(mut self, wait: Duration) -> Self {
        self.receive_wait = wait;
        self
    }

    /// Starts `queues.len()` worker loops, one per queue handle, all stopping
    /// when `shutdown` is cancelled.
    ///
    /// # Arguments
    ///
    /// * `queues` - One handle per worker; the index becomes the worker id
    /// * `shutdown` - Cancelled to stop every loop
    ///
    /// # Returns
    ///
    /// Returns the spawned tasks, which finish once their loop has stopped.
    pub fn spawn_pool(
        &self,
        queues: Vec<Arc<dyn JobQueue>>,
        shutdown: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        queues
            .into_iter()
            .enumerate()
            .map(|(worker_id, queue)| {
                let worker = self.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { worker.run(worker_id, queue, shutdown).await })
            })
            .collect()
    }

    /// Main worker loop. Runs until `shutdown` is cancelled; a message being
    /// processed when that happens is finished first.
    ///
    /// # Arguments
    ///
    /// * `worker_id` - Identifier used in logs and heartbeats
    /// * `queue` - The queue handle this worker owns
    /// * `shutdown` - Cancelled to stop the loop
    pub async fn run(&self, worker_id: usize, queue: Arc<dyn JobQueue>, shutdown: CancellationToken) {
        info!(worker_id, "Worker started");
        let mut backoff = Backoff::default();
        let mut processed: u64 = 0;

        // Shutdown is only observed between messages.
        while !shutdown.is_cancelled() {
            match self.run_once(queue.as_ref(), self.receive_wait).await {
                Ok(Some(_)) => {
                    backoff.reset();
                    processed += 1;
                    if processed % HEARTBEAT_EVERY == 0 {
                        if let Ok(depth) = queue.pending().await {
                            telemetry::record_worker_heartbeat(worker_id, depth);
                        }
                    }
                }
                Ok(None) => backoff.reset(),
                Err(e) => {
                    let delay = backoff.next_delay();
                    error!(
                        worker_id,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Queue unavailable, backing off"
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        info!(worker_id, processed, "Worker stopped");
    }

    /// Receives and fully settles at most one message.
    ///
    /// # Arguments
    ///
    /// * `queue` - Queue to receive from and settle against
    /// * `wait` - How long to wait for a message
    ///
    /// # Returns
    ///
    /// Returns `Ok(Some(outcome))` for a settled message, or `Ok(None)` if
    /// nothing arrived within `wait`. Conversion failures are settled per
    /// message and never surface here; only queue errors do.
    pub async fn run_once(
        &self,
        queue: &dyn JobQueue,
        wait: Duration,
    ) -> Result<Option<JobOutcome>, QueueError> {
        let Some(delivery) = queue.receive(wait).await? else {
            return Ok(None);
        };
        let outcome = self.settle(queue, delivery).await?;
        Ok(Some(outcome))
    }

    async fn settle(&self, queue: &dyn JobQueue, delivery: Delivery) -> Result<JobOutcome, QueueError> {
        let Some(job) = delivery.job.clone() else {
            queue.ack(&delivery).await?;
            return Ok(JobOutcome::Discarded);
        };

        let span = info_span!(
            "conversion_job",
            job_id = %job.job_id,
            filename = %job.filename,
            attempt = job.attempt,
        );

        async move {
            let started = Instant::now();
            let result = self.process(&job).await;

            let outcome = match result {
                Ok(outcome) => {
                    queue.ack(&delivery).await?;
                    outcome
                }
                Err(ProcessError::Permanent(reason)) => {
                    warn!(reason = %reason, "Discarding job");
                    queue.ack(&delivery).await?;
                    JobOutcome::Discarded
                }
                Err(ProcessError::Conversion(e)) => {
                    let mut next = job.clone();
                    if next.retry(self.max_attempts) {
                        warn!(error = %e, next_attempt = next.attempt, "Conversion failed, requeueing");
                        queue.requeue(&delivery, &next).await?;
                        JobOutcome::Requeued
                    } else {
                        error!(
                            error = %e,
                            attempts = next.attempt,
                            "Conversion failed permanently, discarding"
                        );
                        queue.ack(&delivery).await?;
                        self.release_input(&job).await;
                        JobOutcome::Discarded
                    }
                }
            };

            telemetry::record_job_telemetry(&job, outcome, started.elapsed());
            Ok::<_, QueueError>(outcome)
        }
        .instrument(span)
        .await
    }

    /// Converts one job. Safe to re-run: a redelivered job whose output is
    /// already present and whose input is gone is a no-op, and otherwise the
    /// output is simply rewritten through the same atomic rename.
    async fn process(&self, job: &ConversionJob) -> Result<JobOutcome, ProcessError> {
        let source = job
            .source()
            .map_err(|e| ProcessError::Permanent(e.to_string()))?;
        let target = source.pdf_target();

        let input_present = self
            .storage
            .exists(&source)
            .await
            .map_err(|e| ProcessError::Conversion(e.into()))?;

        if !input_present {
            let output_present = self
                .storage
                .exists(&target)
                .await
                .map_err(|e| ProcessError::Conversion(e.into()))?;
            if output_present {
                debug!(target = %target, "Output already present, nothing to do");
                return Ok(JobOutcome::AlreadyDone);
            }
            return Err(ProcessError::Permanent(format!(
                "input {source} not found in shared storage"
            )));
        }

        let input = self.storage.path_of(&source);
        let output = self.storage.path_of(&target);
        self.invoker
            .invoke(&input, &output, &job.options)
            .await
            .map_err(ProcessError::Conversion)?;

        // The ack that follows must not precede a durable output.
        if !self
            .storage
            .exists(&target)
            .await
            .map_err(|e| ProcessError::Conversion(e.into()))?
        {
            return Err(ProcessError::Conversion(ConversionError::EngineFailure(format!(
                "output {target} missing after commit"
            ))));
        }

        if job.delete_original {
            if let Err(e) = self.storage.delete(&source).await {
                warn!(error = %e, source = %source, "Failed to delete original after conversion");
            }
        }

        info!(target = %target, queued_ms = job.queued_for_ms(), "Job completed");
        Ok(JobOutcome::Completed)
    }

    /// Removes the input of a job that will never complete, so the name can
    /// be submitted again.
    async fn release_input(&self, job: &ConversionJob) {
        let Ok(source) = job.source() else {
            return;
        };
        if let Err(e) = self.storage.delete(&source).await {
            warn!(error = %e, source = %source, "Failed to remove input of discarded job");
        }
    }
}

#[derive(Debug)]
enum ProcessError {
    /// Retrying cannot help (bad filename, input gone).
    Permanent(String),
    Conversion(ConversionError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::converter::{ConversionOptions, MockConversionEngine, DEFAULT_TIMEOUT};
    use crate::queue::MemoryJobQueue;
    use crate::storage::SafeName;
    use bytes::Bytes;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    const WAIT: Duration = Duration::from_millis(200);

    fn worker_with(engine: MockConversionEngine) -> (TempDir, SharedStorage, Worker) {
        let dir = TempDir::new().unwrap();
        let storage = SharedStorage::open(dir.path().join("shared"), dir.path().join("fonts")).unwrap();
        let invoker = ConversionInvoker::new(Arc::new(engine), storage.clone(), DEFAULT_TIMEOUT);
        let worker = Worker::new(invoker, storage.clone()).with_max_attempts(3);
        (dir, storage, worker)
    }

    fn succeeding_engine() -> MockConversionEngine {
        let mut engine = MockConversionEngine::new();
        engine.expect_convert().returning(|_, output, _| {
            std::fs::write(output, b"%PDF-1.4 converted").unwrap();
            Ok(())
        });
        engine
    }

    async fn submit(storage: &SharedStorage, queue: &MemoryJobQueue, name: &str, delete_original: bool) {
        let name = SafeName::parse(name).unwrap();
        storage
            .store_new(&name, Bytes::from_static(b"PK\x03\x04"))
            .await
            .unwrap();
        queue
            .publish(&ConversionJob::new(&name, ConversionOptions::none(), delete_original))
            .await
            .unwrap();
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(5));
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));
        assert_eq!(backoff.next_delay(), Duration::from_secs(5));
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_success_acks_after_output_exists() {
        let (_dir, storage, worker) = worker_with(succeeding_engine());
        let queue = MemoryJobQueue::new();
        submit(&storage, &queue, "report.xlsx", false).await;

        let outcome = worker.run_once(&queue, WAIT).await.unwrap();

        assert_eq!(outcome, Some(JobOutcome::Completed));
        assert_eq!(
            std::fs::read(storage.root().join("report.pdf")).unwrap(),
            b"%PDF-1.4 converted"
        );
        assert!(storage.root().join("report.xlsx").exists());
        assert_eq!(queue.in_flight().await, 0);
        assert_eq!(queue.pending().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_delete_original_removes_input_after_success() {
        let (_dir, storage, worker) = worker_with(succeeding_engine());
        let queue = MemoryJobQueue::new();
        submit(&storage, &queue, "report.xlsx", true).await;

        worker.run_once(&queue, WAIT).await.unwrap();

        assert!(storage.root().join("report.pdf").exists());
        assert!(!storage.root().join("report.xlsx").exists());
    }

    #[tokio::test]
    async fn test_failures_are_requeued_until_attempts_run_out() {
        let mut engine = MockConversionEngine::new();
        engine
            .expect_convert()
            .times(3)
            .returning(|_, _, _| Err(ConversionError::EngineFailure("corrupt file".into())));
        let (_dir, storage, worker) = worker_with(engine);
        let queue = MemoryJobQueue::new();
        submit(&storage, &queue, "broken.xlsx", false).await;

        let mut outcomes = Vec::new();
        while let Some(outcome) = worker.run_once(&queue, WAIT).await.unwrap() {
            outcomes.push(outcome);
        }

        assert_eq!(
            outcomes,
            vec![JobOutcome::Requeued, JobOutcome::Requeued, JobOutcome::Discarded]
        );
        assert!(!storage.root().join("broken.pdf").exists());
        assert!(!storage.root().join("broken.xlsx").exists());
        assert_eq!(queue.in_flight().await, 0);
        assert_eq!(queue.pending().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_missing_input_is_discarded_without_conversion() {
        let mut engine = MockConversionEngine::new();
        engine.expect_convert().never();
        let (_dir, _storage, worker) = worker_with(engine);
        let queue = MemoryJobQueue::new();
        queue
            .publish(&ConversionJob::new(
                &SafeName::parse("ghost.xlsx").unwrap(),
                ConversionOptions::none(),
                false,
            ))
            .await
            .unwrap();

        let outcome = worker.run_once(&queue, WAIT).await.unwrap();
        assert_eq!(outcome, Some(JobOutcome::Discarded));
        assert_eq!(queue.in_flight().await, 0);
    }

    #[tokio::test]
    async fn test_redelivered_completed_job_is_a_no_op() {
        let mut engine = MockConversionEngine::new();
        engine.expect_convert().times(1).returning(|_, output, _| {
            std::fs::write(output, b"%PDF-1.4 once").unwrap();
            Ok(())
        });
        let (_dir, storage, worker) = worker_with(engine);
        let queue = MemoryJobQueue::new();
        submit(&storage, &queue, "report.xlsx", true).await;

        let first = ConversionJob::new(
            &SafeName::parse("report.xlsx").unwrap(),
            ConversionOptions::none(),
            true,
        );
        assert_eq!(worker.run_once(&queue, WAIT).await.unwrap(), Some(JobOutcome::Completed));

        // Same job delivered again after its input was consumed.
        queue.publish(&first).await.unwrap();
        assert_eq!(worker.run_once(&queue, WAIT).await.unwrap(), Some(JobOutcome::AlreadyDone));
        assert_eq!(
            std::fs::read(storage.root().join("report.pdf")).unwrap(),
            b"%PDF-1.4 once"
        );
    }

    #[tokio::test]
    async fn test_undecodable_and_unsafe_messages_are_discarded() {
        let mut engine = MockConversionEngine::new();
        engine.expect_convert().never();
        let (_dir, _storage, worker) = worker_with(engine);
        let queue = MemoryJobQueue::new();
        queue.publish_raw("{not json").await;
        queue.publish_raw(r#"{"filename": "../secrets.xlsx"}"#).await;

        assert_eq!(worker.run_once(&queue, WAIT).await.unwrap(), Some(JobOutcome::Discarded));
        assert_eq!(worker.run_once(&queue, WAIT).await.unwrap(), Some(JobOutcome::Discarded));
        assert_eq!(queue.in_flight().await, 0);
    }

    #[tokio::test]
    async fn test_pool_stops_on_shutdown() {
        let (_dir, storage, worker) = worker_with(succeeding_engine());
        let worker = worker.with_receive_wait(Duration::from_millis(100));
        let queue = Arc::new(MemoryJobQueue::new());
        submit(&storage, &queue, "report.xlsx", false).await;

        let shutdown = CancellationToken::new();
        let handles = worker.spawn_pool(
            vec![queue.clone() as Arc<dyn JobQueue>, queue.clone() as Arc<dyn JobQueue>],
            shutdown.clone(),
        );

        let target = storage.root().join("report.pdf");
        for _ in 0..50 {
            if target.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(target.exists());

        shutdown.cancel();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(2), handle)
                .await
                .unwrap()
                .unwrap();
        }
    }
}
