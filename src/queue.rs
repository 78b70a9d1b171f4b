//! Job queues carrying conversion messages from the dispatcher to workers.
//!
//! Delivery is at-least-once. A received message stays in flight until it
//! is acknowledged (removed for good) or requeued (put back with its attempt
//! count bumped). The Redis queue keeps in-flight messages in a separate list,
//! so a worker that dies mid-job leaves its message recoverable.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands};
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::job::ConversionJob;
use crate::worker::Backoff;

/// Default queue name, shared with existing producers.
pub const DEFAULT_QUEUE_NAME: &str = "pdf_jobs";

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue connection error: {0}")]
    Connection(#[from] redis::RedisError),

    #[error("failed to encode job message: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("queue closed")]
    Closed,
}

/// One received message. `raw` is the exact payload as stored, used to
/// remove the message from the in-flight list on ack.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub raw: String,
    /// `None` when the payload could not be decoded; such messages can only
    /// be acknowledged away.
    pub job: Option<ConversionJob>,
}

impl Delivery {
    fn decode(raw: String) -> Self {
        let job = match serde_json::from_str::<ConversionJob>(&raw) {
            Ok(job) => Some(job),
            Err(e) => {
                warn!(error = %e, "Received undecodable job message");
                None
            }
        };
        Self { raw, job }
    }
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Publishes a job. Returns only after the broker accepted the message.
    ///
    /// # Arguments
    ///
    /// * `job` - The conversion job to publish
    ///
    /// # Returns
    ///
    /// Returns `Ok(())` once the message is stored, or an error if encoding
    /// fails or the broker is unreachable.
    async fn publish(&self, job: &ConversionJob) -> Result<(), QueueError>;

    /// Waits for the next message and moves it in flight.
    ///
    /// # Arguments
    ///
    /// * `wait` - Upper bound on how long to block when the queue is empty
    ///
    /// # Returns
    ///
    /// Returns `Ok(Some(delivery))` for a message, `Ok(None)` if `wait`
    /// elapsed first, or an error if the broker is unreachable.
    async fn receive(&self, wait: Duration) -> Result<Option<Delivery>, QueueError>;

    /// Permanently removes a received message.
    ///
    /// # Arguments
    ///
    /// * `delivery` - A message previously returned by `receive`
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Returns a received message to the queue.
    ///
    /// # Arguments
    ///
    /// * `delivery` - The in-flight message to take back
    /// * `job` - The job to publish in its place, carrying the updated
    ///   attempt count
    async fn requeue(&self, delivery: &Delivery, job: &ConversionJob) -> Result<(), QueueError>;

    /// Number of messages waiting to be received.
    async fn pending(&self) -> Result<usize, QueueError>;
}

fn encode(job: &ConversionJob) -> Result<String, QueueError> {
    serde_json::to_string(job).map_err(QueueError::Encode)
}

/// Redis list-backed queue.
///
/// Messages wait in `<name>` and move atomically to `<name>:processing` when
/// received (BLMOVE), so an in-flight message is never only in a worker's
/// memory. Each worker should own its own `RedisJobQueue`: a blocking receive
/// holds the connection for up to `wait`.
pub struct RedisJobQueue {
    conn: ConnectionManager,
    pending_key: String,
    processing_key: String,
}

impl RedisJobQueue {
    /// Opens a managed connection and binds it to the queue `name`.
    ///
    /// # Arguments
    ///
    /// * `client` - Redis client carrying the server address and credentials
    /// * `name` - Pending list key; in-flight messages use `<name>:processing`
    ///
    /// # Returns
    ///
    /// Returns the queue, or an error if the first connection fails.
    pub async fn connect(client: &redis::Client, name: &str) -> Result<Self, QueueError> {
        let conn = ConnectionManager::new(client.clone()).await?;
        Ok(Self::new(conn, name))
    }

    /// Connects like [`RedisJobQueue::connect`], retrying failures with
    /// `backoff` for as long as it takes.
    ///
    /// # Arguments
    ///
    /// * `client` - Redis client carrying the server address and credentials
    /// * `name` - Pending list key
    /// * `backoff` - Delay schedule between failed attempts
    /// * `shutdown` - Abandons the attempts when cancelled
    ///
    /// # Returns
    ///
    /// Returns `Some(queue)` once connected, or `None` if `shutdown` was
    /// cancelled first.
    pub async fn connect_with_retry(
        client: &redis::Client,
        name: &str,
        mut backoff: Backoff,
        shutdown: &CancellationToken,
    ) -> Option<Self> {
        let mut attempt: u64 = 1;
        loop {
            let delay = tokio::select! {
                _ = shutdown.cancelled() => return None,
                result = Self::connect(client, name) => match result {
                    Ok(queue) => return Some(queue),
                    Err(e) => {
                        let delay = backoff.next_delay();
                        warn!(
                            attempt,
                            queue = %name,
                            error = %e,
                            retry_in_ms = delay.as_millis() as u64,
                            "Redis connection failed"
                        );
                        delay
                    }
                },
            };
            tokio::select! {
                _ = shutdown.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    pub fn new(conn: ConnectionManager, name: &str) -> Self {
        Self {
            conn,
            pending_key: name.to_string(),
            processing_key: format!("{name}:processing"),
        }
    }

    /// Moves every message left in the in-flight list back to the pending
    /// list. Meant for worker startup, after a crash; it must not run while
    /// other worker processes share the queue and are mid-job.
    ///
    /// # Returns
    ///
    /// Returns the number of messages moved back.
    pub async fn recover_in_flight(&self) -> Result<usize, QueueError> {
        let mut conn = self.conn.clone();
        let mut moved = 0usize;
        loop {
            let item: Option<String> = redis::cmd("LMOVE")
                .arg(&self.processing_key)
                .arg(&self.pending_key)
                .arg("RIGHT")
                .arg("LEFT")
                .query_async(&mut conn)
                .await?;
            match item {
                Some(_) => moved += 1,
                None => break,
            }
        }
        if moved > 0 {
            info!(count = moved, queue = %self.pending_key, "Recovered in-flight messages");
        }
        Ok(moved)
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn publish(&self, job: &ConversionJob) -> Result<(), QueueError> {
        let payload = encode(job)?;
        let mut conn = self.conn.clone();
        conn.rpush::<_, _, ()>(&self.pending_key, &payload).await?;

        info!(
            job_id = %job.job_id,
            filename = %job.filename,
            attempt = job.attempt,
            "Enqueued job"
        );
        Ok(())
    }

    async fn receive(&self, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("BLMOVE")
            .arg(&self.pending_key)
            .arg(&self.processing_key)
            .arg("LEFT")
            .arg("RIGHT")
            .arg(wait.as_secs_f64())
            .query_async(&mut conn)
            .await?;

        Ok(raw.map(|raw| {
            debug!(queue = %self.pending_key, "Received message");
            Delivery::decode(raw)
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        conn.lrem::<_, _, ()>(&self.processing_key, 1, &delivery.raw).await?;
        Ok(())
    }

    async fn requeue(&self, delivery: &Delivery, job: &ConversionJob) -> Result<(), QueueError> {
        let payload = encode(job)?;
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .lrem(&self.processing_key, 1, &delivery.raw)
            .ignore()
            .rpush(&self.pending_key, &payload)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn pending(&self) -> Result<usize, QueueError> {
        let mut conn = self.conn.clone();
        let len: usize = conn.llen(&self.pending_key).await?;
        Ok(len)
    }
}

/// In-process queue for single-process deployments and tests. Not durable.
#[derive(Default)]
pub struct MemoryJobQueue {
    state: Mutex<MemoryState>,
    notify: Notify,
}

#[derive(Default)]
struct MemoryState {
    pending: VecDeque<String>,
    in_flight: Vec<String>,
    closed: bool,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects further publishes; used to simulate a broker outage.
    pub async fn close(&self) {
        self.state.lock().await.closed = true;
    }

    pub async fn in_flight(&self) -> usize {
        self.state.lock().await.in_flight.len()
    }

    /// Pushes a raw payload, bypassing encoding. Lets tests inject
    /// malformed messages.
    pub async fn publish_raw(&self, raw: impl Into<String>) {
        self.state.lock().await.pending.push_back(raw.into());
        self.notify.notify_one();
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn publish(&self, job: &ConversionJob) -> Result<(), QueueError> {
        let payload = encode(job)?;
        {
            let mut state = self.state.lock().await;
            if state.closed {
                return Err(QueueError::Closed);
            }
            state.pending.push_back(payload);
        }
        self.notify.notify_one();
        debug!(job_id = %job.job_id, "Enqueued job in memory");
        Ok(())
    }

    async fn receive(&self, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            {
                let mut state = self.state.lock().await;
                if let Some(raw) = state.pending.pop_front() {
                    state.in_flight.push(raw.clone());
                    return Ok(Some(Delivery::decode(raw)));
                }
            }
            // notify_one stores a permit when nobody waits, so a publish
            // between the check above and this await is not lost.
            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        if let Some(pos) = state.in_flight.iter().position(|r| *r == delivery.raw) {
            state.in_flight.remove(pos);
        }
        Ok(())
    }

    async fn requeue(&self, delivery: &Delivery, job: &ConversionJob) -> Result<(), QueueError> {
        let payload = encode(job)?;
        {
            let mut state = self.state.lock().await;
            if let Some(pos) = state.in_flight.iter().position(|r| *r == delivery.raw) {
                state.in_flight.remove(pos);
            }
            state.pending.push_back(payload);
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn pending(&self) -> Result<usize, QueueError> {
        Ok(self.state.lock().await.pending.len())
    }
}
