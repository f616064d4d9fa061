use crate::errors::QueueError;
use crate::schema::Job;
use crate::storage::{self, NackOutcome};
use serde::Serialize;
use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// The queue name used when a request leaves it empty.
pub const DEFAULT_QUEUE: &str = "default";

/// The attempts ceiling used when a request does not set a positive one.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 5;

/// A job to be enqueued.
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub(crate) queue_name: String,
    pub(crate) priority: i32,
    pub(crate) unique_key: Option<String>,
    pub(crate) payload: Value,
    pub(crate) max_attempts: i32,
    pub(crate) delay: Duration,
}

impl EnqueueRequest {
    /// Create a request for `queue_name` carrying a raw JSON payload.
    pub fn new(queue_name: impl Into<String>, payload: Value) -> Self {
        Self {
            queue_name: queue_name.into(),
            priority: 0,
            unique_key: None,
            payload,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            delay: Duration::ZERO,
        }
    }

    /// Create a request whose payload is `payload` serialized to JSON.
    pub fn json<T: Serialize + ?Sized>(
        queue_name: impl Into<String>,
        payload: &T,
    ) -> Result<Self, QueueError> {
        Ok(Self::new(queue_name, serde_json::to_value(payload)?))
    }

    /// Set the priority. Higher values are served first.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Deduplicate on `key` within the queue.
    ///
    /// While a job with the same key is pending, enqueueing returns its id
    /// instead of inserting a new row.
    pub fn unique_key(mut self, key: impl Into<String>) -> Self {
        self.unique_key = Some(key.into());
        self
    }

    /// Set how many leases the job gets before it is dead-lettered.
    pub fn max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Delay the first time the job may be dequeued.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn queue_name(&self) -> &str {
        if self.queue_name.is_empty() {
            DEFAULT_QUEUE
        } else {
            &self.queue_name
        }
    }

    pub(crate) fn max_attempts_or_default(&self) -> i32 {
        if self.max_attempts <= 0 {
            DEFAULT_MAX_ATTEMPTS
        } else {
            self.max_attempts
        }
    }
}

/// Parameters for leasing the next available job.
#[derive(Debug, Clone)]
pub struct DequeueRequest {
    /// Queues to take jobs from
    pub queues: Vec<String>,
    /// How long the lease lasts unless renewed by a heartbeat
    pub lease: Duration,
    /// Identity recorded as the lease holder
    pub worker_id: String,
}

/// Enqueue a job inside a caller-owned transaction.
///
/// The job only becomes visible to workers once `tx` commits, so producers
/// can enqueue atomically with their own writes.
#[instrument(name = "queue.enqueue", skip_all, fields(queue = request.queue_name(), unique_key = ?request.unique_key))]
pub async fn enqueue_in(
    tx: &mut Transaction<'_, Postgres>,
    request: &EnqueueRequest,
) -> Result<(i64, bool), QueueError> {
    let (job_id, existed) = storage::insert_job(tx, request).await?;
    if existed {
        debug!(job.id = job_id, "Job with the same unique key is already pending");
    } else {
        debug!(job.id = job_id, "Enqueued job");
    }
    Ok((job_id, existed))
}

/// Stateless facade over the job tables.
#[derive(Debug, Clone)]
pub struct Client {
    pool: PgPool,
}

impl Client {
    /// Create a client on top of `pool`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The connection pool backing this client.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Enqueue a job in its own transaction.
    ///
    /// Returns the job id and whether a pending job with the same unique key
    /// already existed, in which case nothing was inserted.
    pub async fn enqueue(&self, request: &EnqueueRequest) -> Result<(i64, bool), QueueError> {
        let mut tx = self.pool.begin().await?;
        let enqueued = enqueue_in(&mut tx, request).await?;
        tx.commit().await?;
        Ok(enqueued)
    }

    /// Lease the next available job, if any.
    #[instrument(name = "queue.dequeue", skip_all, fields(worker.id = %request.worker_id))]
    pub async fn dequeue(&self, request: &DequeueRequest) -> Result<Option<Job>, QueueError> {
        storage::lease_next_job(&self.pool, &request.queues, request.lease, &request.worker_id)
            .await
    }

    /// Resolve a leased job as completed.
    ///
    /// This must run in the same transaction as the handler's own effects;
    /// nothing is persisted until `tx` commits.
    #[instrument(name = "queue.ack", skip_all, fields(job.id = job.id))]
    pub async fn ack(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        job: &Job,
        result: &Value,
    ) -> Result<(), QueueError> {
        storage::complete_job(tx, job, result).await?;
        job.mark_resolved();
        Ok(())
    }

    /// Resolve a leased job as failed.
    ///
    /// The job is retried after an exponential backoff, or dead-lettered if
    /// it has used up its attempts.
    #[instrument(name = "queue.nack", skip_all, fields(job.id = job.id, job.attempts = job.attempts))]
    pub async fn nack(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        job: &Job,
        base_backoff: Duration,
        jitter: f64,
        error: &Value,
    ) -> Result<NackOutcome, QueueError> {
        let outcome = storage::fail_job(tx, job, base_backoff, jitter, error).await?;
        match outcome {
            NackOutcome::Retrying { delay } => debug!(?delay, "Job will be retried"),
            NackOutcome::DeadLettered => warn!("Job exhausted its attempts and was dead-lettered"),
        }
        job.mark_resolved();
        Ok(outcome)
    }

    /// Extend the lease of a job still held by `worker_id`.
    ///
    /// Returns `false` if the lease was already lost.
    pub async fn heartbeat(
        &self,
        job_id: i64,
        worker_id: &str,
        extend: Duration,
    ) -> Result<bool, QueueError> {
        storage::extend_lease(&self.pool, job_id, worker_id, extend).await
    }

    /// Release up to `limit` expired leases. A non-positive limit uses
    /// [`DEFAULT_RECOVER_LIMIT`](crate::DEFAULT_RECOVER_LIMIT).
    #[instrument(name = "queue.recover_expired_leases", skip(self))]
    pub async fn recover_expired_leases(&self, limit: i64) -> Result<u64, QueueError> {
        storage::release_expired_leases(&self.pool, limit).await
    }

    /// Operator action: dead-letter a pending job with `reason` as its result.
    #[instrument(name = "queue.move_to_dead_letter", skip(self, reason))]
    pub async fn move_to_dead_letter_by_id(
        &self,
        job_id: i64,
        reason: &Value,
    ) -> Result<(), QueueError> {
        storage::dead_letter_by_id(&self.pool, job_id, reason).await?;
        warn!("Job was dead-lettered by an operator");
        Ok(())
    }
}

/// The queue operations a [`Worker`](crate::Worker) needs to drive its
/// dispatch loop.
pub trait JobSource: Send + Sync + 'static {
    /// Lease the next available job, if any.
    fn dequeue(
        &self,
        request: &DequeueRequest,
    ) -> impl Future<Output = Result<Option<Job>, QueueError>> + Send;

    /// Extend a lease; `Ok(false)` means the lease is lost.
    fn heartbeat(
        &self,
        job_id: i64,
        worker_id: &str,
        extend: Duration,
    ) -> impl Future<Output = Result<bool, QueueError>> + Send;

    /// Release up to `limit` expired leases.
    fn recover_expired_leases(
        &self,
        limit: i64,
    ) -> impl Future<Output = Result<u64, QueueError>> + Send;
}

impl JobSource for Client {
    fn dequeue(
        &self,
        request: &DequeueRequest,
    ) -> impl Future<Output = Result<Option<Job>, QueueError>> + Send {
        Client::dequeue(self, request)
    }

    fn heartbeat(
        &self,
        job_id: i64,
        worker_id: &str,
        extend: Duration,
    ) -> impl Future<Output = Result<bool, QueueError>> + Send {
        Client::heartbeat(self, job_id, worker_id, extend)
    }

    fn recover_expired_leases(
        &self,
        limit: i64,
    ) -> impl Future<Output = Result<u64, QueueError>> + Send {
        Client::recover_expired_leases(self, limit)
    }
}
