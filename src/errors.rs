use thiserror::Error;

/// Error type for queue client operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The job payload could not be serialized to JSON.
    #[error("Failed to serialize job payload: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// The database returned an error.
    #[error(transparent)]
    DatabaseError(#[from] sqlx::Error),

    /// The job is no longer leased by the worker that tried to resolve it.
    #[error("job {job_id} is not locked by worker {worker_id}")]
    LeaseLost {
        /// Identifier of the job
        job_id: i64,
        /// Worker that believed it held the lease
        worker_id: String,
    },

    /// No pending job exists with the given id.
    #[error("job {0} not found")]
    JobNotFound(i64),

    /// A selected and locked candidate could not be leased.
    #[error("job {0} changed state between selection and lease")]
    InconsistentLease(i64),

    /// An enqueue hit a unique key conflict, but the conflicting row was
    /// gone by the time it was read.
    #[error("job with key {key} in queue {queue} disappeared after a conflicting enqueue")]
    ConflictVanished {
        /// Queue of the conflicting job
        queue: String,
        /// Idempotency key of the conflicting job
        key: String,
    },
}

/// Error type for worker construction.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WorkerError {
    /// The worker was configured without any queue to poll.
    #[error("at least one queue must be configured")]
    NoQueues,

    /// The worker identity is empty, so leases could not be attributed.
    #[error("worker id must not be empty")]
    EmptyWorkerId,
}
