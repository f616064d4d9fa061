#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod backoff;
mod client;
mod errors;
mod inflight;
mod runner;
/// Database schema definitions.
pub mod schema;
mod stats;
mod storage;
mod sweeper;
mod util;
mod worker;

/// Retry delay computation used by [`Client::nack`].
pub use self::backoff::{MIN_RETRY_DELAY, base_delay, retry_delay};
/// The producer and consumer API over the job tables.
pub use self::client::{
    Client, DEFAULT_MAX_ATTEMPTS, DEFAULT_QUEUE, DequeueRequest, EnqueueRequest, JobSource,
    enqueue_in,
};
/// Error types for queue and worker operations.
pub use self::errors::{QueueError, WorkerError};
/// A snapshot of a job the worker is running.
pub use self::inflight::InflightJob;
/// The worker that leases and runs jobs.
pub use self::runner::{Worker, WorkerHandle, WorkerOptions};
pub use self::schema::{Job, JobHistory, JobStatus};
/// Counters of a running worker.
pub use self::stats::StatsSnapshot;
/// Read helpers and constants of the persistence layer.
pub use self::storage::{
    DEFAULT_RECOVER_LIMIT, MANUAL_OPERATOR, NackOutcome, dead_letter_count, get_dead_letters,
    get_history, get_job, pending_job_count,
};
/// The job handler interface.
pub use self::worker::{JobContext, JobHandler};

/// Apply the bundled migrations creating `job_queue` and `job_history`.
pub async fn setup_database(pool: &sqlx::PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}
