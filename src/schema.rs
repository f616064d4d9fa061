//! Database schema definitions for SQLx.
//!
//! This module contains the row types of the `job_queue` and `job_history`
//! tables.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::FromRow;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Final status recorded in `job_history`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, sqlx::Type)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// The job is still in `job_queue`
    Pending,
    /// The job was acked
    Completed,
    /// The job exhausted its attempts or was moved by an operator
    DeadLetter,
    /// The job was discarded by an operator
    Discarded,
}

/// Represents a pending job record in the `job_queue` table
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Job {
    /// Unique identifier for the job
    pub id: i64,
    /// Logical queue the job belongs to
    pub queue_name: String,
    /// Priority of the job (higher = served first)
    pub priority: i32,
    /// Idempotency key, unique per queue when present
    pub unique_key: Option<String>,
    /// JSON data containing the job payload
    pub payload: Value,
    /// Number of lease acquisitions so far
    pub attempts: i32,
    /// Attempts ceiling before the job is dead-lettered
    pub max_attempts: i32,
    /// Earliest time the job may be claimed
    pub available_at: DateTime<Utc>,
    /// End of the current lease, `None` when unclaimed
    pub lease_until: Option<DateTime<Utc>>,
    /// Worker holding the current lease
    pub locked_by: Option<String>,
    /// Timestamp when the job was created
    pub created_at: DateTime<Utc>,
    /// Timestamp of the last modification
    pub updated_at: DateTime<Utc>,
    #[sqlx(skip)]
    #[serde(skip)]
    resolution: Resolution,
}

impl Job {
    /// Whether [`ack`](crate::Client::ack) or [`nack`](crate::Client::nack)
    /// has succeeded for this lease.
    ///
    /// Clones of a job share this flag.
    pub fn is_resolved(&self) -> bool {
        self.resolution.is_resolved()
    }

    pub(crate) fn mark_resolved(&self) {
        self.resolution.mark();
    }

    pub(crate) fn resolution(&self) -> Resolution {
        self.resolution.clone()
    }

    #[cfg(test)]
    pub(crate) fn leased(id: i64, queue_name: &str, worker_id: &str) -> Self {
        let now = Utc::now();
        Self {
            id,
            queue_name: queue_name.to_string(),
            priority: 0,
            unique_key: None,
            payload: serde_json::json!({ "n": id }),
            attempts: 1,
            max_attempts: 5,
            available_at: now,
            lease_until: Some(now + chrono::Duration::seconds(30)),
            locked_by: Some(worker_id.to_string()),
            created_at: now,
            updated_at: now,
            resolution: Resolution::default(),
        }
    }
}

/// Shared flag set once a leased job has been acked or nacked.
#[derive(Debug, Clone, Default)]
pub(crate) struct Resolution(Arc<AtomicBool>);

impl Resolution {
    pub(crate) fn mark(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub(crate) fn is_resolved(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Represents a permanent record in the `job_history` table
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct JobHistory {
    /// Identifier of the original job
    pub id: i64,
    /// Logical queue the job belonged to
    pub queue_name: String,
    /// Priority of the job
    pub priority: i32,
    /// Idempotency key of the job
    pub unique_key: Option<String>,
    /// JSON data containing the job payload
    pub payload: Value,
    /// Last result or error reported for the job
    pub result: Value,
    /// Status of the job
    pub status_final: JobStatus,
    /// Attempts at the time of the last update
    pub attempts: i32,
    /// Worker that last processed the job
    pub processed_by: Option<String>,
    /// Timestamp when the job was created
    pub created_at: DateTime<Utc>,
    /// First time work on the job began
    pub started_at: Option<DateTime<Utc>>,
    /// Time the job reached a terminal state
    pub finished_at: Option<DateTime<Utc>>,
}
