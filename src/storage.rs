use crate::backoff;
use crate::client::EnqueueRequest;
use crate::errors::QueueError;
use crate::schema::{Job, JobHistory};
use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction};
use std::time::Duration;

/// Worker identity recorded when an operator dead-letters a job by hand.
pub const MANUAL_OPERATOR: &str = "manual_operator";

/// Number of leases recovered per sweep when no positive limit is given.
pub const DEFAULT_RECOVER_LIMIT: i64 = 1000;

/// Inserts a job, or resolves the existing one when its unique key is taken.
///
/// Returns the job id and whether it already existed. The pending history row
/// is only written when a new job was inserted.
pub(crate) async fn insert_job(
    tx: &mut Transaction<'_, Postgres>,
    request: &EnqueueRequest,
) -> Result<(i64, bool), QueueError> {
    // A NULL unique key never conflicts, so this is a plain insert without one
    let inserted = sqlx::query_scalar::<_, i64>(
        r"
        INSERT INTO job_queue (queue_name, priority, unique_key, payload, max_attempts, available_at)
        VALUES ($1, $2, $3, $4, $5, NOW() + $6 * INTERVAL '1 second')
        ON CONFLICT (queue_name, unique_key) DO NOTHING
        RETURNING id
        ",
    )
    .bind(request.queue_name())
    .bind(request.priority)
    .bind(request.unique_key.as_deref())
    .bind(&request.payload)
    .bind(request.max_attempts_or_default())
    .bind(request.delay.as_secs_f64())
    .fetch_optional(&mut **tx)
    .await?;

    if let Some(job_id) = inserted {
        sqlx::query(
            r"
            INSERT INTO job_history (id, queue_name, priority, unique_key, payload, created_at)
            SELECT id, queue_name, priority, unique_key, payload, created_at
            FROM job_queue
            WHERE id = $1
            ",
        )
        .bind(job_id)
        .execute(&mut **tx)
        .await?;

        return Ok((job_id, false));
    }

    let existing = sqlx::query_scalar::<_, i64>(
        "SELECT id FROM job_queue WHERE queue_name = $1 AND unique_key = $2",
    )
    .bind(request.queue_name())
    .bind(request.unique_key.as_deref())
    .fetch_optional(&mut **tx)
    .await?;

    existing
        .map(|job_id| (job_id, true))
        .ok_or_else(|| QueueError::ConflictVanished {
            queue: request.queue_name().to_string(),
            key: request.unique_key.clone().unwrap_or_default(),
        })
}

/// Finds the next unlocked job that is ready to run and leases it to `worker_id`.
///
/// Rows locked by concurrent dequeues are skipped rather than waited on.
pub(crate) async fn lease_next_job(
    pool: &PgPool,
    queues: &[String],
    lease: Duration,
    worker_id: &str,
) -> Result<Option<Job>, QueueError> {
    let mut tx = pool.begin().await?;

    // The one second tolerance absorbs clock and commit skew
    let candidate = sqlx::query_scalar::<_, i64>(
        r"
        SELECT id
        FROM job_queue
        WHERE queue_name = ANY($1)
          AND available_at <= NOW() + INTERVAL '1 second'
          AND lease_until IS NULL
          AND attempts < max_attempts
        ORDER BY priority DESC, available_at ASC, id ASC
        LIMIT 1
        FOR UPDATE SKIP LOCKED
        ",
    )
    .bind(queues)
    .fetch_optional(&mut *tx)
    .await?;

    let Some(job_id) = candidate else {
        tx.rollback().await?;
        return Ok(None);
    };

    let job = sqlx::query_as::<_, Job>(
        r"
        UPDATE job_queue
        SET lease_until = NOW() + $2 * INTERVAL '1 second',
            locked_by = $3,
            attempts = attempts + 1,
            updated_at = NOW()
        WHERE id = $1
          AND lease_until IS NULL
          AND attempts < max_attempts
        RETURNING *
        ",
    )
    .bind(job_id)
    .bind(lease.as_secs_f64())
    .bind(worker_id)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or(QueueError::InconsistentLease(job_id))?;

    sqlx::query("UPDATE job_history SET started_at = COALESCE(started_at, NOW()) WHERE id = $1")
        .bind(job_id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(Some(job))
}

/// Locks the pending row of a leased job and returns `(attempts, max_attempts)`.
///
/// Fails with [`QueueError::LeaseLost`] if the row is gone or now belongs to
/// another worker.
async fn lock_leased_job(
    tx: &mut Transaction<'_, Postgres>,
    job: &Job,
) -> Result<(i32, i32), QueueError> {
    sqlx::query_as::<_, (i32, i32)>(
        "SELECT attempts, max_attempts FROM job_queue WHERE id = $1 AND locked_by = $2 FOR UPDATE",
    )
    .bind(job.id)
    .bind(job.locked_by.as_deref())
    .fetch_optional(&mut **tx)
    .await?
    .ok_or_else(|| lease_lost(job))
}

fn lease_lost(job: &Job) -> QueueError {
    QueueError::LeaseLost {
        job_id: job.id,
        worker_id: job.locked_by.clone().unwrap_or_else(|| "<none>".into()),
    }
}

/// Records a successful run in `job_history` and deletes the pending row.
pub(crate) async fn complete_job(
    tx: &mut Transaction<'_, Postgres>,
    job: &Job,
    result: &Value,
) -> Result<(), QueueError> {
    let (attempts, _) = lock_leased_job(tx, job).await?;

    sqlx::query(
        r"
        UPDATE job_history
        SET result = $2,
            status_final = 'completed',
            attempts = $3,
            processed_by = $4,
            started_at = COALESCE(started_at, NOW()),
            finished_at = NOW()
        WHERE id = $1
        ",
    )
    .bind(job.id)
    .bind(result)
    .bind(attempts)
    .bind(job.locked_by.as_deref())
    .execute(&mut **tx)
    .await?;

    sqlx::query("DELETE FROM job_queue WHERE id = $1")
        .bind(job.id)
        .execute(&mut **tx)
        .await?;

    Ok(())
}

/// What a nack did to the job.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NackOutcome {
    /// The lease was released and the job becomes available after `delay`.
    Retrying {
        /// Time until the job may be dequeued again
        delay: Duration,
    },
    /// The job had exhausted its attempts and was moved to the dead letters.
    DeadLettered,
}

/// Releases a failed job for a later retry, or dead-letters it once its
/// attempts are exhausted.
pub(crate) async fn fail_job(
    tx: &mut Transaction<'_, Postgres>,
    job: &Job,
    base_backoff: Duration,
    jitter: f64,
    error: &Value,
) -> Result<NackOutcome, QueueError> {
    let (attempts, max_attempts) = lock_leased_job(tx, job).await?;

    if attempts >= max_attempts {
        dead_letter_job(tx, job.id, attempts, job.locked_by.as_deref(), error).await?;
        return Ok(NackOutcome::DeadLettered);
    }

    let delay = backoff::retry_delay(base_backoff, jitter, attempts);

    let released = sqlx::query(
        r"
        UPDATE job_queue
        SET lease_until = NULL,
            locked_by = NULL,
            available_at = NOW() + $2 * INTERVAL '1 second',
            updated_at = NOW()
        WHERE id = $1 AND locked_by = $3
        ",
    )
    .bind(job.id)
    .bind(delay.as_secs_f64())
    .bind(job.locked_by.as_deref())
    .execute(&mut **tx)
    .await?
    .rows_affected();

    if released == 0 {
        return Err(lease_lost(job));
    }

    sqlx::query(
        r"
        UPDATE job_history
        SET result = $2,
            attempts = $3,
            processed_by = $4,
            started_at = COALESCE(started_at, NOW())
        WHERE id = $1
        ",
    )
    .bind(job.id)
    .bind(error)
    .bind(attempts)
    .bind(job.locked_by.as_deref())
    .execute(&mut **tx)
    .await?;

    Ok(NackOutcome::Retrying { delay })
}

/// Marks a job as dead-lettered in `job_history` and deletes the pending row.
///
/// Jobs enqueued before history tracking get their history row created here.
async fn dead_letter_job(
    tx: &mut Transaction<'_, Postgres>,
    job_id: i64,
    attempts: i32,
    processed_by: Option<&str>,
    reason: &Value,
) -> Result<(), QueueError> {
    let updated = sqlx::query(
        r"
        UPDATE job_history
        SET result = $2,
            status_final = 'dead_letter',
            attempts = $3,
            processed_by = $4,
            started_at = COALESCE(started_at, NOW()),
            finished_at = NOW()
        WHERE id = $1
        ",
    )
    .bind(job_id)
    .bind(reason)
    .bind(attempts)
    .bind(processed_by)
    .execute(&mut **tx)
    .await?
    .rows_affected();

    if updated == 0 {
        sqlx::query(
            r"
            INSERT INTO job_history (id, queue_name, priority, unique_key, payload, result,
                                     status_final, attempts, processed_by, created_at, finished_at)
            SELECT id, queue_name, priority, unique_key, payload, $2,
                   'dead_letter', $3, $4, created_at, NOW()
            FROM job_queue
            WHERE id = $1
            ",
        )
        .bind(job_id)
        .bind(reason)
        .bind(attempts)
        .bind(processed_by)
        .execute(&mut **tx)
        .await?;
    }

    sqlx::query("DELETE FROM job_queue WHERE id = $1")
        .bind(job_id)
        .execute(&mut **tx)
        .await?;

    Ok(())
}

/// Dead-letters a pending job regardless of who holds its lease.
pub(crate) async fn dead_letter_by_id(
    pool: &PgPool,
    job_id: i64,
    reason: &Value,
) -> Result<(), QueueError> {
    let mut tx = pool.begin().await?;

    let attempts =
        sqlx::query_scalar::<_, i32>("SELECT attempts FROM job_queue WHERE id = $1 FOR UPDATE")
            .bind(job_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(QueueError::JobNotFound(job_id))?;

    dead_letter_job(&mut tx, job_id, attempts, Some(MANUAL_OPERATOR), reason).await?;

    tx.commit().await?;
    Ok(())
}

/// Extends the lease of a job held by `worker_id`.
///
/// Returns `false` if the lease had already expired or belongs to someone else.
pub(crate) async fn extend_lease(
    pool: &PgPool,
    job_id: i64,
    worker_id: &str,
    extend: Duration,
) -> Result<bool, QueueError> {
    let extended = sqlx::query(
        r"
        UPDATE job_queue
        SET lease_until = NOW() + $3 * INTERVAL '1 second',
            updated_at = NOW()
        WHERE id = $1 AND locked_by = $2 AND lease_until > NOW()
        ",
    )
    .bind(job_id)
    .bind(worker_id)
    .bind(extend.as_secs_f64())
    .execute(pool)
    .await?
    .rows_affected();

    Ok(extended > 0)
}

/// Clears up to `limit` expired leases so the jobs can be dequeued again.
///
/// Attempts are left untouched: a stalled worker's attempt still counts.
pub(crate) async fn release_expired_leases(pool: &PgPool, limit: i64) -> Result<u64, QueueError> {
    let limit = if limit <= 0 {
        DEFAULT_RECOVER_LIMIT
    } else {
        limit
    };

    let released = sqlx::query(
        r"
        UPDATE job_queue
        SET lease_until = NULL, locked_by = NULL, updated_at = NOW()
        WHERE id IN (
            SELECT id
            FROM job_queue
            WHERE lease_until IS NOT NULL AND lease_until <= NOW()
            ORDER BY lease_until
            LIMIT $1
            FOR UPDATE SKIP LOCKED
        )
        ",
    )
    .bind(limit)
    .execute(pool)
    .await?
    .rows_affected();

    Ok(released)
}

/// Get a pending job by id
pub async fn get_job(pool: &PgPool, job_id: i64) -> Result<Option<Job>, sqlx::Error> {
    sqlx::query_as::<_, Job>("SELECT * FROM job_queue WHERE id = $1")
        .bind(job_id)
        .fetch_optional(pool)
        .await
}

/// Get the history record of a job
pub async fn get_history(pool: &PgPool, job_id: i64) -> Result<Option<JobHistory>, sqlx::Error> {
    sqlx::query_as::<_, JobHistory>("SELECT * FROM job_history WHERE id = $1")
        .bind(job_id)
        .fetch_optional(pool)
        .await
}

/// The number of jobs still in `job_queue`, optionally for a single queue
pub async fn pending_job_count(pool: &PgPool, queue: Option<&str>) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM job_queue WHERE ($1::text IS NULL OR queue_name = $1)",
    )
    .bind(queue)
    .fetch_one(pool)
    .await
}

/// The number of dead-lettered jobs, optionally for a single queue
pub async fn dead_letter_count(pool: &PgPool, queue: Option<&str>) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>(
        r"
        SELECT COUNT(*)
        FROM job_history
        WHERE status_final = 'dead_letter'
          AND ($1::text IS NULL OR queue_name = $1)
        ",
    )
    .bind(queue)
    .fetch_one(pool)
    .await
}

/// Get dead-lettered jobs, most recently finished first
pub async fn get_dead_letters(
    pool: &PgPool,
    queue: Option<&str>,
    limit: Option<i64>,
) -> Result<Vec<JobHistory>, sqlx::Error> {
    let mut query = "SELECT * FROM job_history WHERE status_final = 'dead_letter'".to_string();

    if queue.is_some() {
        query.push_str(" AND queue_name = $1");
    }

    query.push_str(" ORDER BY finished_at DESC, id DESC");

    if limit.is_some() {
        if queue.is_some() {
            query.push_str(" LIMIT $2");
        } else {
            query.push_str(" LIMIT $1");
        }
    }

    let mut query_builder = sqlx::query_as::<_, JobHistory>(&query);

    if let Some(queue) = queue {
        query_builder = query_builder.bind(queue);
    }

    if let Some(limit) = limit {
        query_builder = query_builder.bind(limit);
    }

    query_builder.fetch_all(pool).await
}
