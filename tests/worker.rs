#![allow(missing_docs)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::unwrap_used)]

use claims::{assert_none, assert_some};
use insta::assert_compact_json_snapshot;
use lease_queue::{
    Client, EnqueueRequest, Job, JobContext, JobStatus, Worker, WorkerOptions, dead_letter_count,
    get_history, get_job, pending_job_count, setup_database,
};
use serde_json::{Value, json};
use sqlx::PgPool;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use testcontainers::ContainerAsync;
use testcontainers_modules::postgres::Postgres;
use tokio::sync::Barrier;

mod test_utils {
    use super::*;
    use testcontainers::runners::AsyncRunner;

    pub(super) async fn setup_test_db() -> anyhow::Result<(PgPool, ContainerAsync<Postgres>)> {
        let container = Postgres::default().start().await?;

        let host = container.get_host().await?;
        let port = container.get_host_port_ipv4(5432).await?;
        let connection_string = format!("postgresql://postgres:postgres@{host}:{port}/postgres");

        let pool = PgPool::connect(&connection_string).await?;
        setup_database(&pool).await?;

        Ok((pool, container))
    }

    pub(super) fn worker_options(worker_id: &str) -> WorkerOptions {
        WorkerOptions::new(["default"])
            .worker_id(worker_id)
            .concurrency(2)
            .dequeue_every(Duration::from_millis(10))
            .shutdown_timeout(Duration::from_secs(5))
            .backoff(Duration::from_secs(60), 0.0)
    }
}

/// Acks the job in its own transaction, echoing the payload as the result.
async fn ack_job(client: &Client, job: &Job) -> anyhow::Result<Value> {
    let result = json!({ "echo": job.payload });
    let mut tx = client.pool().begin().await?;
    client.ack(&mut tx, job, &result).await?;
    tx.commit().await?;
    Ok(result)
}

#[tokio::test]
async fn worker_runs_and_acks_every_job() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let client = Client::new(pool.clone());

    let mut ids = Vec::new();
    for n in 0..5 {
        let (job_id, _) = client
            .enqueue(&EnqueueRequest::new("default", json!({ "n": n })))
            .await?;
        ids.push(job_id);
    }

    let handler = {
        let client = client.clone();
        move |_ctx: JobContext, job: Job| {
            let client = client.clone();
            async move { ack_job(&client, &job).await }
        }
    };

    let options = test_utils::worker_options("w1").shutdown_when_queue_empty();
    let worker = Worker::new(client.clone(), options, handler)?;
    let handle = worker.start();
    handle.wait_for_shutdown().await;

    assert_eq!(pending_job_count(&pool, None).await?, 0);
    for job_id in ids {
        let history = assert_some!(get_history(&pool, job_id).await?);
        assert_eq!(history.status_final, JobStatus::Completed);
        assert_eq!(history.processed_by.as_deref(), Some("w1"));
        assert_eq!(history.attempts, 1);
    }

    Ok(())
}

#[tokio::test]
async fn handler_effects_commit_atomically_with_the_ack() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let client = Client::new(pool.clone());

    sqlx::query("CREATE TABLE sent_emails (job_id BIGINT PRIMARY KEY, recipient TEXT NOT NULL)")
        .execute(&pool)
        .await?;

    let (job_id, _) = client
        .enqueue(&EnqueueRequest::new("default", json!({"to": "a@example.com"})))
        .await?;

    let handler = {
        let client = client.clone();
        move |_ctx: JobContext, job: Job| {
            let client = client.clone();
            async move {
                let recipient = job.payload["to"].as_str().unwrap_or_default().to_string();
                let mut tx = client.pool().begin().await?;
                sqlx::query("INSERT INTO sent_emails (job_id, recipient) VALUES ($1, $2)")
                    .bind(job.id)
                    .bind(&recipient)
                    .execute(&mut *tx)
                    .await?;
                client.ack(&mut tx, &job, &json!({ "sent": recipient })).await?;
                tx.commit().await?;
                Ok::<_, anyhow::Error>(Value::Null)
            }
        }
    };

    let options = test_utils::worker_options("w1").shutdown_when_queue_empty();
    Worker::new(client.clone(), options, handler)?
        .start()
        .wait_for_shutdown()
        .await;

    let recipient: String = sqlx::query_scalar("SELECT recipient FROM sent_emails WHERE job_id = $1")
        .bind(job_id)
        .fetch_one(&pool)
        .await?;
    assert_eq!(recipient, "a@example.com");

    let history = assert_some!(get_history(&pool, job_id).await?);
    assert_compact_json_snapshot!(history.result, @r#"{"sent": "a@example.com"}"#);

    Ok(())
}

#[tokio::test]
async fn failing_jobs_are_nacked_until_dead_lettered() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let client = Client::new(pool.clone());

    let (job_id, _) = client
        .enqueue(&EnqueueRequest::new("default", json!({})).max_attempts(1))
        .await?;

    let handler = {
        let client = client.clone();
        move |ctx: JobContext, job: Job| {
            let client = client.clone();
            async move {
                let error = json!({ "error": "upstream unavailable" });
                let mut tx = client.pool().begin().await?;
                client
                    .nack(&mut tx, &job, ctx.base_backoff(), ctx.jitter(), &error)
                    .await?;
                tx.commit().await?;
                Err::<Value, _>(anyhow::anyhow!("upstream unavailable"))
            }
        }
    };

    let options = test_utils::worker_options("w1").shutdown_when_queue_empty();
    let handle = Worker::new(client.clone(), options, handler)?.start();
    handle.wait_for_shutdown().await;

    assert_none!(get_job(&pool, job_id).await?);
    assert_eq!(dead_letter_count(&pool, Some("default")).await?, 1);

    Ok(())
}

#[tokio::test]
async fn panicking_handlers_leave_the_lease_to_expire() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let client = Client::new(pool.clone());

    let (poisoned, _) = client
        .enqueue(&EnqueueRequest::new("default", json!({"poison": true})).priority(1))
        .await?;
    let (healthy, _) = client
        .enqueue(&EnqueueRequest::new("default", json!({"poison": false})))
        .await?;

    let handler = {
        let client = client.clone();
        move |_ctx: JobContext, job: Job| {
            let client = client.clone();
            async move {
                if job.payload["poison"] == json!(true) {
                    panic!("poisoned payload");
                }
                ack_job(&client, &job).await
            }
        }
    };

    let options = test_utils::worker_options("w1").concurrency(1);
    let handle = Worker::new(client.clone(), options, handler)?.start();
    let finished = tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            let stats = handle.stats();
            if stats.panicked == 1 && stats.resolved == 1 && stats.unresolved == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(finished.is_ok(), "worker did not process both jobs");
    assert!(handle.stop().await);

    // The panicked job keeps its lease until it expires
    let pending = assert_some!(get_job(&pool, poisoned).await?);
    assert_eq!(pending.locked_by.as_deref(), Some("w1"));
    assert_eq!(pending.attempts, 1);

    let history = assert_some!(get_history(&pool, healthy).await?);
    assert_eq!(history.status_final, JobStatus::Completed);

    Ok(())
}

#[tokio::test]
async fn in_flight_jobs_keep_their_lease_alive() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let client = Client::new(pool.clone());

    let (job_id, _) = client
        .enqueue(&EnqueueRequest::new("default", json!({})))
        .await?;

    let started = Arc::new(Barrier::new(2));
    let release = Arc::new(Barrier::new(2));
    let handler = {
        let client = client.clone();
        let started = started.clone();
        let release = release.clone();
        move |_ctx: JobContext, job: Job| {
            let client = client.clone();
            let started = started.clone();
            let release = release.clone();
            async move {
                started.wait().await;
                release.wait().await;
                ack_job(&client, &job).await
            }
        }
    };

    let options = test_utils::worker_options("w1")
        .lease(Duration::from_secs(1))
        .heartbeat_every(Duration::from_millis(200));
    let handle = Worker::new(client.clone(), options, handler)?.start();

    started.wait().await;
    tokio::time::sleep(Duration::from_secs(2)).await;

    // The lease would have expired twice over without heartbeats
    assert_eq!(client.recover_expired_leases(0).await?, 0);
    let in_flight = handle.in_flight();
    assert_eq!(in_flight.len(), 1);
    assert_eq!(in_flight[0].job_id, job_id);
    assert!(in_flight[0].since_heartbeat < Duration::from_secs(1));

    release.wait().await;
    let acked = tokio::time::timeout(Duration::from_secs(10), async {
        while handle.stats().resolved == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(acked.is_ok());
    assert!(handle.stop().await);

    let history = assert_some!(get_history(&pool, job_id).await?);
    assert_eq!(history.status_final, JobStatus::Completed);

    Ok(())
}

#[tokio::test]
async fn stopped_workers_release_nothing_and_jobs_recover_after_expiry() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let client = Client::new(pool.clone());

    let (job_id, _) = client
        .enqueue(&EnqueueRequest::new("default", json!({})))
        .await?;

    let runs = Arc::new(AtomicUsize::new(0));
    let handler = {
        let runs = runs.clone();
        move |ctx: JobContext, _job: Job| {
            let runs = runs.clone();
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
                ctx.cancelled().await;
                Err::<Value, _>(anyhow::anyhow!("interrupted by shutdown"))
            }
        }
    };

    let options = test_utils::worker_options("w1").lease(Duration::from_secs(1));
    let handle = Worker::new(client.clone(), options, handler)?.start();

    let picked_up = tokio::time::timeout(Duration::from_secs(10), async {
        while handle.in_flight().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(picked_up.is_ok());
    assert!(handle.stop().await);
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    // The stopped worker never released the lease; a sweep does once it expires
    let leased = assert_some!(get_job(&pool, job_id).await?);
    assert_eq!(leased.locked_by.as_deref(), Some("w1"));

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(client.recover_expired_leases(0).await?, 1);

    let released = assert_some!(get_job(&pool, job_id).await?);
    assert_none!(released.locked_by);
    assert_eq!(released.attempts, 1);

    Ok(())
}
