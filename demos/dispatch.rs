//! End-to-end dispatch example for the lease-queue library.
//!
//! A producer enqueues a batch of email jobs, one of them with an address the
//! fake mail server rejects. A worker acks the deliveries it manages and
//! nacks the rest until they land in the dead letters.
//!
//! This example uses TestContainers to automatically start a PostgreSQL
//! database, so no manual setup is required. Just run:
//!
//! ```bash
//! cargo run --example dispatch
//! ```

use anyhow::Result;
use lease_queue::{
    Client, EnqueueRequest, Job, JobContext, NackOutcome, Worker, WorkerOptions,
    dead_letter_count, get_dead_letters, setup_database,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::PgPool;
use std::time::Duration;
use testcontainers::ContainerAsync;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::postgres::Postgres;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Serialize, Deserialize)]
struct Email {
    to: String,
    subject: String,
}

/// Set up a PostgreSQL database using TestContainers
async fn start_database() -> Result<(PgPool, ContainerAsync<Postgres>)> {
    println!("Starting PostgreSQL container...");
    let container = Postgres::default().start().await?;

    let host = container.get_host().await?;
    let port = container.get_host_port_ipv4(5432).await?;
    let connection_string = format!("postgresql://postgres:postgres@{host}:{port}/postgres");

    println!("Connecting to database at {host}:{port}...");
    let pool = PgPool::connect(&connection_string).await?;

    println!("Running database migrations...");
    setup_database(&pool).await?;

    Ok((pool, container))
}

async fn send_email(client: &Client, ctx: &JobContext, job: &Job) -> Result<serde_json::Value> {
    let email: Email = serde_json::from_value(job.payload.clone())?;

    // Simulate talking to the mail server
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut tx = client.pool().begin().await?;
    if email.to.ends_with("@invalid") {
        let error = json!({ "error": format!("mailbox {} does not exist", email.to) });
        let outcome = client
            .nack(&mut tx, job, ctx.base_backoff(), ctx.jitter(), &error)
            .await?;
        tx.commit().await?;

        if outcome == NackOutcome::DeadLettered {
            println!("Giving up on {} after {} attempts", email.to, job.attempts);
        }
        anyhow::bail!("delivery to {} failed", email.to);
    }

    let result = json!({ "delivered_to": email.to });
    client.ack(&mut tx, job, &result).await?;
    tx.commit().await?;

    println!("Sent \"{}\" to {}", email.subject, email.to);
    Ok(result)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let (pool, _container) = start_database().await?;
    let client = Client::new(pool.clone());

    for to in ["alice@example.com", "bob@example.com", "carol@invalid"] {
        let email = Email {
            to: to.to_string(),
            subject: "Welcome aboard".to_string(),
        };
        let request = EnqueueRequest::json("emails", &email)?
            .unique_key(format!("welcome:{to}"))
            .max_attempts(3);
        let (job_id, existed) = client.enqueue(&request).await?;
        println!("Enqueued job {job_id} for {to} (duplicate: {existed})");
    }

    let options = WorkerOptions::new(["emails"])
        .worker_id("demo-worker")
        .concurrency(4)
        .dequeue_every(Duration::from_millis(50))
        // Keep retries quick so the failing job is dead-lettered in seconds
        .backoff(Duration::from_millis(500), 0.2);

    let handler = {
        let client = client.clone();
        move |ctx: JobContext, job: Job| {
            let client = client.clone();
            async move { send_email(&client, &ctx, &job).await }
        }
    };

    println!("\nStarting worker...\n");
    let handle = Worker::new(client.clone(), options, handler)?.start();

    // Retries wait out their backoff, so poll until the dead letter shows up
    while dead_letter_count(&pool, Some("emails")).await? == 0 {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    let stats = handle.stats();
    handle.stop().await;

    println!("\nWorker stats: {}", serde_json::to_string(&stats)?);
    for dead in get_dead_letters(&pool, Some("emails"), None).await? {
        println!(
            "Dead letter {}: {} (attempts: {})",
            dead.id, dead.result, dead.attempts
        );
    }

    Ok(())
}
