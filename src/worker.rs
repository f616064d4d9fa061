use crate::inflight::InflightTable;
use crate::schema::Job;
use crate::stats::WorkerStats;
use crate::util::{try_to_extract_panic_info, with_sentry_transaction};
use futures_util::FutureExt;
use sentry_core::{Hub, SentryFutureExt};
use serde_json::Value;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info_span, trace};

/// Execution context handed to a [`JobHandler`] together with the job.
#[derive(Debug, Clone)]
pub struct JobContext {
    token: CancellationToken,
    worker_id: Arc<str>,
    base_backoff: Duration,
    jitter: f64,
}

impl JobContext {
    pub(crate) fn new(
        token: CancellationToken,
        worker_id: Arc<str>,
        base_backoff: Duration,
        jitter: f64,
    ) -> Self {
        Self {
            token,
            worker_id,
            base_backoff,
            jitter,
        }
    }

    /// Whether the job should stop as soon as it safely can.
    ///
    /// Cancellation comes from a worker shutdown or from a lost lease. It does
    /// not mean the job has been resolved.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Completes once the job has been cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    /// The underlying cancellation token.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Identity of the worker holding the lease.
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Base backoff to pass to [`Client::nack`](crate::Client::nack).
    pub fn base_backoff(&self) -> Duration {
        self.base_backoff
    }

    /// Jitter factor to pass to [`Client::nack`](crate::Client::nack).
    pub fn jitter(&self) -> f64 {
        self.jitter
    }
}

/// The caller-supplied body run for every leased job.
///
/// A handler is expected to open its own transaction and resolve the job
/// with [`Client::ack`](crate::Client::ack) or
/// [`Client::nack`](crate::Client::nack) before returning. A handler that
/// returns without doing so leaves the job to lease expiry; the worker only
/// logs a warning and does not retry on its behalf. Panics are caught and
/// reported as errors.
pub trait JobHandler: Send + Sync + 'static {
    /// Run the job.
    fn handle(&self, ctx: JobContext, job: Job)
    -> impl Future<Output = anyhow::Result<Value>> + Send;
}

impl<F, Fut> JobHandler for F
where
    F: Fn(JobContext, Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    fn handle(
        &self,
        ctx: JobContext,
        job: Job,
    ) -> impl Future<Output = anyhow::Result<Value>> + Send {
        self(ctx, job)
    }
}

/// A leased job travelling from the dispatcher to the pool.
pub(crate) struct WorkItem {
    pub(crate) job: Job,
    pub(crate) token: CancellationToken,
}

/// Outcome of a job whose handler did not resolve it.
pub(crate) struct ExecDone {
    pub(crate) job_id: i64,
    pub(crate) outcome: anyhow::Result<Value>,
}

/// One member of the fixed execution pool.
pub(crate) struct Executor<H> {
    pub(crate) worker_id: Arc<str>,
    pub(crate) handler: Arc<H>,
    pub(crate) work_rx: Arc<Mutex<mpsc::Receiver<WorkItem>>>,
    pub(crate) results_tx: mpsc::Sender<ExecDone>,
    pub(crate) inflight: Arc<InflightTable>,
    pub(crate) stats: Arc<WorkerStats>,
    pub(crate) shutdown: CancellationToken,
    pub(crate) base_backoff: Duration,
    pub(crate) jitter: f64,
}

impl<H: JobHandler> Executor<H> {
    /// Run jobs until the worker shuts down.
    pub(crate) async fn run(self) {
        loop {
            let item = tokio::select! {
                biased;
                () = self.shutdown.cancelled() => break,
                item = self.next_item() => item,
            };

            let Some(item) = item else {
                break;
            };

            let Some(done) = self.execute(item).await else {
                continue;
            };

            tokio::select! {
                biased;
                // Once shutting down the lease is left to expire
                () = self.shutdown.cancelled() => break,
                _ = self.results_tx.send(done) => {}
            }
        }

        trace!("Executor stopped");
    }

    async fn next_item(&self) -> Option<WorkItem> {
        self.work_rx.lock().await.recv().await
    }

    /// Run a single job, returning its outcome if the handler left it unresolved.
    async fn execute(&self, item: WorkItem) -> Option<ExecDone> {
        let WorkItem { job, token } = item;
        let job_id = job.id;
        let resolution = job.resolution();

        let span = info_span!("job", job.id = job_id, job.queue = %job.queue_name, job.attempt = job.attempts);
        let transaction_name = format!("queue.{}", job.queue_name);
        let ctx = JobContext::new(token, self.worker_id.clone(), self.base_backoff, self.jitter);

        let handler = self.handler.clone();
        let stats = self.stats.clone();
        let future = with_sentry_transaction(&transaction_name, || async move {
            debug!("Running job…");
            // Building the handler's future may panic too
            let run = async move { handler.handle(ctx, job).await };
            match AssertUnwindSafe(run).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(payload) => {
                    stats.panicked();
                    let error = try_to_extract_panic_info(&*payload);
                    error!(%error, "Job panicked");
                    Err(error)
                }
            }
        });

        let hub = Arc::new(Hub::new_from_top(Hub::current()));
        let outcome = future.instrument(span.clone()).bind_hub(hub).await;

        if resolution.is_resolved() {
            self.stats.resolved();
            self.inflight.cancel_and_remove(job_id);
            debug!(parent: &span, "Job resolved");
            return None;
        }

        Some(ExecDone { job_id, outcome })
    }
}
