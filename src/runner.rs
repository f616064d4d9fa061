use crate::client::{DequeueRequest, JobSource};
use crate::errors::WorkerError;
use crate::inflight::{InflightJob, InflightTable};
use crate::stats::{StatsSnapshot, WorkerStats};
use crate::storage::DEFAULT_RECOVER_LIMIT;
use crate::sweeper::LeaseSweeper;
use crate::worker::{ExecDone, Executor, JobHandler, WorkItem};
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, trace, warn};

const DEFAULT_CONCURRENCY: usize = 16;
const DEFAULT_LEASE: Duration = Duration::from_secs(30);
const DEFAULT_DEQUEUE_EVERY: Duration = Duration::from_millis(100);
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(3);
const DEFAULT_BASE_BACKOFF: Duration = Duration::from_secs(2);
const DEFAULT_JITTER: f64 = 0.2;

/// Share of the lease after which a heartbeat renews it, unless configured.
const HEARTBEAT_LEASE_RATIO: f64 = 0.4;
const MIN_TICK: Duration = Duration::from_millis(1);

/// Configuration of a [`Worker`].
///
/// Zero durations and counts fall back to their defaults.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    queues: Vec<String>,
    worker_id: String,
    concurrency: usize,
    lease: Duration,
    heartbeat_every: Option<Duration>,
    dequeue_every: Duration,
    shutdown_timeout: Duration,
    store_timeout: Duration,
    base_backoff: Duration,
    jitter: f64,
    recover_expired_every: Option<Duration>,
    recover_limit: i64,
    shutdown_when_queue_empty: bool,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            queues: Vec::new(),
            worker_id: format!("worker-{}", std::process::id()),
            concurrency: DEFAULT_CONCURRENCY,
            lease: DEFAULT_LEASE,
            heartbeat_every: None,
            dequeue_every: DEFAULT_DEQUEUE_EVERY,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            store_timeout: DEFAULT_STORE_TIMEOUT,
            base_backoff: DEFAULT_BASE_BACKOFF,
            jitter: DEFAULT_JITTER,
            recover_expired_every: None,
            recover_limit: DEFAULT_RECOVER_LIMIT,
            shutdown_when_queue_empty: false,
        }
    }
}

fn or_default(value: Duration, default: Duration) -> Duration {
    if value.is_zero() { default } else { value }
}

impl WorkerOptions {
    /// Options consuming the given queues, with every other setting at its default.
    pub fn new<I, Q>(queues: I) -> Self
    where
        I: IntoIterator<Item = Q>,
        Q: Into<String>,
    {
        Self::default().queues(queues)
    }

    /// Replace the list of queues to consume.
    pub fn queues<I, Q>(mut self, queues: I) -> Self
    where
        I: IntoIterator<Item = Q>,
        Q: Into<String>,
    {
        self.queues = queues.into_iter().map(Into::into).collect();
        self
    }

    /// Set the identity recorded as lease holder.
    pub fn worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    /// Set the maximum number of jobs run at once.
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = if concurrency == 0 {
            DEFAULT_CONCURRENCY
        } else {
            concurrency
        };
        self
    }

    /// Set the lease duration requested on dequeue and on every heartbeat.
    pub fn lease(mut self, lease: Duration) -> Self {
        self.lease = or_default(lease, DEFAULT_LEASE);
        self
    }

    /// Set how often in-flight leases are renewed.
    ///
    /// Defaults to 40% of the lease.
    pub fn heartbeat_every(mut self, every: Duration) -> Self {
        self.heartbeat_every = (!every.is_zero()).then_some(every);
        self
    }

    /// Set how often the dispatcher tries to lease a job.
    pub fn dequeue_every(mut self, every: Duration) -> Self {
        self.dequeue_every = or_default(every, DEFAULT_DEQUEUE_EVERY);
        self
    }

    /// Set how long [`WorkerHandle::stop`] waits for running jobs.
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = or_default(timeout, DEFAULT_SHUTDOWN_TIMEOUT);
        self
    }

    /// Set the timeout applied to each dequeue, heartbeat and lease sweep.
    pub fn store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = or_default(timeout, DEFAULT_STORE_TIMEOUT);
        self
    }

    /// Set the retry policy handed to handlers through their
    /// [`JobContext`](crate::JobContext).
    pub fn backoff(mut self, base: Duration, jitter: f64) -> Self {
        self.base_backoff = or_default(base, DEFAULT_BASE_BACKOFF);
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Release up to `limit` expired leases every `every`.
    ///
    /// Off by default. A zero interval turns it off again and a non-positive
    /// limit uses [`DEFAULT_RECOVER_LIMIT`].
    pub fn recover_expired_leases(mut self, every: Duration, limit: i64) -> Self {
        self.recover_expired_every = (!every.is_zero()).then_some(every);
        self.recover_limit = if limit <= 0 {
            DEFAULT_RECOVER_LIMIT
        } else {
            limit
        };
        self
    }

    /// Stop the worker once a dequeue finds nothing and no job is in flight.
    pub fn shutdown_when_queue_empty(mut self) -> Self {
        self.shutdown_when_queue_empty = true;
        self
    }

    /// The effective heartbeat interval.
    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_every
            .unwrap_or_else(|| self.lease.mul_f64(HEARTBEAT_LEASE_RATIO))
            .max(MIN_TICK)
    }

    /// The configured concurrency.
    pub fn concurrency_limit(&self) -> usize {
        self.concurrency
    }

    /// The configured lease duration.
    pub fn lease_duration(&self) -> Duration {
        self.lease
    }
}

/// Leases jobs from a [`JobSource`] and runs them on a fixed pool.
pub struct Worker<S, H> {
    source: Arc<S>,
    handler: Arc<H>,
    options: WorkerOptions,
}

impl<S, H> std::fmt::Debug for Worker<S, H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl<S: JobSource, H: JobHandler> Worker<S, H> {
    /// Create a worker, validating its options.
    pub fn new(source: S, options: WorkerOptions, handler: H) -> Result<Self, WorkerError> {
        if options.queues.is_empty() {
            return Err(WorkerError::NoQueues);
        }
        if options.worker_id.trim().is_empty() {
            return Err(WorkerError::EmptyWorkerId);
        }

        Ok(Self {
            source: Arc::new(source),
            handler: Arc::new(handler),
            options,
        })
    }

    /// Start the dispatch loop and the execution pool.
    ///
    /// This returns a [`WorkerHandle`] which can be used to stop the worker.
    pub fn start(self) -> WorkerHandle {
        let Self {
            source,
            handler,
            options,
        } = self;

        let shutdown = CancellationToken::new();
        let inflight = Arc::new(InflightTable::default());
        let stats = Arc::new(WorkerStats::default());
        let worker_id: Arc<str> = Arc::from(options.worker_id.as_str());

        let (work_tx, work_rx) = mpsc::channel(options.concurrency);
        let (results_tx, results_rx) = mpsc::channel(options.concurrency);
        let work_rx = Arc::new(Mutex::new(work_rx));

        info!(
            worker.id = %worker_id,
            queues = ?options.queues,
            concurrency = options.concurrency,
            "Starting worker…"
        );

        let mut handles = Vec::with_capacity(options.concurrency + 2);
        for i in 1..=options.concurrency {
            let executor = Executor {
                worker_id: worker_id.clone(),
                handler: handler.clone(),
                work_rx: work_rx.clone(),
                results_tx: results_tx.clone(),
                inflight: inflight.clone(),
                stats: stats.clone(),
                shutdown: shutdown.clone(),
                base_backoff: options.base_backoff,
                jitter: options.jitter,
            };

            let span = info_span!("executor", worker.id = %worker_id, executor = i);
            handles.push(tokio::spawn(executor.run().instrument(span)));
        }
        drop(results_tx);

        if let Some(every) = options.recover_expired_every {
            let sweeper = LeaseSweeper {
                source: source.clone(),
                every,
                limit: options.recover_limit,
                store_timeout: options.store_timeout,
                shutdown: shutdown.clone(),
            };

            let span = info_span!("sweeper", worker.id = %worker_id);
            handles.push(tokio::spawn(sweeper.run().instrument(span)));
        }

        let dispatcher = Dispatcher {
            request: DequeueRequest {
                queues: options.queues.clone(),
                lease: options.lease,
                worker_id: options.worker_id.clone(),
            },
            source,
            inflight: inflight.clone(),
            stats: stats.clone(),
            shutdown: shutdown.clone(),
            work_tx,
            results_rx,
            options: options.clone(),
        };

        let span = info_span!("dispatcher", worker.id = %worker_id);
        handles.push(tokio::spawn(dispatcher.run().instrument(span)));

        WorkerHandle {
            shutdown,
            inflight,
            stats,
            handles,
            shutdown_timeout: options.shutdown_timeout,
        }
    }
}

/// What a single dequeue attempt produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Poll {
    Dispatched,
    Empty,
    Busy,
    Failed,
}

/// Single owner of dequeueing, heartbeating and in-flight bookkeeping.
struct Dispatcher<S> {
    source: Arc<S>,
    request: DequeueRequest,
    options: WorkerOptions,
    inflight: Arc<InflightTable>,
    stats: Arc<WorkerStats>,
    shutdown: CancellationToken,
    work_tx: mpsc::Sender<WorkItem>,
    results_rx: mpsc::Receiver<ExecDone>,
}

impl<S: JobSource> Dispatcher<S> {
    async fn run(mut self) {
        let mut heartbeat = time::interval(self.options.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.reset();

        let mut dequeue = time::interval(self.options.dequeue_every);
        dequeue.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = self.shutdown.cancelled() => break,
                Some(done) = self.results_rx.recv() => self.on_unresolved(done),
                _ = heartbeat.tick() => self.heartbeat_inflight().await,
                _ = dequeue.tick() => {
                    let poll = self.dequeue_and_dispatch().await;
                    if poll == Poll::Empty
                        && self.options.shutdown_when_queue_empty
                        && self.inflight.is_empty()
                    {
                        debug!("No pending jobs found. Shutting down the worker…");
                        self.shutdown.cancel();
                    }
                }
            }
        }

        let cancelled = self.inflight.cancel_all();
        if cancelled > 0 {
            info!(jobs = cancelled, "Cancelled in-flight jobs");
        }
        trace!("Dispatcher stopped");
    }

    async fn dequeue_and_dispatch(&self) -> Poll {
        if self.inflight.len() >= self.options.concurrency {
            return Poll::Busy;
        }

        let dequeued = self.source.dequeue(&self.request);
        let job = match time::timeout(self.options.store_timeout, dequeued).await {
            Ok(Ok(Some(job))) => job,
            Ok(Ok(None)) => {
                trace!("No pending jobs found");
                return Poll::Empty;
            }
            Ok(Err(error)) => {
                warn!(%error, "Failed to dequeue job");
                return Poll::Failed;
            }
            Err(_) => {
                warn!(timeout = ?self.options.store_timeout, "Timed out dequeuing job");
                return Poll::Failed;
            }
        };

        let job_id = job.id;
        let token = self.shutdown.child_token();
        if !self
            .inflight
            .try_register(job_id, token.clone(), self.options.concurrency)
        {
            // The lease is left to expire
            warn!(job.id = job_id, "Worker capacity filled while dequeuing");
            token.cancel();
            return Poll::Busy;
        }

        debug!(job.id = job_id, job.attempts = job.attempts, "Dispatching job…");
        self.stats.dispatched();

        tokio::select! {
            biased;
            () = self.shutdown.cancelled() => {}
            sent = self.work_tx.send(WorkItem { job, token }) => {
                if sent.is_err() {
                    self.inflight.cancel_and_remove(job_id);
                }
            }
        }

        Poll::Dispatched
    }

    async fn heartbeat_inflight(&self) {
        for job_id in self.inflight.job_ids() {
            if self.shutdown.is_cancelled() {
                return;
            }

            let renewed = self
                .source
                .heartbeat(job_id, &self.request.worker_id, self.options.lease);
            match time::timeout(self.options.store_timeout, renewed).await {
                Ok(Ok(true)) => {
                    trace!(job.id = job_id, "Lease extended");
                    self.inflight.record_heartbeat(job_id);
                }
                Ok(Ok(false)) => {
                    if self.inflight.cancel_and_remove(job_id) {
                        warn!(job.id = job_id, "Lease lost; cancelling job");
                        self.stats.lease_lost();
                    }
                }
                Ok(Err(error)) => warn!(job.id = job_id, %error, "Failed to extend lease"),
                Err(_) => warn!(job.id = job_id, "Timed out extending lease"),
            }
        }
    }

    fn on_unresolved(&self, done: ExecDone) {
        // Already released after a lost lease
        if !self.inflight.cancel_and_remove(done.job_id) {
            debug!(job.id = done.job_id, "Job returned after its lease was released");
            return;
        }

        match &done.outcome {
            Ok(_) => warn!(job.id = done.job_id, "Job finished without being acked"),
            Err(error) => {
                warn!(job.id = done.job_id, %error, "Job failed without being nacked");
            }
        }
        self.stats.unresolved();
    }
}

/// Handle to a running [`Worker`]
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: CancellationToken,
    inflight: Arc<InflightTable>,
    stats: Arc<WorkerStats>,
    handles: Vec<JoinHandle<()>>,
    shutdown_timeout: Duration,
}

impl WorkerHandle {
    /// Current counters of the worker.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Jobs the worker currently holds a lease for, ordered by id.
    pub fn in_flight(&self) -> Vec<InflightJob> {
        self.inflight.snapshot()
    }

    /// Whether the worker has begun shutting down.
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Stop dequeueing, cancel in-flight jobs and wait for them to return.
    ///
    /// Jobs still running after the shutdown timeout are aborted and their
    /// leases left to expire. Returns `false` in that case.
    pub async fn stop(self) -> bool {
        info!("Stopping worker…");
        self.shutdown.cancel();
        self.inflight.cancel_all();

        let aborts: Vec<AbortHandle> = self.handles.iter().map(JoinHandle::abort_handle).collect();
        match time::timeout(self.shutdown_timeout, join_all(self.handles)).await {
            Ok(results) => {
                log_task_failures(results);
                true
            }
            Err(_) => {
                warn!(timeout = ?self.shutdown_timeout, "Shutdown timed out; abandoning running jobs");
                aborts.iter().for_each(AbortHandle::abort);
                false
            }
        }
    }

    /// Wait for the worker to shut down on its own.
    pub async fn wait_for_shutdown(self) {
        log_task_failures(join_all(self.handles).await);
    }
}

fn log_task_failures(results: Vec<Result<(), tokio::task::JoinError>>) {
    results.into_iter().for_each(|result| {
        if let Err(error) = result {
            warn!(%error, "Worker task panicked");
        }
    });
}
