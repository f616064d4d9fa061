use crate::client::JobSource;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, trace, warn};

/// Periodically releases leases whose holders stopped heartbeating.
///
/// Only runs when the worker is configured with a recovery interval. Several
/// workers may sweep at once; the release query skips rows another sweeper
/// has locked.
pub(crate) struct LeaseSweeper<S> {
    pub(crate) source: Arc<S>,
    pub(crate) every: Duration,
    pub(crate) limit: i64,
    pub(crate) store_timeout: Duration,
    pub(crate) shutdown: CancellationToken,
}

impl<S: JobSource> LeaseSweeper<S> {
    pub(crate) async fn run(self) {
        let mut ticker = time::interval(self.every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = self.shutdown.cancelled() => break,
                _ = ticker.tick() => self.sweep().await,
            }
        }

        trace!("Lease sweeper stopped");
    }

    async fn sweep(&self) {
        let recovered = self.source.recover_expired_leases(self.limit);
        match time::timeout(self.store_timeout, recovered).await {
            Ok(Ok(0)) => trace!("No expired leases found"),
            Ok(Ok(released)) => info!(released, "Released expired leases"),
            Ok(Err(error)) => warn!(%error, "Failed to release expired leases"),
            Err(_) => warn!(timeout = ?self.store_timeout, "Timed out releasing expired leases"),
        }
    }
}
