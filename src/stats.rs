use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters kept by a running worker.
#[derive(Debug, Default)]
pub(crate) struct WorkerStats {
    dispatched: AtomicU64,
    resolved: AtomicU64,
    unresolved: AtomicU64,
    panicked: AtomicU64,
    lease_lost: AtomicU64,
}

impl WorkerStats {
    pub(crate) fn dispatched(&self) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn resolved(&self) {
        self.resolved.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn unresolved(&self) {
        self.unresolved.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn panicked(&self) {
        self.panicked.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn lease_lost(&self) {
        self.lease_lost.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            resolved: self.resolved.load(Ordering::Relaxed),
            unresolved: self.unresolved.load(Ordering::Relaxed),
            panicked: self.panicked.load(Ordering::Relaxed),
            lease_lost: self.lease_lost.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of a worker's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Jobs leased and handed to the pool
    pub dispatched: u64,
    /// Jobs whose handler acked or nacked them
    pub resolved: u64,
    /// Jobs whose handler returned without acking or nacking
    pub unresolved: u64,
    /// Handler invocations that panicked
    pub panicked: u64,
    /// Jobs cancelled because a heartbeat found the lease gone
    pub lease_lost: u64,
}
