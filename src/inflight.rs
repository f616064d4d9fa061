use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Bookkeeping for a job the worker believes it owns.
#[derive(Debug)]
struct InflightEntry {
    started_at: Instant,
    last_heartbeat: Instant,
    token: CancellationToken,
}

/// A leased job as seen by the worker that runs it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InflightJob {
    /// Identifier of the job
    pub job_id: i64,
    /// Time since the job was handed to the pool
    pub running_for: Duration,
    /// Time since the lease was last renewed
    pub since_heartbeat: Duration,
}

/// Table of in-flight jobs, owned by one worker.
///
/// Critical sections never perform I/O: callers snapshot what they need,
/// release the lock and then talk to the database.
#[derive(Debug, Default)]
pub(crate) struct InflightTable {
    entries: Mutex<HashMap<i64, InflightEntry>>,
}

impl InflightTable {
    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Registers a job unless the table already holds `capacity` entries.
    pub(crate) fn try_register(
        &self,
        job_id: i64,
        token: CancellationToken,
        capacity: usize,
    ) -> bool {
        let mut entries = self.entries.lock();
        if entries.len() >= capacity {
            return false;
        }

        let now = Instant::now();
        entries.insert(
            job_id,
            InflightEntry {
                started_at: now,
                last_heartbeat: now,
                token,
            },
        );
        true
    }

    pub(crate) fn job_ids(&self) -> Vec<i64> {
        self.entries.lock().keys().copied().collect()
    }

    pub(crate) fn snapshot(&self) -> Vec<InflightJob> {
        let now = Instant::now();
        let mut jobs: Vec<_> = self
            .entries
            .lock()
            .iter()
            .map(|(&job_id, entry)| InflightJob {
                job_id,
                running_for: now.duration_since(entry.started_at),
                since_heartbeat: now.duration_since(entry.last_heartbeat),
            })
            .collect();
        jobs.sort_by_key(|job| job.job_id);
        jobs
    }

    pub(crate) fn record_heartbeat(&self, job_id: i64) {
        if let Some(entry) = self.entries.lock().get_mut(&job_id) {
            entry.last_heartbeat = Instant::now();
        }
    }

    /// Removes a job and cancels its token. Returns whether it was present.
    pub(crate) fn cancel_and_remove(&self, job_id: i64) -> bool {
        let entry = self.entries.lock().remove(&job_id);
        match entry {
            Some(entry) => {
                entry.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancels every in-flight job and empties the table.
    pub(crate) fn cancel_all(&self) -> usize {
        let drained: Vec<_> = self.entries.lock().drain().collect();
        for (_, entry) in &drained {
            entry.token.cancel();
        }
        drained.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_respects_capacity() {
        let table = InflightTable::default();
        assert!(table.try_register(1, CancellationToken::new(), 2));
        assert!(table.try_register(2, CancellationToken::new(), 2));
        assert!(!table.try_register(3, CancellationToken::new(), 2));
        assert_eq!(table.len(), 2);

        let mut ids = table.job_ids();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn removing_a_job_cancels_its_token() {
        let table = InflightTable::default();
        let token = CancellationToken::new();
        table.try_register(7, token.clone(), 4);

        assert!(table.cancel_and_remove(7));
        assert!(token.is_cancelled());
        assert!(table.is_empty());
        assert!(!table.cancel_and_remove(7));
    }

    #[test]
    fn cancel_all_drains_the_table() {
        let table = InflightTable::default();
        let tokens: Vec<_> = (0..3).map(|_| CancellationToken::new()).collect();
        for (job_id, token) in tokens.iter().enumerate() {
            table.try_register(job_id as i64, token.clone(), 8);
        }

        assert_eq!(table.cancel_all(), 3);
        assert!(table.is_empty());
        assert!(tokens.iter().all(CancellationToken::is_cancelled));
    }

    #[test]
    fn heartbeats_reset_the_heartbeat_clock() {
        let table = InflightTable::default();
        table.try_register(1, CancellationToken::new(), 1);
        std::thread::sleep(Duration::from_millis(20));
        table.record_heartbeat(1);

        let snapshot = table.snapshot();
        let [job] = snapshot.as_slice() else {
            panic!("expected exactly one in-flight job");
        };
        assert_eq!(job.job_id, 1);
        assert!(job.running_for >= Duration::from_millis(20));
        assert!(job.since_heartbeat < job.running_for);
    }
}
