//! Per-job runtime state shared by workers and the aggregator.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use dashmap::{DashMap, DashSet};
use tokio_util::sync::CancellationToken;
use warden_model::{JobId, ToolRunId};

use crate::policy::JobSlot;

/// Runtime bookkeeping for a job between admission and finalization.
#[derive(Debug)]
pub struct ActiveJob {
    /// The admitted job.
    pub job_id: JobId,
    /// Cancelled when the job is cancelled or the runtime shuts down.
    pub cancel: CancellationToken,
    remaining: AtomicUsize,
    counted: DashSet<ToolRunId>,
    job_slot: Mutex<Option<JobSlot>>,
}

/// Result of counting one terminal tool run against its job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountOutcome {
    /// More runs are outstanding.
    Pending { remaining: usize },
    /// This run was the last one; the caller finalizes the job.
    Last,
    /// The run was counted before.
    AlreadyCounted,
}

impl ActiveJob {
    /// `cancel` is normally a child of the runtime's shutdown token, so a
    /// shutdown stops every running tool.
    pub fn new(
        job_id: JobId,
        runs: usize,
        job_slot: Option<JobSlot>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            job_id,
            cancel,
            remaining: AtomicUsize::new(runs),
            counted: DashSet::new(),
            job_slot: Mutex::new(job_slot),
        }
    }

    /// Runs not yet counted as terminal.
    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    /// Counts `run` once. Exactly one caller observes [`CountOutcome::Last`].
    pub fn count_terminal(&self, run: ToolRunId) -> CountOutcome {
        if !self.counted.insert(run) {
            return CountOutcome::AlreadyCounted;
        }
        let previous = self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_sub(1)
            });
        match previous {
            Ok(1) => CountOutcome::Last,
            Ok(previous) => CountOutcome::Pending {
                remaining: previous - 1,
            },
            // Already at zero: the job was finalized by another path.
            Err(_) => CountOutcome::AlreadyCounted,
        }
    }

    /// Reverses [`count_terminal`](Self::count_terminal) for `run` after a
    /// failed finalization, so the next report of the run finalizes again.
    pub fn uncount(&self, run: ToolRunId) {
        if self.counted.remove(&run).is_some() {
            self.remaining.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Takes the job slot out so it is released exactly once.
    pub fn take_job_slot(&self) -> Option<JobSlot> {
        self.lock_slot().take()
    }

    fn lock_slot(&self) -> MutexGuard<'_, Option<JobSlot>> {
        self.job_slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Jobs currently admitted and not yet finalized.
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: DashMap<JobId, Arc<ActiveJob>>,
}

impl JobRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an admitted job.
    pub fn insert(&self, job: Arc<ActiveJob>) {
        self.jobs.insert(job.job_id, job);
    }

    /// The active job, if it has not been finalized.
    pub fn get(&self, job_id: JobId) -> Option<Arc<ActiveJob>> {
        self.jobs.get(&job_id).map(|entry| Arc::clone(entry.value()))
    }

    /// Drops the job from the registry.
    pub fn remove(&self, job_id: JobId) -> Option<Arc<ActiveJob>> {
        self.jobs.remove(&job_id).map(|(_, job)| job)
    }

    /// Ids of every active job.
    pub fn job_ids(&self) -> Vec<JobId> {
        self.jobs.iter().map(|entry| *entry.key()).collect()
    }

    /// Number of active jobs.
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Whether no job is active.
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
