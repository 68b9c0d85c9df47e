//! Bounded concurrency counters.
//!
//! Three ceilings are enforced: running jobs, running tools across all jobs,
//! and running tools per job. Acquisition never blocks; callers get `false`
//! and decide whether to defer. Global counters are compare-and-swap loops on
//! atomics. The per-job map relies on the [`DashMap`] entry lock, and an entry
//! is dropped once its job is terminal and no tool holds a slot.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use warden_model::JobId;

/// Concurrency ceilings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    /// Jobs running at once across the process.
    pub max_global_jobs: usize,
    /// Tool runs executing at once across the process.
    pub max_global_tools: usize,
    /// Tool runs executing at once within one job.
    pub max_tools_per_job: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_global_jobs: 8,
            max_global_tools: 16,
            max_tools_per_job: 4,
        }
    }
}

/// Names a counter in errors and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterKind {
    /// The global job counter.
    GlobalJobs,
    /// The global tool counter.
    GlobalTools,
    /// One job's tool counter.
    JobTools(JobId),
}

impl fmt::Display for CounterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CounterKind::GlobalJobs => f.write_str("global jobs"),
            CounterKind::GlobalTools => f.write_str("global tools"),
            CounterKind::JobTools(job) => write!(f, "tools of job {job}"),
        }
    }
}

/// Counter misuse.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConcurrencyError {
    /// More releases than acquisitions on `counter`.
    #[error("release of {counter} counter would drop below zero")]
    ReleaseUnderflow { counter: CounterKind },
}

#[derive(Debug, Default)]
struct JobCounter {
    in_flight: usize,
    terminal: bool,
}

/// Point-in-time view of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConcurrencySnapshot {
    /// Jobs holding a slot.
    pub global_jobs: usize,
    /// Tool runs holding a slot.
    pub global_tools: usize,
    /// Jobs with a per-job counter entry.
    pub tracked_jobs: usize,
    /// Rejected releases since start.
    pub underflows: u64,
    /// The configured ceilings.
    pub limits: ConcurrencyConfig,
}

/// Lock-free global counters plus per-job counters.
#[derive(Debug)]
pub struct ConcurrencyTracker {
    limits: ConcurrencyConfig,
    global_jobs: AtomicUsize,
    global_tools: AtomicUsize,
    per_job: DashMap<JobId, JobCounter>,
    underflows: AtomicU64,
}

impl ConcurrencyTracker {
    /// A tracker with every counter at zero.
    pub fn new(limits: ConcurrencyConfig) -> Self {
        Self {
            limits,
            global_jobs: AtomicUsize::new(0),
            global_tools: AtomicUsize::new(0),
            per_job: DashMap::new(),
            underflows: AtomicU64::new(0),
        }
    }

    /// The configured ceilings.
    pub fn limits(&self) -> ConcurrencyConfig {
        self.limits
    }

    /// Takes a global job slot if one is free.
    pub fn try_acquire_global_job(&self) -> bool {
        try_increment(&self.global_jobs, self.limits.max_global_jobs)
    }

    /// Returns a global job slot.
    pub fn release_global_job(&self) -> Result<(), ConcurrencyError> {
        if try_decrement(&self.global_jobs) {
            Ok(())
        } else {
            Err(self.underflow(CounterKind::GlobalJobs))
        }
    }

    /// Takes a global tool slot if one is free.
    pub fn try_acquire_global_tool(&self) -> bool {
        try_increment(&self.global_tools, self.limits.max_global_tools)
    }

    /// Returns a global tool slot.
    pub fn release_global_tool(&self) -> Result<(), ConcurrencyError> {
        if try_decrement(&self.global_tools) {
            Ok(())
        } else {
            Err(self.underflow(CounterKind::GlobalTools))
        }
    }

    /// Takes one of the job's tool slots. Always fails once the job has been
    /// marked terminal.
    pub fn try_acquire_job_tool(&self, job: JobId) -> bool {
        let mut counter = self.per_job.entry(job).or_default();
        if counter.terminal || counter.in_flight >= self.limits.max_tools_per_job
        {
            return false;
        }
        counter.in_flight += 1;
        true
    }

    /// Returns one of the job's tool slots.
    pub fn release_job_tool(&self, job: JobId) -> Result<(), ConcurrencyError> {
        let idle_and_terminal = match self.per_job.get_mut(&job) {
            Some(mut counter) if counter.in_flight > 0 => {
                counter.in_flight -= 1;
                counter.in_flight == 0 && counter.terminal
            }
            _ => return Err(self.underflow(CounterKind::JobTools(job))),
        };

        if idle_and_terminal {
            self.per_job
                .remove_if(&job, |_, counter| {
                    counter.in_flight == 0 && counter.terminal
                });
        }
        Ok(())
    }

    /// Marks the job as finished so its per-job entry can be reclaimed once
    /// the last in-flight tool releases.
    pub fn mark_job_terminal(&self, job: JobId) {
        let idle = match self.per_job.get_mut(&job) {
            Some(mut counter) => {
                counter.terminal = true;
                counter.in_flight == 0
            }
            None => return,
        };
        if idle {
            self.per_job.remove_if(&job, |_, counter| counter.in_flight == 0);
        }
    }

    /// Tool slots the job currently holds.
    pub fn job_tools_in_flight(&self, job: JobId) -> usize {
        self.per_job
            .get(&job)
            .map(|counter| counter.in_flight)
            .unwrap_or(0)
    }

    /// Reads every counter.
    pub fn snapshot(&self) -> ConcurrencySnapshot {
        ConcurrencySnapshot {
            global_jobs: self.global_jobs.load(Ordering::Acquire),
            global_tools: self.global_tools.load(Ordering::Acquire),
            tracked_jobs: self.per_job.len(),
            underflows: self.underflows.load(Ordering::Relaxed),
            limits: self.limits,
        }
    }

    /// Reserves a global job slot, released when the returned permit drops.
    pub fn acquire_job_slot(self: &Arc<Self>) -> Option<JobSlot> {
        self.try_acquire_global_job().then(|| JobSlot {
            tracker: Arc::clone(self),
            released: false,
        })
    }

    /// Reserves a global tool slot and one of `job`'s tool slots together.
    /// On failure nothing is held and the exhausted counter is returned.
    pub fn acquire_tool_slots(
        self: &Arc<Self>,
        job: JobId,
    ) -> Result<ToolSlots, CounterKind> {
        if !self.try_acquire_global_tool() {
            return Err(CounterKind::GlobalTools);
        }
        if !self.try_acquire_job_tool(job) {
            let _ = self.release_global_tool();
            return Err(CounterKind::JobTools(job));
        }
        Ok(ToolSlots {
            tracker: Arc::clone(self),
            job,
            released: false,
        })
    }

    fn underflow(&self, counter: CounterKind) -> ConcurrencyError {
        self.underflows.fetch_add(1, Ordering::Relaxed);
        tracing::error!(
            target: "warden::policy",
            %counter,
            "concurrency release without a matching acquire"
        );
        ConcurrencyError::ReleaseUnderflow { counter }
    }
}

fn try_increment(counter: &AtomicUsize, max: usize) -> bool {
    counter
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
            (current < max).then_some(current + 1)
        })
        .is_ok()
}

fn try_decrement(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
            current.checked_sub(1)
        })
        .is_ok()
}

/// A held global job slot.
#[must_use = "dropping the slot releases it immediately"]
pub struct JobSlot {
    tracker: Arc<ConcurrencyTracker>,
    released: bool,
}

impl JobSlot {
    /// Releases the slot, reporting an underflow instead of hiding it.
    pub fn release(mut self) -> Result<(), ConcurrencyError> {
        self.released = true;
        self.tracker.release_global_job()
    }
}

impl fmt::Debug for JobSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobSlot")
            .field("released", &self.released)
            .finish()
    }
}

impl Drop for JobSlot {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            let _ = self.tracker.release_global_job();
        }
    }
}

/// A held global tool slot plus the matching per-job slot.
#[must_use = "dropping the slots releases them immediately"]
pub struct ToolSlots {
    tracker: Arc<ConcurrencyTracker>,
    job: JobId,
    released: bool,
}

impl ToolSlots {
    /// The job these slots belong to.
    pub fn job(&self) -> JobId {
        self.job
    }

    /// Releases both slots, reporting an underflow instead of hiding it.
    pub fn release(mut self) -> Result<(), ConcurrencyError> {
        self.released = true;
        let job = self.tracker.release_job_tool(self.job);
        let global = self.tracker.release_global_tool();
        job.and(global)
    }
}

impl fmt::Debug for ToolSlots {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolSlots")
            .field("job", &self.job)
            .field("released", &self.released)
            .finish()
    }
}

impl Drop for ToolSlots {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            let _ = self.tracker.release_job_tool(self.job);
            let _ = self.tracker.release_global_tool();
        }
    }
}
