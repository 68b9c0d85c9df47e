//! Runtime configuration for the orchestrator.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::policy::PolicyConfig;

/// Everything the orchestrator runtime needs.
///
/// All fields carry defaults, so a partial configuration file only has to
/// mention what it changes. None of the numeric defaults is special; they
/// are starting points for a small deployment.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Admission policy: rate limit, concurrency ceilings, network and tool rules.
    pub policy: PolicyConfig,
    /// Worker pool and per-task execution limits.
    pub task: TaskConfig,
    /// Retry/backoff policy for failed tool runs and enqueue attempts.
    pub retry: RetryConfig,
    /// Lease TTL and housekeeping cadence.
    pub lease: LeaseConfig,
    /// Where captured tool output is written.
    pub output: OutputConfig,
}

impl OrchestratorConfig {
    /// Lease TTL, defaulting to the hard timeout plus a 30 second margin so
    /// a live worker never loses its lease mid-run.
    pub fn lease_ttl(&self) -> Duration {
        match self.lease.lease_ttl_ms {
            Some(ms) => Duration::from_millis(ms),
            None => self.task.hard_timeout() + Duration::from_secs(30),
        }
    }
}

/// Worker pool size and per-task limits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    /// Retries after the first attempt; a run executes at most
    /// `max_retries + 1` times.
    pub max_retries: u16,
    /// When a running tool is asked to stop. A tool stopped this way is
    /// recorded as timed out.
    pub soft_timeout_ms: u64,
    /// When the worker abandons a tool that ignored the soft timeout.
    pub hard_timeout_ms: u64,
    /// Delay before a task denied for rate or concurrency is offered again,
    /// when the limiter gives no better hint.
    pub admission_retry_ms: u64,
    /// Number of queue workers.
    pub workers: usize,
    /// Idle poll interval for workers when the queue is empty.
    pub poll_interval_ms: u64,
    /// Enqueue attempts before a tool run is failed as `queue_unavailable`.
    pub enqueue_attempts: u16,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            soft_timeout_ms: 5 * 60 * 1_000,
            hard_timeout_ms: 6 * 60 * 1_000,
            admission_retry_ms: 250,
            workers: 4,
            poll_interval_ms: 100,
            enqueue_attempts: 3,
        }
    }
}

impl TaskConfig {
    /// `max_retries + 1`.
    pub fn max_attempts(&self) -> u16 {
        self.max_retries.saturating_add(1)
    }

    /// [`soft_timeout_ms`](Self::soft_timeout_ms) as a duration.
    pub fn soft_timeout(&self) -> Duration {
        Duration::from_millis(self.soft_timeout_ms)
    }

    /// [`hard_timeout_ms`](Self::hard_timeout_ms) as a duration.
    pub fn hard_timeout(&self) -> Duration {
        Duration::from_millis(self.hard_timeout_ms)
    }

    /// [`admission_retry_ms`](Self::admission_retry_ms) as a duration.
    pub fn admission_retry(&self) -> Duration {
        Duration::from_millis(self.admission_retry_ms)
    }

    /// [`poll_interval_ms`](Self::poll_interval_ms) as a duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Backoff between attempts of a failed tool run or enqueue.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Delay after the first failure; doubles with each further one.
    pub backoff_base_ms: u64,
    /// Upper bound on any delay, jitter included.
    pub backoff_max_ms: u64,
    /// Jitter window as a fraction of the nominal delay.
    pub jitter_ratio: f32,
    /// Minimum jitter in milliseconds so short delays still spread a bit.
    pub jitter_min_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            backoff_base_ms: 2_000,
            backoff_max_ms: 5 * 60 * 1_000,
            jitter_ratio: 0.25,
            jitter_min_ms: 250,
        }
    }
}

/// Lease lifetime and housekeeping.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    /// Explicit lease TTL; derived from the hard timeout when unset.
    pub lease_ttl_ms: Option<u64>,
    /// Cadence of the expired-lease scan and of retried job finalization.
    pub housekeeper_interval_ms: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            lease_ttl_ms: None,
            housekeeper_interval_ms: 15_000,
        }
    }
}

impl LeaseConfig {
    /// [`housekeeper_interval_ms`](Self::housekeeper_interval_ms) as a duration.
    pub fn housekeeper_interval(&self) -> Duration {
        Duration::from_millis(self.housekeeper_interval_ms)
    }
}

/// Where tool output lands.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Directory for `<run-id>.out` files; created on first use.
    pub dir: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: std::env::temp_dir().join("warden-output"),
        }
    }
}
