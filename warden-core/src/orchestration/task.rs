//! Queue task and lease types.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;
use warden_model::{JobId, ToolRunId};

/// Unit of queued work: run `tool` against `target` for one tool run.
///
/// `key` is the tool run id. It is the idempotency key: a redelivered task
/// whose run is already terminal is acknowledged without running again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolTask {
    /// Id of the tool run this task executes.
    pub key: ToolRunId,
    /// Job the run belongs to.
    pub job_id: JobId,
    /// Normalized tool name.
    pub tool: String,
    /// Normalized target value.
    pub target: String,
}

/// Identifies one delivery of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseId(pub Uuid);

impl LeaseId {
    /// A fresh time-ordered id.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for LeaseId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A dequeued task, owned by one worker until acked, nacked, deferred, or
/// the lease expires.
#[derive(Debug, Clone)]
pub struct TaskLease {
    /// Handle for ack, nack and defer.
    pub lease_id: LeaseId,
    /// The leased task.
    pub task: ToolTask,
    /// Failed attempts recorded before this delivery.
    pub attempts: u16,
    /// Worker holding the lease.
    pub worker: String,
    /// When the lease lapses and the task may be reclaimed.
    pub expires_at: Instant,
}

/// Result of [`TaskQueue::enqueue`](super::TaskQueue::enqueue).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// The task was added.
    Accepted,
    /// The key is already queued or leased.
    Duplicate,
}

/// Result of [`TaskQueue::nack`](super::TaskQueue::nack).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    /// Offered again after `delay`; `attempts` failures recorded so far.
    Requeued { attempts: u16, delay: Duration },
    /// Out of attempts, or the failure was not retryable.
    DeadLettered { attempts: u16 },
}

/// Snapshot of queue occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepth {
    /// Deliverable now.
    pub ready: usize,
    /// Waiting out a backoff or deferral.
    pub delayed: usize,
    /// Held by a worker.
    pub leased: usize,
    /// Given up on.
    pub dead_letter: usize,
}

/// A task the queue gave up on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    /// The task as last enqueued.
    pub task: ToolTask,
    /// Failed attempts recorded.
    pub attempts: u16,
    /// Error from the last failed attempt.
    pub error: Option<String>,
}
