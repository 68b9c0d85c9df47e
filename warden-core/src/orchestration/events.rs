//! Job lifecycle events and the in-process broadcast bus.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use warden_model::{
    DecisionReason, FailureReason, JobId, JobStatus, RunCounts, ToolRunId,
    ToolRunStatus,
};

use crate::error::Result;

/// Lifecycle notifications for a scan job and its tool runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEventPayload {
    /// Persisted, before admission.
    JobSubmitted {
        target: String,
        tools: Vec<String>,
    },
    /// Passed job-level admission and is running.
    JobAdmitted,
    /// Failed job-level admission; no tool runs were created.
    JobDenied {
        reason: FailureReason,
    },
    /// A task for the run is on the queue.
    ToolRunQueued {
        run_id: ToolRunId,
        tool: String,
    },
    /// The tool started; `attempt` is 1-based.
    ToolRunStarted {
        run_id: ToolRunId,
        tool: String,
        attempt: u16,
    },
    /// Rate or concurrency denial; the task will be offered again.
    ToolRunDeferred {
        run_id: ToolRunId,
        tool: String,
        reason: DecisionReason,
    },
    /// The attempt failed and another follows after `delay_ms`.
    ToolRunRetrying {
        run_id: ToolRunId,
        tool: String,
        attempt: u16,
        delay_ms: u64,
    },
    /// The run reached a terminal status.
    ToolRunFinished {
        run_id: ToolRunId,
        tool: String,
        status: ToolRunStatus,
    },
    /// The job reached a terminal status.
    JobFinished {
        status: JobStatus,
        counts: RunCounts,
    },
}

/// A [`JobEventPayload`] stamped with its job and time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    /// Job the event is about.
    pub job_id: JobId,
    /// When the event was published.
    pub occurred_at: DateTime<Utc>,
    /// What happened.
    pub payload: JobEventPayload,
}

impl JobEvent {
    /// Stamps `payload` with the current time.
    pub fn new(job_id: JobId, payload: JobEventPayload) -> Self {
        Self {
            job_id,
            occurred_at: Utc::now(),
            payload,
        }
    }
}

/// Sink for lifecycle events. Publishing failures are logged by callers and
/// never fail the operation that produced the event.
#[async_trait]
pub trait JobEventPublisher: Send + Sync {
    /// Delivers one event to subscribers.
    async fn publish(&self, event: JobEvent) -> Result<()>;
}

/// In-process fan-out of job events. Slow subscribers lag and lose the
/// oldest events; publishing never blocks the orchestrator.
pub struct InProcJobEventBus {
    sender: broadcast::Sender<JobEvent>,
    capacity: usize,
}

impl fmt::Debug for InProcJobEventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InProcJobEventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl InProcJobEventBus {
    /// A bus that buffers up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender, capacity }
    }

    /// Receives every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }
}

impl Default for InProcJobEventBus {
    fn default() -> Self {
        Self::new(1_024)
    }
}

#[async_trait]
impl JobEventPublisher for InProcJobEventBus {
    async fn publish(&self, event: JobEvent) -> Result<()> {
        // No subscribers is not an error.
        let _ = self.sender.send(event);
        Ok(())
    }
}
