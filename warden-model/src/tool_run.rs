use std::fmt;

use chrono::{DateTime, Utc};

use crate::error::{ModelError, Result};
use crate::ids::{JobId, ToolRunId};
use crate::policy::FailureReason;

/// Lifecycle of one tool execution within a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ToolRunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl ToolRunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ToolRunStatus::Pending | ToolRunStatus::Running)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ToolRunStatus::Completed)
    }

    /// `running -> pending` is the retry path after a failed attempt.
    pub fn can_transition_to(&self, next: ToolRunStatus) -> bool {
        use ToolRunStatus::*;
        match self {
            Pending => matches!(next, Running | Failed | Cancelled),
            Running => matches!(
                next,
                Pending | Completed | Failed | Timeout | Cancelled
            ),
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ToolRunStatus::Pending => "pending",
            ToolRunStatus::Running => "running",
            ToolRunStatus::Completed => "completed",
            ToolRunStatus::Failed => "failed",
            ToolRunStatus::Timeout => "timeout",
            ToolRunStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ToolRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque reference to captured tool output (a path, object key, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct OutputHandle(pub String);

impl fmt::Display for OutputHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ToolRun {
    pub id: ToolRunId,
    pub job_id: JobId,
    pub tool: String,
    pub status: ToolRunStatus,
    pub exit_code: Option<i32>,
    pub attempts: u16,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub output: Option<OutputHandle>,
    pub error: Option<String>,
    pub failure: Option<FailureReason>,
}

impl ToolRun {
    pub fn new(job_id: JobId, tool: impl Into<String>) -> Self {
        Self {
            id: ToolRunId::new(),
            job_id,
            tool: tool.into(),
            status: ToolRunStatus::Pending,
            exit_code: None,
            attempts: 0,
            started_at: None,
            finished_at: None,
            output: None,
            error: None,
            failure: None,
        }
    }

    pub fn transition(&mut self, next: ToolRunStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(ModelError::InvalidTransition {
                entity: "tool run",
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        let now = Utc::now();
        match next {
            ToolRunStatus::Running => {
                self.started_at = Some(now);
                self.finished_at = None;
                self.attempts = self.attempts.saturating_add(1);
            }
            status if status.is_terminal() => self.finished_at = Some(now),
            _ => {}
        }
        self.status = next;
        Ok(())
    }

    pub fn summary(&self) -> ToolRunSummary {
        ToolRunSummary {
            id: self.id,
            tool: self.tool.clone(),
            status: self.status,
            exit_code: self.exit_code,
            attempts: self.attempts,
            failure: self.failure.clone(),
        }
    }
}

/// Compact view returned by job status queries.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ToolRunSummary {
    pub id: ToolRunId,
    pub tool: String,
    pub status: ToolRunStatus,
    pub exit_code: Option<i32>,
    pub attempts: u16,
    pub failure: Option<FailureReason>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_counts_attempts_and_allows_retry_path() {
        let mut run = ToolRun::new(JobId::new(), "nmap");
        run.transition(ToolRunStatus::Running).unwrap();
        run.transition(ToolRunStatus::Pending).unwrap();
        run.transition(ToolRunStatus::Running).unwrap();
        assert_eq!(run.attempts, 2);
        run.transition(ToolRunStatus::Timeout).unwrap();
        assert!(run.status.is_terminal());
        assert!(!run.status.is_success());
        assert!(run.finished_at.is_some());
    }

    #[test]
    fn terminal_runs_are_frozen() {
        let mut run = ToolRun::new(JobId::new(), "nmap");
        run.transition(ToolRunStatus::Cancelled).unwrap();
        assert!(run.transition(ToolRunStatus::Running).is_err());
        assert!(run.transition(ToolRunStatus::Completed).is_err());
    }
}
