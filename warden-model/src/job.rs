use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};

use crate::error::{ModelError, Result};
use crate::ids::{JobId, TargetId};
use crate::policy::FailureReason;
use crate::target::Target;

/// Lifecycle of a scan job.
///
/// `pending -> running -> completed | failed`, `pending -> failed` on
/// admission denial, and `pending | running -> cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Explicit operator approvals attached to a submission.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Approvals {
    /// Approval for targets that are out of the default-allow path.
    #[cfg_attr(feature = "serde", serde(default))]
    pub target: bool,
    /// Tool names approved for this job (normalized, lower-case).
    #[cfg_attr(feature = "serde", serde(default))]
    pub tools: BTreeSet<String>,
}

impl Approvals {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn approve_target(mut self) -> Self {
        self.target = true;
        self
    }

    pub fn approve_tool(mut self, tool: impl AsRef<str>) -> Self {
        self.tools.insert(normalize_tool_name(tool.as_ref()));
        self
    }

    pub fn tool_approved(&self, tool: &str) -> bool {
        self.tools.contains(&normalize_tool_name(tool))
    }
}

/// Aggregate tool-run counts stored on the job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RunCounts {
    pub total: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub cancelled: u32,
}

/// A requested scan of one target with an ordered set of tools.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ScanJob {
    pub id: JobId,
    pub target_id: TargetId,
    pub target_value: String,
    pub tools: Vec<String>,
    pub status: JobStatus,
    pub failure: Option<FailureReason>,
    pub counts: RunCounts,
    pub approvals: Approvals,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ScanJob {
    /// Builds a pending job. Tool names are normalized and de-duplicated
    /// while keeping their first-seen order.
    pub fn new<I, S>(target: &Target, tools: I, approvals: Approvals) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut seen = BTreeSet::new();
        let tools = tools
            .into_iter()
            .map(|tool| normalize_tool_name(tool.as_ref()))
            .filter(|tool| seen.insert(tool.clone()))
            .collect();

        Self {
            id: JobId::new(),
            target_id: target.id,
            target_value: target.value.clone(),
            tools,
            status: JobStatus::Pending,
            failure: None,
            counts: RunCounts::default(),
            approvals,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Applies a status transition and its timestamps.
    pub fn transition(&mut self, next: JobStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(ModelError::InvalidTransition {
                entity: "scan job",
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        let now = Utc::now();
        match next {
            JobStatus::Running => self.started_at = Some(now),
            status if status.is_terminal() => self.completed_at = Some(now),
            _ => {}
        }
        self.status = next;
        Ok(())
    }
}

/// Tool names are matched case-insensitively everywhere.
pub fn normalize_tool_name(tool: &str) -> String {
    tool.trim().to_ascii_lowercase()
}
