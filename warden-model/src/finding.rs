use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::error::{ModelError, Result};
use crate::ids::{FindingId, JobId, ToolRunId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "info" | "informational" => Ok(Severity::Info),
            "low" => Ok(Severity::Low),
            "medium" | "moderate" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(ModelError::UnknownVariant {
                kind: "severity",
                value: other.to_string(),
            }),
        }
    }
}

/// A finding as produced by an output parser, before it is bound to a run.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FindingDraft {
    pub severity: Severity,
    pub title: String,
    pub evidence: String,
}

/// Normalized, immutable finding of a completed tool run.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Finding {
    pub id: FindingId,
    pub tool_run_id: ToolRunId,
    pub job_id: JobId,
    pub severity: Severity,
    pub title: String,
    pub evidence: String,
    pub created_at: DateTime<Utc>,
}

impl Finding {
    pub fn from_draft(
        job_id: JobId,
        tool_run_id: ToolRunId,
        ordinal: u32,
        draft: FindingDraft,
    ) -> Self {
        Self {
            id: FindingId::derive(tool_run_id, ordinal),
            tool_run_id,
            job_id,
            severity: draft.severity,
            title: draft.title,
            evidence: draft.evidence,
            created_at: Utc::now(),
        }
    }
}
