use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{ModelError, Result};

/// Risk classification of a scanning tool. Ordered from least to most risky.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum RiskLevel {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskLevel {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(RiskLevel::Low),
            "medium" => Ok(RiskLevel::Medium),
            "high" => Ok(RiskLevel::High),
            "critical" => Ok(RiskLevel::Critical),
            other => Err(ModelError::UnknownVariant {
                kind: "risk level",
                value: other.to_string(),
            }),
        }
    }
}

/// Failure taxonomy bucket of a policy denial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ViolationKind {
    Network,
    Tool,
    Rate,
    Concurrency,
}

/// Why the policy engine admitted or denied an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum DecisionReason {
    Allowed,
    NetworkDenied,
    NotInAllowlist,
    TargetOutOfScope,
    ApprovalRequired,
    ToolDenied,
    RateLimited,
    ConcurrencyExhausted,
}

impl DecisionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionReason::Allowed => "allowed",
            DecisionReason::NetworkDenied => "network_denied",
            DecisionReason::NotInAllowlist => "not_in_allowlist",
            DecisionReason::TargetOutOfScope => "target_out_of_scope",
            DecisionReason::ApprovalRequired => "approval_required",
            DecisionReason::ToolDenied => "tool_denied",
            DecisionReason::RateLimited => "rate_limited",
            DecisionReason::ConcurrencyExhausted => "concurrency_exhausted",
        }
    }

    /// Taxonomy bucket, `None` for [`DecisionReason::Allowed`].
    pub fn category(&self) -> Option<ViolationKind> {
        match self {
            DecisionReason::Allowed => None,
            DecisionReason::NetworkDenied
            | DecisionReason::NotInAllowlist
            | DecisionReason::TargetOutOfScope
            | DecisionReason::ApprovalRequired => Some(ViolationKind::Network),
            DecisionReason::ToolDenied => Some(ViolationKind::Tool),
            DecisionReason::RateLimited => Some(ViolationKind::Rate),
            DecisionReason::ConcurrencyExhausted => {
                Some(ViolationKind::Concurrency)
            }
        }
    }

    /// Rate and concurrency denials clear up on their own; the rest need an
    /// operator or configuration change.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.category(),
            Some(ViolationKind::Rate | ViolationKind::Concurrency)
        )
    }
}

impl fmt::Display for DecisionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ephemeral admission decision. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PolicyDecision {
    pub allowed: bool,
    pub reason: DecisionReason,
    pub detail: Option<String>,
    pub retry_after: Option<Duration>,
}

impl PolicyDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: DecisionReason::Allowed,
            detail: None,
            retry_after: None,
        }
    }

    pub fn deny(reason: DecisionReason, detail: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason,
            detail: Some(detail.into()),
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    pub fn failure_reason(&self) -> Option<FailureReason> {
        FailureReason::from_decision(self)
    }
}

/// Most specific reason a job or tool run ended without success.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(
    feature = "serde",
    serde(tag = "reason", rename_all = "snake_case")
)]
pub enum FailureReason {
    PolicyDenied {
        decision: DecisionReason,
        detail: Option<String>,
    },
    NonZeroExit {
        code: i32,
    },
    ExecutionError {
        message: String,
    },
    Timeout,
    RetriesExhausted {
        attempts: u16,
        last_error: String,
    },
    QueueUnavailable {
        message: String,
    },
    Cancelled,
    AllToolRunsFailed,
}

impl FailureReason {
    pub fn from_decision(decision: &PolicyDecision) -> Option<Self> {
        if decision.allowed {
            return None;
        }
        Some(FailureReason::PolicyDenied {
            decision: decision.reason,
            detail: decision.detail.clone(),
        })
    }

    /// Stable snake_case code, e.g. `network_denied` or `retries_exhausted`.
    pub fn code(&self) -> &'static str {
        match self {
            FailureReason::PolicyDenied { decision, .. } => decision.as_str(),
            FailureReason::NonZeroExit { .. } => "non_zero_exit",
            FailureReason::ExecutionError { .. } => "execution_error",
            FailureReason::Timeout => "timeout",
            FailureReason::RetriesExhausted { .. } => "retries_exhausted",
            FailureReason::QueueUnavailable { .. } => "queue_unavailable",
            FailureReason::Cancelled => "cancelled",
            FailureReason::AllToolRunsFailed => "all_tool_runs_failed",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::PolicyDenied {
                decision,
                detail: Some(detail),
            } => write!(f, "{decision}: {detail}"),
            FailureReason::PolicyDenied { decision, .. } => {
                write!(f, "{decision}")
            }
            FailureReason::NonZeroExit { code } => {
                write!(f, "tool exited with code {code}")
            }
            FailureReason::ExecutionError { message } => {
                write!(f, "execution error: {message}")
            }
            FailureReason::RetriesExhausted {
                attempts,
                last_error,
            } => write!(
                f,
                "retries exhausted after {attempts} attempts: {last_error}"
            ),
            FailureReason::QueueUnavailable { message } => {
                write!(f, "queue unavailable: {message}")
            }
            other => f.write_str(other.code()),
        }
    }
}
