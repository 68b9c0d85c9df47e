//! Core data model definitions shared across Warden crates.
//!
//! Everything here is plain data: targets, scan jobs, tool runs, findings and
//! the ephemeral policy decision value. Behaviour that needs shared state
//! (admission, queueing, aggregation) lives in `warden-core`.
#![allow(missing_docs)]

pub mod error;
pub mod finding;
pub mod ids;
pub mod job;
pub mod policy;
pub mod target;
pub mod tool_run;

pub use error::{ModelError, Result as ModelResult};
pub use finding::{Finding, FindingDraft, Severity};
pub use ids::{FindingId, JobId, TargetId, ToolRunId};
pub use job::{
    Approvals, JobStatus, RunCounts, ScanJob, normalize_tool_name,
};
pub use policy::{
    DecisionReason, FailureReason, PolicyDecision, RiskLevel, ViolationKind,
};
pub use target::{AuthorizationScope, Target, TargetAddress, TargetKind};
pub use tool_run::{OutputHandle, ToolRun, ToolRunStatus, ToolRunSummary};
