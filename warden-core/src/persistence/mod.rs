//! Repository port for targets, jobs, tool runs and findings.
//!
//! Status updates are guarded: each one is checked against the model's
//! transition table inside the repository, so a writer that lost a race (a
//! tool finishing after its job was cancelled, say) gets a conflict instead
//! of overwriting a terminal state. See [`OrchestratorError::is_conflict`].
//!
//! [`OrchestratorError::is_conflict`]: crate::error::OrchestratorError::is_conflict

#[cfg(test)]
pub(crate) mod faulty;
mod memory;

pub use memory::InMemoryScanRepository;

use async_trait::async_trait;
use warden_model::{
    AuthorizationScope, FailureReason, Finding, JobId, JobStatus, OutputHandle,
    RunCounts, ScanJob, Target, TargetId, ToolRun, ToolRunId, ToolRunStatus,
};

use crate::error::Result;

/// A guarded job status change, with the failure to record alongside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStatusUpdate {
    /// Job to update.
    pub job_id: JobId,
    /// Requested status; must be reachable from the stored one.
    pub status: JobStatus,
    /// Replaces the stored failure when set.
    pub failure: Option<FailureReason>,
}

impl JobStatusUpdate {
    /// An update with no failure attached.
    pub fn new(job_id: JobId, status: JobStatus) -> Self {
        Self {
            job_id,
            status,
            failure: None,
        }
    }

    /// Attaches the failure reason recorded with the status.
    pub fn with_failure(mut self, failure: FailureReason) -> Self {
        self.failure = Some(failure);
        self
    }
}

/// A guarded tool-run status change. `None` fields keep their stored value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolRunUpdate {
    /// Run to update.
    pub run_id: ToolRunId,
    /// Requested status; must be reachable from the stored one.
    pub status: ToolRunStatus,
    /// Exit code of the attempt, if it ran.
    pub exit_code: Option<i32>,
    /// Location of the attempt's raw output.
    pub output: Option<OutputHandle>,
    /// Human-readable error for the attempt.
    pub error: Option<String>,
    /// Machine-readable reason for a failed, timed-out or cancelled run.
    pub failure: Option<FailureReason>,
}

impl ToolRunUpdate {
    /// An update that changes only the status.
    pub fn new(run_id: ToolRunId, status: ToolRunStatus) -> Self {
        Self {
            run_id,
            status,
            exit_code: None,
            output: None,
            error: None,
            failure: None,
        }
    }

    /// Records the exit code.
    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self
    }

    /// Records where the output went.
    pub fn with_output(mut self, output: Option<OutputHandle>) -> Self {
        self.output = output;
        self
    }

    /// Records an error message.
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Records the failure reason.
    pub fn with_failure(mut self, failure: FailureReason) -> Self {
        self.failure = Some(failure);
        self
    }
}

/// Storage for targets, jobs, tool runs and findings.
///
/// Implementations must apply status updates atomically with their transition
/// check, and must refuse to move a run to `running` once its job is terminal.
/// A refused update is reported as a conflict.
#[async_trait]
pub trait ScanRepository: Send + Sync {
    /// Stores a new target, or returns the existing record for the same value.
    async fn save_target(&self, target: Target) -> Result<Target>;

    /// Looks a target up by its normalized value.
    async fn find_target(&self, value: &str) -> Result<Option<Target>>;

    /// Fails with `NotFound` for an unknown id.
    async fn get_target(&self, id: TargetId) -> Result<Target>;

    /// Changes a target's authorization scope.
    async fn update_target_scope(
        &self,
        id: TargetId,
        scope: AuthorizationScope,
    ) -> Result<Target>;

    /// Stores a new job.
    async fn save_scan_job(&self, job: ScanJob) -> Result<()>;

    /// Fails with `NotFound` for an unknown id.
    async fn get_scan_job(&self, id: JobId) -> Result<ScanJob>;

    /// Guarded: fails with a conflict once the job is terminal.
    async fn update_scan_job_status(
        &self,
        update: JobStatusUpdate,
    ) -> Result<ScanJob>;

    /// Counts are derived data and may be written after the job is terminal.
    async fn record_job_counts(&self, id: JobId, counts: RunCounts) -> Result<()>;

    /// Stores a run for an existing job. Saving the same run again replaces it.
    async fn save_tool_run(&self, run: ToolRun) -> Result<()>;

    /// Fails with `NotFound` for an unknown id.
    async fn get_tool_run(&self, id: ToolRunId) -> Result<ToolRun>;

    /// A job's runs in the order they were saved.
    async fn list_tool_runs(&self, job_id: JobId) -> Result<Vec<ToolRun>>;

    /// Guarded by the tool-run transition table; `running` is also refused
    /// while the owning job is terminal.
    async fn update_tool_run_status(&self, update: ToolRunUpdate) -> Result<ToolRun>;

    /// Replaces every finding previously stored for `run_id`.
    async fn save_findings(
        &self,
        run_id: ToolRunId,
        findings: Vec<Finding>,
    ) -> Result<()>;

    /// A job's findings, most severe first.
    async fn list_findings(&self, job_id: JobId) -> Result<Vec<Finding>>;
}
