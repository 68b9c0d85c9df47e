//! Repository wrapper that fails chosen calls, for failure-path tests.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use warden_model::{
    AuthorizationScope, Finding, JobId, RunCounts, ScanJob, Target, TargetId, ToolRun,
    ToolRunId,
};

use super::{InMemoryScanRepository, JobStatusUpdate, ScanRepository, ToolRunUpdate};
use crate::error::{OrchestratorError, Result};

#[derive(Debug)]
pub(crate) struct FaultyRepository {
    inner: InMemoryScanRepository,
    list_run_failures: AtomicUsize,
    run_saves_left: AtomicUsize,
}

impl FaultyRepository {
    pub(crate) fn new() -> Self {
        Self {
            inner: InMemoryScanRepository::new(),
            list_run_failures: AtomicUsize::new(0),
            run_saves_left: AtomicUsize::new(usize::MAX),
        }
    }

    /// The next `count` calls to `list_tool_runs` fail.
    pub(crate) fn fail_next_run_listings(&self, count: usize) {
        self.list_run_failures.store(count, Ordering::SeqCst);
    }

    /// `save_tool_run` succeeds `count` more times, then fails.
    pub(crate) fn allow_run_saves(&self, count: usize) {
        self.run_saves_left.store(count, Ordering::SeqCst);
    }

    fn take(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }
}

fn unavailable() -> OrchestratorError {
    OrchestratorError::Persistence("store unavailable".into())
}

#[async_trait]
impl ScanRepository for FaultyRepository {
    async fn save_target(&self, target: Target) -> Result<Target> {
        self.inner.save_target(target).await
    }

    async fn find_target(&self, value: &str) -> Result<Option<Target>> {
        self.inner.find_target(value).await
    }

    async fn get_target(&self, id: TargetId) -> Result<Target> {
        self.inner.get_target(id).await
    }

    async fn update_target_scope(
        &self,
        id: TargetId,
        scope: AuthorizationScope,
    ) -> Result<Target> {
        self.inner.update_target_scope(id, scope).await
    }

    async fn save_scan_job(&self, job: ScanJob) -> Result<()> {
        self.inner.save_scan_job(job).await
    }

    async fn get_scan_job(&self, id: JobId) -> Result<ScanJob> {
        self.inner.get_scan_job(id).await
    }

    async fn update_scan_job_status(&self, update: JobStatusUpdate) -> Result<ScanJob> {
        self.inner.update_scan_job_status(update).await
    }

    async fn record_job_counts(&self, id: JobId, counts: RunCounts) -> Result<()> {
        self.inner.record_job_counts(id, counts).await
    }

    async fn save_tool_run(&self, run: ToolRun) -> Result<()> {
        if !Self::take(&self.run_saves_left) {
            return Err(unavailable());
        }
        self.inner.save_tool_run(run).await
    }

    async fn get_tool_run(&self, id: ToolRunId) -> Result<ToolRun> {
        self.inner.get_tool_run(id).await
    }

    async fn list_tool_runs(&self, job_id: JobId) -> Result<Vec<ToolRun>> {
        if Self::take(&self.list_run_failures) {
            return Err(unavailable());
        }
        self.inner.list_tool_runs(job_id).await
    }

    async fn update_tool_run_status(&self, update: ToolRunUpdate) -> Result<ToolRun> {
        self.inner.update_tool_run_status(update).await
    }

    async fn save_findings(&self, run_id: ToolRunId, findings: Vec<Finding>) -> Result<()> {
        self.inner.save_findings(run_id, findings).await
    }

    async fn list_findings(&self, job_id: JobId) -> Result<Vec<Finding>> {
        self.inner.list_findings(job_id).await
    }
}
