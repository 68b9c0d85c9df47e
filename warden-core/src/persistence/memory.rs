//! In-memory repository.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use warden_model::{
    AuthorizationScope, Finding, JobId, ModelError, RunCounts, ScanJob, Target,
    TargetId, ToolRun, ToolRunId, ToolRunStatus,
};

use super::{JobStatusUpdate, ScanRepository, ToolRunUpdate};
use crate::error::{OrchestratorError, Result};

#[derive(Debug, Default)]
struct Tables {
    targets: HashMap<TargetId, Target>,
    target_by_value: HashMap<String, TargetId>,
    jobs: HashMap<JobId, ScanJob>,
    runs: HashMap<ToolRunId, ToolRun>,
    runs_by_job: HashMap<JobId, Vec<ToolRunId>>,
    findings: HashMap<ToolRunId, Vec<Finding>>,
}

/// Reference repository keeping everything in process memory.
#[derive(Debug, Default)]
pub struct InMemoryScanRepository {
    tables: RwLock<Tables>,
}

impl InMemoryScanRepository {
    /// An empty repository.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ScanRepository for InMemoryScanRepository {
    async fn save_target(&self, target: Target) -> Result<Target> {
        let mut tables = self.tables.write().await;
        if let Some(existing) = tables
            .target_by_value
            .get(&target.value)
            .and_then(|id| tables.targets.get(id))
        {
            return Ok(existing.clone());
        }
        tables.target_by_value.insert(target.value.clone(), target.id);
        tables.targets.insert(target.id, target.clone());
        Ok(target)
    }

    async fn find_target(&self, value: &str) -> Result<Option<Target>> {
        let tables = self.tables.read().await;
        Ok(tables
            .target_by_value
            .get(value)
            .and_then(|id| tables.targets.get(id))
            .cloned())
    }

    async fn get_target(&self, id: TargetId) -> Result<Target> {
        self.tables
            .read()
            .await
            .targets
            .get(&id)
            .cloned()
            .ok_or_else(|| OrchestratorError::not_found("target", id))
    }

    async fn update_target_scope(
        &self,
        id: TargetId,
        scope: AuthorizationScope,
    ) -> Result<Target> {
        let mut tables = self.tables.write().await;
        let target = tables
            .targets
            .get_mut(&id)
            .ok_or_else(|| OrchestratorError::not_found("target", id))?;
        target.scope = scope;
        Ok(target.clone())
    }

    async fn save_scan_job(&self, job: ScanJob) -> Result<()> {
        self.tables.write().await.jobs.insert(job.id, job);
        Ok(())
    }

    async fn get_scan_job(&self, id: JobId) -> Result<ScanJob> {
        self.tables
            .read()
            .await
            .jobs
            .get(&id)
            .cloned()
            .ok_or_else(|| OrchestratorError::not_found("scan job", id))
    }

    async fn update_scan_job_status(
        &self,
        update: JobStatusUpdate,
    ) -> Result<ScanJob> {
        let mut tables = self.tables.write().await;
        let job = tables
            .jobs
            .get_mut(&update.job_id)
            .ok_or_else(|| OrchestratorError::not_found("scan job", update.job_id))?;
        job.transition(update.status)?;
        if update.failure.is_some() {
            job.failure = update.failure;
        }
        Ok(job.clone())
    }

    async fn record_job_counts(&self, id: JobId, counts: RunCounts) -> Result<()> {
        let mut tables = self.tables.write().await;
        let job = tables
            .jobs
            .get_mut(&id)
            .ok_or_else(|| OrchestratorError::not_found("scan job", id))?;
        job.counts = counts;
        Ok(())
    }

    async fn save_tool_run(&self, run: ToolRun) -> Result<()> {
        let mut tables = self.tables.write().await;
        if !tables.jobs.contains_key(&run.job_id) {
            return Err(OrchestratorError::not_found("scan job", run.job_id));
        }
        let ids = tables.runs_by_job.entry(run.job_id).or_default();
        if !ids.contains(&run.id) {
            ids.push(run.id);
        }
        tables.runs.insert(run.id, run);
        Ok(())
    }

    async fn get_tool_run(&self, id: ToolRunId) -> Result<ToolRun> {
        self.tables
            .read()
            .await
            .runs
            .get(&id)
            .cloned()
            .ok_or_else(|| OrchestratorError::not_found("tool run", id))
    }

    async fn list_tool_runs(&self, job_id: JobId) -> Result<Vec<ToolRun>> {
        let tables = self.tables.read().await;
        Ok(tables
            .runs_by_job
            .get(&job_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| tables.runs.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn update_tool_run_status(&self, update: ToolRunUpdate) -> Result<ToolRun> {
        let mut guard = self.tables.write().await;
        let tables = &mut *guard;
        let run = tables
            .runs
            .get_mut(&update.run_id)
            .ok_or_else(|| OrchestratorError::not_found("tool run", update.run_id))?;
        if update.status == ToolRunStatus::Running {
            // Checked under the same lock that guards job status writes.
            let job = tables.jobs.get(&run.job_id);
            if let Some(job) = job.filter(|job| job.status.is_terminal()) {
                return Err(ModelError::InvalidTransition {
                    entity: "tool run",
                    from: format!("{} (job {})", run.status, job.status),
                    to: update.status.to_string(),
                }
                .into());
            }
        }
        run.transition(update.status)?;

        if update.exit_code.is_some() {
            run.exit_code = update.exit_code;
        }
        if update.output.is_some() {
            run.output = update.output;
        }
        if update.error.is_some() {
            run.error = update.error;
        }
        if update.failure.is_some() {
            run.failure = update.failure;
        } else if update.status == ToolRunStatus::Completed {
            run.failure = None;
            run.error = None;
        }
        Ok(run.clone())
    }

    async fn save_findings(
        &self,
        run_id: ToolRunId,
        findings: Vec<Finding>,
    ) -> Result<()> {
        self.tables.write().await.findings.insert(run_id, findings);
        Ok(())
    }

    async fn list_findings(&self, job_id: JobId) -> Result<Vec<Finding>> {
        let tables = self.tables.read().await;
        let mut findings: Vec<Finding> = tables
            .runs_by_job
            .get(&job_id)
            .into_iter()
            .flatten()
            .filter_map(|run| tables.findings.get(run))
            .flatten()
            .cloned()
            .collect();
        findings.sort_by(|a, b| b.severity.cmp(&a.severity).then(a.id.cmp(&b.id)));
        Ok(findings)
    }
}

#[cfg(test)]
mod tests {
    use warden_model::{
        Approvals, FindingDraft, JobStatus, Severity, TargetAddress,
    };

    use super::*;

    async fn seeded() -> (InMemoryScanRepository, ScanJob) {
        let repo = InMemoryScanRepository::new();
        let address = TargetAddress::parse("example.com").expect("target");
        let target = repo
            .save_target(Target::new(&address, AuthorizationScope::InScope))
            .await
            .expect("save target");
        let job = ScanJob::new(&target, ["nmap"], Approvals::none());
        repo.save_scan_job(job.clone()).await.expect("save job");
        (repo, job)
    }

    #[tokio::test]
    async fn targets_are_unique_by_value() {
        let (repo, job) = seeded().await;
        let address = TargetAddress::parse("example.com").expect("target");
        let again = repo
            .save_target(Target::new(&address, AuthorizationScope::OutOfScope))
            .await
            .expect("save target");
        assert_eq!(again.id, job.target_id);
        assert_eq!(again.scope, AuthorizationScope::InScope);
    }

    #[tokio::test]
    async fn terminal_job_status_is_final() {
        let (repo, job) = seeded().await;
        repo.update_scan_job_status(JobStatusUpdate::new(job.id, JobStatus::Running))
            .await
            .expect("running");
        repo.update_scan_job_status(JobStatusUpdate::new(job.id, JobStatus::Cancelled))
            .await
            .expect("cancelled");
        let err = repo
            .update_scan_job_status(JobStatusUpdate::new(job.id, JobStatus::Completed))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        let stored = repo.get_scan_job(job.id).await.expect("job");
        assert_eq!(stored.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn saving_findings_replaces_previous_set() {
        let (repo, job) = seeded().await;
        let run = ToolRun::new(job.id, "nmap");
        repo.save_tool_run(run.clone()).await.expect("save run");

        let draft = |title: &str| FindingDraft {
            severity: Severity::High,
            title: title.to_string(),
            evidence: String::new(),
        };
        let first = vec![
            Finding::from_draft(job.id, run.id, 0, draft("open port")),
            Finding::from_draft(job.id, run.id, 1, draft("old banner")),
        ];
        repo.save_findings(run.id, first).await.expect("save");
        let second = vec![Finding::from_draft(job.id, run.id, 0, draft("open port"))];
        repo.save_findings(run.id, second).await.expect("save");

        let stored = repo.list_findings(job.id).await.expect("list");
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, warden_model::FindingId::derive(run.id, 0));
    }

    #[tokio::test]
    async fn tool_runs_follow_transition_table() {
        let (repo, job) = seeded().await;
        let run = ToolRun::new(job.id, "nmap");
        repo.save_tool_run(run.clone()).await.expect("save run");

        let err = repo
            .update_tool_run_status(ToolRunUpdate::new(run.id, ToolRunStatus::Completed))
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        repo.update_tool_run_status(ToolRunUpdate::new(run.id, ToolRunStatus::Running))
            .await
            .expect("running");
        let done = repo
            .update_tool_run_status(
                ToolRunUpdate::new(run.id, ToolRunStatus::Completed).with_exit_code(0),
            )
            .await
            .expect("completed");
        assert_eq!(done.exit_code, Some(0));
        assert_eq!(done.attempts, 1);
        assert_eq!(repo.list_tool_runs(job.id).await.expect("list").len(), 1);
    }

    #[tokio::test]
    async fn run_cannot_start_under_a_terminal_job() {
        let (repo, job) = seeded().await;
        let run = ToolRun::new(job.id, "nmap");
        repo.save_tool_run(run.clone()).await.expect("save run");
        repo.update_scan_job_status(JobStatusUpdate::new(job.id, JobStatus::Running))
            .await
            .expect("running");
        repo.update_scan_job_status(JobStatusUpdate::new(job.id, JobStatus::Cancelled))
            .await
            .expect("cancelled");

        let err = repo
            .update_tool_run_status(ToolRunUpdate::new(run.id, ToolRunStatus::Running))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        let stored = repo.get_tool_run(run.id).await.expect("run");
        assert_eq!(stored.status, ToolRunStatus::Pending);
        assert_eq!(stored.attempts, 0);

        // Cancelling the run itself is still allowed.
        let cancelled = repo
            .update_tool_run_status(ToolRunUpdate::new(run.id, ToolRunStatus::Cancelled))
            .await
            .expect("cancel run");
        assert_eq!(cancelled.status, ToolRunStatus::Cancelled);
    }
}
