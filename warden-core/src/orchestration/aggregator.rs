//! Turns terminal tool-run outcomes into a job outcome.

use std::sync::Arc;

use dashmap::DashMap;
use warden_model::{
    FailureReason, JobId, JobStatus, RunCounts, ToolRun, ToolRunId, ToolRunStatus,
};

use super::events::{JobEvent, JobEventPayload, JobEventPublisher};
use super::state::{ActiveJob, CountOutcome, JobRegistry};
use crate::error::Result;
use crate::persistence::{JobStatusUpdate, ScanRepository};
use crate::policy::ConcurrencyTracker;

/// What happened when a terminal tool run was reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// Counted; `remaining` runs are still outstanding.
    Counted { remaining: usize },
    /// The run was the last one and the job settled in this status.
    Finalized(JobStatus),
    /// A redelivered report for a run that was already counted.
    AlreadyCounted,
    /// The job is not active: finalized, cancelled, or never admitted.
    UnknownJob,
}

/// Counts terminal runs per job and finalizes each job exactly once.
pub struct ResultAggregator {
    repository: Arc<dyn ScanRepository>,
    registry: Arc<JobRegistry>,
    tracker: Arc<ConcurrencyTracker>,
    events: Arc<dyn JobEventPublisher>,
    /// Jobs whose last run was reported but whose finalization failed.
    unsettled: DashMap<JobId, ToolRunId>,
}

impl std::fmt::Debug for ResultAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultAggregator")
            .field("active_jobs", &self.registry.len())
            .field("unsettled", &self.unsettled.len())
            .finish_non_exhaustive()
    }
}

impl ResultAggregator {
    /// Builds an aggregator over the shared registry and tracker.
    pub fn new(
        repository: Arc<dyn ScanRepository>,
        registry: Arc<JobRegistry>,
        tracker: Arc<ConcurrencyTracker>,
        events: Arc<dyn JobEventPublisher>,
    ) -> Self {
        Self {
            repository,
            registry,
            tracker,
            events,
            unsettled: DashMap::new(),
        }
    }

    /// Counts `run_id` against its job and finalizes the job on the last run.
    ///
    /// Safe to call again for the same run: a repeat report is a no-op unless
    /// an earlier finalization failed, in which case it is retried.
    pub async fn record_terminal(
        &self,
        job_id: JobId,
        run_id: ToolRunId,
    ) -> Result<RecordOutcome> {
        let Some(job) = self.registry.get(job_id) else {
            return Ok(RecordOutcome::UnknownJob);
        };

        match job.count_terminal(run_id) {
            CountOutcome::AlreadyCounted => Ok(RecordOutcome::AlreadyCounted),
            CountOutcome::Pending { remaining } => {
                tracing::debug!(
                    target: "warden::aggregator",
                    job = %job_id,
                    run = %run_id,
                    remaining,
                    "tool run counted"
                );
                Ok(RecordOutcome::Counted { remaining })
            }
            CountOutcome::Last => match self.finalize(&job).await {
                Ok(status) => {
                    self.unsettled.remove(&job_id);
                    Ok(RecordOutcome::Finalized(status))
                }
                Err(err) => {
                    job.uncount(run_id);
                    self.unsettled.insert(job_id, run_id);
                    tracing::warn!(
                        target: "warden::aggregator",
                        job = %job_id,
                        run = %run_id,
                        %err,
                        "job finalization failed, will retry"
                    );
                    Err(err)
                }
            },
        }
    }

    /// Finalizes jobs whose last report failed to settle. Called from the
    /// housekeeper; returns how many jobs were finalized.
    pub async fn retry_unsettled(&self) -> usize {
        let pending: Vec<(JobId, ToolRunId)> = self
            .unsettled
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect();

        let mut finalized = 0;
        for (job_id, run_id) in pending {
            match self.record_terminal(job_id, run_id).await {
                Ok(RecordOutcome::Finalized(_)) => finalized += 1,
                Ok(RecordOutcome::UnknownJob) => {
                    // Released elsewhere, usually by cancellation.
                    self.unsettled.remove(&job_id);
                }
                _ => {}
            }
        }
        finalized
    }

    async fn finalize(&self, job: &ActiveJob) -> Result<JobStatus> {
        let runs = self.repository.list_tool_runs(job.job_id).await?;
        let counts = count_runs(&runs);

        let update = if counts.succeeded > 0 {
            JobStatusUpdate::new(job.job_id, JobStatus::Completed)
        } else {
            JobStatusUpdate::new(job.job_id, JobStatus::Failed)
                .with_failure(shared_failure(&runs))
        };
        let wanted = update.status;

        let status = match self.repository.update_scan_job_status(update).await {
            Ok(updated) => updated.status,
            Err(err) if err.is_conflict() => {
                // Cancelled while the last run was finishing.
                let current = self.repository.get_scan_job(job.job_id).await?;
                tracing::debug!(
                    target: "warden::aggregator",
                    job = %job.job_id,
                    wanted = wanted.as_str(),
                    current = current.status.as_str(),
                    "job already terminal"
                );
                current.status
            }
            Err(err) => return Err(err),
        };
        self.repository.record_job_counts(job.job_id, counts).await?;

        self.release(job);
        tracing::info!(
            target: "warden::aggregator",
            job = %job.job_id,
            status = status.as_str(),
            succeeded = counts.succeeded,
            failed = counts.failed,
            cancelled = counts.cancelled,
            "job finished"
        );
        self.publish(job.job_id, JobEventPayload::JobFinished { status, counts })
            .await;
        Ok(status)
    }

    /// Drops the job from the registry and gives back its capacity.
    pub fn release(&self, job: &ActiveJob) {
        self.registry.remove(job.job_id);
        self.unsettled.remove(&job.job_id);
        if let Some(slot) = job.take_job_slot() {
            if let Err(err) = slot.release() {
                tracing::error!(target: "warden::aggregator", job = %job.job_id, %err, "job slot release failed");
            }
        }
        self.tracker.mark_job_terminal(job.job_id);
    }

    async fn publish(&self, job_id: JobId, payload: JobEventPayload) {
        if let Err(err) = self.events.publish(JobEvent::new(job_id, payload)).await {
            tracing::warn!(target: "warden::aggregator", job = %job_id, %err, "event publish failed");
        }
    }
}

/// Tallies runs by terminal status.
pub fn count_runs(runs: &[ToolRun]) -> RunCounts {
    let mut counts = RunCounts {
        total: u32::try_from(runs.len()).unwrap_or(u32::MAX),
        ..RunCounts::default()
    };
    for run in runs {
        match run.status {
            ToolRunStatus::Completed => counts.succeeded += 1,
            ToolRunStatus::Cancelled => counts.cancelled += 1,
            ToolRunStatus::Failed | ToolRunStatus::Timeout => counts.failed += 1,
            ToolRunStatus::Pending | ToolRunStatus::Running => {}
        }
    }
    counts
}

/// The reason every unsuccessful run shares, or `AllToolRunsFailed`.
pub fn shared_failure(runs: &[ToolRun]) -> FailureReason {
    let mut reasons = runs.iter().filter(|run| !run.status.is_success()).map(run_failure);
    let Some(first) = reasons.next() else {
        return FailureReason::AllToolRunsFailed;
    };
    if reasons.all(|reason| reason.code() == first.code()) {
        first
    } else {
        FailureReason::AllToolRunsFailed
    }
}

fn run_failure(run: &ToolRun) -> FailureReason {
    if let Some(failure) = &run.failure {
        return failure.clone();
    }
    match run.status {
        ToolRunStatus::Timeout => FailureReason::Timeout,
        ToolRunStatus::Cancelled => FailureReason::Cancelled,
        _ => match run.exit_code {
            Some(code) if code != 0 => FailureReason::NonZeroExit { code },
            _ => FailureReason::ExecutionError {
                message: run.error.clone().unwrap_or_else(|| "unknown error".into()),
            },
        },
    }
}

#[cfg(test)]
mod tests {
    use warden_model::{
        Approvals, AuthorizationScope, DecisionReason, ScanJob, Target, TargetAddress,
    };

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::orchestration::events::InProcJobEventBus;
    use crate::persistence::ToolRunUpdate;
    use crate::persistence::faulty::FaultyRepository;
    use crate::policy::ConcurrencyConfig;

    struct Fixture {
        repository: Arc<FaultyRepository>,
        registry: Arc<JobRegistry>,
        tracker: Arc<ConcurrencyTracker>,
        aggregator: ResultAggregator,
    }

    fn fixture() -> Fixture {
        let repository = Arc::new(FaultyRepository::new());
        let registry = Arc::new(JobRegistry::new());
        let tracker = Arc::new(ConcurrencyTracker::new(ConcurrencyConfig::default()));
        let aggregator = ResultAggregator::new(
            repository.clone(),
            Arc::clone(&registry),
            Arc::clone(&tracker),
            Arc::new(InProcJobEventBus::new(16)),
        );
        Fixture {
            repository,
            registry,
            tracker,
            aggregator,
        }
    }

    async fn running_job(fixture: &Fixture, tools: &[&str]) -> (JobId, Vec<ToolRunId>) {
        let address = TargetAddress::parse("example.com").expect("address");
        let target = Target::new(&address, AuthorizationScope::InScope);
        let job = ScanJob::new(&target, tools.iter().copied(), Approvals::none());
        let job_id = job.id;
        fixture.repository.save_scan_job(job).await.expect("save job");
        fixture
            .repository
            .update_scan_job_status(JobStatusUpdate::new(job_id, JobStatus::Running))
            .await
            .expect("running");

        let slot = fixture.tracker.acquire_job_slot().expect("job slot");
        fixture
            .registry
            .insert(Arc::new(ActiveJob::new(
                job_id,
                tools.len(),
                Some(slot),
                CancellationToken::new(),
            )));

        let mut ids = Vec::new();
        for tool in tools {
            let run = ToolRun::new(job_id, *tool);
            ids.push(run.id);
            fixture.repository.save_tool_run(run).await.expect("save run");
        }
        (job_id, ids)
    }

    async fn finish(
        fixture: &Fixture,
        run: ToolRunId,
        status: ToolRunStatus,
        failure: Option<FailureReason>,
    ) {
        fixture
            .repository
            .update_tool_run_status(ToolRunUpdate::new(run, ToolRunStatus::Running))
            .await
            .expect("running");
        let mut update = ToolRunUpdate::new(run, status);
        if let Some(failure) = failure {
            update = update.with_failure(failure);
        }
        fixture
            .repository
            .update_tool_run_status(update)
            .await
            .expect("terminal");
    }

    #[tokio::test]
    async fn one_success_completes_the_job() {
        let fixture = fixture();
        let (job_id, runs) = running_job(&fixture, &["a", "b", "c"]).await;

        finish(&fixture, runs[0], ToolRunStatus::Completed, None).await;
        finish(&fixture, runs[1], ToolRunStatus::Completed, None).await;
        finish(&fixture, runs[2], ToolRunStatus::Failed, Some(FailureReason::NonZeroExit { code: 2 })).await;

        for (index, run) in runs.iter().enumerate() {
            let outcome = fixture
                .aggregator
                .record_terminal(job_id, *run)
                .await
                .expect("record");
            if index < 2 {
                assert_eq!(outcome, RecordOutcome::Counted { remaining: 2 - index });
            } else {
                assert_eq!(outcome, RecordOutcome::Finalized(JobStatus::Completed));
            }
        }

        let job = fixture.repository.get_scan_job(job_id).await.expect("job");
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.counts.succeeded, 2);
        assert_eq!(job.counts.failed, 1);
        assert_eq!(fixture.tracker.snapshot().global_jobs, 0);
        assert!(fixture.registry.get(job_id).is_none());
    }

    #[tokio::test]
    async fn redelivered_terminal_report_is_not_counted_twice() {
        let fixture = fixture();
        let (job_id, runs) = running_job(&fixture, &["a", "b"]).await;
        finish(&fixture, runs[0], ToolRunStatus::Completed, None).await;

        for _ in 0..3 {
            fixture
                .aggregator
                .record_terminal(job_id, runs[0])
                .await
                .expect("record");
        }
        assert_eq!(
            fixture.registry.get(job_id).expect("active").remaining(),
            1
        );
    }

    #[tokio::test]
    async fn all_failed_job_carries_the_shared_reason() {
        let fixture = fixture();
        let (job_id, runs) = running_job(&fixture, &["a", "b"]).await;
        let denied = FailureReason::PolicyDenied {
            decision: DecisionReason::ToolDenied,
            detail: Some("tool is disabled".into()),
        };
        for run in &runs {
            finish(&fixture, *run, ToolRunStatus::Failed, Some(denied.clone())).await;
            fixture
                .aggregator
                .record_terminal(job_id, *run)
                .await
                .expect("record");
        }

        let job = fixture.repository.get_scan_job(job_id).await.expect("job");
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.failure, Some(denied));
    }

    #[tokio::test]
    async fn failed_finalization_is_retried_until_the_job_settles() {
        let fixture = fixture();
        let (job_id, runs) = running_job(&fixture, &["a"]).await;
        finish(&fixture, runs[0], ToolRunStatus::Completed, None).await;

        fixture.repository.fail_next_run_listings(1);
        assert!(fixture.aggregator.record_terminal(job_id, runs[0]).await.is_err());
        let job = fixture.repository.get_scan_job(job_id).await.expect("job");
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(fixture.tracker.snapshot().global_jobs, 1);

        assert_eq!(fixture.aggregator.retry_unsettled().await, 1);
        let job = fixture.repository.get_scan_job(job_id).await.expect("job");
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.counts.succeeded, 1);
        assert_eq!(fixture.tracker.snapshot().global_jobs, 0);
        assert!(fixture.registry.get(job_id).is_none());
        assert_eq!(fixture.aggregator.retry_unsettled().await, 0);
    }

    #[tokio::test]
    async fn redelivered_report_finalizes_after_a_failed_attempt() {
        let fixture = fixture();
        let (job_id, runs) = running_job(&fixture, &["a", "b"]).await;
        finish(&fixture, runs[0], ToolRunStatus::Completed, None).await;
        finish(&fixture, runs[1], ToolRunStatus::Failed, None).await;
        fixture
            .aggregator
            .record_terminal(job_id, runs[0])
            .await
            .expect("record");

        fixture.repository.fail_next_run_listings(1);
        assert!(fixture.aggregator.record_terminal(job_id, runs[1]).await.is_err());
        assert_eq!(
            fixture
                .aggregator
                .record_terminal(job_id, runs[1])
                .await
                .expect("record again"),
            RecordOutcome::Finalized(JobStatus::Completed)
        );
        assert_eq!(fixture.tracker.snapshot().global_jobs, 0);
    }

    #[test]
    fn differing_reasons_collapse_to_all_tool_runs_failed() {
        let job_id = JobId::new();
        let mut timed_out = ToolRun::new(job_id, "a");
        timed_out.status = ToolRunStatus::Timeout;
        let mut exited = ToolRun::new(job_id, "b");
        exited.status = ToolRunStatus::Failed;
        exited.exit_code = Some(2);

        assert_eq!(shared_failure(&[timed_out.clone()]), FailureReason::Timeout);
        assert_eq!(
            shared_failure(&[exited.clone()]),
            FailureReason::NonZeroExit { code: 2 }
        );
        assert_eq!(
            shared_failure(&[timed_out, exited]),
            FailureReason::AllToolRunsFailed
        );
    }
}
