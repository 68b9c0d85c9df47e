//! The orchestrator: submission, cancellation, status and shutdown.

use std::any::type_name_of_val;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use warden_model::{
    Approvals, AuthorizationScope, FailureReason, Finding, JobId, JobStatus, ScanJob,
    Target, TargetAddress, ToolRun, ToolRunStatus, ToolRunSummary,
};

use super::aggregator::{ResultAggregator, count_runs};
use super::config::OrchestratorConfig;
use super::events::{InProcJobEventBus, JobEvent, JobEventPayload, JobEventPublisher};
use super::queue::{InMemoryTaskQueue, TaskQueue};
use super::retry::RetryPolicy;
use super::state::{ActiveJob, JobRegistry};
use super::task::{QueueDepth, ToolTask};
use super::worker::{WorkerContext, run_worker};
use crate::error::{OrchestratorError, Result};
use crate::execution::{ProcessToolRunner, ToolRunner};
use crate::persistence::{
    InMemoryScanRepository, JobStatusUpdate, ScanRepository, ToolRunUpdate,
};
use crate::policy::{ConcurrencySnapshot, PolicyEngine, RateLimiter};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// A scan request: one target, one or more tools, and any operator approvals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitRequest {
    /// Hostname, IP address or CIDR to scan.
    pub target: String,
    /// Tool names, in the order their runs are queued.
    pub tools: Vec<String>,
    /// Operator approvals for high-risk tools.
    pub approvals: Approvals,
}

impl SubmitRequest {
    /// A request with no approvals.
    pub fn new<I, S>(target: impl Into<String>, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            target: target.into(),
            tools: tools.into_iter().map(Into::into).collect(),
            approvals: Approvals::none(),
        }
    }

    /// Attaches operator approvals.
    pub fn with_approvals(mut self, approvals: Approvals) -> Self {
        self.approvals = approvals;
        self
    }
}

/// A job and a summary of each of its tool runs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatusView {
    /// The job record.
    pub job: ScanJob,
    /// One entry per tool run, in creation order.
    pub tool_runs: Vec<ToolRunSummary>,
}

/// Assembles an [`Orchestrator`]. Every port defaults to its in-process
/// implementation.
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    repository: Option<Arc<dyn ScanRepository>>,
    queue: Option<Arc<dyn TaskQueue>>,
    rate_limiter: Option<Arc<dyn RateLimiter>>,
    runner: Option<Arc<dyn ToolRunner>>,
    events: Option<Arc<InProcJobEventBus>>,
}

impl fmt::Debug for OrchestratorBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrchestratorBuilder")
            .field("config", &self.config)
            .field("custom_repository", &self.repository.is_some())
            .field("custom_queue", &self.queue.is_some())
            .field("custom_rate_limiter", &self.rate_limiter.is_some())
            .field("custom_runner", &self.runner.is_some())
            .finish()
    }
}

impl OrchestratorBuilder {
    /// A builder with default ports.
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            config,
            repository: None,
            queue: None,
            rate_limiter: None,
            runner: None,
            events: None,
        }
    }

    /// Uses `repository` for persistence.
    pub fn with_repository(mut self, repository: Arc<dyn ScanRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    /// Uses `queue` for tool-run tasks.
    pub fn with_queue(mut self, queue: Arc<dyn TaskQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Uses `rate_limiter` instead of the in-process token buckets.
    pub fn with_rate_limiter(mut self, rate_limiter: Arc<dyn RateLimiter>) -> Self {
        self.rate_limiter = Some(rate_limiter);
        self
    }

    /// Uses `runner` to execute tools.
    pub fn with_runner(mut self, runner: Arc<dyn ToolRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    /// Publishes job events on `events`.
    pub fn with_events(mut self, events: Arc<InProcJobEventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Connects the shared Redis token bucket named by
    /// `policy.rate_limit.redis_url`, if one is configured.
    #[cfg(feature = "redis")]
    pub async fn with_configured_redis(mut self) -> Result<Self> {
        if let Some(url) = self.config.policy.rate_limit.redis_url.clone() {
            let limiter = crate::policy::RedisRateLimiter::connect(
                &url,
                &self.config.policy.rate_limit,
            )
            .await?;
            self.rate_limiter = Some(Arc::new(limiter));
        }
        Ok(self)
    }

    /// Validates the policy configuration and wires the orchestrator. Workers
    /// do not run until [`Orchestrator::start`].
    pub fn build(self) -> Result<Orchestrator> {
        let config = Arc::new(self.config);
        let policy = match self.rate_limiter {
            Some(limiter) => PolicyEngine::with_rate_limiter(&config.policy, limiter)?,
            None => PolicyEngine::new(&config.policy)?,
        };
        let policy = Arc::new(policy);
        let retry = RetryPolicy::new(config.retry, config.task.max_attempts());

        let repository: Arc<dyn ScanRepository> = match self.repository {
            Some(repository) => repository,
            None => Arc::new(InMemoryScanRepository::new()),
        };
        let queue: Arc<dyn TaskQueue> = match self.queue {
            Some(queue) => queue,
            None => Arc::new(InMemoryTaskQueue::new(retry, config.lease_ttl())),
        };
        let runner: Arc<dyn ToolRunner> = match self.runner {
            Some(runner) => runner,
            None => Arc::new(ProcessToolRunner::new(
                &config.policy.tools.commands,
                config.output.dir.clone(),
            )),
        };
        let events = self.events.unwrap_or_default();
        let registry = Arc::new(JobRegistry::new());
        let aggregator = Arc::new(ResultAggregator::new(
            Arc::clone(&repository),
            Arc::clone(&registry),
            Arc::clone(policy.tracker()),
            events.clone(),
        ));

        Ok(Orchestrator {
            config,
            repository,
            queue,
            policy,
            runner,
            events,
            registry,
            aggregator,
            retry,
            shutdown: CancellationToken::new(),
            worker_handles: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }
}

/// Accepts scan jobs, admits them through the policy engine and drives their
/// tool runs through the task queue to a terminal state.
pub struct Orchestrator {
    config: Arc<OrchestratorConfig>,
    repository: Arc<dyn ScanRepository>,
    queue: Arc<dyn TaskQueue>,
    policy: Arc<PolicyEngine>,
    runner: Arc<dyn ToolRunner>,
    events: Arc<InProcJobEventBus>,
    registry: Arc<JobRegistry>,
    aggregator: Arc<ResultAggregator>,
    retry: RetryPolicy,
    shutdown: CancellationToken,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("Orchestrator");
        debug
            .field("workers", &self.config.task.workers)
            .field("repository", &type_name_of_val(self.repository.as_ref()))
            .field("queue", &type_name_of_val(self.queue.as_ref()))
            .field("runner", &type_name_of_val(self.runner.as_ref()))
            .field("events", &self.events)
            .field("active_jobs", &self.registry.len())
            .field("started", &self.started.load(Ordering::Relaxed))
            .field("shutdown", &self.shutdown.is_cancelled());
        match self.worker_handles.try_lock() {
            Ok(handles) => {
                debug.field("worker_handles", &handles.len());
            }
            Err(_) => {
                debug.field("worker_handles", &"<locked>");
            }
        }
        debug.finish()
    }
}

impl Orchestrator {
    /// Starts building an orchestrator.
    pub fn builder(config: OrchestratorConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    /// The effective configuration.
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// The policy engine admissions go through.
    pub fn policy(&self) -> &PolicyEngine {
        &self.policy
    }

    /// The repository backing this orchestrator.
    pub fn repository(&self) -> &Arc<dyn ScanRepository> {
        &self.repository
    }

    /// Spawns the worker pool and the lease housekeeper. Idempotent.
    pub async fn start(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(OrchestratorError::ShuttingDown);
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let ctx = Arc::new(WorkerContext {
            config: Arc::clone(&self.config),
            repository: Arc::clone(&self.repository),
            queue: Arc::clone(&self.queue),
            policy: Arc::clone(&self.policy),
            runner: Arc::clone(&self.runner),
            registry: Arc::clone(&self.registry),
            aggregator: Arc::clone(&self.aggregator),
            events: self.events.clone(),
            retry: self.retry,
            shutdown: self.shutdown.clone(),
        });

        let workers = self.config.task.workers.max(1);
        let mut handles = self.worker_handles.lock().await;
        for index in 0..workers {
            let worker_id = format!("worker-{index}");
            handles.push(tokio::spawn(run_worker(Arc::clone(&ctx), worker_id)));
        }
        handles.push(self.spawn_housekeeper());

        tracing::info!(target: "warden::orchestrator", workers, "orchestrator started");
        Ok(())
    }

    fn spawn_housekeeper(&self) -> JoinHandle<()> {
        let queue = Arc::clone(&self.queue);
        let aggregator = Arc::clone(&self.aggregator);
        let interval = self.config.lease.housekeeper_interval();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::debug!(target: "warden::orchestrator", "housekeeper shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        match queue.reclaim_expired().await {
                            Ok(0) => {}
                            Ok(reclaimed) => tracing::info!(target: "warden::orchestrator", reclaimed, "expired leases reclaimed"),
                            Err(err) => tracing::warn!(target: "warden::orchestrator", %err, "lease scan failed"),
                        }
                        let settled = aggregator.retry_unsettled().await;
                        if settled > 0 {
                            tracing::info!(target: "warden::orchestrator", settled, "stalled jobs finalized");
                        }
                    }
                }
            }
        })
    }

    /// Cancels every active job, stops the workers and waits for in-flight
    /// tasks to settle. Running tools are signalled through their job token.
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!(target: "warden::orchestrator", "initiating graceful shutdown");
        self.cancel_active_jobs().await;
        self.shutdown.cancel();

        let handles = {
            let mut guard = self.worker_handles.lock().await;
            std::mem::take(&mut *guard)
        };
        let joined = tokio::time::timeout(
            SHUTDOWN_TIMEOUT,
            futures::future::join_all(handles),
        )
        .await;
        match joined {
            Ok(results) => {
                for result in results {
                    if let Err(err) = result {
                        tracing::warn!(target: "warden::orchestrator", %err, "worker task failed");
                    }
                }
            }
            Err(_) => {
                tracing::warn!(target: "warden::orchestrator", "workers did not stop within the shutdown timeout");
            }
        }
        // Jobs admitted while the first pass ran.
        self.cancel_active_jobs().await;

        tracing::info!(target: "warden::orchestrator", "orchestrator shutdown complete");
        Ok(())
    }

    async fn cancel_active_jobs(&self) {
        for job_id in self.registry.job_ids() {
            if let Err(err) = self.cancel_job(job_id).await {
                tracing::warn!(target: "warden::orchestrator", job = %job_id, %err, "job not cancelled during shutdown");
            }
        }
    }

    /// Shorthand for [`submit`](Self::submit) without approvals.
    pub async fn submit_job<I, S>(&self, target: &str, tools: I) -> Result<JobId>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.submit(SubmitRequest::new(target, tools)).await
    }

    /// Validates, persists and admits a job. Validation errors create
    /// nothing; a policy denial still returns the id of the failed job.
    pub async fn submit(&self, request: SubmitRequest) -> Result<JobId> {
        if self.shutdown.is_cancelled() {
            return Err(OrchestratorError::ShuttingDown);
        }

        let (address, tools) = self
            .policy
            .validate_submission(&request.target, &request.tools)?;
        let target = self.find_or_create_target(&address).await?;

        let job = ScanJob::new(&target, &tools, request.approvals);
        let job_id = job.id;
        self.repository.save_scan_job(job.clone()).await?;
        self.publish(
            job_id,
            JobEventPayload::JobSubmitted {
                target: target.value.clone(),
                tools: job.tools.clone(),
            },
        )
        .await;

        let admission = self.policy.evaluate_job(&job, &target)?;
        if !admission.is_allowed() {
            let failure = admission
                .decision
                .failure_reason()
                .unwrap_or(FailureReason::AllToolRunsFailed);
            self.repository
                .update_scan_job_status(
                    JobStatusUpdate::new(job_id, JobStatus::Failed).with_failure(failure.clone()),
                )
                .await?;
            tracing::info!(
                target: "warden::orchestrator",
                job = %job_id,
                target_value = %target.value,
                reason = failure.code(),
                "job denied"
            );
            self.publish(job_id, JobEventPayload::JobDenied { reason: failure }).await;
            return Ok(job_id);
        }

        let active = Arc::new(ActiveJob::new(
            job_id,
            job.tools.len(),
            admission.into_job_slot(),
            self.shutdown.child_token(),
        ));
        self.registry.insert(Arc::clone(&active));
        let job = match self
            .repository
            .update_scan_job_status(JobStatusUpdate::new(job_id, JobStatus::Running))
            .await
        {
            Ok(job) => job,
            Err(err) => {
                self.aggregator.release(&active);
                return Err(err);
            }
        };
        self.publish(job_id, JobEventPayload::JobAdmitted).await;

        if let Err(err) = self.start_runs(&job).await {
            self.abandon_admitted(&job, &active, &err).await;
            return Err(err);
        }
        Ok(job_id)
    }

    async fn start_runs(&self, job: &ScanJob) -> Result<()> {
        let runs: Vec<ToolRun> = job
            .tools
            .iter()
            .map(|tool| ToolRun::new(job.id, tool.as_str()))
            .collect();
        for run in &runs {
            self.repository.save_tool_run(run.clone()).await?;
        }
        tracing::info!(
            target: "warden::orchestrator",
            job = %job.id,
            target_value = %job.target_value,
            tools = runs.len(),
            "job admitted"
        );
        for run in runs {
            self.enqueue_run(job, run).await?;
        }
        Ok(())
    }

    /// Fails a job whose runs could not all be saved or queued, so it never
    /// sits in `running` holding its job slot. Best effort: the store may
    /// still be failing.
    async fn abandon_admitted(
        &self,
        job: &ScanJob,
        active: &ActiveJob,
        cause: &OrchestratorError,
    ) {
        let failure = FailureReason::QueueUnavailable {
            message: cause.to_string(),
        };
        tracing::error!(
            target: "warden::orchestrator",
            job = %job.id,
            err = %cause,
            "job admission failed after registration, failing the job"
        );

        active.cancel.cancel();
        if let Err(err) = self.queue.cancel_job(job.id).await {
            tracing::warn!(target: "warden::orchestrator", job = %job.id, %err, "queued tasks not dropped; workers will skip them");
        }
        let update = JobStatusUpdate::new(job.id, JobStatus::Failed).with_failure(failure.clone());
        let failed = match self.repository.update_scan_job_status(update).await {
            Ok(_) => true,
            // Cancelled concurrently; cancellation owns the outcome.
            Err(err) if err.is_conflict() => false,
            Err(err) => {
                tracing::warn!(target: "warden::orchestrator", job = %job.id, %err, "job status not recorded");
                false
            }
        };

        let runs = match self.repository.list_tool_runs(job.id).await {
            Ok(runs) => runs,
            Err(err) => {
                tracing::warn!(target: "warden::orchestrator", job = %job.id, %err, "tool runs not listed");
                Vec::new()
            }
        };
        for run in runs.iter().filter(|run| !run.status.is_terminal()) {
            let update = ToolRunUpdate::new(run.id, ToolRunStatus::Failed)
                .with_failure(failure.clone())
                .with_error(cause.to_string());
            if let Err(err) = self.repository.update_tool_run_status(update).await {
                tracing::debug!(target: "warden::orchestrator", run = %run.id, %err, "run left as is");
            }
        }
        self.aggregator.release(active);
        if !failed {
            return;
        }

        if let Ok(runs) = self.repository.list_tool_runs(job.id).await {
            let counts = count_runs(&runs);
            if let Err(err) = self.repository.record_job_counts(job.id, counts).await {
                tracing::warn!(target: "warden::orchestrator", job = %job.id, %err, "job counts not recorded");
            }
            self.publish(
                job.id,
                JobEventPayload::JobFinished {
                    status: JobStatus::Failed,
                    counts,
                },
            )
            .await;
        }
    }

    async fn find_or_create_target(&self, address: &TargetAddress) -> Result<Target> {
        let value = address.to_string();
        if let Some(target) = self.repository.find_target(&value).await? {
            return Ok(target);
        }
        self.repository
            .save_target(Target::new(address, AuthorizationScope::default()))
            .await
    }

    async fn enqueue_run(&self, job: &ScanJob, run: ToolRun) -> Result<()> {
        let task = ToolTask {
            key: run.id,
            job_id: job.id,
            tool: run.tool.clone(),
            target: job.target_value.clone(),
        };
        let attempts = self.config.task.enqueue_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match self.queue.enqueue(task.clone()).await {
                Ok(_) => {
                    self.publish(
                        job.id,
                        JobEventPayload::ToolRunQueued {
                            run_id: run.id,
                            tool: run.tool.clone(),
                        },
                    )
                    .await;
                    return Ok(());
                }
                Err(err) => {
                    tracing::warn!(
                        target: "warden::orchestrator",
                        job = %job.id,
                        run = %run.id,
                        attempt,
                        %err,
                        "enqueue failed"
                    );
                    last_error = err.to_string();
                    if attempt < attempts {
                        tokio::time::sleep(self.retry.delay_for(run.id, attempt)).await;
                    }
                }
            }
        }

        let update = ToolRunUpdate::new(run.id, ToolRunStatus::Failed)
            .with_failure(FailureReason::QueueUnavailable {
                message: last_error.clone(),
            })
            .with_error(last_error);
        self.repository.update_tool_run_status(update).await?;
        self.publish(
            job.id,
            JobEventPayload::ToolRunFinished {
                run_id: run.id,
                tool: run.tool,
                status: ToolRunStatus::Failed,
            },
        )
        .await;
        self.aggregator.record_terminal(job.id, run.id).await?;
        Ok(())
    }

    /// Cancels a job and its unfinished tool runs. Returns `false` when the
    /// job was already terminal.
    pub async fn cancel_job(&self, job_id: JobId) -> Result<bool> {
        let job = self.repository.get_scan_job(job_id).await?;
        if job.status.is_terminal() {
            return Ok(false);
        }

        // Status first, so a run that observes the token can only find the
        // job already cancelled.
        let update = JobStatusUpdate::new(job_id, JobStatus::Cancelled)
            .with_failure(FailureReason::Cancelled);
        match self.repository.update_scan_job_status(update).await {
            Ok(_) => {}
            Err(err) if err.is_conflict() => return Ok(false),
            Err(err) => return Err(err),
        }

        let active = self.registry.get(job_id);
        if let Some(active) = &active {
            active.cancel.cancel();
        }

        match self.queue.cancel_job(job_id).await {
            Ok(dropped) => {
                tracing::debug!(target: "warden::orchestrator", job = %job_id, dropped, "queued tasks dropped");
            }
            Err(err) => {
                tracing::warn!(target: "warden::orchestrator", job = %job_id, %err, "queued tasks not dropped; workers will skip them");
            }
        }

        for run in self.repository.list_tool_runs(job_id).await? {
            if run.status.is_terminal() {
                continue;
            }
            let update = ToolRunUpdate::new(run.id, ToolRunStatus::Cancelled)
                .with_failure(FailureReason::Cancelled);
            match self.repository.update_tool_run_status(update).await {
                Ok(_) => {}
                Err(err) if err.is_conflict() => {}
                Err(err) => return Err(err),
            }
        }

        if let Some(active) = &active {
            self.aggregator.release(active);
        }
        let counts = count_runs(&self.repository.list_tool_runs(job_id).await?);
        self.repository.record_job_counts(job_id, counts).await?;

        tracing::info!(target: "warden::orchestrator", job = %job_id, "job cancelled");
        self.publish(
            job_id,
            JobEventPayload::JobFinished {
                status: JobStatus::Cancelled,
                counts,
            },
        )
        .await;
        Ok(true)
    }

    /// The job and its tool runs.
    pub async fn job_status(&self, job_id: JobId) -> Result<JobStatusView> {
        let job = self.repository.get_scan_job(job_id).await?;
        let tool_runs = self
            .repository
            .list_tool_runs(job_id)
            .await?
            .iter()
            .map(ToolRun::summary)
            .collect();
        Ok(JobStatusView { job, tool_runs })
    }

    /// Every finding recorded for the job.
    pub async fn findings(&self, job_id: JobId) -> Result<Vec<Finding>> {
        self.repository.get_scan_job(job_id).await?;
        self.repository.list_findings(job_id).await
    }

    /// Operator scope change. Applies to new jobs and to queued tool runs,
    /// which re-check the target on every admission.
    pub async fn set_target_scope(
        &self,
        value: &str,
        scope: AuthorizationScope,
    ) -> Result<Target> {
        let address = TargetAddress::parse(value)?;
        let target = self.find_or_create_target(&address).await?;
        let updated = self.repository.update_target_scope(target.id, scope).await?;
        tracing::info!(
            target: "warden::orchestrator",
            target_value = %updated.value,
            scope = updated.scope.as_str(),
            "target scope updated"
        );
        Ok(updated)
    }

    /// Receives job events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Current concurrency counters.
    pub fn concurrency_snapshot(&self) -> ConcurrencySnapshot {
        self.policy.tracker().snapshot()
    }

    /// Task counts by queue state.
    pub async fn queue_depth(&self) -> Result<QueueDepth> {
        self.queue.depth().await
    }

    async fn publish(&self, job_id: JobId, payload: JobEventPayload) {
        if let Err(err) = self.events.publish(JobEvent::new(job_id, payload)).await {
            tracing::warn!(target: "warden::orchestrator", job = %job_id, %err, "event publish failed");
        }
    }
}
