//! Queue workers.
//!
//! A worker leases one task at a time, re-runs tool-level admission, executes
//! the tool and records the outcome. Every step is safe to repeat: a task
//! whose run is already terminal is acknowledged and reported again without
//! running the tool, and the aggregator ignores reports it has seen.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use warden_model::{
    FailureReason, Finding, JobStatus, ToolRun, ToolRunStatus, normalize_tool_name,
};

use super::aggregator::ResultAggregator;
use super::config::OrchestratorConfig;
use super::events::{JobEvent, JobEventPayload, JobEventPublisher};
use super::queue::TaskQueue;
use super::retry::RetryPolicy;
use super::state::JobRegistry;
use super::task::{NackOutcome, TaskLease};
use crate::error::Result;
use crate::execution::{
    ExecutionError, ExecutionLimits, ToolInvocation, ToolOutcome, ToolRunner,
};
use crate::persistence::{ScanRepository, ToolRunUpdate};
use crate::policy::{PolicyEngine, ToolSlots};

/// How long a cancelled tool gets to stop on its own before it is dropped.
const CANCEL_GRACE: Duration = Duration::from_secs(5);

pub(crate) struct WorkerContext {
    pub config: Arc<OrchestratorConfig>,
    pub repository: Arc<dyn ScanRepository>,
    pub queue: Arc<dyn TaskQueue>,
    pub policy: Arc<PolicyEngine>,
    pub runner: Arc<dyn ToolRunner>,
    pub registry: Arc<JobRegistry>,
    pub aggregator: Arc<ResultAggregator>,
    pub events: Arc<dyn JobEventPublisher>,
    pub retry: RetryPolicy,
    pub shutdown: CancellationToken,
}

enum Execution {
    Finished(std::result::Result<ToolOutcome, ExecutionError>),
    TimedOut,
    Cancelled,
}

pub(crate) async fn run_worker(ctx: Arc<WorkerContext>, worker_id: String) {
    tracing::debug!(target: "warden::worker", worker = %worker_id, "worker started");
    let idle = ctx.config.task.poll_interval();

    loop {
        if ctx.shutdown.is_cancelled() {
            break;
        }

        match ctx.queue.dequeue(&worker_id).await {
            Ok(Some(lease)) => {
                let lease_id = lease.lease_id;
                let run = lease.task.key;
                if let Err(err) = ctx.process(&lease).await {
                    tracing::warn!(
                        target: "warden::worker",
                        worker = %worker_id,
                        run = %run,
                        %err,
                        "task processing failed, returning it to the queue"
                    );
                    if let Err(err) = ctx.queue.nack(lease_id, true, Some(err.to_string())).await {
                        tracing::warn!(target: "warden::worker", run = %run, %err, "nack failed");
                    }
                }
            }
            Ok(None) => {
                tokio::select! {
                    _ = ctx.shutdown.cancelled() => break,
                    _ = ctx.queue.wait_for_work(idle) => {}
                }
            }
            Err(err) => {
                tracing::warn!(target: "warden::worker", worker = %worker_id, %err, "dequeue failed");
                tokio::select! {
                    _ = ctx.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(idle) => {}
                }
            }
        }
    }

    tracing::debug!(target: "warden::worker", worker = %worker_id, "worker stopped");
}

impl WorkerContext {
    async fn process(&self, lease: &TaskLease) -> Result<()> {
        let task = &lease.task;

        let run = match self.repository.get_tool_run(task.key).await {
            Ok(run) => run,
            Err(crate::error::OrchestratorError::NotFound { .. }) => {
                tracing::warn!(target: "warden::worker", run = %task.key, "task has no tool run, dropping it");
                return self.queue.ack(lease.lease_id).await;
            }
            Err(err) => return Err(err),
        };

        if run.status.is_terminal() {
            tracing::debug!(
                target: "warden::worker",
                run = %run.id,
                status = run.status.as_str(),
                "redelivered task already terminal"
            );
            self.queue.ack(lease.lease_id).await?;
            self.aggregator.record_terminal(run.job_id, run.id).await?;
            return Ok(());
        }

        let job = self.repository.get_scan_job(task.job_id).await?;
        let active = match self.registry.get(job.id) {
            Some(active) if job.status == JobStatus::Running => active,
            _ => {
                // Cancelled (or otherwise finished) while the task was queued.
                self.write_run(
                    ToolRunUpdate::new(run.id, ToolRunStatus::Cancelled)
                        .with_failure(FailureReason::Cancelled),
                )
                .await?;
                return self.queue.ack(lease.lease_id).await;
            }
        };

        if run.status == ToolRunStatus::Running {
            // The previous holder lost its lease mid-run.
            self.write_run(
                ToolRunUpdate::new(run.id, ToolRunStatus::Pending)
                    .with_error("lease expired while running"),
            )
            .await?;
        }

        let target = self.repository.get_target(job.target_id).await?;
        let admission = self.policy.evaluate_tool(&job, &target, &task.tool).await?;
        if !admission.is_allowed() {
            let decision = admission.decision;
            if decision.reason.is_transient() {
                let delay = decision
                    .retry_after
                    .unwrap_or_else(|| self.config.task.admission_retry());
                self.publish(
                    &run,
                    JobEventPayload::ToolRunDeferred {
                        run_id: run.id,
                        tool: run.tool.clone(),
                        reason: decision.reason,
                    },
                )
                .await;
                return self.queue.defer(lease.lease_id, delay).await;
            }

            let mut update = ToolRunUpdate::new(run.id, ToolRunStatus::Failed);
            if let Some(failure) = decision.failure_reason() {
                update = update.with_failure(failure);
            }
            if let Some(detail) = decision.detail {
                update = update.with_error(detail);
            }
            tracing::info!(
                target: "warden::worker",
                job = %job.id,
                run = %run.id,
                tool = %run.tool,
                reason = %decision.reason,
                "tool run denied"
            );
            return self.finish(lease, &run, update, None).await;
        }
        let Some(slots) = admission.into_tool_slots() else {
            return self.queue.defer(lease.lease_id, self.config.task.admission_retry()).await;
        };

        if active.cancel.is_cancelled() {
            drop(slots);
            self.write_run(
                ToolRunUpdate::new(run.id, ToolRunStatus::Cancelled)
                    .with_failure(FailureReason::Cancelled),
            )
            .await?;
            return self.queue.ack(lease.lease_id).await;
        }
        // The repository refuses `running` once the job is terminal, so a
        // cancellation landing after the check above still wins.
        let Some(running) = self
            .write_run(ToolRunUpdate::new(run.id, ToolRunStatus::Running))
            .await?
        else {
            drop(slots);
            return self.queue.ack(lease.lease_id).await;
        };
        let attempt = lease.attempts.saturating_add(1);
        self.publish(
            &running,
            JobEventPayload::ToolRunStarted {
                run_id: running.id,
                tool: running.tool.clone(),
                attempt,
            },
        )
        .await;

        let invocation = ToolInvocation {
            job_id: job.id,
            run_id: running.id,
            tool: normalize_tool_name(&task.tool),
            target: task.target.clone(),
            attempt,
        };
        let execution = self.execute(invocation, &active.cancel).await;
        let slots = Some(slots);

        match execution {
            Execution::TimedOut => {
                self.time_out(lease, &running, "hard timeout reached".into(), slots)
                    .await
            }
            Execution::Finished(Err(err @ ExecutionError::SoftTimeout(_))) => {
                self.time_out(lease, &running, err.to_string(), slots).await
            }
            Execution::Cancelled | Execution::Finished(Err(ExecutionError::Cancelled)) => {
                let update = ToolRunUpdate::new(running.id, ToolRunStatus::Cancelled)
                    .with_failure(FailureReason::Cancelled);
                self.finish(lease, &running, update, slots).await
            }
            Execution::Finished(Ok(outcome)) if outcome.is_success() => {
                self.complete(lease, &running, outcome, slots).await
            }
            Execution::Finished(Ok(outcome)) => {
                let code = outcome.exit_code;
                let error = outcome
                    .stderr_tail
                    .clone()
                    .unwrap_or_else(|| format!("tool exited with code {code}"));
                let update = ToolRunUpdate::new(running.id, ToolRunStatus::Pending)
                    .with_exit_code(code)
                    .with_output(outcome.output)
                    .with_error(error.clone());
                self.retry_or_fail(lease, &running, update, error, slots).await
            }
            Execution::Finished(Err(err)) if err.is_retryable() => {
                let error = err.to_string();
                let update = ToolRunUpdate::new(running.id, ToolRunStatus::Pending)
                    .with_error(error.clone());
                self.retry_or_fail(lease, &running, update, error, slots).await
            }
            Execution::Finished(Err(err)) => {
                let message = err.to_string();
                let update = ToolRunUpdate::new(running.id, ToolRunStatus::Failed)
                    .with_failure(FailureReason::ExecutionError {
                        message: message.clone(),
                    })
                    .with_error(message);
                self.finish(lease, &running, update, slots).await
            }
        }
    }

    /// Timeouts are terminal: a tool that ran out of time is not retried.
    async fn time_out(
        &self,
        lease: &TaskLease,
        run: &ToolRun,
        error: String,
        slots: Option<ToolSlots>,
    ) -> Result<()> {
        tracing::warn!(target: "warden::worker", run = %run.id, tool = %run.tool, %error, "tool run timed out");
        let update = ToolRunUpdate::new(run.id, ToolRunStatus::Timeout)
            .with_failure(FailureReason::Timeout)
            .with_error(error);
        self.finish(lease, run, update, slots).await
    }

    async fn execute(
        &self,
        invocation: ToolInvocation,
        cancel: &CancellationToken,
    ) -> Execution {
        let limits = ExecutionLimits {
            soft_timeout: self.config.task.soft_timeout(),
            cancel: cancel.child_token(),
        };
        let execution = self.runner.run_tool(invocation, limits);
        tokio::pin!(execution);
        let hard_timeout = tokio::time::sleep(self.config.task.hard_timeout());
        tokio::pin!(hard_timeout);

        tokio::select! {
            result = &mut execution => Execution::Finished(result),
            _ = &mut hard_timeout => Execution::TimedOut,
            _ = cancel.cancelled() => {
                // Give the runner a chance to stop its tool cleanly.
                let _ = tokio::time::timeout(CANCEL_GRACE, &mut execution).await;
                Execution::Cancelled
            }
        }
    }

    async fn complete(
        &self,
        lease: &TaskLease,
        run: &ToolRun,
        outcome: ToolOutcome,
        slots: Option<ToolSlots>,
    ) -> Result<()> {
        let findings: Vec<Finding> = outcome
            .findings
            .into_iter()
            .enumerate()
            .map(|(ordinal, draft)| {
                let ordinal = u32::try_from(ordinal).unwrap_or(u32::MAX);
                Finding::from_draft(run.job_id, run.id, ordinal, draft)
            })
            .collect();
        let found = findings.len();
        self.repository.save_findings(run.id, findings).await?;

        tracing::info!(
            target: "warden::worker",
            job = %run.job_id,
            run = %run.id,
            tool = %run.tool,
            findings = found,
            "tool run completed"
        );
        let update = ToolRunUpdate::new(run.id, ToolRunStatus::Completed)
            .with_exit_code(outcome.exit_code)
            .with_output(outcome.output);
        self.finish(lease, run, update, slots).await
    }

    /// Puts a failed attempt back on the queue, or fails the run once the
    /// attempt budget is spent.
    async fn retry_or_fail(
        &self,
        lease: &TaskLease,
        run: &ToolRun,
        pending: ToolRunUpdate,
        error: String,
        slots: Option<ToolSlots>,
    ) -> Result<()> {
        let consumed = lease.attempts.saturating_add(1);
        let exhausted = FailureReason::RetriesExhausted {
            attempts: consumed,
            last_error: error.clone(),
        };

        if !self.retry.allows_another(consumed) {
            let mut update = ToolRunUpdate::new(run.id, ToolRunStatus::Failed)
                .with_failure(exhausted)
                .with_error(error.clone());
            if let Some(code) = pending.exit_code {
                update = update.with_exit_code(code);
            }
            if self.write_run(update).await?.is_some() {
                self.queue.nack(lease.lease_id, true, Some(error)).await?;
            } else {
                self.queue.ack(lease.lease_id).await?;
            }
            return self.report(run, slots).await;
        }

        if self.write_run(pending).await?.is_none() {
            self.queue.ack(lease.lease_id).await?;
            return self.report(run, slots).await;
        }

        match self.queue.nack(lease.lease_id, true, Some(error.clone())).await? {
            NackOutcome::Requeued { attempts, delay } => {
                if let Some(slots) = slots {
                    release_slots(slots);
                }
                tracing::info!(
                    target: "warden::worker",
                    run = %run.id,
                    tool = %run.tool,
                    attempts,
                    delay_ms = delay.as_millis() as u64,
                    %error,
                    "tool run failed, retrying"
                );
                self.publish(
                    run,
                    JobEventPayload::ToolRunRetrying {
                        run_id: run.id,
                        tool: run.tool.clone(),
                        attempt: attempts.saturating_add(1),
                        delay_ms: delay.as_millis() as u64,
                    },
                )
                .await;
                Ok(())
            }
            NackOutcome::DeadLettered { attempts } => {
                // The queue ran out of attempts before the worker did.
                self.write_run(
                    ToolRunUpdate::new(run.id, ToolRunStatus::Failed).with_failure(
                        FailureReason::RetriesExhausted {
                            attempts,
                            last_error: error,
                        },
                    ),
                )
                .await?;
                self.report(run, slots).await
            }
        }
    }

    /// Persists a terminal run state, acknowledges the task and reports it.
    async fn finish(
        &self,
        lease: &TaskLease,
        run: &ToolRun,
        update: ToolRunUpdate,
        slots: Option<ToolSlots>,
    ) -> Result<()> {
        self.write_run(update).await?;
        self.queue.ack(lease.lease_id).await?;
        self.report(run, slots).await
    }

    /// Slots go back after `ToolRunFinished` is published and before the
    /// aggregator can finish the job.
    async fn report(&self, run: &ToolRun, slots: Option<ToolSlots>) -> Result<()> {
        let current = self.repository.get_tool_run(run.id).await?;
        self.publish(
            &current,
            JobEventPayload::ToolRunFinished {
                run_id: current.id,
                tool: current.tool.clone(),
                status: current.status,
            },
        )
        .await;
        if let Some(slots) = slots {
            release_slots(slots);
        }
        self.aggregator.record_terminal(current.job_id, current.id).await?;
        Ok(())
    }

    /// Guarded run update. `None` means another path (usually cancellation)
    /// already moved the run somewhere this update may not follow.
    async fn write_run(&self, update: ToolRunUpdate) -> Result<Option<ToolRun>> {
        let run_id = update.run_id;
        let status = update.status;
        match self.repository.update_tool_run_status(update).await {
            Ok(run) => Ok(Some(run)),
            Err(err) if err.is_conflict() => {
                tracing::debug!(
                    target: "warden::worker",
                    run = %run_id,
                    wanted = status.as_str(),
                    %err,
                    "tool run update skipped"
                );
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    async fn publish(&self, run: &ToolRun, payload: JobEventPayload) {
        if let Err(err) = self.events.publish(JobEvent::new(run.job_id, payload)).await {
            tracing::warn!(target: "warden::worker", run = %run.id, %err, "event publish failed");
        }
    }
}

fn release_slots(slots: ToolSlots) {
    let job = slots.job();
    if let Err(err) = slots.release() {
        tracing::error!(target: "warden::worker", job = %job, %err, "tool slot release failed");
    }
}
