#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;
use warden_core::execution::{
    ExecutionError, ExecutionLimits, ToolInvocation, ToolOutcome, ToolRunner,
};
use warden_core::model::{FindingDraft, JobId, JobStatus};
use warden_core::orchestration::{RetryConfig, TaskConfig};
use warden_core::{JobEvent, JobEventPayload, OrchestratorConfig};

/// What a fake tool does when invoked.
#[derive(Debug, Clone)]
pub enum Script {
    Succeed(Vec<FindingDraft>),
    Exit(i32),
    /// Exits 1 on the first `n` invocations, then succeeds.
    FailTimes(u32),
    /// Succeeds after the delay.
    Slow(Duration),
    /// Runs until cancelled, then reports cancellation.
    Hang,
    /// Never finishes and ignores cancellation.
    Stall,
    /// Stopped at the soft timeout, as a process runner reports it.
    SoftTimeout,
    Unknown,
}

#[derive(Debug, Default)]
pub struct FakeRunner {
    scripts: Mutex<HashMap<String, Script>>,
    calls: DashMap<String, u32>,
    in_flight: DashMap<JobId, usize>,
    max_in_flight: DashMap<JobId, usize>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, tool: &str, script: Script) -> Self {
        self.scripts
            .lock()
            .expect("scripts lock")
            .insert(tool.to_string(), script);
        self
    }

    pub fn calls(&self, tool: &str) -> u32 {
        self.calls.get(tool).map(|calls| *calls).unwrap_or(0)
    }

    pub fn max_in_flight(&self, job: JobId) -> usize {
        self.max_in_flight.get(&job).map(|max| *max).unwrap_or(0)
    }

    fn script_for(&self, tool: &str) -> Script {
        self.scripts
            .lock()
            .expect("scripts lock")
            .get(tool)
            .cloned()
            .unwrap_or(Script::Slow(Duration::from_millis(10)))
    }

    fn enter(&self, job: JobId) -> InFlight<'_> {
        let now = {
            let mut current = self.in_flight.entry(job).or_insert(0);
            *current += 1;
            *current
        };
        let mut max = self.max_in_flight.entry(job).or_insert(0);
        *max = (*max).max(now);
        InFlight { runner: self, job }
    }
}

/// Decrements the in-flight count even when the execution future is dropped.
struct InFlight<'a> {
    runner: &'a FakeRunner,
    job: JobId,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Some(mut current) = self.runner.in_flight.get_mut(&self.job) {
            *current = current.saturating_sub(1);
        }
    }
}

#[async_trait]
impl ToolRunner for FakeRunner {
    async fn run_tool(
        &self,
        invocation: ToolInvocation,
        limits: ExecutionLimits,
    ) -> Result<ToolOutcome, ExecutionError> {
        let call = {
            let mut calls = self.calls.entry(invocation.tool.clone()).or_insert(0);
            *calls += 1;
            *calls
        };
        let _guard = self.enter(invocation.job_id);

        match self.script_for(&invocation.tool) {
            Script::Succeed(findings) => Ok(ToolOutcome::success(findings)),
            Script::Exit(code) => Ok(ToolOutcome::exited(code)),
            Script::FailTimes(failures) if call <= failures => Ok(ToolOutcome::exited(1)),
            Script::FailTimes(_) => Ok(ToolOutcome::success(Vec::new())),
            Script::Slow(delay) => {
                tokio::time::sleep(delay).await;
                Ok(ToolOutcome::success(Vec::new()))
            }
            Script::Hang => {
                limits.cancel.cancelled().await;
                Err(ExecutionError::Cancelled)
            }
            Script::Stall => std::future::pending().await,
            Script::SoftTimeout => Err(ExecutionError::SoftTimeout(limits.soft_timeout)),
            Script::Unknown => Err(ExecutionError::UnknownTool(invocation.tool)),
        }
    }
}

/// Short timeouts and backoff so scenarios finish in milliseconds.
pub fn fast_config() -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.task = TaskConfig {
        max_retries: 2,
        soft_timeout_ms: 1_000,
        hard_timeout_ms: 2_000,
        admission_retry_ms: 10,
        workers: 4,
        poll_interval_ms: 10,
        enqueue_attempts: 2,
    };
    config.retry = RetryConfig {
        backoff_base_ms: 10,
        backoff_max_ms: 50,
        jitter_ratio: 0.0,
        jitter_min_ms: 0,
    };
    config.lease.housekeeper_interval_ms = 50;
    config.policy.rate_limit.tokens_per_second = 1_000.0;
    config.policy.rate_limit.burst = 100;
    config
}

pub fn finding(severity: warden_core::model::Severity, title: &str) -> FindingDraft {
    FindingDraft {
        severity,
        title: title.to_string(),
        evidence: format!("evidence for {title}"),
    }
}

/// Waits for the job's final event: `JobFinished`, or `JobDenied` for a job
/// that never ran.
pub async fn wait_for_job(
    events: &mut broadcast::Receiver<JobEvent>,
    job_id: JobId,
) -> Option<JobStatus> {
    let wait = async {
        loop {
            match events.recv().await {
                Ok(event) if event.job_id == job_id => match event.payload {
                    JobEventPayload::JobFinished { status, .. } => return status,
                    JobEventPayload::JobDenied { .. } => return JobStatus::Failed,
                    _ => {}
                },
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return JobStatus::Pending,
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(10), wait).await.ok()
}

/// Waits until an event matching `predicate` arrives for the job.
pub async fn wait_for_event<F>(
    events: &mut broadcast::Receiver<JobEvent>,
    job_id: JobId,
    predicate: F,
) -> Option<JobEventPayload>
where
    F: Fn(&JobEventPayload) -> bool,
{
    let wait = async {
        loop {
            match events.recv().await {
                Ok(event) if event.job_id == job_id && predicate(&event.payload) => {
                    return Some(event.payload);
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(10), wait)
        .await
        .ok()
        .flatten()
}
