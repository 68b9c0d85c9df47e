//! Tool execution port.
//!
//! A [`ToolRunner`] runs one tool against one target and reports what
//! happened. It honours the soft timeout and cancellation itself (by asking
//! the tool to stop); the hard timeout is enforced by the worker, which drops
//! the execution future.

mod findings;
mod process;

pub use findings::{FindingExtractor, JsonLinesExtractor};
pub use process::ProcessToolRunner;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use warden_model::{FindingDraft, JobId, OutputHandle, ToolRunId};

/// One execution request handed to a [`ToolRunner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    /// Job the run belongs to.
    pub job_id: JobId,
    /// Tool run being executed; also names the output file.
    pub run_id: ToolRunId,
    /// Normalized tool name.
    pub tool: String,
    /// Normalized target value substituted into the command.
    pub target: String,
    /// 1-based execution attempt.
    pub attempt: u16,
}

/// Limits the runner enforces itself.
#[derive(Debug, Clone)]
pub struct ExecutionLimits {
    /// After this long the tool is asked to stop (SIGTERM for processes).
    pub soft_timeout: Duration,
    /// Fires when the job is cancelled or the runtime shuts down.
    pub cancel: CancellationToken,
}

/// What a tool produced once it exited.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutcome {
    /// Process exit code; `-1` when the tool was killed by a signal.
    pub exit_code: i32,
    /// Where the raw output was stored, if anywhere.
    pub output: Option<OutputHandle>,
    /// Last part of stderr, kept for error reporting.
    pub stderr_tail: Option<String>,
    /// Findings extracted from a successful run.
    pub findings: Vec<FindingDraft>,
}

impl ToolOutcome {
    /// Exit code 0 with the given findings.
    pub fn success(findings: Vec<FindingDraft>) -> Self {
        Self {
            exit_code: 0,
            findings,
            ..Self::default()
        }
    }

    /// Exit with `code` and nothing else recorded.
    pub fn exited(code: i32) -> Self {
        Self {
            exit_code: code,
            ..Self::default()
        }
    }

    /// A zero exit code.
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Why a tool could not produce a [`ToolOutcome`].
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// No command is configured for the tool.
    #[error("no command configured for tool '{0}'")]
    UnknownTool(String),

    /// The process could not be started.
    #[error("failed to spawn '{tool}': {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    /// Output or pipe handling failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The job was cancelled while the tool ran.
    #[error("tool run was cancelled")]
    Cancelled,

    /// The tool was asked to stop at the soft timeout and did not exit cleanly.
    #[error("tool stopped after the soft timeout of {0:?}")]
    SoftTimeout(Duration),
}

impl ExecutionError {
    /// Misconfiguration does not get better by retrying, and a tool that ran
    /// out of time will run out of time again.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ExecutionError::UnknownTool(_)
                | ExecutionError::Cancelled
                | ExecutionError::SoftTimeout(_)
        )
    }
}

/// Executes one tool against one target.
///
/// Implementations honour `limits` themselves. The worker enforces the hard
/// timeout by dropping the returned future, so runners must not leave the tool
/// running when that happens.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ToolRunner: Send + Sync {
    /// Runs the tool to completion, or until it is stopped by the soft timeout
    /// or cancellation. A non-zero exit is an `Ok` outcome; errors are reserved
    /// for runs that produced no usable outcome.
    async fn run_tool(
        &self,
        invocation: ToolInvocation,
        limits: ExecutionLimits,
    ) -> Result<ToolOutcome, ExecutionError>;
}
