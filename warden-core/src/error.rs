//! Error types shared by every layer of the crate.

use thiserror::Error;
use warden_model::ModelError;

use crate::execution::ExecutionError;
use crate::policy::{ConcurrencyError, PolicyError, RateLimitError};

/// Submission problems reported synchronously; no job is created.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// No tools were requested.
    #[error("at least one tool is required")]
    EmptyToolList,

    /// A tool name is empty after trimming.
    #[error("tool name at position {index} is blank")]
    BlankToolName { index: usize },

    /// The target is not a hostname, IP address or CIDR.
    #[error("{0}")]
    InvalidTarget(ModelError),

    /// A tool costs more tokens than a bucket can hold.
    #[error(
        "tool '{tool}' costs {cost} tokens but the rate limit burst is {burst}"
    )]
    CostExceedsBurst { tool: String, cost: u32, burst: u32 },
}

/// Errors returned by the orchestrator and its ports.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The request was rejected before anything was created.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// The task queue failed.
    #[error("Queue error: {0}")]
    Queue(String),

    /// The repository failed.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// No such record.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// A domain rule was broken, such as an invalid status transition.
    #[error(transparent)]
    Model(#[from] ModelError),

    /// The policy configuration is invalid.
    #[error("Policy error: {0}")]
    Policy(#[from] PolicyError),

    /// The rate limiter failed.
    #[error("Rate limiter error: {0}")]
    RateLimit(#[from] RateLimitError),

    /// A concurrency counter was misused.
    #[error("Concurrency tracker error: {0}")]
    Concurrency(#[from] ConcurrencyError),

    /// A tool could not be executed.
    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    /// The orchestrator no longer accepts work.
    #[error("Orchestrator is shutting down")]
    ShuttingDown,
}

impl OrchestratorError {
    /// Shorthand for [`OrchestratorError::NotFound`].
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        OrchestratorError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// True when a guarded status update lost against a concurrent writer
    /// (for example, a tool finishing after its job was cancelled).
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            OrchestratorError::Model(ModelError::InvalidTransition { .. })
        )
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, OrchestratorError>;
