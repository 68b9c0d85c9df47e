//! Warden core: admission policy, task queue and scan job orchestration.
//!
//! The crate is split along the same seams the runtime uses:
//!
//! * [`policy`] decides whether a job or a single tool run may proceed right
//!   now (network and tool authorization, token-bucket rate limiting and
//!   concurrency slots).
//! * [`orchestration`] owns the job state machine, the task queue, the worker
//!   pool and the aggregator that turns tool-run outcomes into a job outcome.
//! * [`persistence`] and [`execution`] are the ports the orchestrator talks
//!   to, each with a reference adapter (in-memory repository, process runner).

pub mod error;
pub mod execution;
pub mod orchestration;
pub mod persistence;
pub mod policy;

pub use error::{OrchestratorError, Result, ValidationError};
pub use orchestration::{
    JobEvent, JobEventPayload, JobStatusView, Orchestrator, OrchestratorBuilder,
    OrchestratorConfig, SubmitRequest,
};
pub use policy::{PolicyConfig, PolicyEngine};

pub use warden_model as model;
