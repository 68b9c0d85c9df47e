//! Job lifecycle: submission, admission, queued tool runs and finalization.

pub mod aggregator;
pub mod config;
pub mod events;
pub mod queue;
pub mod retry;
pub mod runtime;
pub mod state;
pub mod task;
mod worker;

pub use aggregator::{RecordOutcome, ResultAggregator};
pub use config::{
    LeaseConfig, OrchestratorConfig, OutputConfig, RetryConfig, TaskConfig,
};
pub use events::{InProcJobEventBus, JobEvent, JobEventPayload, JobEventPublisher};
pub use queue::{InMemoryTaskQueue, TaskQueue};
pub use retry::RetryPolicy;
pub use runtime::{JobStatusView, Orchestrator, OrchestratorBuilder, SubmitRequest};
pub use state::{ActiveJob, CountOutcome, JobRegistry};
pub use task::{
    DeadLetter, EnqueueOutcome, LeaseId, NackOutcome, QueueDepth, TaskLease, ToolTask,
};
