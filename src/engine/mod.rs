pub mod events;
pub mod executor;
pub mod job;
mod monitor;
pub mod queue;
mod runner;
pub mod scheduler;
pub mod state;
pub mod worker;

pub use events::{EngineEvent, EventBus, EventHandlers, SubscriptionId, WorkerChange};
pub use executor::{DryRunExecutor, StepExecutor, StepOutput};
pub use job::{DEFAULT_PRIORITY, ExecutionResult, Job, JobProgress};
pub use queue::{JobQueue, QueueSnapshot, QueueStats};
pub use scheduler::{EngineDeps, ExecutionEngine};
pub use state::{JobStatus, StateTransition};
pub use worker::{Worker, WorkerPool, WorkerStatus};
