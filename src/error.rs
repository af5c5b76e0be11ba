//! Error types for the RPA engine.

use uuid::Uuid;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Task/profile store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid task {id}: {reason}")]
    InvalidTask { id: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Job-queue and execution errors.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Task {id} not found")]
    TaskNotFound { id: String },

    #[error("Profile {id} not found")]
    ProfileNotFound { id: String },

    #[error("At least one profile is required to queue a task")]
    NoProfiles,

    #[error("Step {index} ({name}): {reason}")]
    StepExecution {
        index: usize,
        name: String,
        reason: String,
    },

    #[error("Failed to create worker for job {job_id}: {reason}")]
    WorkerCreation { job_id: Uuid, reason: String },

    #[error("Job {id} failed after {attempts} attempts")]
    JobRetryExhausted { id: Uuid, attempts: u32 },

    #[error("Job {id} not found")]
    JobNotFound { id: Uuid },

    #[error("Job {id} was cancelled")]
    Cancelled { id: Uuid },

    #[error("Job {id} panicked: {reason}")]
    Panicked { id: Uuid, reason: String },

    #[error("Engine has been shut down")]
    ShutDown,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_error_names_index_and_step() {
        let err = EngineError::StepExecution {
            index: 2,
            name: "Open login".into(),
            reason: "selector not found".into(),
        };
        assert_eq!(err.to_string(), "Step 2 (Open login): selector not found");
    }

    #[test]
    fn store_error_converts_into_engine_error() {
        let err: EngineError = StoreError::Unavailable("disk gone".into()).into();
        assert!(matches!(err, EngineError::Store(_)));
        let top: Error = err.into();
        assert!(top.to_string().starts_with("Engine error"));
    }
}
