//! Job status state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting in the pending queue.
    Queued,
    /// Bound to a worker and executing steps.
    Running,
    /// All steps ran without an escalated failure.
    Completed,
    /// Aborted; terminal once retries are exhausted.
    Failed,
    /// Cancelled by the caller or by shutdown.
    Cancelled,
}

impl JobStatus {
    /// Check if this status allows transitioning to another status.
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, target),
            // From Queued (Failed when no worker could be allocated)
            (Queued, Running) | (Queued, Cancelled) | (Queued, Failed) |
            // From Running
            (Running, Completed) | (Running, Failed) | (Running, Cancelled) |
            // Retry
            (Failed, Queued)
        )
    }

    /// Completed and cancelled are always final. Failed is final unless the
    /// engine re-queues the job for a retry.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// A recorded status change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: JobStatus,
    pub to: JobStatus,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}
