//! Jobs and execution results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::{JobStatus, StateTransition};
use crate::task::ProfileRef;

/// Cap on recorded transitions per job.
const MAX_TRANSITIONS: usize = 50;

/// Default priority for `queue_task`.
pub const DEFAULT_PRIORITY: i32 = 1;

/// Step progress of a running job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    /// 1-based index of the step being executed, 0 before the first step.
    pub current_step: usize,
    pub total_steps: usize,
    pub step_name: Option<String>,
}

/// Aggregated outcome of running a job's steps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub steps_completed: usize,
    pub steps_skipped: usize,
    pub steps_failed: usize,
    pub execution_time_ms: u64,
    /// Values from extract steps; later steps overwrite earlier keys.
    pub extracted_data: serde_json::Map<String, serde_json::Value>,
    pub screenshots: Vec<String>,
    /// One entry per failing step: `Step {n} ({name}): {message}`.
    pub errors: Vec<String>,
}

impl ExecutionResult {
    pub(crate) fn merge_extracted(&mut self, data: serde_json::Map<String, serde_json::Value>) {
        for (key, value) in data {
            self.extracted_data.insert(key, value);
        }
    }

    pub(crate) fn record_error(&mut self, index: usize, name: &str, message: &str) {
        self.steps_failed += 1;
        self.errors.push(format!("Step {} ({name}): {message}", index + 1));
    }
}

/// One (task, profile) execution request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique job id
    pub id: Uuid,
    /// Task definition this job runs
    pub task_id: String,
    /// Target profile
    pub profile_id: String,
    pub profile_name: String,
    /// Current lifecycle state
    pub status: JobStatus,
    /// Higher runs sooner.
    pub priority: i32,
    /// When the job was queued
    pub created_at: DateTime<Utc>,
    /// When the latest attempt was dispatched
    pub started_at: Option<DateTime<Utc>>,
    /// When the job last reached a terminal state
    pub completed_at: Option<DateTime<Utc>>,
    /// Step progress of the current attempt
    pub progress: JobProgress,
    /// Job-level retries used so far
    pub retry_count: u32,
    /// Job-level retries allowed
    pub max_retries: u32,
    /// Worker bound to the job while it runs
    pub worker_id: Option<Uuid>,
    /// Outcome of the latest attempt, partial if it failed mid-run
    pub result: Option<ExecutionResult>,
    /// Error of the latest failed attempt
    pub error: Option<String>,
    /// Recent state transitions (capped)
    pub transitions: Vec<StateTransition>,
}

impl Job {
    pub fn new(
        task_id: impl Into<String>,
        profile: &ProfileRef,
        priority: i32,
        max_retries: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id: task_id.into(),
            profile_id: profile.id.clone(),
            profile_name: profile.name.clone(),
            status: JobStatus::Queued,
            priority,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            progress: JobProgress::default(),
            retry_count: 0,
            max_retries,
            worker_id: None,
            result: None,
            error: None,
            transitions: Vec::new(),
        }
    }

    /// Transition to a new status, updating timestamps.
    pub fn transition_to(
        &mut self,
        new_status: JobStatus,
        reason: Option<String>,
    ) -> Result<(), String> {
        if !self.status.can_transition_to(new_status) {
            return Err(format!(
                "Cannot transition job {} from {} to {}",
                self.id, self.status, new_status
            ));
        }

        self.transitions.push(StateTransition {
            from: self.status,
            to: new_status,
            timestamp: Utc::now(),
            reason,
        });
        if self.transitions.len() > MAX_TRANSITIONS {
            let drain_count = self.transitions.len() - MAX_TRANSITIONS;
            self.transitions.drain(..drain_count);
        }

        self.status = new_status;

        match new_status {
            JobStatus::Running => {
                self.started_at = Some(Utc::now());
                self.completed_at = None;
            }
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => {
                self.completed_at = Some(Utc::now());
            }
            JobStatus::Queued => {}
        }

        Ok(())
    }

    /// Whether another attempt is allowed after a failure.
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Milliseconds between start and completion (or now, if still running).
    pub fn elapsed_ms(&self) -> Option<i64> {
        self.started_at.map(|start| {
            let end = self.completed_at.unwrap_or_else(Utc::now);
            end.signed_duration_since(start).num_milliseconds().max(0)
        })
    }
}
