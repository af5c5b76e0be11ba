//! Step executor seam.
//!
//! The engine drives jobs but never touches a browser; every step is handed
//! to a [`StepExecutor`] together with the target profile.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::task::{Profile, Step, StepAction};

/// Successful output of one step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepOutput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extracted_data: Option<serde_json::Map<String, serde_json::Value>>,
    /// Path or reference to a captured screenshot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<String>,
}

impl StepOutput {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_data(key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        let mut data = serde_json::Map::new();
        data.insert(key.into(), value.into());
        Self {
            extracted_data: Some(data),
            screenshot: None,
        }
    }

    pub fn with_screenshot(path: impl Into<String>) -> Self {
        Self {
            extracted_data: None,
            screenshot: Some(path.into()),
        }
    }
}

/// Performs a single automation step against a profile.
///
/// Implementations must tolerate being called again for the same step, since
/// the `retry` policy and job-level retries re-run steps. Errors are plain
/// messages; the engine formats them into the job result.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(&self, step: &Step, profile: &Profile) -> Result<StepOutput, String>;
}

/// Executor that performs no browser work.
///
/// `wait` steps sleep for their duration, `extract` steps yield a
/// placeholder value and `screenshot` steps yield a synthetic path.
#[derive(Debug, Default, Clone)]
pub struct DryRunExecutor;

#[async_trait]
impl StepExecutor for DryRunExecutor {
    async fn execute(&self, step: &Step, profile: &Profile) -> Result<StepOutput, String> {
        debug!(
            profile_id = %profile.id,
            step_id = %step.id,
            kind = step.action.kind(),
            "Dry-run step"
        );

        let output = match &step.action {
            StepAction::Wait { duration_ms } => {
                tokio::time::sleep(Duration::from_millis(*duration_ms)).await;
                StepOutput::empty()
            }
            StepAction::Extract { selector, key, .. } => {
                StepOutput::with_data(key.clone(), format!("<{selector}>"))
            }
            StepAction::Screenshot { .. } => {
                StepOutput::with_screenshot(format!("screenshots/{}/{}.png", profile.id, step.id))
            }
            _ => StepOutput::empty(),
        };

        Ok(output)
    }
}
