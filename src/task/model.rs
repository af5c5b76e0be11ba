//! Task and step definitions.
//!
//! A task is an ordered list of steps owned by the task store. Each step
//! carries a typed action (the `type` field on the wire) plus the error
//! policy the runner applies when that action fails.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// What a step does when its action fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Move on if the task allows it, otherwise abort.
    #[default]
    Continue,
    /// Abort the whole job.
    #[serde(alias = "stop")]
    StopTask,
    /// Record the failure as skipped and move on.
    Skip,
    /// Re-run the step up to `error_retries` times.
    Retry,
}

impl std::fmt::Display for ErrorPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Continue => "continue",
            Self::StopTask => "stop_task",
            Self::Skip => "skip",
            Self::Retry => "retry",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrollDirection {
    #[default]
    Down,
    Up,
    Top,
    Bottom,
}

/// Type-specific step parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepAction {
    Navigate {
        url: String,
    },
    Click {
        selector: String,
    },
    Input {
        selector: String,
        text: String,
        #[serde(default)]
        clear_first: bool,
    },
    Wait {
        duration_ms: u64,
    },
    Scroll {
        #[serde(default)]
        direction: ScrollDirection,
        #[serde(default)]
        amount: u32,
    },
    Extract {
        selector: String,
        /// Key the extracted value is stored under.
        key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        attribute: Option<String>,
    },
    Screenshot {
        #[serde(default)]
        full_page: bool,
    },
    Hover {
        selector: String,
    },
    Select {
        selector: String,
        value: String,
    },
    PressKey {
        key: String,
    },
}

impl StepAction {
    /// Wire name of the action (matches the serde tag).
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Navigate { .. } => "navigate",
            Self::Click { .. } => "click",
            Self::Input { .. } => "input",
            Self::Wait { .. } => "wait",
            Self::Scroll { .. } => "scroll",
            Self::Extract { .. } => "extract",
            Self::Screenshot { .. } => "screenshot",
            Self::Hover { .. } => "hover",
            Self::Select { .. } => "select",
            Self::PressKey { .. } => "press_key",
        }
    }

    fn validate(&self) -> Result<(), String> {
        fn required(field: &str, value: &str) -> Result<(), String> {
            if value.trim().is_empty() {
                Err(format!("{field} must not be empty"))
            } else {
                Ok(())
            }
        }

        match self {
            Self::Navigate { url } => required("url", url),
            Self::Click { selector } | Self::Hover { selector } => required("selector", selector),
            Self::Input { selector, .. } => required("selector", selector),
            Self::Select { selector, value } => {
                required("selector", selector)?;
                required("value", value)
            }
            Self::Extract { selector, key, .. } => {
                required("selector", selector)?;
                required("key", key)
            }
            Self::PressKey { key } => required("key", key),
            Self::Wait { .. } | Self::Scroll { .. } | Self::Screenshot { .. } => Ok(()),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_error_retries() -> u32 {
    1
}

/// One automation instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub name: String,
    #[serde(flatten)]
    pub action: StepAction,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub on_error: ErrorPolicy,
    /// Extra attempts for the `retry` policy.
    #[serde(default = "default_error_retries")]
    pub error_retries: u32,
    /// Enforced by the step executor, not the engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl Step {
    /// Create an enabled step with the default error policy.
    pub fn new(id: impl Into<String>, name: impl Into<String>, action: StepAction) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            action,
            enabled: true,
            on_error: ErrorPolicy::default(),
            error_retries: default_error_retries(),
            timeout_ms: None,
        }
    }

    pub fn with_policy(mut self, on_error: ErrorPolicy) -> Self {
        self.on_error = on_error;
        self
    }

    pub fn with_retries(mut self, error_retries: u32) -> Self {
        self.error_retries = error_retries;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Task-wide execution settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSettings {
    /// Keep going after a failed step with the `continue` or exhausted
    /// `retry` policy.
    #[serde(default)]
    pub continue_on_error: bool,
    #[serde(default)]
    pub human_behavior: bool,
    #[serde(default)]
    pub random_delay: bool,
    #[serde(default = "default_delay_min_ms")]
    pub delay_min_ms: u64,
    #[serde(default = "default_delay_max_ms")]
    pub delay_max_ms: u64,
    /// Overrides the engine's default job-level retry count.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

fn default_delay_min_ms() -> u64 {
    500
}

fn default_delay_max_ms() -> u64 {
    2000
}

impl Default for TaskSettings {
    fn default() -> Self {
        Self {
            continue_on_error: false,
            human_behavior: false,
            random_delay: false,
            delay_min_ms: default_delay_min_ms(),
            delay_max_ms: default_delay_max_ms(),
            max_retries: None,
        }
    }
}

impl TaskSettings {
    /// Inter-step delay bounds in milliseconds, if human pacing is on.
    /// Always ordered low to high, even for an unvalidated inverted range.
    pub fn pacing_range(&self) -> Option<(u64, u64)> {
        let (a, b) = (self.delay_min_ms, self.delay_max_ms);
        (self.human_behavior && self.random_delay).then_some((a.min(b), a.max(b)))
    }
}

/// An ordered automation script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub settings: TaskSettings,
}

impl Task {
    pub fn new(id: impl Into<String>, name: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            steps,
            settings: TaskSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: TaskSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Parse and validate a task definition.
    pub fn from_json(json: &str) -> Result<Self, StoreError> {
        let task: Task =
            serde_json::from_str(json).map_err(|e| StoreError::Serialization(e.to_string()))?;
        task.validate()?;
        Ok(task)
    }

    /// Enabled steps in definition order.
    pub fn enabled_steps(&self) -> impl Iterator<Item = &Step> {
        self.steps.iter().filter(|s| s.enabled)
    }

    /// Number of steps that count toward progress.
    pub fn total_steps(&self) -> usize {
        self.enabled_steps().count()
    }

    /// Check the definition before it is accepted into a store.
    pub fn validate(&self) -> Result<(), StoreError> {
        let invalid = |reason: String| StoreError::InvalidTask {
            id: self.id.clone(),
            reason,
        };

        if self.id.trim().is_empty() {
            return Err(invalid("task id must not be empty".to_string()));
        }
        if self.steps.is_empty() {
            return Err(invalid("task has no steps".to_string()));
        }
        if self.settings.delay_min_ms > self.settings.delay_max_ms {
            return Err(invalid(format!(
                "delay_min_ms ({}) exceeds delay_max_ms ({})",
                self.settings.delay_min_ms, self.settings.delay_max_ms
            )));
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.id.as_str()) {
                return Err(invalid(format!("duplicate step id '{}'", step.id)));
            }
            if let Err(e) = step.action.validate() {
                let kind = step.action.kind();
                return Err(invalid(format!("step '{}' ({kind}): {e}", step.id)));
            }
        }

        Ok(())
    }
}
