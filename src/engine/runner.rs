//! Per-job step execution loop.
//!
//! Steps run strictly in order. A failed step is resolved locally according
//! to its [`ErrorPolicy`] unless it escalates, in which case the whole job
//! fails with the partial result attached.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use tracing::{debug, warn};
use uuid::Uuid;

use super::executor::{StepExecutor, StepOutput};
use super::job::{ExecutionResult, JobProgress};
use crate::error::EngineError;
use crate::task::{ErrorPolicy, Profile, Step, Task};

/// Engine-side hooks the runner reports to.
#[async_trait]
pub(crate) trait JobObserver: Send + Sync {
    /// Record progress before a step starts. Returns false once the job is
    /// no longer running (cancelled), which stops the loop.
    async fn step_started(&self, progress: JobProgress) -> bool;

    /// Refresh the worker heartbeat. Same return contract as `step_started`.
    async fn heartbeat(&self) -> bool;
}

/// Why a job's step loop stopped early.
#[derive(Debug)]
pub(crate) struct JobFailure {
    pub error: EngineError,
    /// Partial result, when the failure happened inside the step loop.
    pub result: Option<ExecutionResult>,
}

impl From<EngineError> for JobFailure {
    fn from(error: EngineError) -> Self {
        Self {
            error,
            result: None,
        }
    }
}

enum RetryOutcome {
    Recovered(StepOutput),
    Exhausted,
}

pub(crate) struct StepRunner<'a> {
    pub job_id: Uuid,
    pub task: &'a Task,
    pub profile: &'a Profile,
    pub executor: &'a dyn StepExecutor,
    pub observer: &'a dyn JobObserver,
    /// Pause between attempts of a `retry` step.
    pub retry_delay: Duration,
}

impl StepRunner<'_> {
    pub async fn run(&self) -> Result<ExecutionResult, JobFailure> {
        let started = Instant::now();
        let settings = &self.task.settings;
        let steps: Vec<&Step> = self.task.enabled_steps().collect();
        let total = steps.len();
        let mut result = ExecutionResult::default();

        for (index, step) in steps.iter().enumerate() {
            let progress = JobProgress {
                current_step: index + 1,
                total_steps: total,
                step_name: Some(step.name.clone()),
            };
            if !self.observer.step_started(progress).await {
                return Err(self.cancelled(result, started));
            }

            let outcome = self.executor.execute(step, self.profile).await;
            if !self.observer.heartbeat().await {
                return Err(self.cancelled(result, started));
            }

            match outcome {
                Ok(output) => absorb(&mut result, output),
                Err(message) => {
                    self.handle_failure(index, step, message, &mut result, started)
                        .await?
                }
            }

            if index + 1 < total
                && let Some((min, max)) = settings.pacing_range()
            {
                let delay_ms = rand::thread_rng().gen_range(min..=max);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }
        }

        result.execution_time_ms = elapsed_ms(started);
        result.success = result.steps_failed == 0 || settings.continue_on_error;
        Ok(result)
    }

    async fn handle_failure(
        &self,
        index: usize,
        step: &Step,
        message: String,
        result: &mut ExecutionResult,
        started: Instant,
    ) -> Result<(), JobFailure> {
        let continue_on_error = self.task.settings.continue_on_error;

        warn!(
            job_id = %self.job_id,
            step = index + 1,
            step_name = %step.name,
            policy = %step.on_error,
            error = %message,
            "Step failed"
        );

        result.record_error(index, &step.name, &message);

        match step.on_error {
            // Always aborts, whatever the task-level setting says.
            ErrorPolicy::StopTask => Err(self.abort(index, step, message, result, started)),
            ErrorPolicy::Skip => {
                result.steps_skipped += 1;
                Ok(())
            }
            ErrorPolicy::Retry => match self.retry_step(index, step, result, started).await? {
                RetryOutcome::Recovered(output) => {
                    absorb(result, output);
                    Ok(())
                }
                RetryOutcome::Exhausted if continue_on_error => Ok(()),
                RetryOutcome::Exhausted => Err(self.abort(index, step, message, result, started)),
            },
            ErrorPolicy::Continue if continue_on_error => Ok(()),
            ErrorPolicy::Continue => Err(self.abort(index, step, message, result, started)),
        }
    }

    async fn retry_step(
        &self,
        index: usize,
        step: &Step,
        result: &ExecutionResult,
        started: Instant,
    ) -> Result<RetryOutcome, JobFailure> {
        for attempt in 1..=step.error_retries {
            tokio::time::sleep(self.retry_delay).await;
            if !self.observer.heartbeat().await {
                return Err(self.cancelled(result.clone(), started));
            }

            match self.executor.execute(step, self.profile).await {
                Ok(output) => {
                    debug!(
                        job_id = %self.job_id,
                        step = index + 1,
                        attempt,
                        "Step recovered on retry"
                    );
                    return Ok(RetryOutcome::Recovered(output));
                }
                Err(e) => {
                    warn!(
                        job_id = %self.job_id,
                        step = index + 1,
                        attempt,
                        max = step.error_retries,
                        error = %e,
                        "Step retry failed"
                    );
                }
            }
        }
        Ok(RetryOutcome::Exhausted)
    }

    fn abort(
        &self,
        index: usize,
        step: &Step,
        reason: String,
        result: &ExecutionResult,
        started: Instant,
    ) -> JobFailure {
        let mut partial = result.clone();
        partial.execution_time_ms = elapsed_ms(started);
        partial.success = false;
        JobFailure {
            error: EngineError::StepExecution {
                index: index + 1,
                name: step.name.clone(),
                reason,
            },
            result: Some(partial),
        }
    }

    fn cancelled(&self, mut result: ExecutionResult, started: Instant) -> JobFailure {
        result.execution_time_ms = elapsed_ms(started);
        result.success = false;
        JobFailure {
            error: EngineError::Cancelled { id: self.job_id },
            result: Some(result),
        }
    }
}

fn absorb(result: &mut ExecutionResult, output: StepOutput) {
    result.steps_completed += 1;
    if let Some(data) = output.extracted_data {
        result.merge_extracted(data);
    }
    if let Some(screenshot) = output.screenshot {
        result.screenshots.push(screenshot);
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis().try_into().unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use crate::task::{StepAction, TaskSettings};

    /// Executor that replays scripted outcomes per step id.
    #[derive(Default)]
    struct Scripted {
        outcomes: Mutex<Vec<(String, VecDeque<Result<StepOutput, String>>)>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn script(self, step_id: &str, outcomes: Vec<Result<StepOutput, String>>) -> Self {
            self.outcomes
                .lock()
                .unwrap()
                .push((step_id.to_string(), outcomes.into()));
            self
        }
    }

    #[async_trait]
    impl StepExecutor for Scripted {
        async fn execute(&self, step: &Step, _profile: &Profile) -> Result<StepOutput, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut outcomes = self.outcomes.lock().unwrap();
            outcomes
                .iter_mut()
                .find(|(id, _)| *id == step.id)
                .and_then(|(_, q)| q.pop_front())
                .unwrap_or(Ok(StepOutput::empty()))
        }
    }

    struct Observer {
        running: AtomicBool,
        progress: Mutex<Vec<JobProgress>>,
        cancel_after_steps: Option<usize>,
    }

    impl Observer {
        fn new() -> Self {
            Self {
                running: AtomicBool::new(true),
                progress: Mutex::new(Vec::new()),
                cancel_after_steps: None,
            }
        }
    }

    #[async_trait]
    impl JobObserver for Observer {
        async fn step_started(&self, progress: JobProgress) -> bool {
            let mut seen = self.progress.lock().unwrap();
            seen.push(progress);
            if self.cancel_after_steps.is_some_and(|n| seen.len() > n) {
                self.running.store(false, Ordering::SeqCst);
            }
            self.running.load(Ordering::SeqCst)
        }

        async fn heartbeat(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }
    }

    fn click(id: &str, policy: ErrorPolicy) -> Step {
        Step::new(
            id,
            format!("Click {id}"),
            StepAction::Click {
                selector: "#b".into(),
            },
        )
        .with_policy(policy)
    }

    async fn run(
        task: &Task,
        executor: &Scripted,
        observer: &Observer,
    ) -> Result<ExecutionResult, JobFailure> {
        let profile = Profile::new("p1", "One");
        StepRunner {
            job_id: Uuid::new_v4(),
            task,
            profile: &profile,
            executor,
            observer,
            retry_delay: Duration::from_millis(1),
        }
        .run()
        .await
    }

    #[tokio::test]
    async fn all_steps_succeed_and_merge_output() {
        let task = Task::new(
            "t",
            "ok",
            vec![
                click("a", ErrorPolicy::Continue),
                click("b", ErrorPolicy::Continue).disabled(),
                click("c", ErrorPolicy::Continue),
            ],
        );
        let executor = Scripted::default()
            .script("a", vec![Ok(StepOutput::with_data("k", "first"))])
            .script("c", vec![Ok(StepOutput {
                extracted_data: StepOutput::with_data("k", "second").extracted_data,
                screenshot: Some("shot.png".into()),
            })]);
        let observer = Observer::new();

        let result = run(&task, &executor, &observer).await.unwrap();

        assert!(result.success);
        assert_eq!(result.steps_completed, 2);
        assert_eq!(result.extracted_data["k"], "second");
        assert_eq!(result.screenshots, vec!["shot.png".to_string()]);

        let progress = observer.progress.lock().unwrap();
        assert_eq!(progress.len(), 2);
        assert_eq!(progress[1].current_step, 2);
        assert_eq!(progress[1].total_steps, 2);
        assert_eq!(progress[1].step_name.as_deref(), Some("Click c"));
    }

    #[tokio::test]
    async fn retry_recovers_within_budget() {
        let step = click("a", ErrorPolicy::Retry).with_retries(2);
        let task = Task::new("t", "retry", vec![step]);
        let executor = Scripted::default().script(
            "a",
            vec![
                Err("flaky".into()),
                Err("flaky".into()),
                Ok(StepOutput::empty()),
            ],
        );

        let result = run(&task, &executor, &Observer::new()).await.unwrap();

        // The first failure is still counted even though the step recovered
        assert!(!result.success);
        assert_eq!(result.steps_completed, 1);
        assert_eq!(result.steps_failed, 1);
        assert_eq!(result.errors, vec!["Step 1 (Click a): flaky".to_string()]);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_exhausted_aborts_with_original_error() {
        let task = Task::new(
            "t",
            "retry",
            vec![
                click("a", ErrorPolicy::Retry).with_retries(1),
                click("b", ErrorPolicy::Continue),
            ],
        );
        let executor =
            Scripted::default().script("a", vec![Err("first".into()), Err("second".into())]);

        let failure = run(&task, &executor, &Observer::new()).await.unwrap_err();

        assert!(matches!(
            &failure.error,
            EngineError::StepExecution { index: 1, reason, .. } if reason == "first"
        ));
        let partial = failure.result.unwrap();
        assert_eq!(partial.steps_failed, 1);
        assert_eq!(partial.steps_completed, 0);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn retry_exhausted_continues_when_task_allows() {
        let task = Task::new(
            "t",
            "retry",
            vec![
                click("a", ErrorPolicy::Retry).with_retries(0),
                click("b", ErrorPolicy::Continue),
            ],
        )
        .with_settings(TaskSettings {
            continue_on_error: true,
            ..TaskSettings::default()
        });
        let executor = Scripted::default().script("a", vec![Err("nope".into())]);

        let result = run(&task, &executor, &Observer::new()).await.unwrap();

        assert!(result.success);
        assert_eq!(result.steps_failed, 1);
        assert_eq!(result.steps_completed, 1);
    }

    #[tokio::test]
    async fn stop_task_wins_over_continue_on_error() {
        let task = Task::new(
            "t",
            "stop",
            vec![
                click("a", ErrorPolicy::StopTask),
                click("b", ErrorPolicy::Continue),
            ],
        )
        .with_settings(TaskSettings {
            continue_on_error: true,
            ..TaskSettings::default()
        });
        let executor = Scripted::default().script("a", vec![Err("boom".into())]);

        let failure = run(&task, &executor, &Observer::new()).await.unwrap_err();

        let partial = failure.result.unwrap();
        assert_eq!(partial.errors, vec!["Step 1 (Click a): boom".to_string()]);
        assert!(!partial.success);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn skip_counts_failed_and_skipped() {
        let task = Task::new(
            "t",
            "skip",
            vec![
                click("a", ErrorPolicy::Skip),
                click("b", ErrorPolicy::Continue),
            ],
        );
        let executor = Scripted::default().script("a", vec![Err("missing".into())]);

        let result = run(&task, &executor, &Observer::new()).await.unwrap();

        assert_eq!(result.steps_failed, 1);
        assert_eq!(result.steps_skipped, 1);
        assert_eq!(result.steps_completed, 1);
        assert!(!result.success);
    }

    #[tokio::test]
    async fn continue_policy_aborts_without_task_override() {
        let task = Task::new(
            "t",
            "continue",
            vec![
                click("a", ErrorPolicy::Continue),
                click("b", ErrorPolicy::Continue),
            ],
        );
        let executor = Scripted::default().script("a", vec![Err("err".into())]);

        let failure = run(&task, &executor, &Observer::new()).await.unwrap_err();
        assert!(matches!(failure.error, EngineError::StepExecution { .. }));
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_stops_the_loop() {
        let task = Task::new(
            "t",
            "cancel",
            vec![
                click("a", ErrorPolicy::Continue),
                click("b", ErrorPolicy::Continue),
                click("c", ErrorPolicy::Continue),
            ],
        );
        let executor = Scripted::default();
        let observer = Observer {
            cancel_after_steps: Some(1),
            ..Observer::new()
        };

        let failure = run(&task, &executor, &observer).await.unwrap_err();

        assert!(matches!(failure.error, EngineError::Cancelled { .. }));
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn human_pacing_sleeps_between_steps() {
        let task = Task::new(
            "t",
            "paced",
            vec![
                click("a", ErrorPolicy::Continue),
                click("b", ErrorPolicy::Continue),
            ],
        )
        .with_settings(TaskSettings {
            human_behavior: true,
            random_delay: true,
            delay_min_ms: 20,
            delay_max_ms: 30,
            ..TaskSettings::default()
        });

        let start = Instant::now();
        let result = run(&task, &Scripted::default(), &Observer::new()).await.unwrap();

        assert!(start.elapsed() >= Duration::from_millis(20));
        assert_eq!(result.steps_completed, 2);
    }
}
