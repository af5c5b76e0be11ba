//! Execution engine: job queueing, dispatch, retries and cancellation.
//!
//! The engine owns the [`JobQueue`] and the live [`WorkerPool`] behind one
//! lock. Dispatch requests go through an unbounded channel drained by a
//! dedicated scheduler task, so `queue_task` and job completion never call
//! back into the dispatcher directly. Each dispatched job runs on its own
//! Tokio task and reports back through [`EngineJobHandle`].

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::{RwLock, broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::events::{EngineEvent, EventBus, EventHandlers, SubscriptionId, WorkerChange};
use super::executor::StepExecutor;
use super::job::{ExecutionResult, Job, JobProgress};
use super::monitor::spawn_health_monitor;
use super::queue::{JobQueue, QueueSnapshot, QueueStats};
use super::runner::{JobFailure, JobObserver, StepRunner};
use super::state::JobStatus;
use super::worker::{Worker, WorkerPool};
use crate::config::EngineConfig;
use crate::error::{ConfigError, EngineError};
use crate::task::{ProfileRef, ProfileStore, TaskStore};

/// Collaborators the engine resolves work through.
#[derive(Clone)]
pub struct EngineDeps {
    pub tasks: Arc<dyn TaskStore>,
    pub profiles: Arc<dyn ProfileStore>,
    pub executor: Arc<dyn StepExecutor>,
}

/// Shared mutable state. Only touched under `EngineInner::state`.
struct EngineState {
    queue: JobQueue,
    workers: WorkerPool,
    paused: bool,
    shut_down: bool,
}

impl EngineState {
    fn snapshot(&self) -> QueueSnapshot {
        self.queue.snapshot(self.workers.snapshot(), self.paused)
    }
}

pub(crate) struct EngineInner {
    config: EngineConfig,
    deps: EngineDeps,
    state: RwLock<EngineState>,
    events: EventBus,
    dispatch_tx: mpsc::UnboundedSender<()>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to a running engine. Cheap to clone; all clones share one queue.
#[derive(Clone)]
pub struct ExecutionEngine {
    inner: Arc<EngineInner>,
}

impl ExecutionEngine {
    /// Build the engine and spawn its scheduler and health-monitor tasks.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(config: EngineConfig, deps: EngineDeps) -> Result<Self, ConfigError> {
        config.validate()?;

        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(EngineInner {
            state: RwLock::new(EngineState {
                queue: JobQueue::new(config.concurrency_limit),
                workers: WorkerPool::new(),
                paused: false,
                shut_down: false,
            }),
            events: EventBus::new(config.event_capacity),
            dispatch_tx,
            background: Mutex::new(Vec::new()),
            deps,
            config,
        });

        let dispatcher = tokio::spawn(dispatch_loop(Arc::downgrade(&inner), dispatch_rx));
        let monitor = spawn_health_monitor(
            Arc::downgrade(&inner),
            inner.config.heartbeat_check_interval,
        );
        inner
            .background
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend([dispatcher, monitor]);

        info!(
            concurrency_limit = inner.config.concurrency_limit,
            "Execution engine started"
        );

        Ok(Self { inner })
    }

    /// Create one job per profile and schedule dispatch.
    ///
    /// Returns the job ids in profile order. Never waits for execution.
    pub async fn queue_task(
        &self,
        task_id: &str,
        profiles: &[ProfileRef],
        priority: i32,
    ) -> Result<Vec<Uuid>, EngineError> {
        self.inner.queue_task(task_id, profiles, priority).await
    }

    /// Cancel a queued or running job. Returns false if the job is unknown
    /// or already finished.
    pub async fn cancel_job(&self, job_id: Uuid) -> bool {
        self.inner.cancel_job(job_id).await
    }

    /// Dispatch as many pending jobs as capacity allows. Returns how many
    /// were started. Normally driven by the scheduler task.
    pub async fn process_queue(&self) -> usize {
        self.inner.process_queue().await
    }

    pub async fn get_queue_status(&self) -> QueueSnapshot {
        self.inner.state.read().await.snapshot()
    }

    pub async fn stats(&self) -> QueueStats {
        let state = self.inner.state.read().await;
        state.queue.stats(state.workers.len(), state.paused)
    }

    pub async fn get_job(&self, job_id: Uuid) -> Option<Job> {
        self.inner.state.read().await.queue.get(job_id).cloned()
    }

    /// Set the limit (minimum 1). Raising it dispatches immediately; lowering
    /// it only throttles future dispatch. Returns the applied limit.
    pub async fn set_concurrency_limit(&self, limit: usize) -> usize {
        let (applied, snapshot) = {
            let mut state = self.inner.state.write().await;
            let applied = state.queue.set_concurrency_limit(limit);
            (applied, state.snapshot())
        };
        info!(concurrency_limit = applied, "Concurrency limit updated");
        self.inner.events.emit(EngineEvent::QueueUpdated { queue: snapshot });
        self.inner.request_dispatch();
        applied
    }

    /// Stop dispatching new jobs. Running jobs finish normally.
    pub async fn pause_queue(&self) {
        let snapshot = {
            let mut state = self.inner.state.write().await;
            state.paused = true;
            state.snapshot()
        };
        info!("Queue paused");
        self.inner.events.emit(EngineEvent::QueueUpdated { queue: snapshot });
    }

    pub async fn resume_queue(&self) {
        let snapshot = {
            let mut state = self.inner.state.write().await;
            state.paused = false;
            state.snapshot()
        };
        info!("Queue resumed");
        self.inner.events.emit(EngineEvent::QueueUpdated { queue: snapshot });
        self.inner.request_dispatch();
    }

    /// Register observer callbacks.
    pub fn subscribe(&self, handlers: EventHandlers) -> SubscriptionId {
        self.inner.events.subscribe(handlers)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.events.unsubscribe(id)
    }

    /// Broadcast stream of engine events.
    pub fn events(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.receiver()
    }

    /// Destroy workers whose heartbeat is stale. Returns the reaped ids.
    pub async fn reap_stale_workers(&self) -> Vec<Uuid> {
        self.inner.reap_stale_workers().await
    }

    /// Drop cancelled jobs from the job map.
    pub async fn purge_cancelled(&self) -> usize {
        self.inner.state.write().await.queue.purge_cancelled()
    }

    /// Wait until nothing is pending or running, polling at `poll`.
    pub async fn wait_idle(&self, poll: Duration) {
        loop {
            {
                let state = self.inner.state.read().await;
                if state.queue.pending_len() == 0 && state.queue.running_len() == 0 {
                    return;
                }
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Cancel every queued and running job, destroy all workers and stop
    /// background tasks. Completed and failed history is kept.
    pub async fn shutdown(&self) {
        self.inner.shutdown().await
    }
}

/// Scheduler task: drains dispatch requests, coalescing bursts.
async fn dispatch_loop(engine: Weak<EngineInner>, mut rx: mpsc::UnboundedReceiver<()>) {
    while rx.recv().await.is_some() {
        while rx.try_recv().is_ok() {}

        let Some(engine) = engine.upgrade() else {
            break;
        };
        engine.process_queue().await;
    }
    debug!("Scheduler loop stopped");
}

/// Outcome of a finished run, decided under the state lock.
#[derive(Debug, Clone, Copy)]
enum Settled {
    Completed,
    Retrying,
    Failed,
    Discarded,
}

impl EngineInner {
    fn request_dispatch(&self) {
        // Receiver is gone only after shutdown
        let _ = self.dispatch_tx.send(());
    }

    async fn queue_task(
        &self,
        task_id: &str,
        profiles: &[ProfileRef],
        priority: i32,
    ) -> Result<Vec<Uuid>, EngineError> {
        if profiles.is_empty() {
            return Err(EngineError::NoProfiles);
        }

        let task = self
            .deps
            .tasks
            .get_task(task_id)
            .await?
            .ok_or_else(|| EngineError::TaskNotFound {
                id: task_id.to_string(),
            })?;
        let max_retries = task
            .settings
            .max_retries
            .unwrap_or(self.config.default_max_retries);
        let total_steps = task.total_steps();

        let (jobs, snapshot) = {
            let mut state = self.state.write().await;
            if state.shut_down {
                return Err(EngineError::ShutDown);
            }

            let jobs: Vec<Job> = profiles
                .iter()
                .map(|profile| {
                    let mut job = Job::new(task_id, profile, priority, max_retries);
                    job.progress.total_steps = total_steps;
                    job
                })
                .collect();
            for job in &jobs {
                state.queue.enqueue(job.clone());
            }
            state.queue.sort_pending();
            (jobs, state.snapshot())
        };

        info!(
            task_id = %task_id,
            jobs = jobs.len(),
            priority,
            pending = snapshot.pending.len(),
            "Task queued"
        );

        let ids = jobs.iter().map(|j| j.id).collect();
        for job in jobs {
            self.events.emit(EngineEvent::JobUpdated { job });
        }
        self.events.emit(EngineEvent::QueueUpdated { queue: snapshot });
        self.request_dispatch();

        Ok(ids)
    }

    async fn process_queue(self: &Arc<Self>) -> usize {
        let mut dispatched: Vec<(Job, Worker)> = Vec::new();
        let mut abandoned: Vec<Job> = Vec::new();

        let snapshot = {
            let mut state = self.state.write().await;
            if state.paused || state.shut_down {
                return 0;
            }

            let available = state.queue.available_slots(state.workers.len());
            let count = available.min(state.queue.pending_len());
            if count == 0 {
                return 0;
            }

            let EngineState { queue, workers, .. } = &mut *state;
            for job_id in queue.dequeue(count) {
                let Some(job) = queue.get_mut(job_id) else {
                    continue;
                };

                match workers.create(job_id, &job.profile_id, &self.config.worker_capabilities) {
                    Ok(worker) => {
                        if let Err(reason) =
                            job.transition_to(JobStatus::Running, Some("dispatched".to_string()))
                        {
                            warn!(job_id = %job_id, "{reason}");
                            workers.destroy(worker.id);
                            continue;
                        }
                        job.worker_id = Some(worker.id);
                        job.progress = JobProgress {
                            total_steps: job.progress.total_steps,
                            ..JobProgress::default()
                        };
                        job.error = None;
                        let job = job.clone();
                        queue.mark_running(job_id);
                        dispatched.push((job, worker));
                    }
                    Err(e) => {
                        error!(
                            job_id = %job_id,
                            error = %e,
                            "Worker creation failed, abandoning job"
                        );
                        job.error = Some(e.to_string());
                        if let Err(reason) =
                            job.transition_to(JobStatus::Failed, Some("no worker".to_string()))
                        {
                            warn!(job_id = %job_id, "{reason}");
                        }
                        let job = job.clone();
                        queue.push_failed(job_id);
                        abandoned.push(job);
                    }
                }
            }

            state.snapshot()
        };

        let started = dispatched.len();
        for (job, worker) in dispatched {
            info!(
                job_id = %job.id,
                worker_id = %worker.id,
                profile_id = %job.profile_id,
                attempt = job.retry_count + 1,
                "Job dispatched"
            );
            let (job_id, worker_id) = (job.id, worker.id);
            self.events.emit(EngineEvent::WorkerUpdated {
                worker,
                change: WorkerChange::Created,
            });
            self.events.emit(EngineEvent::JobUpdated { job });
            tokio::spawn(Arc::clone(self).run_job(job_id, worker_id));
        }
        for job in abandoned {
            self.events.emit(EngineEvent::JobUpdated { job });
        }
        self.events.emit(EngineEvent::QueueUpdated { queue: snapshot });

        started
    }

    async fn run_job(self: Arc<Self>, job_id: Uuid, worker_id: Uuid) {
        let outcome = AssertUnwindSafe(self.execute_job(job_id, worker_id))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| {
                let reason = panic_message(payload.as_ref());
                error!(job_id = %job_id, reason = %reason, "Job execution panicked");
                Err(EngineError::Panicked { id: job_id, reason }.into())
            });
        self.settle_job(job_id, worker_id, outcome).await;

        tokio::time::sleep(self.config.requeue_delay).await;
        self.request_dispatch();
    }

    async fn execute_job(
        self: &Arc<Self>,
        job_id: Uuid,
        worker_id: Uuid,
    ) -> Result<ExecutionResult, JobFailure> {
        let (task_id, profile_id) = {
            let state = self.state.read().await;
            let job = state
                .queue
                .get(job_id)
                .ok_or(EngineError::JobNotFound { id: job_id })?;
            (job.task_id.clone(), job.profile_id.clone())
        };

        let task = self
            .deps
            .tasks
            .get_task(&task_id)
            .await
            .map_err(EngineError::from)?
            .ok_or(EngineError::TaskNotFound { id: task_id })?;
        task.validate().map_err(EngineError::from)?;
        let profile = self
            .deps
            .profiles
            .get_profile(&profile_id)
            .await
            .map_err(EngineError::from)?
            .ok_or(EngineError::ProfileNotFound { id: profile_id })?;

        let handle = EngineJobHandle {
            engine: Arc::clone(self),
            job_id,
            worker_id,
        };
        StepRunner {
            job_id,
            task: &task,
            profile: &profile,
            executor: self.deps.executor.as_ref(),
            observer: &handle,
            retry_delay: self.config.step_retry_delay,
        }
        .run()
        .await
    }

    /// Apply a run's outcome: complete, re-queue for retry, or fail for good.
    async fn settle_job(
        &self,
        job_id: Uuid,
        worker_id: Uuid,
        outcome: Result<ExecutionResult, JobFailure>,
    ) {
        let (settled, job, worker, snapshot) = {
            let mut state = self.state.write().await;
            let EngineState { queue, workers, .. } = &mut *state;
            let worker = workers.destroy(worker_id);

            let settled = match queue.get_mut(job_id) {
                None => Settled::Discarded,
                Some(job) if job.status != JobStatus::Running => Settled::Discarded,
                Some(job) => {
                    job.worker_id = None;
                    match outcome {
                        Ok(result) => {
                            job.result = Some(result);
                            transition(job, JobStatus::Completed, None);
                            Settled::Completed
                        }
                        Err(failure) => {
                            let message = failure.error.to_string();
                            if failure.result.is_some() {
                                job.result = failure.result;
                            }
                            job.error = Some(message.clone());
                            transition(job, JobStatus::Failed, Some(message));
                            if job.can_retry() {
                                job.retry_count += 1;
                                transition(job, JobStatus::Queued, Some("retry".to_string()));
                                Settled::Retrying
                            } else {
                                Settled::Failed
                            }
                        }
                    }
                }
            };

            match settled {
                Settled::Completed => {
                    queue.remove_running(job_id);
                    queue.push_completed(job_id);
                }
                Settled::Retrying => {
                    queue.remove_running(job_id);
                    queue.requeue_front(job_id);
                }
                Settled::Failed => {
                    queue.remove_running(job_id);
                    queue.push_failed(job_id);
                }
                Settled::Discarded => {}
            }

            let job = queue.get(job_id).cloned();
            (settled, job, worker, state.snapshot())
        };

        if let Some(job) = &job {
            match settled {
                Settled::Completed => info!(
                    job_id = %job_id,
                    elapsed_ms = job.elapsed_ms().unwrap_or_default(),
                    "Job completed"
                ),
                Settled::Retrying => warn!(
                    job_id = %job_id,
                    attempt = job.retry_count,
                    max_retries = job.max_retries,
                    error = job.error.as_deref().unwrap_or_default(),
                    "Job failed, re-queued for retry"
                ),
                Settled::Failed => error!(
                    job_id = %job_id,
                    error = job.error.as_deref().unwrap_or_default(),
                    "{}",
                    EngineError::JobRetryExhausted {
                        id: job_id,
                        attempts: job.retry_count + 1,
                    }
                ),
                Settled::Discarded => debug!(
                    job_id = %job_id,
                    status = %job.status,
                    "Discarding result of job that is no longer running"
                ),
            }
        }

        if let Some(worker) = worker {
            self.events.emit(EngineEvent::WorkerUpdated {
                worker,
                change: WorkerChange::Destroyed,
            });
        }
        if let Some(job) = job
            && !matches!(settled, Settled::Discarded)
        {
            self.events.emit(EngineEvent::JobUpdated { job });
        }
        self.events.emit(EngineEvent::QueueUpdated { queue: snapshot });
    }

    async fn cancel_job(&self, job_id: Uuid) -> bool {
        let (job, worker, snapshot) = {
            let mut state = self.state.write().await;
            let EngineState { queue, workers, .. } = &mut *state;

            let Some(job) = queue.get_mut(job_id) else {
                return false;
            };
            if let Err(reason) =
                job.transition_to(JobStatus::Cancelled, Some("cancelled".to_string()))
            {
                debug!(job_id = %job_id, "{reason}");
                return false;
            }
            job.worker_id = None;
            let job = job.clone();

            queue.remove_pending(job_id);
            queue.remove_running(job_id);
            let worker = workers.destroy_for_job(job_id);
            (job, worker, state.snapshot())
        };

        info!(job_id = %job_id, had_worker = worker.is_some(), "Job cancelled");

        if let Some(worker) = worker {
            self.events.emit(EngineEvent::WorkerUpdated {
                worker,
                change: WorkerChange::Destroyed,
            });
        }
        self.events.emit(EngineEvent::JobUpdated { job });
        self.events.emit(EngineEvent::QueueUpdated { queue: snapshot });
        self.request_dispatch();
        true
    }

    pub(crate) async fn reap_stale_workers(&self) -> Vec<Uuid> {
        let (reaped, snapshot) = {
            let mut state = self.state.write().await;
            let stale = state.workers.stale(self.config.stale_worker_threshold);
            if stale.is_empty() {
                return Vec::new();
            }
            let reaped: Vec<Worker> = stale
                .into_iter()
                .filter_map(|id| state.workers.destroy(id))
                .collect();
            (reaped, state.snapshot())
        };

        let ids = reaped.iter().map(|w| w.id).collect();
        for worker in reaped {
            warn!(
                worker_id = %worker.id,
                job_id = %worker.current_job,
                last_heartbeat = %worker.last_heartbeat,
                "Reaped stale worker"
            );
            self.events.emit(EngineEvent::WorkerUpdated {
                worker,
                change: WorkerChange::Reaped,
            });
        }
        self.events.emit(EngineEvent::QueueUpdated { queue: snapshot });
        self.request_dispatch();
        ids
    }

    async fn shutdown(&self) {
        let (cancelled, workers, snapshot) = {
            let mut state = self.state.write().await;
            state.shut_down = true;

            let EngineState { queue, workers, .. } = &mut *state;
            let mut cancelled = Vec::new();
            for job_id in queue.pending_ids().into_iter().chain(queue.running_ids()) {
                queue.remove_pending(job_id);
                queue.remove_running(job_id);
                if let Some(job) = queue.get_mut(job_id) {
                    transition(job, JobStatus::Cancelled, Some("shutdown".to_string()));
                    job.worker_id = None;
                    cancelled.push(job.clone());
                }
            }
            let workers = workers.drain();
            (cancelled, workers, state.snapshot())
        };

        for handle in self
            .background
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
        {
            handle.abort();
        }

        info!(
            cancelled = cancelled.len(),
            workers = workers.len(),
            "Execution engine shut down"
        );

        for worker in workers {
            self.events.emit(EngineEvent::WorkerUpdated {
                worker,
                change: WorkerChange::Destroyed,
            });
        }
        for job in cancelled {
            self.events.emit(EngineEvent::JobUpdated { job });
        }
        self.events.emit(EngineEvent::QueueUpdated { queue: snapshot });
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Apply a transition, logging instead of panicking if it is illegal.
fn transition(job: &mut Job, status: JobStatus, reason: Option<String>) {
    if let Err(e) = job.transition_to(status, reason) {
        warn!(job_id = %job.id, "{e}");
    }
}

/// Runner-facing view of one dispatched job.
struct EngineJobHandle {
    engine: Arc<EngineInner>,
    job_id: Uuid,
    worker_id: Uuid,
}

#[async_trait]
impl JobObserver for EngineJobHandle {
    async fn step_started(&self, progress: JobProgress) -> bool {
        let job = {
            let mut state = self.engine.state.write().await;
            let EngineState { queue, workers, .. } = &mut *state;
            let Some(job) = queue.get_mut(self.job_id) else {
                return false;
            };
            if job.status != JobStatus::Running {
                return false;
            }
            job.progress = progress;
            workers.heartbeat(self.worker_id);
            job.clone()
        };

        debug!(
            job_id = %self.job_id,
            step = job.progress.current_step,
            total = job.progress.total_steps,
            step_name = job.progress.step_name.as_deref().unwrap_or_default(),
            "Step started"
        );
        self.engine.events.emit(EngineEvent::JobUpdated { job });
        true
    }

    async fn heartbeat(&self) -> bool {
        let mut state = self.engine.state.write().await;
        // A reaped worker stays gone; its job keeps running until it ends.
        state.workers.heartbeat(self.worker_id);
        state
            .queue
            .get(self.job_id)
            .is_some_and(|job| job.status == JobStatus::Running)
    }
}
