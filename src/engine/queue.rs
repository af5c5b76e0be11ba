//! Job queue aggregate.
//!
//! Owns every tracked job plus the lifecycle lists that reference them.
//! A job id lives in at most one of `pending`, `running`, `completed` and
//! `failed`; cancelled jobs stay in the job map but in none of the lists.
//! All mutation happens under the engine's state lock.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::job::Job;
use super::state::JobStatus;
use super::worker::Worker;

/// Lifecycle lists plus the concurrency limit.
#[derive(Debug)]
pub struct JobQueue {
    jobs: HashMap<Uuid, Job>,
    pending: VecDeque<Uuid>,
    running: Vec<Uuid>,
    completed: Vec<Uuid>,
    failed: Vec<Uuid>,
    concurrency_limit: usize,
}

impl JobQueue {
    pub fn new(concurrency_limit: usize) -> Self {
        Self {
            jobs: HashMap::new(),
            pending: VecDeque::new(),
            running: Vec::new(),
            completed: Vec::new(),
            failed: Vec::new(),
            concurrency_limit: concurrency_limit.max(1),
        }
    }

    /// Clamp to at least 1 and return the applied limit.
    pub fn set_concurrency_limit(&mut self, limit: usize) -> usize {
        self.concurrency_limit = limit.max(1);
        self.concurrency_limit
    }

    /// Slots left given the number of live workers.
    pub fn available_slots(&self, active_workers: usize) -> usize {
        self.concurrency_limit.saturating_sub(active_workers)
    }

    /// Track a new job at the back of `pending`.
    pub fn enqueue(&mut self, job: Job) {
        self.pending.push_back(job.id);
        self.jobs.insert(job.id, job);
    }

    /// Stable sort of `pending` by priority, highest first.
    pub fn sort_pending(&mut self) {
        let jobs = &self.jobs;
        self.pending.make_contiguous().sort_by(|a, b| {
            let pa = jobs.get(a).map_or(i32::MIN, |j| j.priority);
            let pb = jobs.get(b).map_or(i32::MIN, |j| j.priority);
            pb.cmp(&pa)
        });
    }

    /// Put a retried job at the very front of `pending`, ahead of any
    /// priority ordering.
    pub fn requeue_front(&mut self, id: Uuid) {
        if !self.pending.contains(&id) {
            self.pending.push_front(id);
        }
    }

    /// Pop up to `n` ids from the front of `pending`.
    pub fn dequeue(&mut self, n: usize) -> Vec<Uuid> {
        let n = n.min(self.pending.len());
        self.pending.drain(..n).collect()
    }

    pub fn mark_running(&mut self, id: Uuid) {
        if !self.running.contains(&id) {
            self.running.push(id);
        }
    }

    pub fn remove_pending(&mut self, id: Uuid) -> bool {
        let before = self.pending.len();
        self.pending.retain(|p| *p != id);
        before != self.pending.len()
    }

    pub fn remove_running(&mut self, id: Uuid) -> bool {
        let before = self.running.len();
        self.running.retain(|r| *r != id);
        before != self.running.len()
    }

    pub fn push_completed(&mut self, id: Uuid) {
        self.completed.push(id);
    }

    pub fn push_failed(&mut self, id: Uuid) {
        self.failed.push(id);
    }

    pub fn get(&self, id: Uuid) -> Option<&Job> {
        self.jobs.get(&id)
    }

    pub fn get_mut(&mut self, id: Uuid) -> Option<&mut Job> {
        self.jobs.get_mut(&id)
    }

    pub fn pending_ids(&self) -> Vec<Uuid> {
        self.pending.iter().copied().collect()
    }

    pub fn running_ids(&self) -> Vec<Uuid> {
        self.running.clone()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn running_len(&self) -> usize {
        self.running.len()
    }

    pub fn total_processed(&self) -> usize {
        self.completed.len() + self.failed.len()
    }

    /// Drop cancelled jobs from the job map. Returns how many were removed.
    pub fn purge_cancelled(&mut self) -> usize {
        let before = self.jobs.len();
        self.jobs.retain(|_, job| job.status != JobStatus::Cancelled);
        before - self.jobs.len()
    }

    fn collect(&self, ids: impl IntoIterator<Item = Uuid>) -> Vec<Job> {
        ids.into_iter()
            .filter_map(|id| self.jobs.get(&id).cloned())
            .collect()
    }

    /// Read-only copy of the queue.
    pub fn snapshot(&self, workers: Vec<Worker>, paused: bool) -> QueueSnapshot {
        QueueSnapshot {
            pending: self.collect(self.pending.iter().copied()),
            running: self.collect(self.running.iter().copied()),
            completed: self.collect(self.completed.iter().copied()),
            failed: self.collect(self.failed.iter().copied()),
            workers,
            concurrency_limit: self.concurrency_limit,
            total_processed: self.total_processed(),
            paused,
        }
    }

    /// Counts only.
    pub fn stats(&self, active_workers: usize, paused: bool) -> QueueStats {
        QueueStats {
            pending: self.pending.len(),
            running: self.running.len(),
            completed: self.completed.len(),
            failed: self.failed.len(),
            cancelled: self
                .jobs
                .values()
                .filter(|j| j.status == JobStatus::Cancelled)
                .count(),
            workers: active_workers,
            concurrency_limit: self.concurrency_limit,
            total_processed: self.total_processed(),
            paused,
        }
    }
}

/// Deep copy of the queue handed to observers and callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSnapshot {
    /// Waiting jobs in dispatch order
    pub pending: Vec<Job>,
    /// Jobs dispatched and not yet settled
    pub running: Vec<Job>,
    pub completed: Vec<Job>,
    /// Jobs that failed with no retries left
    pub failed: Vec<Job>,
    /// Live workers, oldest first
    pub workers: Vec<Worker>,
    pub concurrency_limit: usize,
    /// Completed plus permanently failed
    pub total_processed: usize,
    /// Whether dispatch is paused
    pub paused: bool,
}

/// Queue counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub workers: usize,
    pub concurrency_limit: usize,
    pub total_processed: usize,
    pub paused: bool,
}
