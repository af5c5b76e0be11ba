//! Ephemeral execution slots.
//!
//! A worker exists only while its job runs: it is created right before
//! execution and destroyed right after, or when the health monitor finds its
//! heartbeat stale.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineError;

/// Workers are only ever busy; idle workers are destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Busy,
}

/// An execution slot bound to exactly one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    pub id: Uuid,
    pub status: WorkerStatus,
    /// The one job this worker runs
    pub current_job: Uuid,
    /// Profile the job executes against
    pub profile_id: String,
    pub started_at: DateTime<Utc>,
    /// Refreshed at each step start and finish
    pub last_heartbeat: DateTime<Utc>,
    /// What this worker can drive, e.g. `browser`
    pub capabilities: BTreeSet<String>,
}

impl Worker {
    /// Whether the last heartbeat is older than `threshold` at `now`.
    pub fn is_stale(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        now.signed_duration_since(self.last_heartbeat)
            .to_std()
            .map(|age| age > threshold)
            .unwrap_or(false)
    }
}

/// The live worker set.
#[derive(Debug, Default)]
pub struct WorkerPool {
    workers: HashMap<Uuid, Worker>,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a worker for `job_id`. A job can hold at most one worker.
    pub fn create(
        &mut self,
        job_id: Uuid,
        profile_id: &str,
        capabilities: &[String],
    ) -> Result<Worker, EngineError> {
        if let Some(existing) = self.workers.values().find(|w| w.current_job == job_id) {
            return Err(EngineError::WorkerCreation {
                job_id,
                reason: format!("job already bound to worker {}", existing.id),
            });
        }

        let now = Utc::now();
        let worker = Worker {
            id: Uuid::new_v4(),
            status: WorkerStatus::Busy,
            current_job: job_id,
            profile_id: profile_id.to_string(),
            started_at: now,
            last_heartbeat: now,
            capabilities: capabilities.iter().cloned().collect(),
        };
        self.workers.insert(worker.id, worker.clone());
        Ok(worker)
    }

    pub fn destroy(&mut self, worker_id: Uuid) -> Option<Worker> {
        self.workers.remove(&worker_id)
    }

    pub fn destroy_for_job(&mut self, job_id: Uuid) -> Option<Worker> {
        let worker_id = self
            .workers
            .values()
            .find(|w| w.current_job == job_id)
            .map(|w| w.id)?;
        self.workers.remove(&worker_id)
    }

    /// Refresh a worker's heartbeat. Returns false if it no longer exists.
    pub fn heartbeat(&mut self, worker_id: Uuid) -> bool {
        match self.workers.get_mut(&worker_id) {
            Some(worker) => {
                worker.last_heartbeat = Utc::now();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Ids of workers whose heartbeat is older than `threshold`.
    pub fn stale(&self, threshold: Duration) -> Vec<Uuid> {
        let now = Utc::now();
        self.workers
            .values()
            .filter(|w| w.is_stale(now, threshold))
            .map(|w| w.id)
            .collect()
    }

    pub fn drain(&mut self) -> Vec<Worker> {
        self.workers.drain().map(|(_, w)| w).collect()
    }

    /// Workers ordered by start time.
    pub fn snapshot(&self) -> Vec<Worker> {
        let mut workers: Vec<Worker> = self.workers.values().cloned().collect();
        workers.sort_by_key(|w| w.started_at);
        workers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps() -> Vec<String> {
        vec!["browser".to_string()]
    }

    #[test]
    fn create_binds_one_worker_per_job() {
        let mut pool = WorkerPool::new();
        let job_id = Uuid::new_v4();

        let worker = pool.create(job_id, "p1", &caps()).unwrap();
        assert_eq!(worker.current_job, job_id);
        assert_eq!(worker.status, WorkerStatus::Busy);
        assert!(worker.capabilities.contains("browser"));

        let err = pool.create(job_id, "p1", &caps()).unwrap_err();
        assert!(matches!(err, EngineError::WorkerCreation { .. }));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn destroy_by_id_and_job() {
        let mut pool = WorkerPool::new();
        let a = pool.create(Uuid::new_v4(), "p1", &caps()).unwrap();
        let b_job = Uuid::new_v4();
        pool.create(b_job, "p2", &caps()).unwrap();

        assert!(pool.destroy(a.id).is_some());
        assert!(pool.destroy(a.id).is_none());
        assert_eq!(pool.destroy_for_job(b_job).unwrap().profile_id, "p2");
        assert!(pool.is_empty());
    }

    #[test]
    fn stale_detection() {
        let mut pool = WorkerPool::new();
        let worker = pool.create(Uuid::new_v4(), "p1", &caps()).unwrap();
        assert!(pool.stale(Duration::from_secs(300)).is_empty());

        let old = Utc::now() - chrono::Duration::minutes(6);
        pool.workers.get_mut(&worker.id).unwrap().last_heartbeat = old;
        assert_eq!(pool.stale(Duration::from_secs(300)), vec![worker.id]);

        assert!(pool.heartbeat(worker.id));
        assert!(pool.stale(Duration::from_secs(300)).is_empty());
        pool.destroy(worker.id);
        assert!(!pool.heartbeat(worker.id));
    }

    #[test]
    fn future_heartbeat_is_not_stale() {
        let mut pool = WorkerPool::new();
        let worker = pool.create(Uuid::new_v4(), "p1", &caps()).unwrap();
        let earlier = Utc::now() - chrono::Duration::minutes(1);
        assert!(!worker.is_stale(earlier, Duration::ZERO));
    }
}
