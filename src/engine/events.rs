//! Engine events and observer fan-out.
//!
//! Observers either register callbacks with [`EventBus::subscribe`] (and
//! later drop them with the returned [`SubscriptionId`]) or consume the
//! broadcast stream from [`EventBus::receiver`]. Every event carries owned
//! copies of engine state, never the live objects.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::job::Job;
use super::queue::QueueSnapshot;
use super::worker::Worker;

/// Why a worker update was emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerChange {
    Created,
    Destroyed,
    /// Destroyed by the health monitor after a stale heartbeat.
    Reaped,
}

/// State-change notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    JobUpdated { job: Job },
    WorkerUpdated {
        worker: Worker,
        change: WorkerChange,
    },
    QueueUpdated { queue: QueueSnapshot },
}

impl EngineEvent {
    /// Event type name (matches the serde tag).
    pub fn kind(&self) -> &'static str {
        match self {
            Self::JobUpdated { .. } => "job_updated",
            Self::WorkerUpdated { .. } => "worker_updated",
            Self::QueueUpdated { .. } => "queue_updated",
        }
    }
}

pub type JobHandler = Arc<dyn Fn(&Job) + Send + Sync>;
pub type WorkerHandler = Arc<dyn Fn(&Worker, WorkerChange) + Send + Sync>;
pub type QueueHandler = Arc<dyn Fn(&QueueSnapshot) + Send + Sync>;

/// Callback set registered by one observer. Unset callbacks are skipped.
#[derive(Clone, Default)]
pub struct EventHandlers {
    pub on_job_update: Option<JobHandler>,
    pub on_worker_update: Option<WorkerHandler>,
    pub on_queue_update: Option<QueueHandler>,
}

impl EventHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_job_update(mut self, f: impl Fn(&Job) + Send + Sync + 'static) -> Self {
        self.on_job_update = Some(Arc::new(f));
        self
    }

    pub fn on_worker_update(
        mut self,
        f: impl Fn(&Worker, WorkerChange) + Send + Sync + 'static,
    ) -> Self {
        self.on_worker_update = Some(Arc::new(f));
        self
    }

    pub fn on_queue_update(mut self, f: impl Fn(&QueueSnapshot) + Send + Sync + 'static) -> Self {
        self.on_queue_update = Some(Arc::new(f));
        self
    }

    fn dispatch(&self, event: &EngineEvent) {
        match event {
            EngineEvent::JobUpdated { job } => {
                if let Some(f) = &self.on_job_update {
                    f(job);
                }
            }
            EngineEvent::WorkerUpdated { worker, change } => {
                if let Some(f) = &self.on_worker_update {
                    f(worker, *change);
                }
            }
            EngineEvent::QueueUpdated { queue } => {
                if let Some(f) = &self.on_queue_update {
                    f(queue);
                }
            }
        }
    }
}

impl std::fmt::Debug for EventHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHandlers")
            .field("on_job_update", &self.on_job_update.is_some())
            .field("on_worker_update", &self.on_worker_update.is_some())
            .field("on_queue_update", &self.on_queue_update.is_some())
            .finish()
    }
}

/// Token returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(u64);

/// Publish/subscribe hub for engine events.
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
    subscribers: RwLock<Vec<(SubscriptionId, EventHandlers)>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            subscribers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a callback set.
    pub fn subscribe(&self, handlers: EventHandlers) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, handlers));
        id
    }

    /// Remove a callback set. Returns false if the id was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write().unwrap_or_else(|e| e.into_inner());
        let before = subscribers.len();
        subscribers.retain(|(sub, _)| *sub != id);
        before != subscribers.len()
    }

    /// Stream of every event emitted from now on.
    pub fn receiver(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Deliver an event to callbacks, then to stream receivers.
    pub fn emit(&self, event: EngineEvent) {
        // Callbacks run outside the lock so a handler may (un)subscribe.
        let handlers: Vec<EventHandlers> = self
            .subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, h)| h.clone())
            .collect();

        for handler in &handlers {
            handler.dispatch(&event);
        }

        // Ok if nobody is listening
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use crate::engine::queue::JobQueue;
    use crate::task::ProfileRef;

    fn job_event() -> EngineEvent {
        EngineEvent::JobUpdated {
            job: Job::new("t", &ProfileRef::new("p", "P"), 1, 0),
        }
    }

    #[test]
    fn multiple_subscribers_each_receive() {
        let bus = EventBus::new(16);
        let a = Arc::new(AtomicUsize::new(0));
        let b = Arc::new(AtomicUsize::new(0));

        let a2 = a.clone();
        bus.subscribe(EventHandlers::new().on_job_update(move |_| {
            a2.fetch_add(1, Ordering::SeqCst);
        }));
        let b2 = b.clone();
        bus.subscribe(EventHandlers::new().on_job_update(move |_| {
            b2.fetch_add(1, Ordering::SeqCst);
        }));

        bus.emit(job_event());
        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = EventBus::new(16);
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let id = bus.subscribe(EventHandlers::new().on_job_update(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        }));

        bus.emit(job_event());
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.emit(job_event());

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handlers_only_see_their_event_type() {
        let bus = EventBus::new(16);
        let queue_updates = Arc::new(AtomicUsize::new(0));
        let q = queue_updates.clone();
        bus.subscribe(EventHandlers::new().on_queue_update(move |snapshot| {
            assert_eq!(snapshot.concurrency_limit, 2);
            q.fetch_add(1, Ordering::SeqCst);
        }));

        bus.emit(job_event());
        bus.emit(EngineEvent::QueueUpdated {
            queue: JobQueue::new(2).snapshot(Vec::new(), false),
        });

        assert_eq!(queue_updates.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn broadcast_receiver_gets_events() {
        let bus = EventBus::new(16);
        let mut rx = bus.receiver();

        bus.emit(job_event());

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind(), "job_updated");
    }

    #[test]
    fn event_serializes_with_type_tag() {
        let json = serde_json::to_value(job_event()).unwrap();
        assert_eq!(json["type"], "job_updated");
        assert_eq!(json["job"]["status"], "queued");
    }
}
