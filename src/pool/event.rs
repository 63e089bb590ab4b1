//! Typed pool events.
//!
//! Every state change the dispatcher makes is published as a [`PoolEvent`] on
//! a Tokio broadcast channel. Subscribers obtain a receiver with
//! [`Pool::subscribe`](super::Pool::subscribe); a subscriber that falls more
//! than `event_capacity` events behind sees `RecvError::Lagged` and skips
//! ahead. Publishing never blocks the dispatcher.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::task::{TaskErrorKind, TaskId};
use crate::worker::WorkerId;

/// A state change inside the pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PoolEvent {
    /// No worker was idle; the task joined the queue at `position` (0-based).
    Queued { task_id: TaskId, position: usize },
    /// The task was handed to a worker.
    Assigned { task_id: TaskId, worker_id: WorkerId },
    /// The task's handle settled. `error` is `None` on success.
    Settled {
        task_id: TaskId,
        worker_id: Option<WorkerId>,
        error: Option<TaskErrorKind>,
    },
    /// A worker's execution unit terminated without reporting.
    WorkerCrashed {
        worker_id: WorkerId,
        task_id: Option<TaskId>,
        reason: String,
    },
    /// A crashed worker received a fresh execution unit.
    WorkerReplaced { worker_id: WorkerId },
    /// A crashed worker was taken out of service.
    WorkerRetired { worker_id: WorkerId },
    /// Shutdown began: `rejected` queued tasks were settled, `in_flight` are draining.
    ShutdownStarted { rejected: usize, in_flight: usize },
    /// The pool closed; `forced` lists tasks settled with a shutdown timeout.
    Closed { forced: Vec<TaskId> },
}

/// The explicit subscriber list behind [`PoolEvent`] delivery.
#[derive(Debug, Clone)]
pub(crate) struct EventBus {
    tx: broadcast::Sender<PoolEvent>,
}

impl EventBus {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.tx.subscribe()
    }

    /// Publishes to current subscribers. Having none is not an error.
    pub(crate) fn publish(&self, event: PoolEvent) {
        let _ = self.tx.send(event);
    }
}
