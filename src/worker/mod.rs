//! Workers — pool slots wrapping one isolated execution unit each.
//!
//! An execution unit is a spawned Tokio task that receives one
//! [`Assignment`] at a time over an unbounded channel, runs the
//! [`TaskHandler`] on it, and reports the outcome back through a
//! [`ReportSink`]. A second "watcher" task awaits the unit's `JoinHandle` so
//! that a panic (or any other exit) is reported as [`UnitReport::Exited`].
//!
//! Reports carry the unit's generation. A slot's generation is bumped every
//! time its unit is replaced or retired, which lets the pool discard reports
//! from units it already gave up on.

use std::any::Any;
use std::fmt;
use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, trace};

use crate::task::TaskId;

pub mod handler;

pub use handler::{HandlerFuture, TaskHandler};

/// Position of a worker slot in the pool's fixed order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(usize);

impl WorkerId {
    pub(crate) fn new(index: usize) -> Self {
        Self(index)
    }

    /// Returns the slot index.
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Availability of a worker slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Waiting for an assignment.
    Idle,
    /// Running the given task.
    Busy(TaskId),
    /// The slot has no execution unit and never receives work again.
    Retired,
}

/// One payload handed to an execution unit.
pub(crate) struct Assignment<P> {
    pub(crate) task_id: TaskId,
    pub(crate) payload: P,
}

/// What an execution unit tells the pool.
#[derive(Debug)]
pub(crate) enum UnitReport<R> {
    /// The handler returned for `task_id`.
    Finished {
        worker: WorkerId,
        generation: u64,
        task_id: TaskId,
        outcome: Result<R, String>,
    },
    /// The unit stopped running without being asked to.
    Exited {
        worker: WorkerId,
        generation: u64,
        reason: String,
    },
}

/// Receiver of [`UnitReport`]s. Implemented by the pool's shared state.
pub(crate) trait ReportSink<R>: Send + Sync + 'static {
    fn report(&self, report: UnitReport<R>);
}

/// Spawns execution units that all run the same handler and report to the
/// same sink.
///
/// Units only hold a [`Weak`] reference to the sink, so a dropped pool is not
/// kept alive by its own workers.
pub(crate) struct UnitFactory<P, R> {
    handler: Arc<dyn TaskHandler<P, R>>,
    sink: Weak<dyn ReportSink<R>>,
}

impl<P, R> UnitFactory<P, R>
where
    P: Send + 'static,
    R: Send + 'static,
{
    pub(crate) fn new(handler: Arc<dyn TaskHandler<P, R>>, sink: Weak<dyn ReportSink<R>>) -> Self {
        Self { handler, sink }
    }

    /// Spawns a fresh unit for slot `worker`. Must be called inside a Tokio
    /// runtime.
    pub(crate) fn spawn(&self, worker: WorkerId, generation: u64) -> Unit<P> {
        let (tx, rx) = mpsc::unbounded_channel();
        let join = tokio::spawn(run_unit(
            worker,
            generation,
            rx,
            Arc::clone(&self.handler),
            self.sink.clone(),
        ));
        let abort = join.abort_handle();
        tokio::spawn(watch_unit(worker, generation, join, self.sink.clone()));
        trace!(%worker, generation, "execution unit spawned");
        Unit { tx, abort }
    }
}

/// A live execution unit. Dropping it terminates the underlying task.
pub(crate) struct Unit<P> {
    tx: mpsc::UnboundedSender<Assignment<P>>,
    abort: AbortHandle,
}

impl<P> Drop for Unit<P> {
    fn drop(&mut self) {
        self.abort.abort();
    }
}

/// A pool slot: identity, availability, and the current execution unit.
pub(crate) struct Worker<P> {
    id: WorkerId,
    state: WorkerState,
    generation: u64,
    unit: Option<Unit<P>>,
}

impl<P> Worker<P>
where
    P: Send + 'static,
{
    pub(crate) fn spawn<R: Send + 'static>(id: WorkerId, factory: &UnitFactory<P, R>) -> Self {
        Self {
            id,
            state: WorkerState::Idle,
            generation: 0,
            unit: Some(factory.spawn(id, 0)),
        }
    }

    /// Swaps in a freshly spawned unit and marks the slot idle.
    pub(crate) fn replace<R: Send + 'static>(&mut self, factory: &UnitFactory<P, R>) {
        self.generation += 1;
        self.unit = Some(factory.spawn(self.id, self.generation));
        self.state = WorkerState::Idle;
    }
}

impl<P> Worker<P> {
    pub(crate) fn id(&self) -> WorkerId {
        self.id
    }

    pub(crate) fn state(&self) -> WorkerState {
        self.state
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.state == WorkerState::Idle
    }

    pub(crate) fn is_live(&self) -> bool {
        self.state != WorkerState::Retired
    }

    /// Hands `payload` to the execution unit and marks the slot busy.
    ///
    /// Gives the payload back if the unit is gone; the slot stays idle.
    pub(crate) fn assign(&mut self, task_id: TaskId, payload: P) -> Result<(), P> {
        debug_assert!(self.is_idle(), "{} assigned while {:?}", self.id, self.state);
        let Some(unit) = &self.unit else {
            return Err(payload);
        };
        match unit.tx.send(Assignment { task_id, payload }) {
            Ok(()) => {
                self.state = WorkerState::Busy(task_id);
                Ok(())
            }
            Err(mpsc::error::SendError(assignment)) => Err(assignment.payload),
        }
    }

    /// Marks a busy slot idle again, returning the task it was running.
    pub(crate) fn release(&mut self) -> Option<TaskId> {
        match self.state {
            WorkerState::Busy(task_id) => {
                self.state = WorkerState::Idle;
                Some(task_id)
            }
            _ => None,
        }
    }

    /// Terminates the unit (if any) and takes the slot out of service.
    pub(crate) fn retire(&mut self) {
        self.generation += 1;
        self.unit = None;
        self.state = WorkerState::Retired;
    }
}

async fn run_unit<P: Send + 'static, R: Send + 'static>(
    worker: WorkerId,
    generation: u64,
    mut rx: mpsc::UnboundedReceiver<Assignment<P>>,
    handler: Arc<dyn TaskHandler<P, R>>,
    sink: Weak<dyn ReportSink<R>>,
) {
    while let Some(Assignment { task_id, payload }) = rx.recv().await {
        trace!(%worker, %task_id, "execution unit started task");
        let outcome = handler.call(payload).await;
        let Some(sink) = sink.upgrade() else {
            break;
        };
        sink.report(UnitReport::Finished {
            worker,
            generation,
            task_id,
            outcome,
        });
    }
}

async fn watch_unit<R: Send + 'static>(
    worker: WorkerId,
    generation: u64,
    join: JoinHandle<()>,
    sink: Weak<dyn ReportSink<R>>,
) {
    let reason = match join.await {
        Ok(()) => "execution unit exited without reporting".to_string(),
        Err(e) if e.is_cancelled() => {
            debug!(%worker, generation, "execution unit terminated");
            return;
        }
        Err(e) => format!("execution unit panicked: {}", panic_message(e.into_panic())),
    };
    if let Some(sink) = sink.upgrade() {
        sink.report(UnitReport::Exited {
            worker,
            generation,
            reason,
        });
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
