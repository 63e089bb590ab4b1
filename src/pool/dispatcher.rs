//! The single owner of scheduling state.
//!
//! [`Dispatcher`] holds the worker table, the FIFO queue and the in-flight
//! map together. Every event (submission, completion, crash, cancellation,
//! shutdown) is one `&mut self` call, and the pool only ever reaches the
//! dispatcher through one mutex, so no interleaving can hand the same idle
//! worker to two tasks.
//!
//! Handles are not settled while the lock is held. Each event queues its
//! settlements; [`Dispatcher::commit`] publishes the new [`PoolStats`] and
//! hands them back to be delivered once the lock is released. A caller woken
//! by its handle therefore always observes the post-event snapshot.

use std::collections::{HashMap, VecDeque};
use std::mem;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::config::RespawnPolicy;
use super::event::{EventBus, PoolEvent};
use super::{Lifecycle, PoolError, PoolStats};
use crate::task::{Completer, CompletionHandle, Task, TaskError, TaskErrorKind, TaskId};
use crate::worker::{UnitFactory, UnitReport, Worker, WorkerId, WorkerState};

/// A handle settlement deferred until the dispatcher lock is released.
pub(crate) type Settlement<R> = (Completer<R>, Result<R, TaskError>);

struct InFlight<R> {
    completer: Completer<R>,
    worker: WorkerId,
}

pub(crate) struct Dispatcher<P, R> {
    workers: Vec<Worker<P>>,
    queue: VecDeque<Task<P, R>>,
    in_flight: HashMap<TaskId, InFlight<R>>,
    lifecycle: Lifecycle,
    next_id: u64,
    respawn: RespawnPolicy,
    factory: UnitFactory<P, R>,
    events: EventBus,
    stats: watch::Sender<PoolStats>,
    settled: Vec<Settlement<R>>,
}

impl<P, R> Dispatcher<P, R>
where
    P: Send + 'static,
    R: Send + 'static,
{
    /// Spawns `size` workers. Must be called inside a Tokio runtime.
    pub(crate) fn new(
        size: usize,
        respawn: RespawnPolicy,
        factory: UnitFactory<P, R>,
        events: EventBus,
        stats: watch::Sender<PoolStats>,
    ) -> Self {
        let workers = (0..size)
            .map(|index| Worker::spawn(WorkerId::new(index), &factory))
            .collect();
        Self {
            workers,
            queue: VecDeque::new(),
            in_flight: HashMap::new(),
            lifecycle: Lifecycle::Running,
            next_id: 1,
            respawn,
            factory,
            events,
            stats,
            settled: Vec::new(),
        }
    }

    /// Creates a task for `payload`, assigning it to the first idle worker or
    /// appending it to the queue.
    pub(crate) fn submit(&mut self, payload: P) -> Result<CompletionHandle<R>, TaskError> {
        if self.lifecycle != Lifecycle::Running {
            return Err(TaskError::pool_closed(format!(
                "pool is {}, not accepting tasks",
                self.lifecycle
            )));
        }
        if !self.workers.iter().any(Worker::is_live) {
            return Err(TaskError::capacity_exhausted(
                "every worker slot has been retired",
            ));
        }

        let task_id = TaskId::from_raw(self.next_id);
        self.next_id += 1;
        let (task, handle) = Task::new(task_id, payload);
        self.queue.push_back(task);

        if self.first_idle().is_some() {
            self.drain_queue();
        } else {
            let position = self.queue.len() - 1;
            debug!(%task_id, position, "no idle worker, task queued");
            self.events.publish(PoolEvent::Queued { task_id, position });
        }
        Ok(handle)
    }

    /// Applies a report from an execution unit.
    pub(crate) fn on_report(&mut self, report: UnitReport<R>) {
        match report {
            UnitReport::Finished {
                worker,
                generation,
                task_id,
                outcome,
            } => self.on_finished(worker, generation, task_id, outcome),
            UnitReport::Exited {
                worker,
                generation,
                reason,
            } => self.on_exited(worker, generation, reason),
        }
    }

    fn on_finished(
        &mut self,
        worker_id: WorkerId,
        generation: u64,
        task_id: TaskId,
        outcome: Result<R, String>,
    ) {
        let Some(index) = self.current(worker_id, generation) else {
            debug!(%worker_id, %task_id, generation, "ignoring report from a stale unit");
            return;
        };
        if self.workers[index].state() != WorkerState::Busy(task_id) {
            debug!(%worker_id, %task_id, "ignoring report for a task the worker no longer runs");
            return;
        }
        self.workers[index].release();

        let Some(entry) = self.in_flight.remove(&task_id) else {
            corrupted(&format!("{worker_id} finished {task_id} with no in-flight entry"));
        };
        let outcome = outcome.map_err(TaskError::execution);
        debug!(%task_id, %worker_id, ok = outcome.is_ok(), "task finished");
        self.settle(task_id, Some(entry.worker), entry.completer, outcome);

        if self.lifecycle == Lifecycle::Running {
            self.drain_queue();
        }
    }

    fn on_exited(&mut self, worker_id: WorkerId, generation: u64, reason: String) {
        if self.lifecycle == Lifecycle::Closed {
            return;
        }
        let Some(index) = self.current(worker_id, generation) else {
            debug!(%worker_id, generation, "ignoring exit of a stale unit");
            return;
        };
        self.recover(index, reason);
        if self.lifecycle == Lifecycle::Running {
            self.drain_queue();
        }
    }

    /// Assigns queued tasks, oldest first, until no worker is idle or the
    /// queue is empty.
    fn drain_queue(&mut self) {
        while let Some(index) = self.first_idle() {
            let Some(task) = self.queue.pop_front() else {
                break;
            };
            self.dispatch(index, task);
        }

        if !self.queue.is_empty() && !self.workers.iter().any(Worker::is_live) {
            let rejected = self.reject_queue(
                TaskErrorKind::CapacityExhausted,
                "every worker slot has been retired",
            );
            error!(rejected, "no live workers remain, queued tasks rejected");
        }
    }

    fn dispatch(&mut self, index: usize, task: Task<P, R>) {
        let Task {
            id: task_id,
            payload,
            submitted_at,
            completer,
        } = task;

        let worker = &mut self.workers[index];
        let worker_id = worker.id();
        match worker.assign(task_id, payload) {
            Ok(()) => {
                debug!(%task_id, %worker_id, waited = ?submitted_at.elapsed(), "task assigned");
                self.in_flight.insert(
                    task_id,
                    InFlight {
                        completer,
                        worker: worker_id,
                    },
                );
                self.events
                    .publish(PoolEvent::Assigned { task_id, worker_id });
            }
            Err(payload) => {
                // The unit died before its watcher reported it. Put the task
                // back in front so it keeps its place.
                self.queue.push_front(Task {
                    id: task_id,
                    payload,
                    submitted_at,
                    completer,
                });
                self.recover(index, "execution unit was gone at assignment".to_string());
            }
        }
    }

    /// Handles the loss of worker `index`'s execution unit: settles its task
    /// as crashed and applies the respawn policy.
    fn recover(&mut self, index: usize, reason: String) {
        let worker_id = self.workers[index].id();
        let task_id = self.workers[index].release();
        warn!(%worker_id, task_id = ?task_id, %reason, "execution unit crashed");

        if let Some(task_id) = task_id {
            match self.in_flight.remove(&task_id) {
                Some(entry) => self.settle(
                    task_id,
                    Some(worker_id),
                    entry.completer,
                    Err(TaskError::crash(reason.clone())),
                ),
                None => corrupted(&format!(
                    "{worker_id} crashed on {task_id} with no in-flight entry"
                )),
            }
        }
        self.events.publish(PoolEvent::WorkerCrashed {
            worker_id,
            task_id,
            reason,
        });

        if self.lifecycle == Lifecycle::Running && self.respawn == RespawnPolicy::Replace {
            let worker = &mut self.workers[index];
            worker.replace(&self.factory);
            info!(%worker_id, generation = worker.generation(), "execution unit replaced");
            self.events.publish(PoolEvent::WorkerReplaced { worker_id });
        } else {
            self.workers[index].retire();
            let live = self.workers.iter().filter(|w| w.is_live()).count();
            warn!(%worker_id, live, "worker retired");
            self.events.publish(PoolEvent::WorkerRetired { worker_id });
        }
    }

    /// Returns the index of `worker_id` if `generation` is its current unit.
    fn current(&self, worker_id: WorkerId, generation: u64) -> Option<usize> {
        let index = worker_id.index();
        let worker = self.workers.get(index)?;
        (worker.generation() == generation).then_some(index)
    }
}

impl<P, R> Dispatcher<P, R> {
    pub(crate) fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub(crate) fn stats(&self) -> PoolStats {
        let mut stats = PoolStats {
            pool_size: self.workers.len(),
            queued: self.queue.len(),
            ..PoolStats::default()
        };
        for worker in &self.workers {
            match worker.state() {
                WorkerState::Idle => stats.idle += 1,
                WorkerState::Busy(_) => stats.active += 1,
                WorkerState::Retired => {}
            }
        }
        stats
    }

    /// Publishes the current snapshot and returns the settlements queued by
    /// the events applied since the last commit.
    pub(crate) fn commit(&mut self) -> Vec<Settlement<R>> {
        self.stats.send_replace(self.stats());
        mem::take(&mut self.settled)
    }

    /// Removes a still-queued task and settles it as cancelled.
    pub(crate) fn cancel(&mut self, task_id: TaskId) -> bool {
        let Some(position) = self.queue.iter().position(|task| task.id == task_id) else {
            return false;
        };
        let Some(task) = self.queue.remove(position) else {
            return false;
        };
        debug!(%task_id, position, "queued task cancelled");
        self.settle(
            task_id,
            None,
            task.completer,
            Err(TaskError::cancelled(format!(
                "{task_id} was cancelled before assignment"
            ))),
        );
        true
    }

    /// Stops accepting tasks and rejects everything still queued.
    ///
    /// Returns the number of tasks left in flight.
    pub(crate) fn begin_shutdown(&mut self) -> Result<usize, PoolError> {
        if self.lifecycle != Lifecycle::Running {
            return Err(PoolError::NotRunning(self.lifecycle));
        }
        self.lifecycle = Lifecycle::ShuttingDown;

        let rejected = self.reject_queue(TaskErrorKind::PoolClosed, "pool is shutting down");
        let in_flight = self.in_flight.len();
        info!(rejected, in_flight, "pool shutting down");
        self.events
            .publish(PoolEvent::ShutdownStarted { rejected, in_flight });
        Ok(in_flight)
    }

    /// Rejects the queue, settles every in-flight task with `kind`, terminates
    /// every execution unit and marks the pool closed.
    ///
    /// Returns the ids of the in-flight tasks that were force-settled.
    pub(crate) fn close(&mut self, kind: TaskErrorKind, message: &str) -> Vec<TaskId> {
        if self.lifecycle == Lifecycle::Closed {
            return Vec::new();
        }
        self.reject_queue(TaskErrorKind::PoolClosed, message);

        let mut forced: Vec<TaskId> = self.in_flight.keys().copied().collect();
        forced.sort_unstable();
        for &task_id in &forced {
            if let Some(entry) = self.in_flight.remove(&task_id) {
                warn!(%task_id, worker_id = %entry.worker, %kind, "in-flight task force-settled");
                self.settle(
                    task_id,
                    Some(entry.worker),
                    entry.completer,
                    Err(TaskError::new(kind, message)),
                );
            }
        }

        for worker in &mut self.workers {
            worker.retire();
        }
        self.lifecycle = Lifecycle::Closed;
        info!(forced = forced.len(), "pool closed");
        self.events.publish(PoolEvent::Closed {
            forced: forced.clone(),
        });
        forced
    }

    fn first_idle(&self) -> Option<usize> {
        self.workers.iter().position(Worker::is_idle)
    }

    fn reject_queue(&mut self, kind: TaskErrorKind, message: &str) -> usize {
        let rejected: Vec<Task<P, R>> = self.queue.drain(..).collect();
        let count = rejected.len();
        for task in rejected {
            self.settle(
                task.id,
                None,
                task.completer,
                Err(TaskError::new(kind, message)),
            );
        }
        count
    }

    fn settle(
        &mut self,
        task_id: TaskId,
        worker_id: Option<WorkerId>,
        completer: Completer<R>,
        outcome: Result<R, TaskError>,
    ) {
        let error = outcome.as_ref().err().map(TaskError::kind);
        self.events.publish(PoolEvent::Settled {
            task_id,
            worker_id,
            error,
        });
        self.settled.push((completer, outcome));
    }
}

/// Last-resort guard for a violated bookkeeping invariant.
///
/// Panicking while the dispatcher lock is held poisons it, which turns every
/// later pool operation into the same fatal condition.
fn corrupted(what: &str) -> ! {
    error!(what, "worker pool bookkeeping corrupted");
    panic!("worker pool bookkeeping corrupted: {what}");
}
