//! Bounded worker pool with FIFO overflow queueing.
//!
//! [`Pool`] owns a fixed set of workers, each wrapping one execution unit
//! that runs a [`TaskHandler`]. Submissions never block: [`Pool::schedule`]
//! returns a [`CompletionHandle`] immediately, and the task is either handed
//! to the first idle worker (in fixed slot order) or appended to the queue.
//!
//! ## Lifecycle
//!
//! ```text
//! Running ──shutdown()──▶ ShuttingDown ──drained or timed out──▶ Closed
//! ```
//!
//! Transitions are one-way. Once shutdown begins, queued tasks are rejected
//! with `PoolClosedError`, in-flight tasks get up to the caller's bound to
//! finish, and whatever is still running afterwards is settled with
//! `ShutdownTimeoutError` before every execution unit is terminated.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use crate::task::{CompletionHandle, TaskError, TaskErrorKind, TaskId};
use crate::worker::{ReportSink, TaskHandler, UnitFactory, UnitReport};

pub mod config;
mod dispatcher;
pub mod event;

pub use config::{PoolConfig, RespawnPolicy};
pub use event::PoolEvent;

use dispatcher::{Dispatcher, Settlement};
use event::EventBus;

/// Errors produced by pool-level operations.
///
/// Task-level failures are reported as [`TaskError`] instead.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("invalid pool configuration for {key}: {message}")]
    InvalidConfig { key: &'static str, message: String },

    #[error("a worker pool must be created inside a tokio runtime")]
    NoRuntime,

    #[error("pool is not running (currently {0})")]
    NotRunning(Lifecycle),
}

/// Pool lifecycle state. Moves forward only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    /// Accepting and running tasks.
    Running,
    /// Rejecting new tasks while in-flight ones drain.
    ShuttingDown,
    /// Every execution unit has been terminated.
    Closed,
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::ShuttingDown => "shutting down",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of the pool's occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    /// Configured number of worker slots.
    pub pool_size: usize,
    /// Workers waiting for an assignment.
    pub idle: usize,
    /// Workers running a task.
    pub active: usize,
    /// Tasks waiting for a worker.
    pub queued: usize,
}

/// Outcome of [`Pool::shutdown`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShutdownReport {
    /// Tasks that were still running when the drain bound elapsed, in id order.
    pub forced_task_ids: Vec<TaskId>,
}

/// Payload check run by [`Pool::schedule`] before a task is created.
pub type Validator<P> = Arc<dyn Fn(&P) -> Result<(), String> + Send + Sync>;

/// State shared between the pool handle and its execution units.
struct Shared<P, R> {
    dispatcher: Mutex<Dispatcher<P, R>>,
}

impl<P, R> Shared<P, R> {
    /// Runs one event against the dispatcher, then delivers the settlements
    /// it produced after the lock is released.
    fn with<T>(&self, event: impl FnOnce(&mut Dispatcher<P, R>) -> T) -> T {
        let mut dispatcher = self.lock();
        let output = event(&mut dispatcher);
        let settled = dispatcher.commit();
        drop(dispatcher);
        deliver(settled);
        output
    }

    /// Reads dispatcher state without applying an event. Nothing is committed.
    fn inspect<T>(&self, read: impl FnOnce(&Dispatcher<P, R>) -> T) -> T {
        read(&self.lock())
    }

    fn lock(&self) -> MutexGuard<'_, Dispatcher<P, R>> {
        match self.dispatcher.lock() {
            Ok(guard) => guard,
            Err(_) => {
                error!("worker pool dispatcher lock poisoned");
                panic!("worker pool bookkeeping corrupted; the process must restart");
            }
        }
    }

    /// Like [`with`](Self::with), but gives up quietly on a poisoned lock.
    fn try_with<T>(&self, event: impl FnOnce(&mut Dispatcher<P, R>) -> T) -> Option<T> {
        let mut dispatcher = self.dispatcher.lock().ok()?;
        let output = event(&mut dispatcher);
        let settled = dispatcher.commit();
        drop(dispatcher);
        deliver(settled);
        Some(output)
    }
}

impl<P, R> ReportSink<R> for Shared<P, R>
where
    P: Send + 'static,
    R: Send + 'static,
{
    fn report(&self, report: UnitReport<R>) {
        self.with(|dispatcher| dispatcher.on_report(report));
    }
}

fn deliver<R>(settled: Vec<Settlement<R>>) {
    for (completer, outcome) in settled {
        let task_id = completer.id();
        if !completer.settle(outcome) {
            debug!(%task_id, "submitter dropped its handle, outcome discarded");
        }
    }
}

/// A bounded pool of workers running a [`TaskHandler`].
///
/// `P` is the payload type, `R` the result type.
///
/// # Examples
///
/// ```rust,no_run
/// use std::time::Duration;
/// use rttp_pool::{Pool, PoolConfig};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let pool: Pool<String, usize> = Pool::new(PoolConfig::default().with_size(2), |s: String| async move {
///         Ok::<_, String>(s.len())
///     })?;
///
///     let handle = pool.schedule("hello".to_string())?;
///     assert_eq!(handle.await?, 5);
///
///     let report = pool.shutdown(Duration::from_secs(5)).await?;
///     assert!(report.forced_task_ids.is_empty());
///     Ok(())
/// }
/// ```
pub struct Pool<P, R> {
    shared: Arc<Shared<P, R>>,
    validator: Option<Validator<P>>,
    stats: watch::Receiver<PoolStats>,
    events: EventBus,
    config: PoolConfig,
}

impl<P, R> Pool<P, R>
where
    P: Send + 'static,
    R: Send + 'static,
{
    /// Creates a pool running `handler` with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::InvalidConfig`] if `config` fails validation and
    /// [`PoolError::NoRuntime`] when called outside a Tokio runtime.
    pub fn new<H>(config: PoolConfig, handler: H) -> Result<Self, PoolError>
    where
        H: TaskHandler<P, R>,
    {
        Self::builder(handler).config(config).build()
    }

    /// Starts building a pool around `handler`.
    pub fn builder<H>(handler: H) -> PoolBuilder<P, R>
    where
        H: TaskHandler<P, R>,
    {
        PoolBuilder {
            handler: Arc::new(handler),
            config: PoolConfig::default(),
            validator: None,
        }
    }

    /// Submits `payload` and returns its completion handle without waiting.
    ///
    /// # Errors
    ///
    /// Fails fast, without creating a task, with
    ///
    /// - [`TaskErrorKind::Validation`] if the validator rejects the payload,
    /// - [`TaskErrorKind::PoolClosed`] once shutdown has begun,
    /// - [`TaskErrorKind::CapacityExhausted`] if every worker was retired.
    pub fn schedule(&self, payload: P) -> Result<CompletionHandle<R>, TaskError> {
        if let Some(validate) = &self.validator {
            if let Err(message) = validate(&payload) {
                debug!(%message, "payload rejected");
                return Err(TaskError::validation(message));
            }
        }
        self.shared.with(|dispatcher| dispatcher.submit(payload))
    }
}

impl<P, R> Pool<P, R> {
    /// Cancels a task that is still waiting in the queue.
    ///
    /// The task's handle settles with `CancelledError`. Returns `false` if the
    /// task is not queued (already assigned, settled, or unknown).
    pub fn cancel(&self, task_id: TaskId) -> bool {
        self.shared.with(|dispatcher| dispatcher.cancel(task_id))
    }

    /// Returns the latest occupancy snapshot. Never waits on the dispatcher.
    pub fn stats(&self) -> PoolStats {
        *self.stats.borrow()
    }

    /// Subscribes to [`PoolEvent`]s published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    /// Returns the current lifecycle state.
    pub fn lifecycle(&self) -> Lifecycle {
        self.shared.inspect(|dispatcher| dispatcher.lifecycle())
    }

    /// Returns the configuration the pool was built with.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Shuts the pool down, waiting up to `timeout` for in-flight tasks.
    ///
    /// Queued tasks are rejected immediately with `PoolClosedError`. Tasks
    /// still running when `timeout` elapses are settled with
    /// `ShutdownTimeoutError` and reported in
    /// [`ShutdownReport::forced_task_ids`].
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::NotRunning`] if shutdown was already requested.
    pub async fn shutdown(&self, timeout: Duration) -> Result<ShutdownReport, PoolError> {
        let in_flight = self
            .shared
            .with(|dispatcher| dispatcher.begin_shutdown())?;

        let mut stats = self.stats.clone();
        let drained = tokio::time::timeout(timeout, async move {
            let idle = stats.wait_for(|s| s.active == 0).await.is_ok();
            idle
        })
        .await
        .unwrap_or(false);

        if !drained {
            warn!(
                in_flight,
                timeout_ms = config::saturating_millis(timeout),
                "shutdown drain bound elapsed, terminating workers"
            );
        }

        let forced_task_ids = self.shared.with(|dispatcher| {
            dispatcher.close(
                TaskErrorKind::ShutdownTimeout,
                "task was still running when the shutdown drain bound elapsed",
            )
        });
        Ok(ShutdownReport { forced_task_ids })
    }

    /// Shuts down with the configured [`PoolConfig::shutdown_timeout`].
    pub async fn close(&self) -> Result<ShutdownReport, PoolError> {
        self.shutdown(self.config.shutdown_timeout).await
    }
}

impl<P, R> Drop for Pool<P, R> {
    fn drop(&mut self) {
        let closed = self.shared.try_with(|dispatcher| {
            if dispatcher.lifecycle() == Lifecycle::Closed {
                return false;
            }
            dispatcher.close(TaskErrorKind::PoolClosed, "pool was dropped");
            true
        });
        if closed == Some(true) {
            info!("pool dropped without shutdown, workers terminated");
        }
    }
}

/// Builder for [`Pool`].
///
/// # Examples
///
/// ```rust,no_run
/// use rttp_pool::{Pool, RespawnPolicy};
///
/// # fn demo() -> Result<(), rttp_pool::PoolError> {
/// let pool: Pool<u64, u64> = Pool::builder(|n: u64| async move { Ok::<_, String>(n * n) })
///     .size(4)
///     .respawn(RespawnPolicy::Retire)
///     .validator(|n: &u64| if *n > 1_000 { Err("too large".to_string()) } else { Ok(()) })
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct PoolBuilder<P, R> {
    handler: Arc<dyn TaskHandler<P, R>>,
    config: PoolConfig,
    validator: Option<Validator<P>>,
}

impl<P, R> PoolBuilder<P, R>
where
    P: Send + 'static,
    R: Send + 'static,
{
    /// Replace the whole configuration
    pub fn config(mut self, config: PoolConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the number of worker slots
    pub fn size(mut self, size: usize) -> Self {
        self.config.size = size;
        self
    }

    /// Set the crash replacement policy
    pub fn respawn(mut self, respawn: RespawnPolicy) -> Self {
        self.config.respawn = respawn;
        self
    }

    /// Reject payloads before they are queued.
    pub fn validator<V>(mut self, validator: V) -> Self
    where
        V: Fn(&P) -> Result<(), String> + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(validator));
        self
    }

    /// Spawns the workers and returns the running pool.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::InvalidConfig`] if the configuration fails
    /// validation and [`PoolError::NoRuntime`] outside a Tokio runtime.
    pub fn build(self) -> Result<Pool<P, R>, PoolError> {
        let Self {
            handler,
            config,
            validator,
        } = self;
        config.validate()?;
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(PoolError::NoRuntime);
        }

        let events = EventBus::new(config.event_capacity);
        let (stats_tx, stats) = watch::channel(PoolStats {
            pool_size: config.size,
            idle: config.size,
            ..PoolStats::default()
        });

        let shared = Arc::new_cyclic(|weak: &Weak<Shared<P, R>>| {
            let sink: Weak<dyn ReportSink<R>> = weak.clone();
            let factory = UnitFactory::new(handler, sink);
            Shared {
                dispatcher: Mutex::new(Dispatcher::new(
                    config.size,
                    config.respawn,
                    factory,
                    events.clone(),
                    stats_tx,
                )),
            }
        });

        info!(size = config.size, respawn = ?config.respawn, "worker pool started");
        Ok(Pool {
            shared,
            validator,
            stats,
            events,
            config,
        })
    }
}
