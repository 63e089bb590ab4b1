//! Single-settle completion channel.
//!
//! Every task gets exactly one [`Completer`] (kept by the pool) and one
//! [`CompletionHandle`] (returned to the submitter). Settling consumes the
//! completer, so a task cannot be settled twice: the second attempt does not
//! type-check.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use super::{TaskError, TaskId};

type Outcome<R> = Result<R, TaskError>;

/// Creates a linked completer/handle pair for the given task.
pub(crate) fn channel<R>(id: TaskId) -> (Completer<R>, CompletionHandle<R>) {
    let (tx, rx) = oneshot::channel();
    (Completer { id, tx }, CompletionHandle { id, rx })
}

/// The settling side of a task's completion channel.
///
/// Dropping a `Completer` without settling it resolves the handle with a
/// [`PoolClosed`](super::TaskErrorKind::PoolClosed) error, so an awaiting
/// caller is never left hanging.
#[derive(Debug)]
pub struct Completer<R> {
    id: TaskId,
    tx: oneshot::Sender<Outcome<R>>,
}

impl<R> Completer<R> {
    /// Returns the id of the task this completer settles.
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Settles the task with `outcome`.
    ///
    /// Returns `false` if the submitter already dropped its handle; the
    /// outcome is discarded in that case.
    pub fn settle(self, outcome: Outcome<R>) -> bool {
        self.tx.send(outcome).is_ok()
    }

    /// Settles the task with a result.
    pub fn succeed(self, result: R) -> bool {
        self.settle(Ok(result))
    }

    /// Settles the task with an error.
    pub fn fail(self, error: TaskError) -> bool {
        self.settle(Err(error))
    }
}

/// The awaiting side of a task's completion channel.
///
/// Resolves to the task's result or its [`TaskError`]. Awaiting is optional:
/// dropping the handle does not cancel the task.
///
/// # Examples
///
/// ```rust,no_run
/// use rttp_pool::{Pool, PoolConfig};
///
/// # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
/// let pool: Pool<u32, u32> = Pool::new(PoolConfig::default(), |n: u32| async move {
///     Ok::<_, String>(n + 1)
/// })?;
/// let handle = pool.schedule(1)?;
/// println!("scheduled {}", handle.id());
/// assert_eq!(handle.await?, 2);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
#[must_use = "a completion handle does nothing unless awaited"]
pub struct CompletionHandle<R> {
    id: TaskId,
    rx: oneshot::Receiver<Outcome<R>>,
}

impl<R> CompletionHandle<R> {
    /// Returns the id of the task behind this handle.
    pub fn id(&self) -> TaskId {
        self.id
    }
}

impl<R> Future for CompletionHandle<R> {
    type Output = Outcome<R>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let id = self.id;
        Pin::new(&mut self.rx).poll(cx).map(|received| match received {
            Ok(outcome) => outcome,
            Err(_) => Err(TaskError::pool_closed(format!(
                "{id} was abandoned before it settled"
            ))),
        })
    }
}
