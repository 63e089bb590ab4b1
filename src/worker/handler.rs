//! The execution-unit contract.
//!
//! A [`TaskHandler`] is the code a worker's execution unit runs for each
//! payload. Given one payload it must eventually produce exactly one of:
//!
//! | Outcome             | Pool reaction                                     |
//! |---------------------|---------------------------------------------------|
//! | `Ok(result)`        | handle settles with `result`                      |
//! | `Err(fault)`        | handle settles with `WorkerExecutionError`        |
//! | panic               | unit terminates, handle settles with `WorkerCrashError` |

use std::fmt;
use std::future::Future;
use std::pin::Pin;

/// Boxed future returned by [`TaskHandler::call`]. The error side carries the
/// rendered fault message.
pub type HandlerFuture<R> = Pin<Box<dyn Future<Output = Result<R, String>> + Send>>;

/// Processes one payload at a time inside a worker's execution unit.
///
/// Any `Fn(P) -> impl Future<Output = Result<R, E>> + Send` where `E:
/// Display` implements this trait through the blanket impl below, so plain
/// async closures can be handed to [`Pool::new`](crate::pool::Pool::new).
///
/// # Examples
///
/// ```
/// use rttp_pool::worker::TaskHandler;
///
/// fn assert_handler<H: TaskHandler<String, usize>>(_: H) {}
///
/// assert_handler(|s: String| async move {
///     if s.is_empty() {
///         Err("empty input")
///     } else {
///         Ok(s.len())
///     }
/// });
/// ```
pub trait TaskHandler<P, R>: Send + Sync + 'static {
    /// Runs the handler for `payload`, boxing the returned future.
    fn call(&self, payload: P) -> HandlerFuture<R>;
}

impl<T, F, P, R, E> TaskHandler<P, R> for T
where
    T: Fn(P) -> F + Send + Sync + 'static,
    F: Future<Output = Result<R, E>> + Send + 'static,
    P: 'static,
    R: 'static,
    E: fmt::Display + 'static,
{
    fn call(&self, payload: P) -> HandlerFuture<R> {
        let fut = (self)(payload);
        Box::pin(async move { fut.await.map_err(|e| e.to_string()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn closure_result_passes_through() {
        let handler = |n: u32| async move { Ok::<_, String>(n * 3) };
        assert_eq!(TaskHandler::call(&handler, 4).await, Ok(12));
    }

    #[tokio::test]
    async fn closure_fault_is_rendered() {
        #[derive(Debug)]
        struct Fault(u32);

        impl fmt::Display for Fault {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "fault code {}", self.0)
            }
        }

        let handler = |n: u32| async move { Err::<u32, _>(Fault(n)) };
        assert_eq!(TaskHandler::call(&handler, 7).await, Err("fault code 7".to_string()));
    }
}
