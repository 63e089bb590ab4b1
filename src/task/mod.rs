//! Tasks — the unit of work submitted to a [`Pool`](crate::pool::Pool).
//!
//! This module provides the task-level primitives:
//! [`TaskId`], [`TaskError`], [`TaskErrorKind`], and the single-settle
//! [`Completer`] / [`CompletionHandle`] pair in [`completion`].

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;

pub mod completion;

pub use completion::{Completer, CompletionHandle};

/// Identifier of a submitted task.
///
/// Ids are allocated from a per-pool counter and are never reused for the
/// lifetime of that pool.
///
/// # Examples
///
/// ```
/// use rttp_pool::TaskId;
///
/// let id = TaskId::from_raw(7);
/// assert_eq!(id.as_u64(), 7);
/// assert_eq!(id.to_string(), "task-7");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(u64);

impl TaskId {
    /// Wraps a raw numeric id.
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the numeric id.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// The category of a task failure.
///
/// Serialized with the canonical error names (`"ValidationError"`,
/// `"PoolClosedError"`, ...) so they can be relayed to clients unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskErrorKind {
    /// The payload was rejected before it was queued.
    #[serde(rename = "ValidationError")]
    Validation,
    /// The pool was shutting down or closed.
    #[serde(rename = "PoolClosedError")]
    PoolClosed,
    /// The execution unit reported a fault while processing the payload.
    #[serde(rename = "WorkerExecutionError")]
    WorkerExecution,
    /// The execution unit terminated without reporting a result or a fault.
    #[serde(rename = "WorkerCrashError")]
    WorkerCrash,
    /// The task was still running when the shutdown drain bound elapsed.
    #[serde(rename = "ShutdownTimeoutError")]
    ShutdownTimeout,
    /// The task was removed from the queue before it was assigned.
    #[serde(rename = "CancelledError")]
    Cancelled,
    /// Every worker slot has been retired; nothing can run the task.
    #[serde(rename = "CapacityExhaustedError")]
    CapacityExhausted,
}

impl TaskErrorKind {
    /// Returns the canonical error name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "ValidationError",
            Self::PoolClosed => "PoolClosedError",
            Self::WorkerExecution => "WorkerExecutionError",
            Self::WorkerCrash => "WorkerCrashError",
            Self::ShutdownTimeout => "ShutdownTimeoutError",
            Self::Cancelled => "CancelledError",
            Self::CapacityExhausted => "CapacityExhaustedError",
        }
    }
}

impl fmt::Display for TaskErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A task failure: a [`TaskErrorKind`] plus a human-readable message.
///
/// Serializes as `{"kind": "...", "message": "..."}`.
///
/// # Examples
///
/// ```
/// use rttp_pool::{TaskError, TaskErrorKind};
///
/// let err = TaskError::cancelled("removed from queue");
/// assert_eq!(err.kind(), TaskErrorKind::Cancelled);
/// assert_eq!(err.to_string(), "CancelledError: removed from queue");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct TaskError {
    kind: TaskErrorKind,
    message: String,
}

impl TaskError {
    /// Creates an error of the given kind.
    pub fn new(kind: TaskErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(TaskErrorKind::Validation, message)
    }

    pub fn pool_closed(message: impl Into<String>) -> Self {
        Self::new(TaskErrorKind::PoolClosed, message)
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::new(TaskErrorKind::WorkerExecution, message)
    }

    pub fn crash(message: impl Into<String>) -> Self {
        Self::new(TaskErrorKind::WorkerCrash, message)
    }

    pub fn shutdown_timeout(message: impl Into<String>) -> Self {
        Self::new(TaskErrorKind::ShutdownTimeout, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(TaskErrorKind::Cancelled, message)
    }

    pub fn capacity_exhausted(message: impl Into<String>) -> Self {
        Self::new(TaskErrorKind::CapacityExhausted, message)
    }

    /// Returns the failure category.
    pub fn kind(&self) -> TaskErrorKind {
        self.kind
    }

    /// Returns the failure message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// A submitted unit of work, owned by the pool until it settles.
///
/// The payload is moved out when the task is assigned to a worker; the
/// [`Completer`] stays with the pool's in-flight bookkeeping.
pub(crate) struct Task<P, R> {
    pub(crate) id: TaskId,
    pub(crate) payload: P,
    pub(crate) submitted_at: Instant,
    pub(crate) completer: Completer<R>,
}

impl<P, R> Task<P, R> {
    /// Creates a pending task and the handle its submitter will await.
    pub(crate) fn new(id: TaskId, payload: P) -> (Self, CompletionHandle<R>) {
        let (completer, handle) = completion::channel(id);
        let task = Self {
            id,
            payload,
            submitted_at: Instant::now(),
            completer,
        };
        (task, handle)
    }
}
