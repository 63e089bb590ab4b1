//! # rttp-pool
//!
//! A bounded async worker pool: a fixed number of isolated execution units,
//! FIFO overflow queueing, one single-settle completion handle per task, crash
//! recovery, and graceful drain-on-shutdown.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use rttp_pool::{Pool, PoolConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let pool: Pool<u64, u64> = Pool::new(PoolConfig::default().with_size(2), |n: u64| async move {
//!         Ok::<_, String>(n * 2)
//!     })?;
//!
//!     let handle = pool.schedule(21)?;
//!     println!("{} -> {}", handle.id(), handle.await?);
//!     println!("{:?}", pool.stats());
//!
//!     pool.shutdown(Duration::from_secs(5)).await?;
//!     Ok(())
//! }
//! ```

// ── Task model ────────────────────────────────────────────────────────────────
pub mod task;

// ── Worker slots and the execution-unit contract ──────────────────────────────
pub mod worker;

// ── Dispatcher, configuration, and events ─────────────────────────────────────
pub mod pool;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use pool::{
    Lifecycle, Pool, PoolBuilder, PoolConfig, PoolError, PoolEvent, PoolStats, RespawnPolicy,
    ShutdownReport,
};
pub use task::{CompletionHandle, TaskError, TaskErrorKind, TaskId};
pub use worker::{TaskHandler, WorkerId, WorkerState};
