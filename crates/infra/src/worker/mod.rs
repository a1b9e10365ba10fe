//! Task workers: consume task messages and drive requests to a terminal state.
//!
//! ## Components
//!
//! - `TaskWorker`: processes one task message (claim, generate, persist, notify)
//! - `WorkerPool`: N concurrent consumer loops feeding a shared `TaskWorker`,
//!   acking on success and nacking on infrastructure failure

pub mod pool;
pub mod task_worker;

pub use pool::{PoolStats, WorkerPool, WorkerPoolConfig, WorkerPoolHandle};
pub use task_worker::{HandleOutcome, TaskWorker, WorkerError, WorkerSettings};
