//! Infrastructure layer: storage, queues, and the request-lifecycle services.
//!
//! ```text
//! TaskDispatcher ─► RequestStore (pending) ─► task queue
//!                                                 │
//!                          TaskWorker ◄───────────┘
//!                              │  LlmClient (retry/backoff)
//!                              ▼
//!              ArtifactStore ─► RequestStore (terminal) ─► notification queue
//!
//! StatusQueryService ─► RequestStore          Reconciler ─► RequestStore
//! ```

pub mod config;
pub mod dispatcher;
pub mod notify;
pub mod queue;
pub mod reconcile;
pub mod retry;
pub mod status;
pub mod store;
pub mod worker;

#[cfg(test)]
mod integration_tests;

pub use config::{AppConfig, ConfigError};
pub use dispatcher::{DispatchError, TaskDispatcher};
pub use reconcile::{ReconcileSettings, Reconciler, SweepReport};
pub use retry::{retry_with_backoff, RetryError, RetryPolicy, Transient};
pub use status::{RequestStatusView, StatusQueryService};
pub use store::{
    ArtifactRevision, ArtifactStore, InMemoryArtifactStore, InMemoryRequestStore, NewArtifact,
    RequestStore, StoreError, StoredArtifact, TransitionOutcome,
};
pub use worker::{
    HandleOutcome, PoolStats, TaskWorker, WorkerError, WorkerPool, WorkerPoolConfig,
    WorkerPoolHandle, WorkerSettings,
};

/// Convert for timestamp arithmetic; out-of-range durations saturate at a century.
pub(crate) fn chrono_duration(d: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(36_500))
}
