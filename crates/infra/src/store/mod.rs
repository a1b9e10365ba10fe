//! Durable state: the request status record and generated artifacts.
//!
//! ## Components
//!
//! - `RequestStore`: keyed record store with one conditional-write primitive
//!   (`transition`, a compare-and-set on status)
//! - `ArtifactStore`: generated payloads keyed by request, versioned per
//!   `(parent, task_type)`, revisable in place by a reprocessing request
//! - In-memory implementations for tests/dev, Postgres for production

pub mod artifacts;
pub mod postgres;
pub mod requests;

pub use artifacts::{
    ArtifactRevision, ArtifactStore, InMemoryArtifactStore, NewArtifact, StoredArtifact,
};
pub use postgres::{ensure_schema, PostgresArtifactStore, PostgresRequestStore};
pub use requests::{InMemoryRequestStore, RequestStore, TransitionOutcome};

use demandflow_core::{ArtifactId, RequestId, RequestStatus};

use crate::retry::Transient;

/// Storage error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("request not found: {0}")]
    NotFound(RequestId),

    #[error("artifact not found: {0}")]
    ArtifactNotFound(ArtifactId),

    #[error("request already exists: {0}")]
    AlreadyExists(RequestId),

    #[error("illegal transition for {request_id}: {from} -> {to}")]
    IllegalTransition {
        request_id: RequestId,
        from: RequestStatus,
        to: RequestStatus,
    },

    /// Conflicting concurrent write that a retry may resolve.
    #[error("write conflict: {0}")]
    Conflict(String),

    /// Stored data could not be decoded.
    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl Transient for StoreError {
    fn is_transient(&self) -> bool {
        matches!(self, StoreError::Storage(_) | StoreError::Conflict(_))
    }
}
