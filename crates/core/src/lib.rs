//! `demandflow-core`: request lifecycle data model.
//!
//! This crate contains **pure** types (no I/O): identifiers, the request
//! record and its status state machine, and the shape of a generation request.

pub mod error;
pub mod generation;
pub mod id;
pub mod request;
pub mod task_type;

pub use error::{DomainError, DomainResult};
pub use generation::{
    Correlation, GenerationRequest, LlmConfig, LlmProvider, PromptData, ReprocessRequest,
    DEFAULT_LANGUAGE,
};
pub use id::{ArtifactId, RequestId};
pub use request::{
    ErrorClassification, RequestRecord, RequestStatus, ResultSummary, StatusUpdate, TokenUsage,
    MAX_ERROR_DETAIL_CHARS,
};
pub use task_type::{ParentRef, TaskType};
