//! The request record and its status state machine.
//!
//! ```text
//! pending ──► processing ──► completed
//!    │             │
//!    └─────────────┴────────► failed
//! ```
//!
//! Records are never deleted and never move backwards. `error_detail` is set
//! exactly when the status is `failed`; `result` exactly when `completed`.

use chrono::{DateTime, Utc};
use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::generation::Correlation;
use crate::id::{ArtifactId, RequestId};
use crate::task_type::{ParentRef, TaskType};

/// Failure details longer than this are truncated before they are stored.
pub const MAX_ERROR_DETAIL_CHARS: usize = 500;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Processing => "processing",
            RequestStatus::Completed => "completed",
            RequestStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestStatus::Completed | RequestStatus::Failed)
    }

    /// Whether `self -> next` is an edge of the lifecycle.
    pub fn can_transition_to(&self, next: RequestStatus) -> bool {
        use RequestStatus::*;
        matches!(
            (self, next),
            (Pending, Processing) | (Pending, Failed) | (Processing, Completed) | (Processing, Failed)
        )
    }
}

impl core::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RequestStatus::Pending),
            "processing" => Ok(RequestStatus::Processing),
            "completed" => Ok(RequestStatus::Completed),
            "failed" => Ok(RequestStatus::Failed),
            other => Err(DomainError::validation(format!("unknown request status: {other}"))),
        }
    }
}

/// Why a request ended up `failed`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClassification {
    /// Transient provider failures outlasted the retry budget.
    LlmUnavailable,
    /// The provider refused the request (invalid input, model, or policy).
    LlmRejected,
    /// The completion could not be parsed into the task type's schema.
    InvalidResponse,
    /// Unexpected failure inside the worker.
    Internal,
    /// Never picked up by a worker before the orphan threshold.
    Orphaned,
    /// Stuck in `processing` past the stall threshold.
    Stalled,
    /// The task message could not be enqueued.
    EnqueueFailed,
}

impl ErrorClassification {
    pub const ALL: [ErrorClassification; 7] = [
        ErrorClassification::LlmUnavailable,
        ErrorClassification::LlmRejected,
        ErrorClassification::InvalidResponse,
        ErrorClassification::Internal,
        ErrorClassification::Orphaned,
        ErrorClassification::Stalled,
        ErrorClassification::EnqueueFailed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClassification::LlmUnavailable => "llm_unavailable",
            ErrorClassification::LlmRejected => "llm_rejected",
            ErrorClassification::InvalidResponse => "invalid_response",
            ErrorClassification::Internal => "internal",
            ErrorClassification::Orphaned => "orphaned",
            ErrorClassification::Stalled => "stalled",
            ErrorClassification::EnqueueFailed => "enqueue_failed",
        }
    }
}

impl core::fmt::Display for ErrorClassification {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorClassification {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ErrorClassification::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown error classification: {s}")))
    }
}

/// Token counts reported by the provider for one completion.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
        }
    }

    pub fn total(&self) -> u32 {
        self.prompt_tokens.saturating_add(self.completion_tokens)
    }

    /// Usage summed across completions.
    pub fn accumulate(self, other: TokenUsage) -> TokenUsage {
        TokenUsage {
            prompt_tokens: self.prompt_tokens.saturating_add(other.prompt_tokens),
            completion_tokens: self.completion_tokens.saturating_add(other.completion_tokens),
        }
    }
}

/// What a completed request produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultSummary {
    pub artifact_id: ArtifactId,
    pub version: u32,
    pub item_count: u32,
    pub token_usage: TokenUsage,
}

/// Requested move to a new status, carrying the fields that status requires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusUpdate {
    Processing,
    Completed(ResultSummary),
    Failed {
        classification: ErrorClassification,
        detail: String,
    },
}

impl StatusUpdate {
    pub fn failed(classification: ErrorClassification, detail: impl Into<String>) -> Self {
        Self::Failed {
            classification,
            detail: truncate_detail(detail.into()),
        }
    }

    pub fn target(&self) -> RequestStatus {
        match self {
            StatusUpdate::Processing => RequestStatus::Processing,
            StatusUpdate::Completed(_) => RequestStatus::Completed,
            StatusUpdate::Failed { .. } => RequestStatus::Failed,
        }
    }
}

fn truncate_detail(detail: String) -> String {
    match detail.char_indices().nth(MAX_ERROR_DETAIL_CHARS) {
        Some((idx, _)) => detail[..idx].to_string(),
        None => detail,
    }
}

/// Durable record of one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub request_id: RequestId,
    pub parent: ParentRef,
    pub task_type: TaskType,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub error_detail: Option<String>,
    pub error_classification: Option<ErrorClassification>,
    pub result: Option<ResultSummary>,
    /// Set once the terminal notification has been published.
    pub notified_at: Option<DateTime<Utc>>,
    /// When a publisher last claimed the notification. Expires after a lease.
    #[serde(default)]
    pub notify_claimed_at: Option<DateTime<Utc>>,
    /// The failed request this one resubmits, if any.
    pub retry_of: Option<RequestId>,
    /// The artifact this request regenerates in place, if any.
    #[serde(default)]
    pub reprocess_of: Option<ArtifactId>,
    #[serde(default)]
    pub correlation: Correlation,
}

impl RequestRecord {
    pub fn pending(
        request_id: RequestId,
        parent: ParentRef,
        task_type: TaskType,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            request_id,
            parent,
            task_type,
            status: RequestStatus::Pending,
            created_at: now,
            updated_at: now,
            processing_started_at: None,
            error_detail: None,
            error_classification: None,
            result: None,
            notified_at: None,
            notify_claimed_at: None,
            retry_of: None,
            reprocess_of: None,
            correlation: Correlation::default(),
        }
    }

    pub fn with_retry_of(mut self, original: RequestId) -> Self {
        self.retry_of = Some(original);
        self
    }

    pub fn with_reprocess_of(mut self, artifact_id: ArtifactId) -> Self {
        self.reprocess_of = Some(artifact_id);
        self
    }

    pub fn with_correlation(mut self, correlation: Correlation) -> Self {
        self.correlation = correlation;
        self
    }

    pub fn is_reprocessing(&self) -> bool {
        self.reprocess_of.is_some()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Terminal and still owed a notification.
    pub fn needs_notification(&self) -> bool {
        self.is_terminal() && self.notified_at.is_none()
    }

    /// Apply a status update in place, enforcing the lifecycle edges.
    pub fn apply(&mut self, update: StatusUpdate, at: DateTime<Utc>) -> DomainResult<()> {
        let next = update.target();
        if !self.status.can_transition_to(next) {
            return Err(DomainError::illegal_transition(self.status, next));
        }

        match update {
            StatusUpdate::Processing => {
                self.processing_started_at = Some(at);
            }
            StatusUpdate::Completed(summary) => {
                self.result = Some(summary);
            }
            StatusUpdate::Failed {
                classification,
                detail,
            } => {
                self.error_classification = Some(classification);
                self.error_detail = Some(truncate_detail(detail));
            }
        }
        self.status = next;
        self.updated_at = at;
        Ok(())
    }
}
