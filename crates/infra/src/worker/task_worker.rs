//! Processing of a single task message.
//!
//! ```text
//! 1. pending → processing      (conditional; losers resume, skip or re-notify)
//! 2. assemble prompt
//! 3. call LLM                  (per-attempt timeout, backoff on transient errors)
//! 4. parse + store artifact    (idempotent by request_id; revise in place when reprocessing)
//! 5. processing → completed | failed
//! 6. claim, publish and mark the notification
//! ```
//!
//! `handle` returns `Ok` when the message can be acknowledged and `Err` when it
//! must be left for redelivery (store or broker unavailable).
//!
//! A redelivery that finds the request still `processing` resumes it when the
//! artifact is already stored, and takes it over when the owner has exceeded
//! the longest processing time the settings allow.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, instrument, warn};

use demandflow_core::{
    ErrorClassification, LlmConfig, RequestId, RequestRecord, RequestStatus, ResultSummary,
    StatusUpdate,
};
use demandflow_llm::{
    JsonResponseParser, LlmClient, LlmError, LlmResponse, Prompt, ResponseParser,
};
use demandflow_messaging::{MessageQueue, NotificationMessage, QueueError, TaskMessage};

use crate::notify::{self, NotifyError};
use crate::retry::{retry_with_backoff, RetryError, RetryPolicy};
use crate::store::{
    ArtifactRevision, ArtifactStore, NewArtifact, RequestStore, StoreError, StoredArtifact,
    TransitionOutcome,
};

/// Worker tuning.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Backoff for transient LLM failures
    pub llm_retry: RetryPolicy,
    /// Upper bound on a single LLM attempt; expiry counts as a transient failure
    pub attempt_timeout: Duration,
    /// Backoff for store writes after the LLM call has succeeded
    pub persist_retry: RetryPolicy,
    /// How long a notification claim blocks other publishers
    pub notify_lease: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            llm_retry: RetryPolicy::default(),
            attempt_timeout: Duration::from_secs(120),
            persist_retry: RetryPolicy::exponential(
                3,
                Duration::from_millis(200),
                Duration::from_secs(2),
            ),
            notify_lease: Duration::from_secs(300),
        }
    }
}

impl WorkerSettings {
    /// Longest a live worker can hold a request in `processing`: every LLM
    /// attempt timing out, every backoff at its jittered maximum, and both
    /// store writes exhausting their retries.
    pub fn max_processing_time(&self) -> Duration {
        let attempts = self.llm_retry.max_attempts.max(1);
        self.attempt_timeout.saturating_mul(attempts)
            + self.llm_retry.max_backoff()
            + self.persist_retry.max_backoff() * 2
    }
}

/// What happened to a delivery. Every variant means "acknowledge".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleOutcome {
    Completed,
    Failed(ErrorClassification),
    /// Another delivery owns (or already finished) this request.
    Duplicate(RequestStatus),
    /// Already terminal but its notification was still owed; published now.
    Renotified,
    /// No record exists for the message; redelivery cannot help.
    UnknownRequest,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("notification publish failed: {0}")]
    Publish(#[from] QueueError),
}

impl From<NotifyError> for WorkerError {
    fn from(value: NotifyError) -> Self {
        match value {
            NotifyError::Publish(e) => WorkerError::Publish(e),
            NotifyError::Store(e) => WorkerError::Store(e),
        }
    }
}

pub struct TaskWorker {
    store: Arc<dyn RequestStore>,
    artifacts: Arc<dyn ArtifactStore>,
    notifications: Arc<dyn MessageQueue<NotificationMessage>>,
    llm: Arc<dyn LlmClient>,
    parser: Arc<dyn ResponseParser>,
    settings: WorkerSettings,
}

impl TaskWorker {
    pub fn new(
        store: Arc<dyn RequestStore>,
        artifacts: Arc<dyn ArtifactStore>,
        notifications: Arc<dyn MessageQueue<NotificationMessage>>,
        llm: Arc<dyn LlmClient>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            store,
            artifacts,
            notifications,
            llm,
            parser: Arc::new(JsonResponseParser),
            settings,
        }
    }

    pub fn with_parser(mut self, parser: Arc<dyn ResponseParser>) -> Self {
        self.parser = parser;
        self
    }

    #[instrument(
        skip(self, task),
        fields(
            request_id = %task.request_id,
            task_type = %task.task_type,
            reprocessing = task.reprocess_of.is_some()
        )
    )]
    pub async fn handle(&self, task: &TaskMessage) -> Result<HandleOutcome, WorkerError> {
        let request_id = task.request_id;
        let claim = self
            .store
            .transition(request_id, RequestStatus::Pending, StatusUpdate::Processing)
            .await;

        match claim {
            Ok(TransitionOutcome::Applied(_)) => {}
            Ok(TransitionOutcome::Skipped { current }) => {
                return self.settle_duplicate(task, current).await;
            }
            Err(StoreError::NotFound(_)) => {
                error!(parent = %task.parent, "task message for unknown request; dropping");
                return Ok(HandleOutcome::UnknownRequest);
            }
            Err(e) => return Err(e.into()),
        }

        let update = self.generate(task).await;
        self.finish(request_id, update).await
    }

    /// Run the LLM call and persist its output; always yields a terminal update.
    async fn generate(&self, task: &TaskMessage) -> StatusUpdate {
        let prompt = Prompt::assemble(&task.prompt_data);
        let response = retry_with_backoff(&self.settings.llm_retry, |attempt| {
            self.call_llm(&prompt, &task.llm_config, attempt)
        })
        .await;

        let response = match response {
            Ok(response) => response,
            Err(RetryError::Exhausted { last, attempts }) => {
                return StatusUpdate::failed(
                    ErrorClassification::LlmUnavailable,
                    format!("{last} (after {attempts} attempts)"),
                );
            }
            Err(RetryError::Permanent { error, .. }) => {
                return StatusUpdate::failed(ErrorClassification::LlmRejected, error.to_string());
            }
        };

        let parsed = match self.parser.parse(task.task_type, &response.text) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(error = %e, "completion did not parse");
                return StatusUpdate::failed(ErrorClassification::InvalidResponse, e.to_string());
            }
        };

        let stored = match task.reprocess_of {
            Some(artifact_id) => {
                let revision = ArtifactRevision {
                    request_id: task.request_id,
                    payload: parsed.payload,
                    item_count: parsed.item_count,
                    token_usage: response.usage,
                    correlation: task.correlation.clone(),
                };
                retry_with_backoff(&self.settings.persist_retry, |_| {
                    self.artifacts.update_in_place(artifact_id, revision.clone())
                })
                .await
            }
            None => {
                let artifact = NewArtifact {
                    request_id: task.request_id,
                    parent: task.parent.clone(),
                    task_type: task.task_type,
                    payload: parsed.payload,
                    item_count: parsed.item_count,
                    token_usage: response.usage,
                    correlation: task.correlation.clone(),
                };
                retry_with_backoff(&self.settings.persist_retry, |_| {
                    self.artifacts.put(artifact.clone())
                })
                .await
            }
        };

        match stored {
            Ok(stored) => StatusUpdate::Completed(summary_of(&stored)),
            Err(RetryError::Permanent {
                error: StoreError::ArtifactNotFound(artifact_id),
                ..
            }) => {
                error!(%artifact_id, "artifact to reprocess no longer exists");
                StatusUpdate::failed(
                    ErrorClassification::Internal,
                    format!("artifact {artifact_id} not found"),
                )
            }
            Err(e) => {
                error!(error = %e, "artifact could not be stored");
                StatusUpdate::failed(
                    ErrorClassification::Internal,
                    format!("artifact persistence failed: {e}"),
                )
            }
        }
    }

    async fn call_llm(
        &self,
        prompt: &Prompt,
        config: &LlmConfig,
        attempt: u32,
    ) -> Result<LlmResponse, LlmError> {
        debug!(attempt, provider = %config.provider, "calling llm");
        let timeout = self.settings.attempt_timeout;
        match tokio::time::timeout(timeout, self.llm.generate(prompt, config)).await {
            Ok(result) => result,
            Err(_) => Err(LlmError::Timeout(format!("no response within {timeout:?}"))),
        }
    }

    /// Write the terminal status, then notify.
    async fn finish(
        &self,
        request_id: RequestId,
        update: StatusUpdate,
    ) -> Result<HandleOutcome, WorkerError> {
        let outcome = match &update {
            StatusUpdate::Failed { classification, .. } => HandleOutcome::Failed(*classification),
            _ => HandleOutcome::Completed,
        };

        let written = retry_with_backoff(&self.settings.persist_retry, |_| {
            self.store
                .transition(request_id, RequestStatus::Processing, update.clone())
        })
        .await
        .map_err(|e| WorkerError::Store(e.into_inner()))?;

        match written {
            TransitionOutcome::Applied(record) => {
                self.publish(&record).await?;
                info!(status = %record.status, "request finished");
                Ok(outcome)
            }
            TransitionOutcome::Skipped { current } => {
                warn!(status = %current.status, "request changed while processing; result discarded");
                self.settle_terminal(current).await
            }
        }
    }

    /// A delivery that lost the claim.
    async fn settle_duplicate(
        &self,
        task: &TaskMessage,
        current: RequestRecord,
    ) -> Result<HandleOutcome, WorkerError> {
        if current.status != RequestStatus::Processing {
            return self.settle_terminal(current).await;
        }

        // The previous delivery stored the artifact but never wrote the status.
        if let Some(stored) = self.artifacts.get_by_request(task.request_id).await? {
            info!(artifact_id = %stored.artifact_id, "resuming request from its stored artifact");
            return self
                .finish(task.request_id, StatusUpdate::Completed(summary_of(&stored)))
                .await;
        }

        let limit = self.settings.max_processing_time();
        let stale_before = Utc::now() - crate::chrono_duration(limit);
        if current
            .processing_started_at
            .is_none_or(|started| started < stale_before)
        {
            warn!(
                limit_secs = limit.as_secs(),
                "processing owner exceeded its time limit; taking over"
            );
            let update = self.generate(task).await;
            return self.finish(task.request_id, update).await;
        }

        debug!("request is being processed elsewhere; skipping");
        Ok(HandleOutcome::Duplicate(RequestStatus::Processing))
    }

    /// The request is already terminal: make sure the notification went out, then ack.
    async fn settle_terminal(&self, current: RequestRecord) -> Result<HandleOutcome, WorkerError> {
        if current.needs_notification() && self.publish(&current).await? {
            return Ok(HandleOutcome::Renotified);
        }
        debug!(status = %current.status, "duplicate delivery; skipping");
        Ok(HandleOutcome::Duplicate(current.status))
    }

    async fn publish(&self, record: &RequestRecord) -> Result<bool, NotifyError> {
        notify::publish_terminal(
            self.notifications.as_ref(),
            self.store.as_ref(),
            record,
            self.settings.notify_lease,
        )
        .await
    }
}

fn summary_of(stored: &StoredArtifact) -> ResultSummary {
    ResultSummary {
        artifact_id: stored.artifact_id,
        version: stored.version,
        item_count: stored.item_count,
        token_usage: stored.token_usage,
    }
}
