//! Request intake pipeline.
//!
//! ```text
//! GenerationRequest | ReprocessRequest
//!   ↓
//! 1. Validate shape (nothing persisted on failure)
//!   ↓
//! 2. Persist record as `pending`
//!   ↓
//! 3. Enqueue task message (bounded retry)
//!   ↓
//! request_id
//! ```
//!
//! The record always exists before its task message, so a worker never sees
//! a message for an unknown request under normal operation. If enqueueing
//! gives up, the record is moved to `failed` (`enqueue_failed`) and the caller
//! gets an error; the reconciler publishes that record's notification.

use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, instrument, warn};

use demandflow_core::{
    ArtifactId, DomainError, ErrorClassification, GenerationRequest, ReprocessRequest, RequestId,
    RequestRecord, RequestStatus, StatusUpdate,
};
use demandflow_messaging::{MessageQueue, QueueError, TaskMessage};

use crate::retry::{retry_with_backoff, RetryError, RetryPolicy};
use crate::store::{ArtifactStore, RequestStore, StoreError, TransitionOutcome};

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Request shape rejected before anything was persisted.
    #[error(transparent)]
    Validation(#[from] DomainError),

    /// Persisting or reading the record failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The record exists but its task message could not be enqueued.
    #[error("request {request_id} could not be enqueued: {source}")]
    Enqueue {
        request_id: RequestId,
        source: RetryError<QueueError>,
    },

    #[error("request not found: {0}")]
    NotFound(RequestId),

    /// Only failed requests can be resubmitted.
    #[error("request {request_id} is {status}; only failed requests can be resubmitted")]
    NotResubmittable {
        request_id: RequestId,
        status: RequestStatus,
    },

    #[error("artifact not found: {0}")]
    ArtifactNotFound(ArtifactId),

    /// An artifact stays on the platform it was generated for.
    #[error("artifact {artifact_id} belongs to platform {current}, not {requested}")]
    PlatformChanged {
        artifact_id: ArtifactId,
        current: String,
        requested: String,
    },
}

/// Accepts generation requests and hands them to the task queue.
pub struct TaskDispatcher {
    store: Arc<dyn RequestStore>,
    artifacts: Arc<dyn ArtifactStore>,
    tasks: Arc<dyn MessageQueue<TaskMessage>>,
    enqueue_retry: RetryPolicy,
}

impl TaskDispatcher {
    pub fn new(
        store: Arc<dyn RequestStore>,
        artifacts: Arc<dyn ArtifactStore>,
        tasks: Arc<dyn MessageQueue<TaskMessage>>,
        enqueue_retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            artifacts,
            tasks,
            enqueue_retry,
        }
    }

    /// Persist a `pending` record and enqueue its task. Does not wait for a worker.
    #[instrument(skip(self, request), fields(parent = %request.parent, task_type = %request.task_type), err)]
    pub async fn submit(&self, request: GenerationRequest) -> Result<RequestId, DispatchError> {
        request.validate()?;
        let record = RequestRecord::pending(
            RequestId::new(),
            request.parent.clone(),
            request.task_type,
            Utc::now(),
        )
        .with_correlation(request.correlation.clone());
        let message = TaskMessage::for_request(record.request_id, &request);
        self.persist_and_enqueue(record, message).await
    }

    /// Submit `request` again as a new record linked to a failed one.
    ///
    /// The failed record is left untouched; the new request gets its own id.
    #[instrument(skip(self, request), fields(retry_of = %failed), err)]
    pub async fn resubmit(
        &self,
        failed: RequestId,
        request: GenerationRequest,
    ) -> Result<RequestId, DispatchError> {
        request.validate()?;
        let original = self
            .store
            .get(failed)
            .await?
            .ok_or(DispatchError::NotFound(failed))?;
        if original.status != RequestStatus::Failed {
            return Err(DispatchError::NotResubmittable {
                request_id: failed,
                status: original.status,
            });
        }

        let record = RequestRecord::pending(
            RequestId::new(),
            request.parent.clone(),
            request.task_type,
            Utc::now(),
        )
        .with_retry_of(failed)
        .with_correlation(request.correlation.clone());
        let message = TaskMessage::for_request(record.request_id, &request);
        self.persist_and_enqueue(record, message).await
    }

    /// Regenerate an existing artifact with new prompts.
    ///
    /// The artifact keeps its id; the worker replaces its content, adds the
    /// new token usage to its total and moves it to the next version. Parent
    /// and task type come from the artifact. Board identifiers in `request`
    /// replace the artifact's; the platform cannot change.
    #[instrument(skip(self, request), fields(artifact_id = %request.artifact_id, task_type = %request.task_type), err)]
    pub async fn reprocess(&self, request: ReprocessRequest) -> Result<RequestId, DispatchError> {
        request.validate()?;
        let artifact = self
            .artifacts
            .get(request.artifact_id)
            .await?
            .ok_or(DispatchError::ArtifactNotFound(request.artifact_id))?;

        if artifact.task_type != request.task_type {
            return Err(DomainError::validation(format!(
                "artifact {} is a {} artifact, not {}",
                artifact.artifact_id, artifact.task_type, request.task_type
            ))
            .into());
        }
        if let (Some(current), Some(requested)) =
            (&artifact.correlation.platform, &request.correlation.platform)
        {
            if current != requested {
                return Err(DispatchError::PlatformChanged {
                    artifact_id: artifact.artifact_id,
                    current: current.clone(),
                    requested: requested.clone(),
                });
            }
        }

        let correlation = artifact.correlation.revised(&request.correlation);
        let record = RequestRecord::pending(
            RequestId::new(),
            artifact.parent.clone(),
            artifact.task_type,
            Utc::now(),
        )
        .with_reprocess_of(artifact.artifact_id)
        .with_correlation(correlation.clone());
        let mut message = TaskMessage::for_reprocess(record.request_id, artifact.parent, &request);
        message.correlation = correlation;
        self.persist_and_enqueue(record, message).await
    }

    async fn persist_and_enqueue(
        &self,
        record: RequestRecord,
        message: TaskMessage,
    ) -> Result<RequestId, DispatchError> {
        let request_id = record.request_id;
        self.store.create(record).await?;

        let enqueued = retry_with_backoff(&self.enqueue_retry, |_| self.tasks.publish(&message)).await;

        match enqueued {
            Ok(()) => {
                info!(%request_id, reprocessing = message.reprocess_of.is_some(), "request enqueued");
                Ok(request_id)
            }
            Err(source) => {
                self.abandon(request_id, &source).await;
                Err(DispatchError::Enqueue { request_id, source })
            }
        }
    }

    /// Move a record whose task never reached the queue to `failed`.
    async fn abandon(&self, request_id: RequestId, cause: &RetryError<QueueError>) {
        let update = StatusUpdate::failed(ErrorClassification::EnqueueFailed, cause.to_string());
        match self
            .store
            .transition(request_id, RequestStatus::Pending, update)
            .await
        {
            Ok(TransitionOutcome::Applied(_)) => {
                warn!(%request_id, error = %cause, "enqueue failed; request marked failed")
            }
            // A publish reported as failed may still have landed; a worker got there first.
            Ok(TransitionOutcome::Skipped { current }) => {
                info!(%request_id, status = %current.status, error = %cause, "enqueue reported failure but request already moved on")
            }
            // Left pending; the reconciler will fail it as orphaned.
            Err(e) => error!(%request_id, error = %e, "enqueue failed and request could not be marked failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use demandflow_core::{Correlation, ParentRef, PromptData, TaskType, TokenUsage};
    use demandflow_messaging::{Delivery, DeliveryTag, InMemoryQueue};

    use crate::store::{InMemoryArtifactStore, InMemoryRequestStore, NewArtifact, StoredArtifact};

    fn request() -> GenerationRequest {
        GenerationRequest::new(
            ParentRef::new("EXT-42").unwrap(),
            TaskType::Epic,
            PromptData::new("system", "user {user_input}").with_user_input("x"),
        )
    }

    fn setup() -> (Arc<InMemoryRequestStore>, Arc<InMemoryQueue<TaskMessage>>, TaskDispatcher) {
        let (store, _, tasks, dispatcher) = setup_with_artifacts();
        (store, tasks, dispatcher)
    }

    fn setup_with_artifacts() -> (
        Arc<InMemoryRequestStore>,
        Arc<InMemoryArtifactStore>,
        Arc<InMemoryQueue<TaskMessage>>,
        TaskDispatcher,
    ) {
        let store = InMemoryRequestStore::arc();
        let artifacts = Arc::new(InMemoryArtifactStore::new());
        let tasks = Arc::new(InMemoryQueue::new());
        let dispatcher = TaskDispatcher::new(
            store.clone(),
            artifacts.clone(),
            tasks.clone(),
            RetryPolicy::fixed(3, Duration::from_millis(10)),
        );
        (store, artifacts, tasks, dispatcher)
    }

    async fn stored_epic(artifacts: &InMemoryArtifactStore, platform: &str) -> StoredArtifact {
        artifacts
            .put(NewArtifact {
                request_id: RequestId::new(),
                parent: ParentRef::new("EXT-42").unwrap(),
                task_type: TaskType::Epic,
                payload: serde_json::json!({"title": "Billing"}),
                item_count: 1,
                token_usage: TokenUsage::new(10, 20),
                correlation: Correlation::default()
                    .with_platform(platform)
                    .with_work_item_id("WI-1"),
            })
            .await
            .unwrap()
    }

    fn reprocess_request(artifact: &StoredArtifact) -> ReprocessRequest {
        ReprocessRequest::new(
            TaskType::Epic,
            artifact.artifact_id,
            PromptData::new("system", "revise the epic"),
        )
    }

    /// Accepts the publish, lets a worker claim the record, then reports failure.
    struct LostAckQueue {
        store: Arc<InMemoryRequestStore>,
    }

    #[async_trait]
    impl MessageQueue<TaskMessage> for LostAckQueue {
        async fn publish(&self, message: &TaskMessage) -> Result<(), QueueError> {
            self.store
                .transition(message.request_id, RequestStatus::Pending, StatusUpdate::Processing)
                .await
                .unwrap();
            Err(QueueError::Serialization("reply lost".to_string()))
        }

        async fn receive(
            &self,
            _consumer: &str,
            _wait: Duration,
        ) -> Result<Option<Delivery<TaskMessage>>, QueueError> {
            Ok(None)
        }

        async fn ack(&self, _tag: &DeliveryTag) -> Result<(), QueueError> {
            Ok(())
        }

        async fn nack(&self, _tag: &DeliveryTag) -> Result<(), QueueError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn submit_persists_pending_then_enqueues() {
        let (store, tasks, dispatcher) = setup();
        let id = dispatcher.submit(request()).await.unwrap();

        let record = store.get(id).await.unwrap().unwrap();
        assert_eq!(record.status, RequestStatus::Pending);
        assert_eq!(record.parent.as_str(), "EXT-42");

        let queued = tasks.ready_messages();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].request_id, id);
        assert_eq!(queued[0].prompt_data.user_input.as_deref(), Some("x"));
    }

    #[tokio::test]
    async fn invalid_request_persists_nothing() {
        let (store, tasks, dispatcher) = setup();
        let mut bad = request();
        bad.prompt_data.system = String::new();

        assert!(matches!(
            dispatcher.submit(bad).await,
            Err(DispatchError::Validation(_))
        ));
        assert!(store.is_empty());
        assert_eq!(tasks.ready_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_enqueue_failure_is_retried() {
        let (store, tasks, dispatcher) = setup();
        tasks.fail_next_publishes(2);

        let id = dispatcher.submit(request()).await.unwrap();
        assert_eq!(tasks.ready_len(), 1);
        assert_eq!(store.get(id).await.unwrap().unwrap().status, RequestStatus::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_enqueue_marks_record_failed() {
        let (store, tasks, dispatcher) = setup();
        tasks.fail_next_publishes(10);

        let err = dispatcher.submit(request()).await.unwrap_err();
        let DispatchError::Enqueue { request_id, source } = err else {
            panic!("expected enqueue error");
        };
        assert_eq!(source.attempts(), 3);

        let record = store.get(request_id).await.unwrap().unwrap();
        assert_eq!(record.status, RequestStatus::Failed);
        assert_eq!(record.error_classification, Some(ErrorClassification::EnqueueFailed));
        assert!(record.needs_notification());
    }

    #[tokio::test]
    async fn each_submission_gets_a_new_id() {
        let (_, _, dispatcher) = setup();
        let a = dispatcher.submit(request()).await.unwrap();
        let b = dispatcher.submit(request()).await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test(start_paused = true)]
    async fn resubmit_links_new_record_to_failed_one() {
        let (store, tasks, dispatcher) = setup();
        tasks.fail_next_publishes(3);
        let DispatchError::Enqueue { request_id: failed, .. } =
            dispatcher.submit(request()).await.unwrap_err()
        else {
            panic!("expected enqueue error");
        };

        let retry = dispatcher.resubmit(failed, request()).await.unwrap();
        assert_ne!(retry, failed);
        let record = store.get(retry).await.unwrap().unwrap();
        assert_eq!(record.retry_of, Some(failed));
        assert_eq!(record.status, RequestStatus::Pending);
        assert_eq!(
            store.get(failed).await.unwrap().unwrap().status,
            RequestStatus::Failed
        );
    }

    #[tokio::test]
    async fn only_failed_requests_can_be_resubmitted() {
        let (_, _, dispatcher) = setup();
        let id = dispatcher.submit(request()).await.unwrap();
        assert!(matches!(
            dispatcher.resubmit(id, request()).await,
            Err(DispatchError::NotResubmittable { status: RequestStatus::Pending, .. })
        ));
        assert!(matches!(
            dispatcher.resubmit(RequestId::new(), request()).await,
            Err(DispatchError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn enqueue_failure_does_not_touch_a_claimed_record() {
        let store = InMemoryRequestStore::arc();
        let dispatcher = TaskDispatcher::new(
            store.clone(),
            Arc::new(InMemoryArtifactStore::new()),
            Arc::new(LostAckQueue {
                store: store.clone(),
            }),
            RetryPolicy::fixed(3, Duration::from_millis(10)),
        );

        let DispatchError::Enqueue { request_id, .. } = dispatcher.submit(request()).await.unwrap_err()
        else {
            panic!("expected enqueue error");
        };
        let record = store.get(request_id).await.unwrap().unwrap();
        assert_eq!(record.status, RequestStatus::Processing);
        assert!(record.error_classification.is_none());
    }

    #[tokio::test]
    async fn submit_carries_correlation_to_record_and_message() {
        let (store, tasks, dispatcher) = setup();
        let correlation = Correlation::default().with_work_item_id("WI-9").with_platform("jira");
        let id = dispatcher
            .submit(request().with_correlation(correlation.clone()))
            .await
            .unwrap();

        assert_eq!(store.get(id).await.unwrap().unwrap().correlation, correlation);
        assert_eq!(tasks.ready_messages()[0].correlation, correlation);
    }

    #[tokio::test]
    async fn reprocess_targets_the_artifact_and_its_parent() {
        let (store, artifacts, tasks, dispatcher) = setup_with_artifacts();
        let artifact = stored_epic(&artifacts, "jira").await;
        let request = reprocess_request(&artifact).with_correlation(
            Correlation::default().with_work_item_id("WI-2").with_parent_board_id("B-3"),
        );

        let id = dispatcher.reprocess(request).await.unwrap();

        let record = store.get(id).await.unwrap().unwrap();
        assert_eq!(record.status, RequestStatus::Pending);
        assert_eq!(record.reprocess_of, Some(artifact.artifact_id));
        assert!(record.is_reprocessing());
        assert_eq!(record.parent, artifact.parent);
        assert_eq!(record.correlation.work_item_id.as_deref(), Some("WI-2"));
        assert_eq!(record.correlation.platform.as_deref(), Some("jira"));

        let queued = tasks.ready_messages();
        assert_eq!(queued[0].reprocess_of, Some(artifact.artifact_id));
        assert_eq!(queued[0].correlation, record.correlation);
    }

    #[tokio::test]
    async fn reprocess_rejects_unknown_artifacts_and_changed_targets() {
        let (store, artifacts, tasks, dispatcher) = setup_with_artifacts();
        let artifact = stored_epic(&artifacts, "jira").await;

        let mut missing = reprocess_request(&artifact);
        missing.artifact_id = ArtifactId::new();
        assert!(matches!(
            dispatcher.reprocess(missing).await,
            Err(DispatchError::ArtifactNotFound(_))
        ));

        let mut wrong_type = reprocess_request(&artifact);
        wrong_type.task_type = TaskType::Bug;
        assert!(matches!(
            dispatcher.reprocess(wrong_type).await,
            Err(DispatchError::Validation(_))
        ));

        let moved = reprocess_request(&artifact)
            .with_correlation(Correlation::default().with_platform("azure_devops"));
        assert!(matches!(
            dispatcher.reprocess(moved).await,
            Err(DispatchError::PlatformChanged { .. })
        ));

        assert!(store.is_empty());
        assert_eq!(tasks.ready_len(), 0);
    }
}
