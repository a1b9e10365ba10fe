//! Integration tests for the full request lifecycle.
//!
//! Tests: Dispatcher → RequestStore → task queue → TaskWorker → ArtifactStore
//! → RequestStore → notification queue
//!
//! Verifies:
//! - Status only moves forward and is visible through the status service
//! - Exactly one notification per terminal request, across redeliveries
//! - LLM retry budget and failure classification
//! - Concurrent deliveries of the same request have a single winner
//! - A redelivery finishes a request whose terminal write failed
//! - Reprocessing revises an artifact in place

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use tokio::sync::{Notify, Semaphore};

    use demandflow_core::{
        Correlation, ErrorClassification, GenerationRequest, LlmConfig, LlmProvider, ParentRef,
        PromptData, ReprocessRequest, RequestId, RequestRecord, RequestStatus, StatusUpdate,
        TaskType, TokenUsage,
    };
    use demandflow_llm::{LlmError, ScriptedLlmClient};
    use demandflow_messaging::{
        Delivery, DeliveryTag, InMemoryQueue, MessageQueue, NotificationMessage, Outcome,
        QueueError, TaskMessage,
    };

    use crate::dispatcher::{DispatchError, TaskDispatcher};
    use crate::reconcile::{ReconcileSettings, Reconciler};
    use crate::retry::RetryPolicy;
    use crate::status::StatusQueryService;
    use crate::store::{
        ArtifactStore, InMemoryArtifactStore, InMemoryRequestStore, RequestStore, StoreError,
        TransitionOutcome,
    };
    use crate::worker::{HandleOutcome, TaskWorker, WorkerSettings};

    const EPIC: &str = r#"{"title":"Billing overhaul","description":"Replace invoicing","tags":["billing"],"reflection":{}}"#;

    struct Pipeline {
        store: Arc<InMemoryRequestStore>,
        artifacts: Arc<InMemoryArtifactStore>,
        tasks: Arc<InMemoryQueue<TaskMessage>>,
        notifications: Arc<InMemoryQueue<NotificationMessage>>,
        llm: Arc<ScriptedLlmClient>,
        dispatcher: TaskDispatcher,
        worker: Arc<TaskWorker>,
        status: StatusQueryService,
    }

    impl Pipeline {
        fn new(llm: ScriptedLlmClient, llm_attempts: u32) -> Self {
            let store = InMemoryRequestStore::arc();
            let artifacts = Arc::new(InMemoryArtifactStore::new());
            let tasks = Arc::new(InMemoryQueue::new());
            let notifications = Arc::new(InMemoryQueue::new());
            let llm = Arc::new(llm);

            let dispatcher = TaskDispatcher::new(
                store.clone(),
                artifacts.clone(),
                tasks.clone(),
                RetryPolicy::fixed(3, Duration::from_millis(10)),
            );
            let worker = Arc::new(TaskWorker::new(
                store.clone(),
                artifacts.clone(),
                notifications.clone(),
                llm.clone(),
                worker_settings(llm_attempts),
            ));
            let status = StatusQueryService::new(store.clone());

            Self {
                store,
                artifacts,
                tasks,
                notifications,
                llm,
                dispatcher,
                worker,
                status,
            }
        }

        /// A second worker sharing this pipeline's artifacts and LLM, with its
        /// own view of the request store and notification queue.
        fn worker_with(
            &self,
            store: Arc<dyn RequestStore>,
            notifications: Arc<dyn MessageQueue<NotificationMessage>>,
        ) -> TaskWorker {
            TaskWorker::new(
                store,
                self.artifacts.clone(),
                notifications,
                self.llm.clone(),
                worker_settings(3),
            )
        }

        /// Receive one task, handle it, ack or nack like a pool consumer would.
        async fn process_next(&self) -> Option<HandleOutcome> {
            self.process_next_with(&self.worker).await
        }

        async fn process_next_with(&self, worker: &TaskWorker) -> Option<HandleOutcome> {
            let delivery = self
                .tasks
                .receive("test-consumer", Duration::from_millis(10))
                .await
                .unwrap()?;
            match worker.handle(&delivery.message).await {
                Ok(outcome) => {
                    self.tasks.ack(&delivery.tag).await.unwrap();
                    Some(outcome)
                }
                Err(_) => {
                    self.tasks.nack(&delivery.tag).await.unwrap();
                    None
                }
            }
        }

        async fn status_of(&self, id: RequestId) -> RequestStatus {
            self.status.get_status(id).await.unwrap().unwrap().status
        }
    }

    fn worker_settings(llm_attempts: u32) -> WorkerSettings {
        WorkerSettings {
            llm_retry: RetryPolicy::exponential(
                llm_attempts,
                Duration::from_millis(100),
                Duration::from_secs(1),
            ),
            attempt_timeout: Duration::from_secs(30),
            persist_retry: RetryPolicy::fixed(2, Duration::from_millis(10)),
            notify_lease: Duration::from_secs(60),
        }
    }

    /// Request store whose next `n` terminal writes fail as if the database dropped.
    struct FlakyStore {
        inner: Arc<InMemoryRequestStore>,
        failing_terminal_writes: AtomicU32,
    }

    impl FlakyStore {
        fn failing(inner: Arc<InMemoryRequestStore>, n: u32) -> Self {
            Self {
                inner,
                failing_terminal_writes: AtomicU32::new(n),
            }
        }
    }

    #[async_trait]
    impl RequestStore for FlakyStore {
        async fn create(&self, record: RequestRecord) -> Result<(), StoreError> {
            self.inner.create(record).await
        }

        async fn get(&self, request_id: RequestId) -> Result<Option<RequestRecord>, StoreError> {
            self.inner.get(request_id).await
        }

        async fn transition(
            &self,
            request_id: RequestId,
            expected_from: RequestStatus,
            update: StatusUpdate,
        ) -> Result<TransitionOutcome, StoreError> {
            if update.target().is_terminal()
                && self
                    .failing_terminal_writes
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
            {
                return Err(StoreError::Storage("connection reset".to_string()));
            }
            self.inner.transition(request_id, expected_from, update).await
        }

        async fn claim_notification(
            &self,
            request_id: RequestId,
            stale_before: DateTime<Utc>,
        ) -> Result<bool, StoreError> {
            self.inner.claim_notification(request_id, stale_before).await
        }

        async fn release_notification(&self, request_id: RequestId) -> Result<(), StoreError> {
            self.inner.release_notification(request_id).await
        }

        async fn mark_notified(&self, request_id: RequestId) -> Result<bool, StoreError> {
            self.inner.mark_notified(request_id).await
        }

        async fn list_stale(
            &self,
            status: RequestStatus,
            older_than: DateTime<Utc>,
            limit: usize,
        ) -> Result<Vec<RequestRecord>, StoreError> {
            self.inner.list_stale(status, older_than, limit).await
        }

        async fn list_unnotified(
            &self,
            older_than: DateTime<Utc>,
            limit: usize,
        ) -> Result<Vec<RequestRecord>, StoreError> {
            self.inner.list_unnotified(older_than, limit).await
        }
    }

    /// Notification queue that holds its first publish until `gate` gets a permit.
    struct GatedQueue {
        inner: Arc<InMemoryQueue<NotificationMessage>>,
        entered: Notify,
        gate: Semaphore,
        armed: AtomicBool,
    }

    impl GatedQueue {
        fn new(inner: Arc<InMemoryQueue<NotificationMessage>>) -> Self {
            Self {
                inner,
                entered: Notify::new(),
                gate: Semaphore::new(0),
                armed: AtomicBool::new(true),
            }
        }
    }

    #[async_trait]
    impl MessageQueue<NotificationMessage> for GatedQueue {
        async fn publish(&self, message: &NotificationMessage) -> Result<(), QueueError> {
            if self.armed.swap(false, Ordering::SeqCst) {
                self.entered.notify_one();
                let _permit = self
                    .gate
                    .acquire()
                    .await
                    .map_err(|e| QueueError::Connection(e.to_string()))?;
            }
            self.inner.publish(message).await
        }

        async fn receive(
            &self,
            consumer: &str,
            wait: Duration,
        ) -> Result<Option<Delivery<NotificationMessage>>, QueueError> {
            self.inner.receive(consumer, wait).await
        }

        async fn ack(&self, tag: &DeliveryTag) -> Result<(), QueueError> {
            self.inner.ack(tag).await
        }

        async fn nack(&self, tag: &DeliveryTag) -> Result<(), QueueError> {
            self.inner.nack(tag).await
        }
    }

    fn epic_request(parent: &str) -> GenerationRequest {
        GenerationRequest::new(
            ParentRef::new(parent).unwrap(),
            TaskType::Epic,
            PromptData::new(
                "You write epics in {language}.",
                "Create an epic for: {user_input}",
            )
            .with_user_input("customer billing"),
        )
        .with_llm_config(LlmConfig {
            provider: LlmProvider::OpenAi,
            model: Some("gpt-4o-mini".to_string()),
            ..LlmConfig::default()
        })
    }

    fn transient() -> LlmError {
        LlmError::Unavailable("503 from provider".to_string())
    }

    #[tokio::test(start_paused = true)]
    async fn epic_request_completes_and_notifies() {
        let p = Pipeline::new(ScriptedLlmClient::always(EPIC), 3);

        let r1 = p.dispatcher.submit(epic_request("EXT-42")).await.unwrap();
        assert_eq!(p.status_of(r1).await, RequestStatus::Pending);

        assert_eq!(p.process_next().await, Some(HandleOutcome::Completed));
        let view = p.status.get_status(r1).await.unwrap().unwrap();
        assert_eq!(view.status, RequestStatus::Completed);
        let summary = view.result_summary.unwrap();
        assert_eq!(summary.version, 1);
        assert_eq!(summary.item_count, 1);

        let sent = p.notifications.ready_messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].request_id, r1);
        assert_eq!(sent[0].parent.as_str(), "EXT-42");
        assert_eq!(sent[0].outcome, Outcome::Success);
        assert_eq!(sent[0].result_ref, Some(summary.artifact_id));

        let prompt = &p.llm.prompts()[0];
        assert_eq!(prompt.system, "You write epics in português.");
        assert_eq!(prompt.user, "Create an epic for: customer billing");
    }

    #[tokio::test(start_paused = true)]
    async fn status_moves_forward_while_worker_runs() {
        let llm = ScriptedLlmClient::always(EPIC).with_latency(Duration::from_secs(5));
        let p = Pipeline::new(llm, 3);
        let id = p.dispatcher.submit(epic_request("EXT-1")).await.unwrap();

        let delivery = p
            .tasks
            .receive("c", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        let worker = p.worker.clone();
        let running = tokio::spawn(async move { worker.handle(&delivery.message).await });

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(p.status_of(id).await, RequestStatus::Processing);

        assert_eq!(running.await.unwrap().unwrap(), HandleOutcome::Completed);
        assert_eq!(p.status_of(id).await, RequestStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn two_transient_failures_then_success_within_budget() {
        let third = r#"{"title":"Third try","description":"ok","tags":[],"reflection":{}}"#;
        let llm = ScriptedLlmClient::new()
            .then_err(transient())
            .then_err(transient())
            .then_ok(third);
        let p = Pipeline::new(llm, 3);

        let id = p.dispatcher.submit(epic_request("EXT-2")).await.unwrap();
        assert_eq!(p.process_next().await, Some(HandleOutcome::Completed));
        assert_eq!(p.llm.calls(), 3);

        let artifact = p.artifacts.get_by_request(id).await.unwrap().unwrap();
        assert_eq!(artifact.payload["title"], "Third try");
    }

    #[tokio::test(start_paused = true)]
    async fn two_transient_failures_exhaust_a_budget_of_two() {
        let llm = ScriptedLlmClient::new()
            .then_err(transient())
            .then_err(transient())
            .then_ok(EPIC);
        let p = Pipeline::new(llm, 2);

        let id = p.dispatcher.submit(epic_request("EXT-3")).await.unwrap();
        assert_eq!(
            p.process_next().await,
            Some(HandleOutcome::Failed(ErrorClassification::LlmUnavailable))
        );
        assert_eq!(p.llm.calls(), 2);
        assert_eq!(p.status_of(id).await, RequestStatus::Failed);
        assert!(p.artifacts.is_empty());

        let sent = p.notifications.ready_messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].outcome, Outcome::Failure);
        assert_eq!(
            sent[0].error_classification,
            Some(ErrorClassification::LlmUnavailable)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failure_is_not_retried() {
        let llm = ScriptedLlmClient::new()
            .then_err(LlmError::PolicyRejected("content_policy_violation".to_string()))
            .then_ok(EPIC);
        let p = Pipeline::new(llm, 5);

        let id = p.dispatcher.submit(epic_request("EXT-4")).await.unwrap();
        assert_eq!(
            p.process_next().await,
            Some(HandleOutcome::Failed(ErrorClassification::LlmRejected))
        );
        assert_eq!(p.llm.calls(), 1);

        let view = p.status.get_status(id).await.unwrap().unwrap();
        assert!(view.error_detail.unwrap().contains("content_policy_violation"));
    }

    #[tokio::test(start_paused = true)]
    async fn redelivery_after_ack_changes_nothing() {
        let p = Pipeline::new(ScriptedLlmClient::always(EPIC), 3);
        let id = p.dispatcher.submit(epic_request("EXT-5")).await.unwrap();
        let task = p.tasks.ready_messages().remove(0);

        assert_eq!(p.process_next().await, Some(HandleOutcome::Completed));

        // Broker hands the same message out again.
        p.tasks.publish(&task).await.unwrap();
        assert_eq!(
            p.process_next().await,
            Some(HandleOutcome::Duplicate(RequestStatus::Completed))
        );

        assert_eq!(p.llm.calls(), 1);
        assert_eq!(p.artifacts.len(), 1);
        assert_eq!(p.notifications.ready_len(), 1);
        assert_eq!(p.status_of(id).await, RequestStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn crash_before_ack_is_redelivered_without_side_effects() {
        let p = Pipeline::new(ScriptedLlmClient::always(EPIC), 3);
        p.dispatcher.submit(epic_request("EXT-6")).await.unwrap();

        let delivery = p
            .tasks
            .receive("c", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            p.worker.handle(&delivery.message).await.unwrap(),
            HandleOutcome::Completed
        );
        // Consumer dies before acking.
        assert_eq!(p.tasks.redeliver_in_flight(), 1);

        assert_eq!(
            p.process_next().await,
            Some(HandleOutcome::Duplicate(RequestStatus::Completed))
        );
        assert_eq!(p.tasks.in_flight_len(), 0);
        assert_eq!(p.notifications.ready_len(), 1);
        assert_eq!(p.artifacts.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn crash_between_terminal_write_and_notify_publishes_once() {
        let p = Pipeline::new(ScriptedLlmClient::always(EPIC), 3);
        let id = p.dispatcher.submit(epic_request("EXT-7")).await.unwrap();
        p.notifications.fail_next_publishes(1);

        assert_eq!(p.process_next().await, None);
        assert_eq!(p.status_of(id).await, RequestStatus::Completed);
        assert_eq!(p.notifications.ready_len(), 0);

        assert_eq!(p.process_next().await, Some(HandleOutcome::Renotified));
        assert_eq!(p.process_next().await, None);
        assert_eq!(p.notifications.ready_len(), 1);
        assert_eq!(p.llm.calls(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_deliveries_have_one_winner() {
        let llm = ScriptedLlmClient::always(EPIC).with_latency(Duration::from_millis(50));
        let p = Pipeline::new(llm, 3);
        p.dispatcher.submit(epic_request("EXT-8")).await.unwrap();
        let task = p.tasks.ready_messages().remove(0);

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let worker = p.worker.clone();
                let task = task.clone();
                tokio::spawn(async move { worker.handle(&task).await.unwrap() })
            })
            .collect();
        let mut outcomes = Vec::new();
        for h in handles {
            outcomes.push(h.await.unwrap());
        }

        let completed = outcomes
            .iter()
            .filter(|o| **o == HandleOutcome::Completed)
            .count();
        assert_eq!(completed, 1);
        assert!(outcomes
            .iter()
            .any(|o| matches!(o, HandleOutcome::Duplicate(_))));
        assert_eq!(p.llm.calls(), 1);
        assert_eq!(p.artifacts.len(), 1);
        assert_eq!(p.notifications.ready_len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn resubmission_gets_new_id_and_next_version() {
        let llm = ScriptedLlmClient::new()
            .then_err(LlmError::InvalidModel("gpt-404".to_string()))
            .then_ok(EPIC)
            .then_ok(EPIC);
        let p = Pipeline::new(llm, 3);

        let first = p.dispatcher.submit(epic_request("EXT-9")).await.unwrap();
        p.process_next().await;
        assert_eq!(p.status_of(first).await, RequestStatus::Failed);

        let second = p
            .dispatcher
            .resubmit(first, epic_request("EXT-9"))
            .await
            .unwrap();
        assert_ne!(first, second);
        assert_eq!(p.process_next().await, Some(HandleOutcome::Completed));

        let third = p.dispatcher.submit(epic_request("EXT-9")).await.unwrap();
        assert_eq!(p.process_next().await, Some(HandleOutcome::Completed));

        let view = p.status.get_status(second).await.unwrap().unwrap();
        assert_eq!(view.retry_of, Some(first));
        assert_eq!(p.status_of(first).await, RequestStatus::Failed);

        let versions = p
            .artifacts
            .list_versions(&ParentRef::new("EXT-9").unwrap(), TaskType::Epic)
            .await
            .unwrap();
        assert_eq!(versions.len(), 2);
        assert_eq!((versions[0].version, versions[0].active), (1, false));
        assert_eq!((versions[1].version, versions[1].active), (2, true));
        assert_eq!(versions[1].request_id, third);
        assert_eq!(p.notifications.ready_len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn enqueue_failure_is_notified_by_reconciler() {
        let p = Pipeline::new(ScriptedLlmClient::always(EPIC), 3);
        p.tasks.fail_next_publishes(3);

        let Err(DispatchError::Enqueue { request_id, .. }) =
            p.dispatcher.submit(epic_request("EXT-10")).await
        else {
            panic!("expected enqueue failure");
        };
        assert_eq!(p.status_of(request_id).await, RequestStatus::Failed);
        assert_eq!(p.notifications.ready_len(), 0);

        p.store
            .backdate(request_id, Utc::now() - chrono::Duration::minutes(10))
            .unwrap();
        let reconciler = Reconciler::new(
            p.store.clone(),
            p.notifications.clone(),
            ReconcileSettings::default(),
        );
        assert_eq!(reconciler.sweep().await.unwrap().notified, 1);

        let sent = p.notifications.ready_messages();
        assert_eq!(sent[0].request_id, request_id);
        assert_eq!(
            sent[0].error_classification,
            Some(ErrorClassification::EnqueueFailed)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn reconciler_fails_request_whose_worker_died() {
        let p = Pipeline::new(ScriptedLlmClient::always(EPIC), 3);
        let id = p.dispatcher.submit(epic_request("EXT-11")).await.unwrap();
        p.store
            .transition(
                id,
                RequestStatus::Pending,
                demandflow_core::StatusUpdate::Processing,
            )
            .await
            .unwrap();
        p.store
            .backdate(id, Utc::now() - chrono::Duration::hours(1))
            .unwrap();

        let reconciler = Reconciler::new(
            p.store.clone(),
            p.notifications.clone(),
            ReconcileSettings::default(),
        );
        assert_eq!(reconciler.sweep().await.unwrap().stalled, 1);

        // The queued task arrives late and must not resurrect the request.
        assert_eq!(
            p.process_next().await,
            Some(HandleOutcome::Duplicate(RequestStatus::Failed))
        );
        assert_eq!(p.llm.calls(), 0);
        assert_eq!(p.notifications.ready_len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_terminal_write_is_finished_by_the_redelivery() {
        let p = Pipeline::new(ScriptedLlmClient::always(EPIC), 3);
        // Both persist attempts of the first delivery fail.
        let flaky = p.worker_with(
            Arc::new(FlakyStore::failing(p.store.clone(), 2)),
            p.notifications.clone(),
        );
        let id = p.dispatcher.submit(epic_request("EXT-12")).await.unwrap();

        assert_eq!(p.process_next_with(&flaky).await, None);
        assert_eq!(p.status_of(id).await, RequestStatus::Processing);
        assert_eq!(p.artifacts.len(), 1);

        assert_eq!(p.process_next_with(&flaky).await, Some(HandleOutcome::Completed));
        assert_eq!(p.tasks.in_flight_len(), 0);
        assert_eq!(p.llm.calls(), 1);
        assert_eq!(p.artifacts.len(), 1);
        assert_eq!(p.notifications.ready_len(), 1);

        let stored = p.artifacts.get_by_request(id).await.unwrap().unwrap();
        let view = p.status.get_status(id).await.unwrap().unwrap();
        assert_eq!(view.status, RequestStatus::Completed);
        assert_eq!(view.result_summary.unwrap().artifact_id, stored.artifact_id);
    }

    #[tokio::test(start_paused = true)]
    async fn redelivery_takes_over_from_a_worker_that_died_mid_call() {
        let p = Pipeline::new(ScriptedLlmClient::always(EPIC), 3);
        let id = p.dispatcher.submit(epic_request("EXT-13")).await.unwrap();
        let task = p.tasks.ready_messages().remove(0);
        // A worker claimed the request and vanished before storing anything.
        p.store
            .transition(id, RequestStatus::Pending, StatusUpdate::Processing)
            .await
            .unwrap();
        assert_eq!(
            p.process_next().await,
            Some(HandleOutcome::Duplicate(RequestStatus::Processing))
        );

        p.store
            .backdate(id, Utc::now() - chrono::Duration::minutes(30))
            .unwrap();
        // Broker re-claims the delivery after its visibility timeout.
        p.tasks.publish(&task).await.unwrap();

        assert_eq!(p.process_next().await, Some(HandleOutcome::Completed));
        assert_eq!(p.llm.calls(), 1);
        assert_eq!(p.status_of(id).await, RequestStatus::Completed);
        assert_eq!(p.notifications.ready_len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_during_an_in_flight_publish_does_not_notify_twice() {
        let p = Pipeline::new(ScriptedLlmClient::always(EPIC), 3);
        let gated = Arc::new(GatedQueue::new(p.notifications.clone()));
        let worker = Arc::new(p.worker_with(p.store.clone(), gated.clone()));
        let id = p.dispatcher.submit(epic_request("EXT-14")).await.unwrap();
        let task = p.tasks.ready_messages().remove(0);

        let first = {
            let worker = worker.clone();
            let task = task.clone();
            tokio::spawn(async move { worker.handle(&task).await.unwrap() })
        };
        gated.entered.notified().await;
        assert_eq!(p.status_of(id).await, RequestStatus::Completed);

        // The record is terminal and unmarked, but the first publisher holds the claim.
        assert_eq!(
            worker.handle(&task).await.unwrap(),
            HandleOutcome::Duplicate(RequestStatus::Completed)
        );
        assert_eq!(p.notifications.ready_len(), 0);

        gated.gate.add_permits(1);
        assert_eq!(first.await.unwrap(), HandleOutcome::Completed);
        assert_eq!(p.notifications.ready_len(), 1);
        assert!(p.store.get(id).await.unwrap().unwrap().notified_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn reprocessing_revises_the_artifact_and_notifies_with_board_ids() {
        let revised = r#"{"title":"Billing, revised","description":"Split invoices","tags":[],"reflection":{}}"#;
        let llm = ScriptedLlmClient::new().then_ok(EPIC).then_ok(revised);
        let p = Pipeline::new(llm, 3);

        let original = p
            .dispatcher
            .submit(epic_request("EXT-15").with_correlation(
                Correlation::default()
                    .with_platform("azure_devops")
                    .with_work_item_id("WI-1"),
            ))
            .await
            .unwrap();
        assert_eq!(p.process_next().await, Some(HandleOutcome::Completed));
        let artifact = p.artifacts.get_by_request(original).await.unwrap().unwrap();

        let reprocess = p
            .dispatcher
            .reprocess(
                ReprocessRequest::new(
                    TaskType::Epic,
                    artifact.artifact_id,
                    PromptData::new("You write epics.", "Split the invoices"),
                )
                .with_correlation(
                    Correlation::default()
                        .with_work_item_id("WI-2")
                        .with_parent_board_id("BOARD-9"),
                ),
            )
            .await
            .unwrap();
        assert_eq!(p.process_next().await, Some(HandleOutcome::Completed));

        let view = p.status.get_status(reprocess).await.unwrap().unwrap();
        assert_eq!(view.reprocess_of, Some(artifact.artifact_id));
        let summary = view.result_summary.unwrap();
        assert_eq!((summary.artifact_id, summary.version), (artifact.artifact_id, 2));

        let stored = p.artifacts.get(artifact.artifact_id).await.unwrap().unwrap();
        assert_eq!(stored.payload["title"], "Billing, revised");
        assert_eq!(stored.token_usage, TokenUsage::new(20, 40));
        assert_eq!(p.artifacts.len(), 1);

        let sent = p.notifications.ready_messages();
        assert_eq!(sent.len(), 2);
        assert!(sent[1].is_reprocessing);
        assert_eq!(sent[1].result_ref, Some(artifact.artifact_id));
        assert_eq!(sent[1].version, Some(2));
        assert_eq!(sent[1].correlation.work_item_id.as_deref(), Some("WI-2"));
        assert_eq!(sent[1].correlation.parent_board_id.as_deref(), Some("BOARD-9"));
        assert_eq!(sent[1].correlation.platform.as_deref(), Some("azure_devops"));

        let moved = ReprocessRequest::new(
            TaskType::Epic,
            artifact.artifact_id,
            PromptData::new("You write epics.", "again"),
        )
        .with_correlation(Correlation::default().with_platform("jira"));
        assert!(matches!(
            p.dispatcher.reprocess(moved).await,
            Err(DispatchError::PlatformChanged { .. })
        ));
    }
}
