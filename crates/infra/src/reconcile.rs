//! Periodic repair of requests the normal flow left behind.
//!
//! - `pending` too long: the task message never reached a worker → `failed (orphaned)`
//! - `processing` too long: the worker died mid-task → `failed (stalled)`
//! - terminal but never marked notified: publish the notification
//!
//! Every write goes through the conditional transition, so a sweep racing a
//! live worker changes nothing the worker already moved.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

use demandflow_core::{ErrorClassification, RequestRecord, RequestStatus, StatusUpdate};
use demandflow_messaging::{MessageQueue, NotificationMessage};

use crate::chrono_duration;
use crate::notify::{self, NotifyError};
use crate::store::{RequestStore, StoreError, TransitionOutcome};

#[derive(Debug, Clone)]
pub struct ReconcileSettings {
    pub interval: Duration,
    pub orphan_after: Duration,
    pub stall_after: Duration,
    pub notify_grace: Duration,
    /// Max records handled per category per sweep
    pub batch_size: usize,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            orphan_after: Duration::from_secs(3600),
            stall_after: Duration::from_secs(1800),
            notify_grace: Duration::from_secs(300),
            batch_size: 100,
        }
    }
}

/// Counts from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub orphaned: usize,
    pub stalled: usize,
    pub notified: usize,
    /// Records that could not be repaired this sweep; retried next time.
    pub errors: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

pub struct Reconciler {
    store: Arc<dyn RequestStore>,
    notifications: Arc<dyn MessageQueue<NotificationMessage>>,
    settings: ReconcileSettings,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn RequestStore>,
        notifications: Arc<dyn MessageQueue<NotificationMessage>>,
        settings: ReconcileSettings,
    ) -> Self {
        Self {
            store,
            notifications,
            settings,
        }
    }

    #[instrument(skip(self), err)]
    pub async fn sweep(&self) -> Result<SweepReport, StoreError> {
        let mut report = SweepReport::default();

        let (orphaned, errors) = self
            .fail_stale(
                RequestStatus::Pending,
                self.settings.orphan_after,
                ErrorClassification::Orphaned,
                "no worker picked up the request",
            )
            .await?;
        report.orphaned = orphaned;
        report.errors += errors;

        let (stalled, errors) = self
            .fail_stale(
                RequestStatus::Processing,
                self.settings.stall_after,
                ErrorClassification::Stalled,
                "processing did not finish",
            )
            .await?;
        report.stalled = stalled;
        report.errors += errors;

        let cutoff = Utc::now() - chrono_duration(self.settings.notify_grace);
        for record in self
            .store
            .list_unnotified(cutoff, self.settings.batch_size)
            .await?
        {
            match self.notify(&record).await {
                Ok(true) => report.notified += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(request_id = %record.request_id, error = %e, "notification publish failed");
                    report.errors += 1;
                }
            }
        }

        if !report.is_empty() {
            info!(
                orphaned = report.orphaned,
                stalled = report.stalled,
                notified = report.notified,
                errors = report.errors,
                "reconcile sweep repaired requests"
            );
        }
        Ok(report)
    }

    /// Sweep every `interval` until `shutdown` flips to `true`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.sweep().await {
                warn!(error = %e, "reconcile sweep failed");
            }
        }
        info!("reconciler stopped");
    }

    /// Returns (failed, errors).
    async fn fail_stale(
        &self,
        status: RequestStatus,
        older_than: Duration,
        classification: ErrorClassification,
        detail: &str,
    ) -> Result<(usize, usize), StoreError> {
        let cutoff = Utc::now() - chrono_duration(older_than);
        let stale = self
            .store
            .list_stale(status, cutoff, self.settings.batch_size)
            .await?;

        let mut failed = 0;
        let mut errors = 0;
        for record in stale {
            let update = StatusUpdate::failed(
                classification,
                format!("{detail} within {}s", older_than.as_secs()),
            );
            match self.store.transition(record.request_id, status, update).await {
                Ok(TransitionOutcome::Applied(record)) => {
                    warn!(
                        request_id = %record.request_id,
                        classification = %classification,
                        "request failed by reconciler"
                    );
                    failed += 1;
                    if let Err(e) = self.notify(&record).await {
                        warn!(request_id = %record.request_id, error = %e, "notification publish failed");
                        errors += 1;
                    }
                }
                // Moved on since it was listed.
                Ok(TransitionOutcome::Skipped { .. }) => {}
                Err(e) => {
                    error!(request_id = %record.request_id, error = %e, "could not fail stale request");
                    errors += 1;
                }
            }
        }
        Ok((failed, errors))
    }

    /// A failed publish is left for the next sweep. A claim held by a
    /// publisher that died lapses after `notify_grace`.
    async fn notify(&self, record: &RequestRecord) -> Result<bool, NotifyError> {
        notify::publish_terminal(
            self.notifications.as_ref(),
            self.store.as_ref(),
            record,
            self.settings.notify_grace,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use demandflow_core::{ParentRef, RequestId, TaskType};
    use demandflow_messaging::{InMemoryQueue, Outcome};

    use crate::store::InMemoryRequestStore;

    fn setup() -> (
        Arc<InMemoryRequestStore>,
        Arc<InMemoryQueue<NotificationMessage>>,
        Reconciler,
    ) {
        let store = InMemoryRequestStore::arc();
        let notifications = Arc::new(InMemoryQueue::new());
        let reconciler = Reconciler::new(
            store.clone(),
            notifications.clone(),
            ReconcileSettings::default(),
        );
        (store, notifications, reconciler)
    }

    async fn insert(store: &InMemoryRequestStore) -> RequestId {
        let record = RequestRecord::pending(
            RequestId::new(),
            ParentRef::new("EXT-1").unwrap(),
            TaskType::Feature,
            Utc::now(),
        );
        let id = record.request_id;
        store.create(record).await.unwrap();
        id
    }

    fn hours_ago(h: i64) -> chrono::DateTime<Utc> {
        Utc::now() - chrono::Duration::hours(h)
    }

    #[tokio::test]
    async fn fresh_records_are_left_alone() {
        let (store, notifications, reconciler) = setup();
        insert(&store).await;

        assert!(reconciler.sweep().await.unwrap().is_empty());
        assert_eq!(notifications.ready_len(), 0);
    }

    #[tokio::test]
    async fn old_pending_is_orphaned_and_notified() {
        let (store, notifications, reconciler) = setup();
        let id = insert(&store).await;
        store.backdate(id, hours_ago(2)).unwrap();

        let report = reconciler.sweep().await.unwrap();
        assert_eq!(report.orphaned, 1);

        let record = store.get(id).await.unwrap().unwrap();
        assert_eq!(record.status, RequestStatus::Failed);
        assert_eq!(record.error_classification, Some(ErrorClassification::Orphaned));
        assert!(record.notified_at.is_some());

        let sent = notifications.ready_messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].outcome, Outcome::Failure);
    }

    #[tokio::test]
    async fn old_processing_is_stalled() {
        let (store, _, reconciler) = setup();
        let id = insert(&store).await;
        store
            .transition(id, RequestStatus::Pending, StatusUpdate::Processing)
            .await
            .unwrap();
        store.backdate(id, hours_ago(1)).unwrap();

        let report = reconciler.sweep().await.unwrap();
        assert_eq!(report.stalled, 1);
        assert_eq!(report.orphaned, 0);
        assert_eq!(
            store.get(id).await.unwrap().unwrap().error_classification,
            Some(ErrorClassification::Stalled)
        );
    }

    #[tokio::test]
    async fn unnotified_terminal_record_is_published_once() {
        let (store, notifications, reconciler) = setup();
        let id = insert(&store).await;
        store
            .transition(
                id,
                RequestStatus::Pending,
                StatusUpdate::failed(ErrorClassification::EnqueueFailed, "broker down"),
            )
            .await
            .unwrap();
        store.backdate(id, hours_ago(1)).unwrap();

        assert_eq!(reconciler.sweep().await.unwrap().notified, 1);
        assert_eq!(reconciler.sweep().await.unwrap().notified, 0);
        assert_eq!(notifications.ready_len(), 1);
    }

    #[tokio::test]
    async fn publish_failure_is_retried_next_sweep() {
        let (store, notifications, reconciler) = setup();
        let id = insert(&store).await;
        store.backdate(id, hours_ago(2)).unwrap();
        notifications.fail_next_publishes(1);

        let first = reconciler.sweep().await.unwrap();
        assert_eq!((first.orphaned, first.errors), (1, 1));
        assert!(store.get(id).await.unwrap().unwrap().notified_at.is_none());

        store.backdate(id, hours_ago(1)).unwrap();
        let second = reconciler.sweep().await.unwrap();
        assert_eq!(second.notified, 1);
        assert_eq!(notifications.ready_len(), 1);
    }

    #[tokio::test]
    async fn live_publisher_claim_is_left_to_its_holder() {
        let (store, notifications, reconciler) = setup();
        let id = insert(&store).await;
        store
            .transition(
                id,
                RequestStatus::Pending,
                StatusUpdate::failed(ErrorClassification::EnqueueFailed, "broker down"),
            )
            .await
            .unwrap();
        assert!(store.claim_notification(id, hours_ago(1)).await.unwrap());
        store.backdate(id, hours_ago(1)).unwrap();

        let report = reconciler.sweep().await.unwrap();
        assert_eq!((report.notified, report.errors), (0, 0));
        assert_eq!(notifications.ready_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_on_shutdown() {
        let (_, _, reconciler) = setup();
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(async move { reconciler.run(rx).await });

        tokio::time::sleep(Duration::from_secs(150)).await;
        tx.send(true).unwrap();
        task.await.unwrap();
    }
}
