//! Request record storage.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use demandflow_core::{RequestId, RequestRecord, RequestStatus, StatusUpdate};

use super::StoreError;

/// Result of a conditional transition.
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
    /// The record was in the expected state and has been updated.
    Applied(RequestRecord),
    /// The record was not in the expected state; nothing was written.
    Skipped { current: RequestRecord },
}

impl TransitionOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, TransitionOutcome::Applied(_))
    }

    pub fn record(&self) -> &RequestRecord {
        match self {
            TransitionOutcome::Applied(r) => r,
            TransitionOutcome::Skipped { current } => current,
        }
    }
}

/// Request record store.
///
/// `transition` is the only way a status changes. It succeeds for exactly one
/// of any number of concurrent callers expecting the same `from` status.
#[async_trait]
pub trait RequestStore: Send + Sync {
    /// Insert a new record. Fails if the id already exists.
    async fn create(&self, record: RequestRecord) -> Result<(), StoreError>;

    async fn get(&self, request_id: RequestId) -> Result<Option<RequestRecord>, StoreError>;

    /// Apply `update` only if the current status equals `expected_from`.
    ///
    /// Edges outside the lifecycle are rejected before storage is touched.
    async fn transition(
        &self,
        request_id: RequestId,
        expected_from: RequestStatus,
        update: StatusUpdate,
    ) -> Result<TransitionOutcome, StoreError>;

    /// Take the right to publish the terminal notification.
    ///
    /// Succeeds for one caller while the record is terminal and not yet
    /// notified. A claim taken before `stale_before` has lapsed (its holder
    /// is presumed dead) and may be taken again.
    async fn claim_notification(
        &self,
        request_id: RequestId,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Drop a claim whose publish failed so the next caller can retry at once.
    async fn release_notification(&self, request_id: RequestId) -> Result<(), StoreError>;

    /// Record that the terminal notification went out.
    ///
    /// Returns `false` if it was already marked (or the record is not terminal).
    async fn mark_notified(&self, request_id: RequestId) -> Result<bool, StoreError>;

    /// Records in `status` whose last update is older than `older_than`, oldest first.
    async fn list_stale(
        &self,
        status: RequestStatus,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RequestRecord>, StoreError>;

    /// Terminal records never marked notified, updated before `older_than`.
    async fn list_unnotified(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RequestRecord>, StoreError>;
}

pub(crate) fn check_edge(
    request_id: RequestId,
    from: RequestStatus,
    update: &StatusUpdate,
) -> Result<(), StoreError> {
    let to = update.target();
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(StoreError::IllegalTransition {
            request_id,
            from,
            to,
        })
    }
}

/// In-memory request store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryRequestStore {
    records: RwLock<HashMap<RequestId, RequestRecord>>,
}

impl InMemoryRequestStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Overwrite timestamps; lets tests age records without waiting.
    pub fn backdate(&self, request_id: RequestId, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut records = self.write()?;
        let record = records
            .get_mut(&request_id)
            .ok_or(StoreError::NotFound(request_id))?;
        record.updated_at = at;
        match record.status {
            RequestStatus::Pending => record.created_at = at,
            RequestStatus::Processing => record.processing_started_at = Some(at),
            RequestStatus::Completed | RequestStatus::Failed => {}
        }
        Ok(())
    }

    fn read(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, HashMap<RequestId, RequestRecord>>, StoreError> {
        self.records
            .read()
            .map_err(|_| StoreError::Storage("request store lock poisoned".to_string()))
    }

    fn write(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<RequestId, RequestRecord>>, StoreError> {
        self.records
            .write()
            .map_err(|_| StoreError::Storage("request store lock poisoned".to_string()))
    }
}

#[async_trait]
impl RequestStore for InMemoryRequestStore {
    async fn create(&self, record: RequestRecord) -> Result<(), StoreError> {
        let mut records = self.write()?;
        if records.contains_key(&record.request_id) {
            return Err(StoreError::AlreadyExists(record.request_id));
        }
        records.insert(record.request_id, record);
        Ok(())
    }

    async fn get(&self, request_id: RequestId) -> Result<Option<RequestRecord>, StoreError> {
        Ok(self.read()?.get(&request_id).cloned())
    }

    async fn transition(
        &self,
        request_id: RequestId,
        expected_from: RequestStatus,
        update: StatusUpdate,
    ) -> Result<TransitionOutcome, StoreError> {
        check_edge(request_id, expected_from, &update)?;

        // Check and write under one lock: this is the compare-and-set.
        let mut records = self.write()?;
        let record = records
            .get_mut(&request_id)
            .ok_or(StoreError::NotFound(request_id))?;

        if record.status != expected_from {
            return Ok(TransitionOutcome::Skipped {
                current: record.clone(),
            });
        }

        let now = Utc::now().max(record.updated_at);
        record
            .apply(update, now)
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        Ok(TransitionOutcome::Applied(record.clone()))
    }

    async fn claim_notification(
        &self,
        request_id: RequestId,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut records = self.write()?;
        let record = records
            .get_mut(&request_id)
            .ok_or(StoreError::NotFound(request_id))?;
        let claimable = record.needs_notification()
            && record.notify_claimed_at.is_none_or(|at| at < stale_before);
        if claimable {
            record.notify_claimed_at = Some(Utc::now());
        }
        Ok(claimable)
    }

    async fn release_notification(&self, request_id: RequestId) -> Result<(), StoreError> {
        let mut records = self.write()?;
        let record = records
            .get_mut(&request_id)
            .ok_or(StoreError::NotFound(request_id))?;
        if record.notified_at.is_none() {
            record.notify_claimed_at = None;
        }
        Ok(())
    }

    async fn mark_notified(&self, request_id: RequestId) -> Result<bool, StoreError> {
        let mut records = self.write()?;
        let record = records
            .get_mut(&request_id)
            .ok_or(StoreError::NotFound(request_id))?;
        if !record.needs_notification() {
            return Ok(false);
        }
        record.notified_at = Some(Utc::now());
        Ok(true)
    }

    async fn list_stale(
        &self,
        status: RequestStatus,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RequestRecord>, StoreError> {
        let records = self.read()?;
        let mut stale: Vec<_> = records
            .values()
            .filter(|r| r.status == status && r.updated_at < older_than)
            .cloned()
            .collect();
        stale.sort_by_key(|r| r.updated_at);
        stale.truncate(limit);
        Ok(stale)
    }

    async fn list_unnotified(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RequestRecord>, StoreError> {
        let records = self.read()?;
        let mut owed: Vec<_> = records
            .values()
            .filter(|r| r.needs_notification() && r.updated_at < older_than)
            .cloned()
            .collect();
        owed.sort_by_key(|r| r.updated_at);
        owed.truncate(limit);
        Ok(owed)
    }
}

#[async_trait]
impl<S> RequestStore for Arc<S>
where
    S: RequestStore + ?Sized,
{
    async fn create(&self, record: RequestRecord) -> Result<(), StoreError> {
        (**self).create(record).await
    }

    async fn get(&self, request_id: RequestId) -> Result<Option<RequestRecord>, StoreError> {
        (**self).get(request_id).await
    }

    async fn transition(
        &self,
        request_id: RequestId,
        expected_from: RequestStatus,
        update: StatusUpdate,
    ) -> Result<TransitionOutcome, StoreError> {
        (**self).transition(request_id, expected_from, update).await
    }

    async fn claim_notification(
        &self,
        request_id: RequestId,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        (**self).claim_notification(request_id, stale_before).await
    }

    async fn release_notification(&self, request_id: RequestId) -> Result<(), StoreError> {
        (**self).release_notification(request_id).await
    }

    async fn mark_notified(&self, request_id: RequestId) -> Result<bool, StoreError> {
        (**self).mark_notified(request_id).await
    }

    async fn list_stale(
        &self,
        status: RequestStatus,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RequestRecord>, StoreError> {
        (**self).list_stale(status, older_than, limit).await
    }

    async fn list_unnotified(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RequestRecord>, StoreError> {
        (**self).list_unnotified(older_than, limit).await
    }
}
