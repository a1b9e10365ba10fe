//! Read-only status lookup.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use demandflow_core::{
    ArtifactId, ErrorClassification, ParentRef, RequestId, RequestRecord, RequestStatus, ResultSummary,
    TaskType,
};

use crate::store::{RequestStore, StoreError};

/// What a caller sees when asking about a request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestStatusView {
    pub request_id: RequestId,
    pub parent: ParentRef,
    pub task_type: TaskType,
    pub status: RequestStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_summary: Option<ResultSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_classification: Option<ErrorClassification>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_of: Option<RequestId>,
    /// Set when the request regenerates an existing artifact
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reprocess_of: Option<ArtifactId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<RequestRecord> for RequestStatusView {
    fn from(r: RequestRecord) -> Self {
        Self {
            request_id: r.request_id,
            parent: r.parent,
            task_type: r.task_type,
            status: r.status,
            result_summary: r.result,
            error_detail: r.error_detail,
            error_classification: r.error_classification,
            retry_of: r.retry_of,
            reprocess_of: r.reprocess_of,
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}

/// Reflects the latest committed transition; never writes.
#[derive(Clone)]
pub struct StatusQueryService {
    store: Arc<dyn RequestStore>,
}

impl StatusQueryService {
    pub fn new(store: Arc<dyn RequestStore>) -> Self {
        Self { store }
    }

    /// `Ok(None)` when the id is unknown.
    pub async fn get_status(
        &self,
        request_id: RequestId,
    ) -> Result<Option<RequestStatusView>, StoreError> {
        Ok(self.store.get(request_id).await?.map(RequestStatusView::from))
    }
}
