//! Message schemas for the task and notification queues.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use demandflow_core::{
    ArtifactId, Correlation, ErrorClassification, GenerationRequest, LlmConfig, ParentRef,
    PromptData, ReprocessRequest, RequestId, RequestRecord, RequestStatus, TaskType, TokenUsage,
};

/// Everything a worker needs to process one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMessage {
    pub request_id: RequestId,
    pub parent: ParentRef,
    pub task_type: TaskType,
    pub prompt_data: PromptData,
    pub llm_config: LlmConfig,
    /// Regenerate this artifact in place instead of creating a new one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reprocess_of: Option<ArtifactId>,
    #[serde(default)]
    pub correlation: Correlation,
}

impl TaskMessage {
    pub fn for_request(request_id: RequestId, request: &GenerationRequest) -> Self {
        Self {
            request_id,
            parent: request.parent.clone(),
            task_type: request.task_type,
            prompt_data: request.prompt_data.clone(),
            llm_config: request.llm_config.clone(),
            reprocess_of: None,
            correlation: request.correlation.clone(),
        }
    }

    /// `parent` is the parent of the artifact being regenerated.
    pub fn for_reprocess(request_id: RequestId, parent: ParentRef, request: &ReprocessRequest) -> Self {
        Self {
            request_id,
            parent,
            task_type: request.task_type,
            prompt_data: request.prompt_data.clone(),
            llm_config: request.llm_config.clone(),
            reprocess_of: Some(request.artifact_id),
            correlation: request.correlation.clone(),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
}

/// Published once per terminal request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationMessage {
    pub request_id: RequestId,
    pub parent: ParentRef,
    pub task_type: TaskType,
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_ref: Option<ArtifactId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<TokenUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_classification: Option<ErrorClassification>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// The request regenerated an existing artifact.
    #[serde(default)]
    pub is_reprocessing: bool,
    #[serde(flatten)]
    pub correlation: Correlation,
    pub occurred_at: DateTime<Utc>,
}

impl NotificationMessage {
    /// Build the notification for a terminal record.
    ///
    /// Returns `None` for non-terminal records. The message is derived purely
    /// from the record, so republishing after a crash yields the same payload.
    pub fn from_terminal(record: &RequestRecord) -> Option<Self> {
        let outcome = match record.status {
            RequestStatus::Completed => Outcome::Success,
            RequestStatus::Failed => Outcome::Failure,
            RequestStatus::Pending | RequestStatus::Processing => return None,
        };

        let result = record.result.as_ref();
        Some(Self {
            request_id: record.request_id,
            parent: record.parent.clone(),
            task_type: record.task_type,
            outcome,
            result_ref: result.map(|r| r.artifact_id),
            version: result.map(|r| r.version),
            item_count: result.map(|r| r.item_count),
            token_usage: result.map(|r| r.token_usage),
            error_classification: record.error_classification,
            error_message: record.error_detail.clone(),
            is_reprocessing: record.is_reprocessing(),
            correlation: record.correlation.clone(),
            occurred_at: record.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use demandflow_core::{ResultSummary, StatusUpdate};

    fn record() -> RequestRecord {
        RequestRecord::pending(
            RequestId::new(),
            ParentRef::new("EXT-42").unwrap(),
            TaskType::Epic,
            Utc::now(),
        )
    }

    #[test]
    fn non_terminal_records_have_no_notification() {
        let mut r = record();
        assert!(NotificationMessage::from_terminal(&r).is_none());
        r.apply(StatusUpdate::Processing, Utc::now()).unwrap();
        assert!(NotificationMessage::from_terminal(&r).is_none());
    }

    #[test]
    fn success_notification_carries_result_reference() {
        let mut r = record();
        r.apply(StatusUpdate::Processing, Utc::now()).unwrap();
        let artifact_id = ArtifactId::new();
        r.apply(
            StatusUpdate::Completed(ResultSummary {
                artifact_id,
                version: 3,
                item_count: 1,
                token_usage: TokenUsage::new(12, 34),
            }),
            Utc::now(),
        )
        .unwrap();

        let n = NotificationMessage::from_terminal(&r).unwrap();
        assert_eq!(n.outcome, Outcome::Success);
        assert_eq!(n.parent.as_str(), "EXT-42");
        assert_eq!(n.result_ref, Some(artifact_id));
        assert_eq!(n.version, Some(3));
        assert_eq!(n.token_usage.map(|u| u.total()), Some(46));
        assert!(n.error_classification.is_none());
    }

    #[test]
    fn failure_notification_carries_classification() {
        let mut r = record();
        r.apply(
            StatusUpdate::failed(ErrorClassification::EnqueueFailed, "broker down"),
            Utc::now(),
        )
        .unwrap();

        let n = NotificationMessage::from_terminal(&r).unwrap();
        assert_eq!(n.outcome, Outcome::Failure);
        assert_eq!(n.error_classification, Some(ErrorClassification::EnqueueFailed));
        assert_eq!(n.error_message.as_deref(), Some("broker down"));
        assert!(n.result_ref.is_none());

        let json = serde_json::to_value(&n).unwrap();
        assert_eq!(json["outcome"], "failure");
        assert!(json.get("result_ref").is_none());
        assert_eq!(json["is_reprocessing"], false);
    }

    #[test]
    fn reprocessing_notification_carries_board_identifiers() {
        let artifact_id = ArtifactId::new();
        let mut r = record()
            .with_reprocess_of(artifact_id)
            .with_correlation(
                Correlation::default()
                    .with_work_item_id("4711")
                    .with_parent_board_id("board-2")
                    .with_platform("azure"),
            );
        r.apply(StatusUpdate::Processing, Utc::now()).unwrap();
        r.apply(
            StatusUpdate::Completed(ResultSummary {
                artifact_id,
                version: 2,
                item_count: 1,
                token_usage: TokenUsage::new(30, 60),
            }),
            Utc::now(),
        )
        .unwrap();

        let n = NotificationMessage::from_terminal(&r).unwrap();
        assert!(n.is_reprocessing);
        assert_eq!(n.result_ref, Some(artifact_id));

        let json = serde_json::to_value(&n).unwrap();
        assert_eq!(json["work_item_id"], "4711");
        assert_eq!(json["parent_board_id"], "board-2");
        assert_eq!(json["platform"], "azure");
        assert!(json.get("parent_type").is_none());
    }

    #[test]
    fn task_message_for_reprocess_targets_the_artifact() {
        let artifact_id = ArtifactId::new();
        let request = ReprocessRequest::new(
            TaskType::Feature,
            artifact_id,
            PromptData::new("system", "rewrite"),
        );
        let task = TaskMessage::for_reprocess(
            RequestId::new(),
            ParentRef::new("EXT-42").unwrap(),
            &request,
        );
        assert_eq!(task.reprocess_of, Some(artifact_id));
        assert_eq!(task.parent.as_str(), "EXT-42");
        assert_eq!(task.task_type, TaskType::Feature);
    }
}
