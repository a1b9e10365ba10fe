//! Generated artifact storage.
//!
//! One artifact per completed request. Artifacts for the same
//! `(parent, task_type)` form a version sequence; only the newest is active.
//! A reprocessing request revises an existing artifact in place: it takes the
//! next version of the sequence and becomes the active one again.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use demandflow_core::{ArtifactId, Correlation, ParentRef, RequestId, TaskType, TokenUsage};

use super::StoreError;

/// Artifact to persist for a request.
#[derive(Debug, Clone, PartialEq)]
pub struct NewArtifact {
    pub request_id: RequestId,
    pub parent: ParentRef,
    pub task_type: TaskType,
    pub payload: JsonValue,
    pub item_count: u32,
    pub token_usage: TokenUsage,
    pub correlation: Correlation,
}

/// New content for an existing artifact, produced by a reprocessing request.
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactRevision {
    pub request_id: RequestId,
    pub payload: JsonValue,
    pub item_count: u32,
    /// Usage of this completion; added to the artifact's running total
    pub token_usage: TokenUsage,
    pub correlation: Correlation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredArtifact {
    pub artifact_id: ArtifactId,
    /// The request that created the artifact
    pub request_id: RequestId,
    pub parent: ParentRef,
    pub task_type: TaskType,
    pub version: u32,
    pub payload: JsonValue,
    pub item_count: u32,
    /// Cumulative across the original generation and every revision
    pub token_usage: TokenUsage,
    pub correlation: Correlation,
    pub active: bool,
    /// The reprocessing request that last revised the artifact
    pub revised_by: Option<RequestId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StoredArtifact {
    /// Created or last revised by `request_id`.
    pub fn written_by(&self, request_id: RequestId) -> bool {
        self.request_id == request_id || self.revised_by == Some(request_id)
    }

    pub(crate) fn revise(&mut self, revision: ArtifactRevision, version: u32, at: DateTime<Utc>) {
        self.payload = revision.payload;
        self.item_count = revision.item_count;
        self.token_usage = self.token_usage.accumulate(revision.token_usage);
        self.correlation = self.correlation.revised(&revision.correlation);
        self.version = version;
        self.active = true;
        self.revised_by = Some(revision.request_id);
        self.updated_at = at;
    }
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store the artifact for `artifact.request_id`.
    ///
    /// Idempotent: if the request already has an artifact, that one is
    /// returned and nothing is written. Otherwise the new artifact gets the
    /// next version for its `(parent, task_type)` and earlier versions are
    /// deactivated.
    async fn put(&self, artifact: NewArtifact) -> Result<StoredArtifact, StoreError>;

    /// Replace the content of `artifact_id` with `revision`.
    ///
    /// Token usage accumulates, the version moves to the next one for the
    /// artifact's `(parent, task_type)` and the artifact becomes active.
    /// Idempotent per `revision.request_id`: repeating the last revision
    /// returns the artifact unchanged.
    async fn update_in_place(
        &self,
        artifact_id: ArtifactId,
        revision: ArtifactRevision,
    ) -> Result<StoredArtifact, StoreError>;

    async fn get(&self, artifact_id: ArtifactId) -> Result<Option<StoredArtifact>, StoreError>;

    /// The artifact created, or last revised, by `request_id`.
    async fn get_by_request(
        &self,
        request_id: RequestId,
    ) -> Result<Option<StoredArtifact>, StoreError>;

    /// All versions for a parent and task type, oldest first.
    async fn list_versions(
        &self,
        parent: &ParentRef,
        task_type: TaskType,
    ) -> Result<Vec<StoredArtifact>, StoreError>;
}

/// In-memory artifact store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryArtifactStore {
    by_id: RwLock<HashMap<ArtifactId, StoredArtifact>>,
}

impl InMemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_id.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned() -> StoreError {
    StoreError::Storage("artifact store lock poisoned".to_string())
}

/// Deactivate the `(parent, task_type)` sequence and return its latest version.
fn retire_sequence(
    map: &mut HashMap<ArtifactId, StoredArtifact>,
    parent: &ParentRef,
    task_type: TaskType,
) -> u32 {
    let mut latest = 0;
    for stored in map
        .values_mut()
        .filter(|a| &a.parent == parent && a.task_type == task_type)
    {
        latest = latest.max(stored.version);
        stored.active = false;
    }
    latest
}

#[async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    async fn put(&self, artifact: NewArtifact) -> Result<StoredArtifact, StoreError> {
        let mut map = self.by_id.write().map_err(|_| poisoned())?;
        if let Some(existing) = map.values().find(|a| a.request_id == artifact.request_id) {
            return Ok(existing.clone());
        }

        let latest = retire_sequence(&mut map, &artifact.parent, artifact.task_type);
        let now = Utc::now();
        let stored = StoredArtifact {
            artifact_id: ArtifactId::new(),
            request_id: artifact.request_id,
            parent: artifact.parent,
            task_type: artifact.task_type,
            version: latest + 1,
            payload: artifact.payload,
            item_count: artifact.item_count,
            token_usage: artifact.token_usage,
            correlation: artifact.correlation,
            active: true,
            revised_by: None,
            created_at: now,
            updated_at: now,
        };
        map.insert(stored.artifact_id, stored.clone());
        Ok(stored)
    }

    async fn update_in_place(
        &self,
        artifact_id: ArtifactId,
        revision: ArtifactRevision,
    ) -> Result<StoredArtifact, StoreError> {
        let mut map = self.by_id.write().map_err(|_| poisoned())?;
        let (parent, task_type) = match map.get(&artifact_id) {
            None => return Err(StoreError::ArtifactNotFound(artifact_id)),
            Some(existing) if existing.revised_by == Some(revision.request_id) => {
                return Ok(existing.clone());
            }
            Some(existing) => (existing.parent.clone(), existing.task_type),
        };

        let latest = retire_sequence(&mut map, &parent, task_type);
        let stored = map
            .get_mut(&artifact_id)
            .ok_or(StoreError::ArtifactNotFound(artifact_id))?;
        stored.revise(revision, latest + 1, Utc::now());
        Ok(stored.clone())
    }

    async fn get(&self, artifact_id: ArtifactId) -> Result<Option<StoredArtifact>, StoreError> {
        let map = self.by_id.read().map_err(|_| poisoned())?;
        Ok(map.get(&artifact_id).cloned())
    }

    async fn get_by_request(
        &self,
        request_id: RequestId,
    ) -> Result<Option<StoredArtifact>, StoreError> {
        let map = self.by_id.read().map_err(|_| poisoned())?;
        Ok(map.values().find(|a| a.written_by(request_id)).cloned())
    }

    async fn list_versions(
        &self,
        parent: &ParentRef,
        task_type: TaskType,
    ) -> Result<Vec<StoredArtifact>, StoreError> {
        let map = self.by_id.read().map_err(|_| poisoned())?;
        let mut versions: Vec<_> = map
            .values()
            .filter(|a| &a.parent == parent && a.task_type == task_type)
            .cloned()
            .collect();
        versions.sort_by_key(|a| a.version);
        Ok(versions)
    }
}
