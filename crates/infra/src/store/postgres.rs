//! Postgres-backed request and artifact stores.
//!
//! ## Conditional transition
//!
//! `transition` reads the row, applies the status update in memory (which
//! enforces the lifecycle edges), then writes it back with
//! `UPDATE ... WHERE request_id = $1 AND status = <expected>`. If another
//! writer got there first the update matches zero rows and the caller gets
//! `Skipped` with the row as it now stands. No row lock is held between the
//! read and the write.
//!
//! ## Artifact versions
//!
//! `put` and `update_in_place` both take a transaction-scoped advisory lock
//! keyed by `(parent, task_type)` before reading the latest version, so the
//! sequence has no gaps or duplicates. The `(parent, task_type, version)`
//! unique key backs this up.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed / network / other | N/A | `Storage` |
//! | Row decode failure | N/A | `Corrupt` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::instrument;

use demandflow_core::{
    ArtifactId, Correlation, ErrorClassification, ParentRef, RequestId, RequestRecord, RequestStatus,
    ResultSummary, StatusUpdate, TaskType, TokenUsage,
};

use super::artifacts::{ArtifactRevision, ArtifactStore, NewArtifact, StoredArtifact};
use super::requests::{check_edge, RequestStore, TransitionOutcome};
use super::StoreError;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS requests (
        request_id            UUID PRIMARY KEY,
        parent                TEXT NOT NULL,
        task_type             TEXT NOT NULL,
        status                TEXT NOT NULL
            CHECK (status IN ('pending', 'processing', 'completed', 'failed')),
        created_at            TIMESTAMPTZ NOT NULL,
        updated_at            TIMESTAMPTZ NOT NULL,
        processing_started_at TIMESTAMPTZ,
        error_detail          TEXT,
        error_classification  TEXT,
        result                JSONB,
        notified_at           TIMESTAMPTZ,
        notify_claimed_at     TIMESTAMPTZ,
        retry_of              UUID REFERENCES requests (request_id),
        reprocess_of          UUID,
        correlation           JSONB NOT NULL DEFAULT '{}'::jsonb
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS requests_status_updated_at_idx
        ON requests (status, updated_at)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS generated_artifacts (
        artifact_id       UUID PRIMARY KEY,
        request_id        UUID NOT NULL UNIQUE REFERENCES requests (request_id),
        parent            TEXT NOT NULL,
        task_type         TEXT NOT NULL,
        version           INTEGER NOT NULL CHECK (version > 0),
        payload           JSONB NOT NULL,
        item_count        INTEGER NOT NULL,
        prompt_tokens     INTEGER NOT NULL,
        completion_tokens INTEGER NOT NULL,
        correlation       JSONB NOT NULL DEFAULT '{}'::jsonb,
        active            BOOLEAN NOT NULL,
        revised_by        UUID,
        created_at        TIMESTAMPTZ NOT NULL,
        updated_at        TIMESTAMPTZ NOT NULL,
        UNIQUE (parent, task_type, version)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS generated_artifacts_revised_by_idx
        ON generated_artifacts (revised_by)
    "#,
];

const REQUEST_COLUMNS: &str = "request_id, parent, task_type, status, created_at, updated_at, \
     processing_started_at, error_detail, error_classification, result, notified_at, \
     notify_claimed_at, retry_of, reprocess_of, correlation";

const ARTIFACT_COLUMNS: &str = "artifact_id, request_id, parent, task_type, version, payload, \
     item_count, prompt_tokens, completion_tokens, correlation, active, revised_by, created_at, \
     updated_at";

/// Create tables and indexes if they do not exist.
pub async fn ensure_schema(pool: &PgPool) -> Result<(), StoreError> {
    for statement in SCHEMA {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
    }
    Ok(())
}

/// Postgres-backed request store.
#[derive(Debug, Clone)]
pub struct PostgresRequestStore {
    pool: Arc<PgPool>,
}

impl PostgresRequestStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    async fn fetch(&self, request_id: RequestId) -> Result<Option<RequestRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {REQUEST_COLUMNS} FROM requests WHERE request_id = $1"
        ))
        .bind(request_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_request", e))?;

        row.map(|r| decode_request(&r)).transpose()
    }
}

#[async_trait]
impl RequestStore for PostgresRequestStore {
    #[instrument(skip(self, record), fields(request_id = %record.request_id), err)]
    async fn create(&self, record: RequestRecord) -> Result<(), StoreError> {
        let result = encode_result(record.result.as_ref())?;
        sqlx::query(&format!(
            "INSERT INTO requests ({REQUEST_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)"
        ))
        .bind(record.request_id.as_uuid())
        .bind(record.parent.as_str())
        .bind(record.task_type.as_str())
        .bind(record.status.as_str())
        .bind(record.created_at)
        .bind(record.updated_at)
        .bind(record.processing_started_at)
        .bind(record.error_detail.as_deref())
        .bind(record.error_classification.map(|c| c.as_str()))
        .bind(result)
        .bind(record.notified_at)
        .bind(record.notify_claimed_at)
        .bind(record.retry_of.map(uuid::Uuid::from))
        .bind(record.reprocess_of.map(uuid::Uuid::from))
        .bind(encode_correlation(&record.correlation)?)
        .execute(&*self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::AlreadyExists(record.request_id)
            } else {
                map_sqlx_error("create_request", e)
            }
        })?;
        Ok(())
    }

    #[instrument(skip(self), fields(request_id = %request_id), err)]
    async fn get(&self, request_id: RequestId) -> Result<Option<RequestRecord>, StoreError> {
        self.fetch(request_id).await
    }

    #[instrument(
        skip(self, update),
        fields(request_id = %request_id, from = %expected_from, to = %update.target()),
        err
    )]
    async fn transition(
        &self,
        request_id: RequestId,
        expected_from: RequestStatus,
        update: StatusUpdate,
    ) -> Result<TransitionOutcome, StoreError> {
        check_edge(request_id, expected_from, &update)?;

        let mut record = self
            .fetch(request_id)
            .await?
            .ok_or(StoreError::NotFound(request_id))?;
        if record.status != expected_from {
            return Ok(TransitionOutcome::Skipped { current: record });
        }

        let now = Utc::now().max(record.updated_at);
        record
            .apply(update, now)
            .map_err(|e| StoreError::Storage(e.to_string()))?;

        let done = sqlx::query(
            r#"
            UPDATE requests
            SET status = $2,
                updated_at = $3,
                processing_started_at = $4,
                error_detail = $5,
                error_classification = $6,
                result = $7
            WHERE request_id = $1 AND status = $8
            "#,
        )
        .bind(request_id.as_uuid())
        .bind(record.status.as_str())
        .bind(record.updated_at)
        .bind(record.processing_started_at)
        .bind(record.error_detail.as_deref())
        .bind(record.error_classification.map(|c| c.as_str()))
        .bind(encode_result(record.result.as_ref())?)
        .bind(expected_from.as_str())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("transition_request", e))?;

        if done.rows_affected() == 1 {
            return Ok(TransitionOutcome::Applied(record));
        }

        // Lost the race: report what the winner wrote.
        let current = self
            .fetch(request_id)
            .await?
            .ok_or(StoreError::NotFound(request_id))?;
        Ok(TransitionOutcome::Skipped { current })
    }

    #[instrument(skip(self), fields(request_id = %request_id), err)]
    async fn claim_notification(
        &self,
        request_id: RequestId,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let done = sqlx::query(
            r#"
            UPDATE requests
            SET notify_claimed_at = now()
            WHERE request_id = $1
              AND notified_at IS NULL
              AND status IN ('completed', 'failed')
              AND (notify_claimed_at IS NULL OR notify_claimed_at < $2)
            "#,
        )
        .bind(request_id.as_uuid())
        .bind(stale_before)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_notification", e))?;

        if done.rows_affected() == 1 {
            return Ok(true);
        }
        match self.fetch(request_id).await? {
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound(request_id)),
        }
    }

    #[instrument(skip(self), fields(request_id = %request_id), err)]
    async fn release_notification(&self, request_id: RequestId) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE requests
            SET notify_claimed_at = NULL
            WHERE request_id = $1 AND notified_at IS NULL
            "#,
        )
        .bind(request_id.as_uuid())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("release_notification", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(request_id = %request_id), err)]
    async fn mark_notified(&self, request_id: RequestId) -> Result<bool, StoreError> {
        let done = sqlx::query(
            r#"
            UPDATE requests
            SET notified_at = now()
            WHERE request_id = $1
              AND notified_at IS NULL
              AND status IN ('completed', 'failed')
            "#,
        )
        .bind(request_id.as_uuid())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_notified", e))?;

        if done.rows_affected() == 1 {
            return Ok(true);
        }
        match self.fetch(request_id).await? {
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound(request_id)),
        }
    }

    #[instrument(skip(self), fields(status = %status), err)]
    async fn list_stale(
        &self,
        status: RequestStatus,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RequestRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {REQUEST_COLUMNS} FROM requests \
             WHERE status = $1 AND updated_at < $2 \
             ORDER BY updated_at ASC LIMIT $3"
        ))
        .bind(status.as_str())
        .bind(older_than)
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_stale", e))?;

        rows.iter().map(decode_request).collect()
    }

    #[instrument(skip(self), err)]
    async fn list_unnotified(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RequestRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {REQUEST_COLUMNS} FROM requests \
             WHERE status IN ('completed', 'failed') \
               AND notified_at IS NULL AND updated_at < $1 \
             ORDER BY updated_at ASC LIMIT $2"
        ))
        .bind(older_than)
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_unnotified", e))?;

        rows.iter().map(decode_request).collect()
    }
}

/// Postgres-backed artifact store.
#[derive(Debug, Clone)]
pub struct PostgresArtifactStore {
    pool: Arc<PgPool>,
}

impl PostgresArtifactStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    async fn fetch_one(
        &self,
        operation: &str,
        filter: &str,
        id: uuid::Uuid,
    ) -> Result<Option<StoredArtifact>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {ARTIFACT_COLUMNS} FROM generated_artifacts WHERE {filter} LIMIT 1"
        ))
        .bind(id)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error(operation, e))?;

        row.map(|r| decode_artifact(&r)).transpose()
    }
}

/// Serialize versioning for one `(parent, task_type)` until the transaction ends.
async fn lock_sequence(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    parent: &ParentRef,
    task_type: TaskType,
) -> Result<(), StoreError> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1 || ':' || $2))")
        .bind(parent.as_str())
        .bind(task_type.as_str())
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("lock_artifact_versions", e))?;
    Ok(())
}

/// Deactivate the sequence and return its latest version. Caller holds the lock.
async fn retire_sequence(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    parent: &ParentRef,
    task_type: TaskType,
) -> Result<u32, StoreError> {
    let latest: i32 = sqlx::query(
        r#"
        SELECT COALESCE(MAX(version), 0) AS latest
        FROM generated_artifacts
        WHERE parent = $1 AND task_type = $2
        "#,
    )
    .bind(parent.as_str())
    .bind(task_type.as_str())
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("latest_artifact_version", e))?
    .try_get("latest")
    .map_err(|e| StoreError::Corrupt(format!("latest version: {e}")))?;

    sqlx::query(
        r#"
        UPDATE generated_artifacts
        SET active = FALSE
        WHERE parent = $1 AND task_type = $2 AND active
        "#,
    )
    .bind(parent.as_str())
    .bind(task_type.as_str())
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("deactivate_artifacts", e))?;

    Ok(latest as u32)
}

#[async_trait]
impl ArtifactStore for PostgresArtifactStore {
    #[instrument(
        skip(self, artifact),
        fields(request_id = %artifact.request_id, task_type = %artifact.task_type),
        err
    )]
    async fn put(&self, artifact: NewArtifact) -> Result<StoredArtifact, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        lock_sequence(&mut tx, &artifact.parent, artifact.task_type).await?;

        let existing = sqlx::query(&format!(
            "SELECT {ARTIFACT_COLUMNS} FROM generated_artifacts WHERE request_id = $1"
        ))
        .bind(artifact.request_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("get_artifact", e))?;

        if let Some(row) = existing {
            tx.commit()
                .await
                .map_err(|e| map_sqlx_error("commit_transaction", e))?;
            return decode_artifact(&row);
        }

        let latest = retire_sequence(&mut tx, &artifact.parent, artifact.task_type).await?;

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

        sqlx::query(&format!(
            "INSERT INTO generated_artifacts ({ARTIFACT_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)"
        ))
        .bind(stored.artifact_id.as_uuid())
        .bind(stored.request_id.as_uuid())
        .bind(stored.parent.as_str())
        .bind(stored.task_type.as_str())
        .bind(stored.version as i32)
        .bind(&stored.payload)
        .bind(stored.item_count as i32)
        .bind(stored.token_usage.prompt_tokens as i32)
        .bind(stored.token_usage.completion_tokens as i32)
        .bind(encode_correlation(&stored.correlation)?)
        .bind(stored.active)
        .bind(None::<uuid::Uuid>)
        .bind(stored.created_at)
        .bind(stored.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_artifact", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(stored)
    }

    /// The row is read once without a lock to learn its sequence, then again
    /// `FOR UPDATE` after the sequence lock, in the same order `put` locks.
    #[instrument(
        skip(self, revision),
        fields(artifact_id = %artifact_id, request_id = %revision.request_id),
        err
    )]
    async fn update_in_place(
        &self,
        artifact_id: ArtifactId,
        revision: ArtifactRevision,
    ) -> Result<StoredArtifact, StoreError> {
        let located = self
            .get(artifact_id)
            .await?
            .ok_or(StoreError::ArtifactNotFound(artifact_id))?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        lock_sequence(&mut tx, &located.parent, located.task_type).await?;

        let row = sqlx::query(&format!(
            "SELECT {ARTIFACT_COLUMNS} FROM generated_artifacts \
             WHERE artifact_id = $1 FOR UPDATE"
        ))
        .bind(artifact_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("get_artifact", e))?
        .ok_or(StoreError::ArtifactNotFound(artifact_id))?;
        let mut stored = decode_artifact(&row)?;

        if stored.revised_by == Some(revision.request_id) {
            tx.commit()
                .await
                .map_err(|e| map_sqlx_error("commit_transaction", e))?;
            return Ok(stored);
        }

        let latest = retire_sequence(&mut tx, &stored.parent, stored.task_type).await?;
        stored.revise(revision, latest + 1, Utc::now());

        sqlx::query(
            r#"
            UPDATE generated_artifacts
            SET version = $2,
                payload = $3,
                item_count = $4,
                prompt_tokens = $5,
                completion_tokens = $6,
                correlation = $7,
                active = TRUE,
                revised_by = $8,
                updated_at = $9
            WHERE artifact_id = $1
            "#,
        )
        .bind(stored.artifact_id.as_uuid())
        .bind(stored.version as i32)
        .bind(&stored.payload)
        .bind(stored.item_count as i32)
        .bind(stored.token_usage.prompt_tokens as i32)
        .bind(stored.token_usage.completion_tokens as i32)
        .bind(encode_correlation(&stored.correlation)?)
        .bind(stored.revised_by.map(uuid::Uuid::from))
        .bind(stored.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("revise_artifact", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(stored)
    }

    #[instrument(skip(self), fields(artifact_id = %artifact_id), err)]
    async fn get(&self, artifact_id: ArtifactId) -> Result<Option<StoredArtifact>, StoreError> {
        self.fetch_one("get_artifact", "artifact_id = $1", artifact_id.into())
            .await
    }

    #[instrument(skip(self), fields(request_id = %request_id), err)]
    async fn get_by_request(
        &self,
        request_id: RequestId,
    ) -> Result<Option<StoredArtifact>, StoreError> {
        self.fetch_one(
            "get_artifact_by_request",
            "request_id = $1 OR revised_by = $1",
            request_id.into(),
        )
        .await
    }

    #[instrument(skip(self), fields(parent = %parent, task_type = %task_type), err)]
    async fn list_versions(
        &self,
        parent: &ParentRef,
        task_type: TaskType,
    ) -> Result<Vec<StoredArtifact>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {ARTIFACT_COLUMNS} FROM generated_artifacts \
             WHERE parent = $1 AND task_type = $2 ORDER BY version ASC"
        ))
        .bind(parent.as_str())
        .bind(task_type.as_str())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_artifact_versions", e))?;

        rows.iter().map(decode_artifact).collect()
    }
}

fn encode_result(result: Option<&ResultSummary>) -> Result<Option<serde_json::Value>, StoreError> {
    result
        .map(serde_json::to_value)
        .transpose()
        .map_err(|e| StoreError::Storage(format!("encode result summary: {e}")))
}

fn encode_correlation(correlation: &Correlation) -> Result<serde_json::Value, StoreError> {
    serde_json::to_value(correlation)
        .map_err(|e| StoreError::Storage(format!("encode correlation: {e}")))
}

fn decode_correlation(value: serde_json::Value) -> Result<Correlation, StoreError> {
    serde_json::from_value(value).map_err(|e| corrupt("correlation", e))
}

fn corrupt(field: &str, err: impl core::fmt::Display) -> StoreError {
    StoreError::Corrupt(format!("{field}: {err}"))
}

fn decode_request(row: &sqlx::postgres::PgRow) -> Result<RequestRecord, StoreError> {
    let get_err = |field: &'static str| move |e: sqlx::Error| corrupt(field, e);

    let request_id: uuid::Uuid = row.try_get("request_id").map_err(get_err("request_id"))?;
    let parent: String = row.try_get("parent").map_err(get_err("parent"))?;
    let task_type: String = row.try_get("task_type").map_err(get_err("task_type"))?;
    let status: String = row.try_get("status").map_err(get_err("status"))?;
    let classification: Option<String> = row
        .try_get("error_classification")
        .map_err(get_err("error_classification"))?;
    let result: Option<serde_json::Value> = row.try_get("result").map_err(get_err("result"))?;
    let retry_of: Option<uuid::Uuid> = row.try_get("retry_of").map_err(get_err("retry_of"))?;
    let reprocess_of: Option<uuid::Uuid> =
        row.try_get("reprocess_of").map_err(get_err("reprocess_of"))?;
    let correlation: serde_json::Value =
        row.try_get("correlation").map_err(get_err("correlation"))?;

    Ok(RequestRecord {
        request_id: RequestId::from_uuid(request_id),
        parent: ParentRef::new(parent).map_err(|e| corrupt("parent", e))?,
        task_type: task_type.parse().map_err(|e| corrupt("task_type", e))?,
        status: status.parse().map_err(|e| corrupt("status", e))?,
        created_at: row.try_get("created_at").map_err(get_err("created_at"))?,
        updated_at: row.try_get("updated_at").map_err(get_err("updated_at"))?,
        processing_started_at: row
            .try_get("processing_started_at")
            .map_err(get_err("processing_started_at"))?,
        error_detail: row.try_get("error_detail").map_err(get_err("error_detail"))?,
        error_classification: classification
            .map(|c| c.parse::<ErrorClassification>())
            .transpose()
            .map_err(|e| corrupt("error_classification", e))?,
        result: result
            .map(serde_json::from_value::<ResultSummary>)
            .transpose()
            .map_err(|e| corrupt("result", e))?,
        notified_at: row.try_get("notified_at").map_err(get_err("notified_at"))?,
        notify_claimed_at: row
            .try_get("notify_claimed_at")
            .map_err(get_err("notify_claimed_at"))?,
        retry_of: retry_of.map(RequestId::from_uuid),
        reprocess_of: reprocess_of.map(ArtifactId::from_uuid),
        correlation: decode_correlation(correlation)?,
    })
}

fn decode_artifact(row: &sqlx::postgres::PgRow) -> Result<StoredArtifact, StoreError> {
    let get_err = |field: &'static str| move |e: sqlx::Error| corrupt(field, e);

    let artifact_id: uuid::Uuid = row.try_get("artifact_id").map_err(get_err("artifact_id"))?;
    let request_id: uuid::Uuid = row.try_get("request_id").map_err(get_err("request_id"))?;
    let parent: String = row.try_get("parent").map_err(get_err("parent"))?;
    let task_type: String = row.try_get("task_type").map_err(get_err("task_type"))?;
    let version: i32 = row.try_get("version").map_err(get_err("version"))?;
    let item_count: i32 = row.try_get("item_count").map_err(get_err("item_count"))?;
    let prompt_tokens: i32 = row.try_get("prompt_tokens").map_err(get_err("prompt_tokens"))?;
    let completion_tokens: i32 = row
        .try_get("completion_tokens")
        .map_err(get_err("completion_tokens"))?;
    let correlation: serde_json::Value =
        row.try_get("correlation").map_err(get_err("correlation"))?;
    let revised_by: Option<uuid::Uuid> = row.try_get("revised_by").map_err(get_err("revised_by"))?;

    Ok(StoredArtifact {
        artifact_id: ArtifactId::from_uuid(artifact_id),
        request_id: RequestId::from_uuid(request_id),
        parent: ParentRef::new(parent).map_err(|e| corrupt("parent", e))?,
        task_type: task_type.parse().map_err(|e| corrupt("task_type", e))?,
        version: version as u32,
        payload: row.try_get("payload").map_err(get_err("payload"))?,
        item_count: item_count as u32,
        token_usage: TokenUsage::new(prompt_tokens as u32, completion_tokens as u32),
        correlation: decode_correlation(correlation)?,
        active: row.try_get("active").map_err(get_err("active"))?,
        revised_by: revised_by.map(RequestId::from_uuid),
        created_at: row.try_get("created_at").map_err(get_err("created_at"))?,
        updated_at: row.try_get("updated_at").map_err(get_err("updated_at"))?,
    })
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code() {
                Some(code) if code.as_ref() == "23505" => StoreError::Conflict(msg),
                _ => StoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => StoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

/// Check if an error is a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_summary_round_trips_through_jsonb_encoding() {
        let summary = ResultSummary {
            artifact_id: ArtifactId::new(),
            version: 2,
            item_count: 4,
            token_usage: TokenUsage::new(100, 250),
        };
        let encoded = encode_result(Some(&summary)).unwrap().unwrap();
        let decoded: ResultSummary = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, summary);
        assert!(encode_result(None).unwrap().is_none());
    }

    #[test]
    fn schema_covers_both_tables() {
        let ddl = SCHEMA.join("\n");
        assert!(ddl.contains("CREATE TABLE IF NOT EXISTS requests"));
        assert!(ddl.contains("CREATE TABLE IF NOT EXISTS generated_artifacts"));
        for column in REQUEST_COLUMNS.split(", ").chain(ARTIFACT_COLUMNS.split(", ")) {
            assert!(ddl.contains(column.trim()), "missing column {column}");
        }
    }

    #[test]
    fn correlation_round_trips_through_jsonb_encoding() {
        let correlation = Correlation::default()
            .with_work_item_id("4711")
            .with_platform("azure");
        let encoded = encode_correlation(&correlation).unwrap();
        assert_eq!(decode_correlation(encoded).unwrap(), correlation);
        assert_eq!(
            decode_correlation(serde_json::json!({})).unwrap(),
            Correlation::default()
        );
    }
}
