//! Postgres-backed task store.
//!
//! Every racing transition is a single `UPDATE ... WHERE status = ...`
//! statement; the caller learns whether it won from `rows_affected()`.
//! Postgres row locks make two concurrent claims of the same pending row
//! serialize, and the second one re-evaluates the predicate and matches
//! nothing.
//!
//! ## Error Mapping
//!
//! | SQLx error | TaskStoreError |
//! |------------|----------------|
//! | `Database` / `Io` / `PoolTimedOut` / `PoolClosed` | `Unavailable` |
//! | row decode failure | `Unavailable` (with the column in the message) |

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tokio::runtime::Handle;
use tracing::instrument;

use docflow_core::{ClaimToken, NewTask, Task, TaskId, TaskOutcome, TaskStatus, error_result};

use super::{TaskStats, TaskStore, TaskStoreError};

/// DDL for the task table. Applied by [`PostgresTaskStore::ensure_schema`].
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS doc_tasks (
    task_id               BIGSERIAL PRIMARY KEY,
    task_name             TEXT        NOT NULL,
    doc                   TEXT        NOT NULL,
    product               TEXT,
    feature               TEXT,
    status                TEXT        NOT NULL DEFAULT 'pending'
                          CHECK (status IN ('pending', 'processing', 'success', 'failed')),
    result                JSONB,
    created_at            TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    processing_started_at TIMESTAMPTZ,
    retry_count           INTEGER     NOT NULL DEFAULT 0 CHECK (retry_count >= 0),
    claim_token           UUID
);
CREATE INDEX IF NOT EXISTS doc_tasks_status_idx ON doc_tasks (status);
"#;

const TASK_COLUMNS: &str = "task_id, task_name, doc, product, feature, status, result, \
                            created_at, processing_started_at, retry_count, claim_token";

/// Task store on a shared `PgPool`.
///
/// The store keeps a handle to the runtime the pool was created on, so the
/// synchronous [`TaskStore`] impl can be driven from plain worker threads as
/// well as from `spawn_blocking` sections of the HTTP layer.
#[derive(Debug, Clone)]
pub struct PostgresTaskStore {
    pool: Arc<PgPool>,
    runtime: Handle,
}

impl PostgresTaskStore {
    pub fn new(pool: PgPool, runtime: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            runtime,
        }
    }

    /// Create the task table if it does not exist yet.
    pub async fn ensure_schema(&self) -> Result<(), TaskStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    #[instrument(skip(self, input), fields(task_name = %input.name), err)]
    pub async fn insert_task(&self, input: NewTask) -> Result<Task, TaskStoreError> {
        let row = sqlx::query(&format!(
            "INSERT INTO doc_tasks (task_name, doc, product, feature, status) \
             VALUES ($1, $2, $3, $4, 'pending') RETURNING {TASK_COLUMNS}"
        ))
        .bind(&input.name)
        .bind(&input.doc)
        .bind(&input.product)
        .bind(&input.feature)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_task", e))?;

        TaskRow::decode(&row)?.try_into()
    }

    pub async fn fetch_task(&self, task_id: TaskId) -> Result<Option<Task>, TaskStoreError> {
        let row = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM doc_tasks WHERE task_id = $1"
        ))
        .bind(task_id.get())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fetch_task", e))?;

        row.map(|row| TaskRow::decode(&row)?.try_into()).transpose()
    }

    pub async fn fetch_all(&self) -> Result<Vec<Task>, TaskStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM doc_tasks ORDER BY created_at DESC, task_id DESC"
        ))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fetch_all", e))?;

        rows.iter()
            .map(|row| TaskRow::decode(row)?.try_into())
            .collect()
    }

    #[instrument(skip(self, task_ids), fields(requested = task_ids.len()), err)]
    pub async fn delete_tasks(&self, task_ids: &[TaskId]) -> Result<usize, TaskStoreError> {
        if task_ids.is_empty() {
            return Ok(0);
        }
        let ids: Vec<i64> = task_ids.iter().map(TaskId::get).collect();
        let done = sqlx::query("DELETE FROM doc_tasks WHERE task_id = ANY($1)")
            .bind(&ids)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_tasks", e))?;
        Ok(done.rows_affected() as usize)
    }

    pub async fn update_document(&self, task_id: TaskId, doc: &str) -> Result<(), TaskStoreError> {
        let done = sqlx::query("UPDATE doc_tasks SET doc = $2 WHERE task_id = $1")
            .bind(task_id.get())
            .bind(doc)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("update_document", e))?;
        if done.rows_affected() == 0 {
            return Err(TaskStoreError::NotFound(task_id));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(task_id = %task_id), err)]
    pub async fn claim_task(
        &self,
        task_id: TaskId,
        claimed_at: DateTime<Utc>,
    ) -> Result<Option<ClaimToken>, TaskStoreError> {
        let token = ClaimToken::new();
        let done = sqlx::query(
            r#"
            UPDATE doc_tasks
            SET status = 'processing', processing_started_at = $2, claim_token = $3, result = NULL
            WHERE task_id = $1 AND status = 'pending'
            "#,
        )
        .bind(task_id.get())
        .bind(claimed_at)
        .bind(token.as_uuid())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_task", e))?;

        Ok((done.rows_affected() == 1).then_some(token))
    }

    #[instrument(skip(self, outcome), fields(task_id = %task_id, status = %outcome.status()), err)]
    pub async fn finalize_task(
        &self,
        task_id: TaskId,
        token: ClaimToken,
        outcome: TaskOutcome,
    ) -> Result<bool, TaskStoreError> {
        let status = outcome.status();
        let done = sqlx::query(
            r#"
            UPDATE doc_tasks
            SET status = $3, result = $4, claim_token = NULL
            WHERE task_id = $1 AND status = 'processing' AND claim_token = $2
            "#,
        )
        .bind(task_id.get())
        .bind(token.as_uuid())
        .bind(status.as_str())
        .bind(outcome.into_result())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("finalize_task", e))?;

        Ok(done.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(task_id = %task_id), err)]
    pub async fn reclaim_task(
        &self,
        task_id: TaskId,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, TaskStoreError> {
        let done = sqlx::query(
            r#"
            UPDATE doc_tasks
            SET status = 'pending',
                processing_started_at = NULL,
                result = NULL,
                claim_token = NULL,
                retry_count = retry_count + 1
            WHERE task_id = $1
              AND status = 'processing'
              AND processing_started_at < $2
            "#,
        )
        .bind(task_id.get())
        .bind(stale_before)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("reclaim_task", e))?;

        Ok(done.rows_affected() == 1)
    }

    #[instrument(skip(self, message), fields(task_id = %task_id), err)]
    pub async fn abandon_task(
        &self,
        task_id: TaskId,
        stale_before: DateTime<Utc>,
        message: &str,
    ) -> Result<bool, TaskStoreError> {
        let done = sqlx::query(
            r#"
            UPDATE doc_tasks
            SET status = 'failed', result = $3, claim_token = NULL
            WHERE task_id = $1
              AND status = 'processing'
              AND processing_started_at < $2
            "#,
        )
        .bind(task_id.get())
        .bind(stale_before)
        .bind(error_result(message))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("abandon_task", e))?;

        Ok(done.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(task_id = %task_id), err)]
    pub async fn reset_failed(&self, task_id: TaskId) -> Result<Task, TaskStoreError> {
        let row = sqlx::query(&format!(
            "UPDATE doc_tasks \
             SET status = 'pending', result = NULL, processing_started_at = NULL \
             WHERE task_id = $1 AND status = 'failed' \
             RETURNING {TASK_COLUMNS}"
        ))
        .bind(task_id.get())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("reset_failed", e))?;

        if let Some(row) = row {
            return TaskRow::decode(&row)?.try_into();
        }

        // Nothing matched: tell missing apart from "not failed".
        match self.fetch_task(task_id).await? {
            Some(task) => Err(TaskStoreError::InvalidStatus {
                task_id,
                status: task.status,
            }),
            None => Err(TaskStoreError::NotFound(task_id)),
        }
    }

    #[instrument(skip(self, message), fields(task_id = %task_id), err)]
    pub async fn fail_pending(&self, task_id: TaskId, message: &str) -> Result<bool, TaskStoreError> {
        let done = sqlx::query(
            r#"
            UPDATE doc_tasks
            SET status = 'failed', result = $2
            WHERE task_id = $1 AND status = 'pending'
            "#,
        )
        .bind(task_id.get())
        .bind(error_result(message))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fail_pending", e))?;

        Ok(done.rows_affected() == 1)
    }

    pub async fn count_by_status(&self) -> Result<TaskStats, TaskStoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS total FROM doc_tasks GROUP BY status")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("count_by_status", e))?;

        let mut stats = TaskStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(decode_error("status"))?;
            let total: i64 = row.try_get("total").map_err(decode_error("total"))?;
            let total = total as usize;
            match parse_status(&status)? {
                TaskStatus::Pending => stats.pending = total,
                TaskStatus::Processing => stats.processing = total,
                TaskStatus::Success => stats.success = total,
                TaskStatus::Failed => stats.failed = total,
            }
        }
        Ok(stats)
    }
}

impl TaskStore for PostgresTaskStore {
    fn create(&self, input: NewTask) -> Result<Task, TaskStoreError> {
        self.runtime.block_on(self.insert_task(input))
    }

    fn get(&self, task_id: TaskId) -> Result<Option<Task>, TaskStoreError> {
        self.runtime.block_on(self.fetch_task(task_id))
    }

    fn list(&self) -> Result<Vec<Task>, TaskStoreError> {
        self.runtime.block_on(self.fetch_all())
    }

    fn delete(&self, task_ids: &[TaskId]) -> Result<usize, TaskStoreError> {
        self.runtime.block_on(self.delete_tasks(task_ids))
    }

    fn set_document(&self, task_id: TaskId, doc: &str) -> Result<(), TaskStoreError> {
        self.runtime.block_on(self.update_document(task_id, doc))
    }

    fn claim(
        &self,
        task_id: TaskId,
        claimed_at: DateTime<Utc>,
    ) -> Result<Option<ClaimToken>, TaskStoreError> {
        self.runtime.block_on(self.claim_task(task_id, claimed_at))
    }

    fn finalize(
        &self,
        task_id: TaskId,
        token: ClaimToken,
        outcome: TaskOutcome,
    ) -> Result<bool, TaskStoreError> {
        self.runtime
            .block_on(self.finalize_task(task_id, token, outcome))
    }

    fn reclaim(
        &self,
        task_id: TaskId,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, TaskStoreError> {
        self.runtime.block_on(self.reclaim_task(task_id, stale_before))
    }

    fn abandon(
        &self,
        task_id: TaskId,
        stale_before: DateTime<Utc>,
        message: &str,
    ) -> Result<bool, TaskStoreError> {
        self.runtime
            .block_on(self.abandon_task(task_id, stale_before, message))
    }

    fn mark_pending(&self, task_id: TaskId) -> Result<Task, TaskStoreError> {
        self.runtime.block_on(self.reset_failed(task_id))
    }

    fn revert_retry(&self, task_id: TaskId, message: &str) -> Result<bool, TaskStoreError> {
        self.runtime.block_on(self.fail_pending(task_id, message))
    }

    fn stats(&self) -> Result<TaskStats, TaskStoreError> {
        self.runtime.block_on(self.count_by_status())
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> TaskStoreError {
    match err {
        sqlx::Error::Database(db_err) => TaskStoreError::Unavailable(format!(
            "database error in {operation}: {}",
            db_err.message()
        )),
        sqlx::Error::PoolClosed => {
            TaskStoreError::Unavailable(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::PoolTimedOut => {
            TaskStoreError::Unavailable(format!("connection pool timed out in {operation}"))
        }
        other => TaskStoreError::Unavailable(format!("sqlx error in {operation}: {other}")),
    }
}

fn decode_error(column: &'static str) -> impl Fn(sqlx::Error) -> TaskStoreError {
    move |e| TaskStoreError::Unavailable(format!("failed to decode column {column}: {e}"))
}

fn parse_status(raw: &str) -> Result<TaskStatus, TaskStoreError> {
    raw.parse()
        .map_err(|e| TaskStoreError::Unavailable(format!("undecodable task row: {e}")))
}

#[derive(Debug)]
struct TaskRow {
    task_id: i64,
    task_name: String,
    doc: String,
    product: Option<String>,
    feature: Option<String>,
    status: String,
    result: Option<serde_json::Value>,
    created_at: DateTime<Utc>,
    processing_started_at: Option<DateTime<Utc>>,
    retry_count: i32,
    claim_token: Option<uuid::Uuid>,
}

impl TaskRow {
    fn decode(row: &sqlx::postgres::PgRow) -> Result<Self, TaskStoreError> {
        Ok(TaskRow {
            task_id: row.try_get("task_id").map_err(decode_error("task_id"))?,
            task_name: row.try_get("task_name").map_err(decode_error("task_name"))?,
            doc: row.try_get("doc").map_err(decode_error("doc"))?,
            product: row.try_get("product").map_err(decode_error("product"))?,
            feature: row.try_get("feature").map_err(decode_error("feature"))?,
            status: row.try_get("status").map_err(decode_error("status"))?,
            result: row.try_get("result").map_err(decode_error("result"))?,
            created_at: row.try_get("created_at").map_err(decode_error("created_at"))?,
            processing_started_at: row
                .try_get("processing_started_at")
                .map_err(decode_error("processing_started_at"))?,
            retry_count: row.try_get("retry_count").map_err(decode_error("retry_count"))?,
            claim_token: row.try_get("claim_token").map_err(decode_error("claim_token"))?,
        })
    }
}

impl TryFrom<TaskRow> for Task {
    type Error = TaskStoreError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        Ok(Task {
            id: TaskId::new(row.task_id),
            name: row.task_name,
            doc: row.doc,
            product: row.product,
            feature: row.feature,
            status: parse_status(&row.status)?,
            result: row.result,
            created_at: row.created_at,
            processing_started_at: row.processing_started_at,
            retry_count: row.retry_count.max(0) as u32,
            claim_token: row.claim_token.map(ClaimToken::from_uuid),
        })
    }
}
