//! Task persistence boundary.
//!
//! The store is the only writer of task records. Transitions that can race
//! (`claim`, `reclaim`, `abandon`) are single conditional updates, never a
//! read followed by a write, so concurrent callers cannot both win.

pub mod in_memory;
pub mod postgres;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use docflow_core::{ClaimToken, NewTask, Task, TaskId, TaskOutcome, TaskStatus};

pub use in_memory::InMemoryTaskStore;
pub use postgres::PostgresTaskStore;

/// Task store operation error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskStoreError {
    #[error("task not found: {0}")]
    NotFound(TaskId),

    #[error("task {task_id} is {status}, operation not allowed")]
    InvalidStatus { task_id: TaskId, status: TaskStatus },

    #[error("task store unavailable: {0}")]
    Unavailable(String),
}

/// Per-status task counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TaskStats {
    pub pending: usize,
    pub processing: usize,
    pub success: usize,
    pub failed: usize,
}

impl TaskStats {
    pub fn record(&mut self, status: TaskStatus) {
        match status {
            TaskStatus::Pending => self.pending += 1,
            TaskStatus::Processing => self.processing += 1,
            TaskStatus::Success => self.success += 1,
            TaskStatus::Failed => self.failed += 1,
        }
    }
}

/// Persistent record of every task plus its conditional transitions.
pub trait TaskStore: Send + Sync {
    /// Insert a new pending task and assign its id.
    fn create(&self, input: NewTask) -> Result<Task, TaskStoreError>;

    fn get(&self, task_id: TaskId) -> Result<Option<Task>, TaskStoreError>;

    /// All tasks, newest first.
    fn list(&self) -> Result<Vec<Task>, TaskStoreError>;

    /// Bulk delete. Returns how many records were actually removed.
    fn delete(&self, task_ids: &[TaskId]) -> Result<usize, TaskStoreError>;

    /// Replace the document reference (used once a pending upload lands).
    fn set_document(&self, task_id: TaskId, doc: &str) -> Result<(), TaskStoreError>;

    /// pending → processing, stamping `claimed_at`.
    ///
    /// Returns the fencing token iff this call performed the transition.
    fn claim(
        &self,
        task_id: TaskId,
        claimed_at: DateTime<Utc>,
    ) -> Result<Option<ClaimToken>, TaskStoreError>;

    /// processing → success | failed for the holder of `token`.
    ///
    /// Returns `false` when the claim is no longer current (reclaimed or
    /// already finalized); the record is left untouched.
    fn finalize(
        &self,
        task_id: TaskId,
        token: ClaimToken,
        outcome: TaskOutcome,
    ) -> Result<bool, TaskStoreError>;

    /// processing → pending when the claim started before `stale_before`.
    ///
    /// Clears the claim and the result and increments `retry_count`.
    fn reclaim(&self, task_id: TaskId, stale_before: DateTime<Utc>)
        -> Result<bool, TaskStoreError>;

    /// processing → failed when the claim started before `stale_before`.
    fn abandon(
        &self,
        task_id: TaskId,
        stale_before: DateTime<Utc>,
        message: &str,
    ) -> Result<bool, TaskStoreError>;

    /// failed → pending (manual retry). Returns the updated record.
    fn mark_pending(&self, task_id: TaskId) -> Result<Task, TaskStoreError>;

    /// pending → failed with `message`, for a retry whose enqueue failed.
    ///
    /// Returns `false` if the task is no longer pending.
    fn revert_retry(&self, task_id: TaskId, message: &str) -> Result<bool, TaskStoreError>;

    fn stats(&self) -> Result<TaskStats, TaskStoreError>;
}

impl<S> TaskStore for Arc<S>
where
    S: TaskStore + ?Sized,
{
    fn create(&self, input: NewTask) -> Result<Task, TaskStoreError> {
        (**self).create(input)
    }

    fn get(&self, task_id: TaskId) -> Result<Option<Task>, TaskStoreError> {
        (**self).get(task_id)
    }

    fn list(&self) -> Result<Vec<Task>, TaskStoreError> {
        (**self).list()
    }

    fn delete(&self, task_ids: &[TaskId]) -> Result<usize, TaskStoreError> {
        (**self).delete(task_ids)
    }

    fn set_document(&self, task_id: TaskId, doc: &str) -> Result<(), TaskStoreError> {
        (**self).set_document(task_id, doc)
    }

    fn claim(
        &self,
        task_id: TaskId,
        claimed_at: DateTime<Utc>,
    ) -> Result<Option<ClaimToken>, TaskStoreError> {
        (**self).claim(task_id, claimed_at)
    }

    fn finalize(
        &self,
        task_id: TaskId,
        token: ClaimToken,
        outcome: TaskOutcome,
    ) -> Result<bool, TaskStoreError> {
        (**self).finalize(task_id, token, outcome)
    }

    fn reclaim(
        &self,
        task_id: TaskId,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, TaskStoreError> {
        (**self).reclaim(task_id, stale_before)
    }

    fn abandon(
        &self,
        task_id: TaskId,
        stale_before: DateTime<Utc>,
        message: &str,
    ) -> Result<bool, TaskStoreError> {
        (**self).abandon(task_id, stale_before, message)
    }

    fn mark_pending(&self, task_id: TaskId) -> Result<Task, TaskStoreError> {
        (**self).mark_pending(task_id)
    }

    fn revert_retry(&self, task_id: TaskId, message: &str) -> Result<bool, TaskStoreError> {
        (**self).revert_retry(task_id, message)
    }

    fn stats(&self) -> Result<TaskStats, TaskStoreError> {
        (**self).stats()
    }
}
