//! In-memory task store for tests/dev.

use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};

use docflow_core::{ClaimToken, NewTask, Task, TaskId, TaskOutcome};

use super::{TaskStats, TaskStore, TaskStoreError};

#[derive(Debug, Default)]
struct State {
    last_id: i64,
    tasks: BTreeMap<TaskId, Task>,
}

/// Every mutation happens under one write lock, which makes each
/// conditional transition atomic with respect to the others.
#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    state: RwLock<State>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>, TaskStoreError> {
        self.state
            .read()
            .map_err(|_| TaskStoreError::Unavailable("task store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>, TaskStoreError> {
        self.state
            .write()
            .map_err(|_| TaskStoreError::Unavailable("task store lock poisoned".to_string()))
    }

    fn update<R>(
        &self,
        task_id: TaskId,
        f: impl FnOnce(&mut Task) -> R,
    ) -> Result<Option<R>, TaskStoreError> {
        let mut state = self.write()?;
        Ok(state.tasks.get_mut(&task_id).map(f))
    }
}

impl TaskStore for InMemoryTaskStore {
    fn create(&self, input: NewTask) -> Result<Task, TaskStoreError> {
        let mut state = self.write()?;
        state.last_id += 1;
        let task = Task::new(TaskId::new(state.last_id), input, Utc::now());
        state.tasks.insert(task.id, task.clone());
        Ok(task)
    }

    fn get(&self, task_id: TaskId) -> Result<Option<Task>, TaskStoreError> {
        Ok(self.read()?.tasks.get(&task_id).cloned())
    }

    fn list(&self) -> Result<Vec<Task>, TaskStoreError> {
        let mut tasks: Vec<Task> = self.read()?.tasks.values().cloned().collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(tasks)
    }

    fn delete(&self, task_ids: &[TaskId]) -> Result<usize, TaskStoreError> {
        let mut state = self.write()?;
        Ok(task_ids
            .iter()
            .filter(|id| state.tasks.remove(id).is_some())
            .count())
    }

    fn set_document(&self, task_id: TaskId, doc: &str) -> Result<(), TaskStoreError> {
        self.update(task_id, |task| task.doc = doc.to_string())?
            .ok_or(TaskStoreError::NotFound(task_id))
    }

    fn claim(
        &self,
        task_id: TaskId,
        claimed_at: DateTime<Utc>,
    ) -> Result<Option<ClaimToken>, TaskStoreError> {
        let token = ClaimToken::new();
        let won = self
            .update(task_id, |task| task.claim(claimed_at, token))?
            .unwrap_or(false);
        Ok(won.then_some(token))
    }

    fn finalize(
        &self,
        task_id: TaskId,
        token: ClaimToken,
        outcome: TaskOutcome,
    ) -> Result<bool, TaskStoreError> {
        Ok(self
            .update(task_id, |task| task.finalize(token, outcome))?
            .unwrap_or(false))
    }

    fn reclaim(
        &self,
        task_id: TaskId,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, TaskStoreError> {
        Ok(self
            .update(task_id, |task| task.reclaim(stale_before))?
            .unwrap_or(false))
    }

    fn abandon(
        &self,
        task_id: TaskId,
        stale_before: DateTime<Utc>,
        message: &str,
    ) -> Result<bool, TaskStoreError> {
        Ok(self
            .update(task_id, |task| task.abandon(stale_before, message))?
            .unwrap_or(false))
    }

    fn mark_pending(&self, task_id: TaskId) -> Result<Task, TaskStoreError> {
        self.update(task_id, |task| {
            task.mark_pending()
                .map(|()| task.clone())
                .map_err(|_| TaskStoreError::InvalidStatus {
                    task_id,
                    status: task.status,
                })
        })?
        .ok_or(TaskStoreError::NotFound(task_id))?
    }

    fn revert_retry(&self, task_id: TaskId, message: &str) -> Result<bool, TaskStoreError> {
        Ok(self
            .update(task_id, |task| task.revert_retry(message))?
            .unwrap_or(false))
    }

    fn stats(&self) -> Result<TaskStats, TaskStoreError> {
        let mut stats = TaskStats::default();
        for task in self.read()?.tasks.values() {
            stats.record(task.status);
        }
        Ok(stats)
    }
}
