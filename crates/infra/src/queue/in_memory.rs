//! Process-local work queue for tests/dev.

use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use docflow_core::{QueueEntry, TaskId};

use super::{QueueError, QueueLengths, WorkQueue};

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<QueueEntry>,
    processing: Vec<QueueEntry>,
    claimed_at: HashMap<TaskId, DateTime<Utc>>,
}

/// Both sequences and the timestamp index sit under one mutex, so
/// `move_to_processing` and `acknowledge` are atomic here.
#[derive(Debug, Default)]
pub struct InMemoryWorkQueue {
    state: Mutex<QueueState>,
    available: Condvar,
}

impl InMemoryWorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of `ready`, oldest first.
    pub fn ready_entries(&self) -> Result<Vec<QueueEntry>, QueueError> {
        Ok(self.lock()?.ready.iter().cloned().collect())
    }

    fn lock(&self) -> Result<MutexGuard<'_, QueueState>, QueueError> {
        self.state
            .lock()
            .map_err(|_| QueueError::Unavailable("queue lock poisoned".to_string()))
    }
}

impl WorkQueue for InMemoryWorkQueue {
    fn enqueue_ready(&self, entry: &QueueEntry) -> Result<(), QueueError> {
        self.lock()?.ready.push_back(entry.clone());
        self.available.notify_one();
        Ok(())
    }

    fn dequeue_ready(&self, timeout: Duration) -> Result<Option<QueueEntry>, QueueError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock()?;
        loop {
            if let Some(entry) = state.ready.pop_front() {
                return Ok(Some(entry));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let (guard, _) = self
                .available
                .wait_timeout(state, deadline - now)
                .map_err(|_| QueueError::Unavailable("queue lock poisoned".to_string()))?;
            state = guard;
        }
    }

    fn move_to_processing(
        &self,
        entry: &QueueEntry,
        claimed_at: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        let mut state = self.lock()?;
        state.processing.push(entry.clone());
        state.claimed_at.insert(entry.task_id, claimed_at);
        Ok(())
    }

    fn acknowledge(&self, entry: &QueueEntry) -> Result<(), QueueError> {
        let mut state = self.lock()?;
        if let Some(pos) = state.processing.iter().position(|e| e == entry) {
            state.processing.remove(pos);
        }
        state.claimed_at.remove(&entry.task_id);
        Ok(())
    }

    fn list_processing(&self) -> Result<Vec<QueueEntry>, QueueError> {
        Ok(self.lock()?.processing.clone())
    }

    fn claim_timestamp(&self, task_id: TaskId) -> Result<Option<DateTime<Utc>>, QueueError> {
        Ok(self.lock()?.claimed_at.get(&task_id).copied())
    }

    fn stamp_unclaimed(
        &self,
        entry: &QueueEntry,
        seen_at: DateTime<Utc>,
    ) -> Result<bool, QueueError> {
        let mut state = self.lock()?;
        if !state.processing.contains(entry) || state.claimed_at.contains_key(&entry.task_id) {
            return Ok(false);
        }
        state.claimed_at.insert(entry.task_id, seen_at);
        Ok(true)
    }

    fn lengths(&self) -> Result<QueueLengths, QueueError> {
        let state = self.lock()?;
        Ok(QueueLengths {
            ready: state.ready.len(),
            processing: state.processing.len(),
        })
    }
}
