//! Queue doubles for failure-path tests.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};

use docflow_core::{QueueEntry, TaskId};

use super::{InMemoryWorkQueue, QueueError, QueueLengths, WorkQueue};

/// In-memory queue whose next `fail_enqueues` enqueues fail.
#[derive(Debug, Default)]
pub(crate) struct FlakyQueue {
    pub inner: InMemoryWorkQueue,
    pub fail_enqueues: AtomicU32,
}

impl FlakyQueue {
    pub fn fail_next_enqueues(&self, count: u32) {
        self.fail_enqueues.store(count, Ordering::SeqCst);
    }
}

impl WorkQueue for FlakyQueue {
    fn enqueue_ready(&self, entry: &QueueEntry) -> Result<(), QueueError> {
        let failing = self
            .fail_enqueues
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(QueueError::Unavailable("connection reset".into()));
        }
        self.inner.enqueue_ready(entry)
    }

    fn dequeue_ready(&self, timeout: Duration) -> Result<Option<QueueEntry>, QueueError> {
        self.inner.dequeue_ready(timeout)
    }

    fn move_to_processing(
        &self,
        entry: &QueueEntry,
        claimed_at: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        self.inner.move_to_processing(entry, claimed_at)
    }

    fn acknowledge(&self, entry: &QueueEntry) -> Result<(), QueueError> {
        self.inner.acknowledge(entry)
    }

    fn list_processing(&self) -> Result<Vec<QueueEntry>, QueueError> {
        self.inner.list_processing()
    }

    fn claim_timestamp(&self, task_id: TaskId) -> Result<Option<DateTime<Utc>>, QueueError> {
        self.inner.claim_timestamp(task_id)
    }

    fn stamp_unclaimed(
        &self,
        entry: &QueueEntry,
        seen_at: DateTime<Utc>,
    ) -> Result<bool, QueueError> {
        self.inner.stamp_unclaimed(entry, seen_at)
    }

    fn lengths(&self) -> Result<QueueLengths, QueueError> {
        self.inner.lengths()
    }
}
