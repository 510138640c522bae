//! Work queue: `ready` and `processing` sequences of [`QueueEntry`] plus a
//! claim-timestamp index keyed by task id.
//!
//! Delivery is at-least-once. An entry handed out by
//! [`WorkQueue::dequeue_ready`] stays the consumer's responsibility until it
//! is acknowledged, or until the reaper finds it stale in `processing`.

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis;
#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use docflow_core::{QueueEntry, TaskId};

pub use in_memory::InMemoryWorkQueue;
#[cfg(feature = "redis")]
pub use self::redis::RedisWorkQueue;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue unavailable: {0}")]
    Unavailable(String),

    #[error("queue payload error: {0}")]
    Codec(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueLengths {
    pub ready: usize,
    pub processing: usize,
}

pub trait WorkQueue: Send + Sync {
    /// Append to `ready`.
    fn enqueue_ready(&self, entry: &QueueEntry) -> Result<(), QueueError>;

    /// Pop the oldest ready entry, waiting up to `timeout`.
    ///
    /// `Ok(None)` means the wait elapsed with nothing to deliver.
    fn dequeue_ready(&self, timeout: Duration) -> Result<Option<QueueEntry>, QueueError>;

    /// Record the entry in `processing` and stamp its claim time.
    ///
    /// Called right after a successful dequeue, before the store claim.
    fn move_to_processing(
        &self,
        entry: &QueueEntry,
        claimed_at: DateTime<Utc>,
    ) -> Result<(), QueueError>;

    /// Drop the entry from `processing` and delete its claim timestamp.
    fn acknowledge(&self, entry: &QueueEntry) -> Result<(), QueueError>;

    /// Non-destructive snapshot of `processing`.
    fn list_processing(&self) -> Result<Vec<QueueEntry>, QueueError>;

    fn claim_timestamp(&self, task_id: TaskId) -> Result<Option<DateTime<Utc>>, QueueError>;

    /// Stamp an entry that sits in `processing` without a claim time.
    ///
    /// Returns `false` when the entry is gone or already stamped. The reaper
    /// uses this so an entry whose consumer died between dequeue and
    /// [`WorkQueue::move_to_processing`] still goes stale eventually.
    fn stamp_unclaimed(&self, entry: &QueueEntry, seen_at: DateTime<Utc>)
    -> Result<bool, QueueError>;

    fn lengths(&self) -> Result<QueueLengths, QueueError>;
}

impl<Q> WorkQueue for Arc<Q>
where
    Q: WorkQueue + ?Sized,
{
    fn enqueue_ready(&self, entry: &QueueEntry) -> Result<(), QueueError> {
        (**self).enqueue_ready(entry)
    }

    fn dequeue_ready(&self, timeout: Duration) -> Result<Option<QueueEntry>, QueueError> {
        (**self).dequeue_ready(timeout)
    }

    fn move_to_processing(
        &self,
        entry: &QueueEntry,
        claimed_at: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        (**self).move_to_processing(entry, claimed_at)
    }

    fn acknowledge(&self, entry: &QueueEntry) -> Result<(), QueueError> {
        (**self).acknowledge(entry)
    }

    fn list_processing(&self) -> Result<Vec<QueueEntry>, QueueError> {
        (**self).list_processing()
    }

    fn claim_timestamp(&self, task_id: TaskId) -> Result<Option<DateTime<Utc>>, QueueError> {
        (**self).claim_timestamp(task_id)
    }

    fn stamp_unclaimed(
        &self,
        entry: &QueueEntry,
        seen_at: DateTime<Utc>,
    ) -> Result<bool, QueueError> {
        (**self).stamp_unclaimed(entry, seen_at)
    }

    fn lengths(&self) -> Result<QueueLengths, QueueError> {
        (**self).lengths()
    }
}
