//! Shared handles passed to the worker, the reaper and the task service.

use std::sync::Arc;

use crate::queue::{InMemoryWorkQueue, WorkQueue};
use crate::task_store::{InMemoryTaskStore, TaskStore};

/// The task store and work queue one deployment shares.
///
/// Cloning is cheap; every clone points at the same backends.
#[derive(Clone)]
pub struct TaskContext {
    pub store: Arc<dyn TaskStore>,
    pub queue: Arc<dyn WorkQueue>,
}

impl TaskContext {
    pub fn new(store: Arc<dyn TaskStore>, queue: Arc<dyn WorkQueue>) -> Self {
        Self { store, queue }
    }

    /// Fresh in-memory store and queue.
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(InMemoryTaskStore::new()),
            Arc::new(InMemoryWorkQueue::new()),
        )
    }
}

impl core::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TaskContext").finish_non_exhaustive()
    }
}
