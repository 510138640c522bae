//! Queue references.

use serde::{Deserialize, Serialize};

use crate::id::TaskId;
use crate::task::Task;

/// A lightweight reference to a task, carried on the work queue.
///
/// Never contains the document: the task store stays the single source of
/// truth for the payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueEntry {
    pub task_id: TaskId,
    pub task_name: String,
}

impl QueueEntry {
    pub fn new(task_id: TaskId, task_name: impl Into<String>) -> Self {
        Self {
            task_id,
            task_name: task_name.into(),
        }
    }
}

impl From<&Task> for QueueEntry {
    fn from(task: &Task) -> Self {
        Self::new(task.id, task.name.clone())
    }
}
