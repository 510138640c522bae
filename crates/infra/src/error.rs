use thiserror::Error;

use crate::queue::QueueError;
use crate::task_store::TaskStoreError;

/// Store or queue failure inside a worker/reaper iteration.
///
/// Never recorded on a task: the loop logs it, backs off and resumes.
#[derive(Debug, Error)]
pub enum InfraError {
    #[error(transparent)]
    Store(#[from] TaskStoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}
