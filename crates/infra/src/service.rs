//! Task API: the operations the HTTP layer exposes.

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

use docflow_core::{
    DocumentRef, Locator, NewTask, PENDING_UPLOAD_SENTINEL, QueueEntry, Task, TaskId, TaskStatus,
};

use crate::context::TaskContext;
use crate::documents::{DocumentStore, upload_object_name};
use crate::queue::{QueueError, QueueLengths};
use crate::task_store::{TaskStats, TaskStoreError};

pub const DEFAULT_BUCKET: &str = "doc-llm-bucket";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ServiceError {
    #[error("task not found: {0}")]
    NotFound(TaskId),

    #[error("task {task_id} is {status}; only failed tasks can be retried")]
    InvalidStatus { task_id: TaskId, status: TaskStatus },

    #[error("invalid request: {0}")]
    BadRequest(String),

    #[error("upload failed: {0}")]
    Upload(String),

    #[error("{0}")]
    Unavailable(String),
}

impl From<TaskStoreError> for ServiceError {
    fn from(e: TaskStoreError) -> Self {
        match e {
            TaskStoreError::NotFound(id) => ServiceError::NotFound(id),
            TaskStoreError::InvalidStatus { task_id, status } => {
                ServiceError::InvalidStatus { task_id, status }
            }
            TaskStoreError::Unavailable(msg) => {
                ServiceError::Unavailable(format!("task store unavailable: {msg}"))
            }
        }
    }
}

impl From<QueueError> for ServiceError {
    fn from(e: QueueError) -> Self {
        ServiceError::Unavailable(e.to_string())
    }
}

/// A file submitted for analysis.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub name: String,
    pub product: Option<String>,
    pub feature: Option<String>,
    pub filename: Option<String>,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadReceipt {
    pub task_id: TaskId,
    pub doc: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceStats {
    pub tasks: TaskStats,
    pub queue: QueueLengths,
}

#[derive(Clone)]
pub struct TaskService {
    ctx: TaskContext,
    documents: Arc<dyn DocumentStore>,
    bucket: String,
}

impl TaskService {
    pub fn new(ctx: TaskContext, documents: Arc<dyn DocumentStore>, bucket: impl Into<String>) -> Self {
        Self {
            ctx,
            documents,
            bucket: bucket.into(),
        }
    }

    pub fn context(&self) -> &TaskContext {
        &self.ctx
    }

    /// Create a pending task and enqueue it.
    pub fn submit(&self, input: NewTask) -> Result<TaskId, ServiceError> {
        validate_name(&input.name)?;
        match DocumentRef::parse(&input.doc) {
            Ok(DocumentRef::PendingUpload) => {
                return Err(ServiceError::BadRequest(format!(
                    "{PENDING_UPLOAD_SENTINEL} is reserved for uploads"
                )));
            }
            Ok(_) => {}
            Err(e) => return Err(ServiceError::BadRequest(e.to_string())),
        }

        let task = self.create_and_enqueue(input)?;
        info!(task_id = %task.id, task_name = %task.name, "Task submitted");
        Ok(task.id)
    }

    /// Create a task for an uploaded file.
    ///
    /// The task is enqueued before the bytes are stored; the worker waits a
    /// bounded time for the document reference to be filled in.
    pub fn submit_with_upload(&self, upload: UploadRequest) -> Result<UploadReceipt, ServiceError> {
        validate_name(&upload.name)?;
        let mut input = NewTask::new(upload.name, PENDING_UPLOAD_SENTINEL);
        input.product = upload.product;
        input.feature = upload.feature;

        let task = self.create_and_enqueue(input)?;
        let object = upload_object_name(task.id, &sanitize_filename(upload.filename.as_deref()));

        let locator: Locator = self
            .documents
            .put(&self.bucket, &object, &upload.bytes)
            .map_err(|e| {
                // The task stays on the sentinel and fails once the wait runs out.
                error!(task_id = %task.id, error = %e, "Storing uploaded document failed");
                ServiceError::Upload(e.to_string())
            })?;

        let doc = locator.to_string();
        self.ctx.store.set_document(task.id, &doc)?;
        info!(task_id = %task.id, doc = %doc, bytes = upload.bytes.len(), "Upload stored");

        Ok(UploadReceipt {
            task_id: task.id,
            doc,
        })
    }

    pub fn get(&self, task_id: TaskId) -> Result<Task, ServiceError> {
        self.ctx
            .store
            .get(task_id)?
            .ok_or(ServiceError::NotFound(task_id))
    }

    /// All tasks, newest first.
    pub fn list(&self) -> Result<Vec<Task>, ServiceError> {
        Ok(self.ctx.store.list()?)
    }

    pub fn delete(&self, task_ids: &[TaskId]) -> Result<usize, ServiceError> {
        let deleted = self.ctx.store.delete(task_ids)?;
        info!(requested = task_ids.len(), deleted, "Tasks deleted");
        Ok(deleted)
    }

    /// failed → pending, then enqueue again.
    ///
    /// If the enqueue fails the task goes back to failed, so the caller can
    /// retry again once the queue recovers.
    pub fn retry(&self, task_id: TaskId) -> Result<Task, ServiceError> {
        let task = self.ctx.store.mark_pending(task_id)?;
        if let Err(e) = self.ctx.queue.enqueue_ready(&QueueEntry::from(&task)) {
            warn!(task_id = %task_id, error = %e, "Retry enqueue failed, reverting to failed");
            let message = format!("retry could not be enqueued: {e}");
            match self.ctx.store.revert_retry(task_id, &message) {
                Ok(true) => {}
                Ok(false) => warn!(task_id = %task_id, "Task left pending by a concurrent change"),
                Err(revert) => {
                    error!(task_id = %task_id, error = %revert, "Reverting unqueued retry failed")
                }
            }
            return Err(e.into());
        }
        info!(task_id = %task_id, retry_count = task.retry_count, "Task retried");
        Ok(task)
    }

    pub fn stats(&self) -> Result<ServiceStats, ServiceError> {
        Ok(ServiceStats {
            tasks: self.ctx.store.stats()?,
            queue: self.ctx.queue.lengths()?,
        })
    }

    fn create_and_enqueue(&self, input: NewTask) -> Result<Task, ServiceError> {
        let task = self.ctx.store.create(input)?;
        if let Err(e) = self.ctx.queue.enqueue_ready(&QueueEntry::from(&task)) {
            // Without a queue entry nothing would ever pick the task up.
            warn!(task_id = %task.id, error = %e, "Enqueue failed, removing task");
            if let Err(cleanup) = self.ctx.store.delete(&[task.id]) {
                error!(task_id = %task.id, error = %cleanup, "Removing unqueued task failed");
            }
            return Err(e.into());
        }
        Ok(task)
    }
}

impl core::fmt::Debug for TaskService {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TaskService")
            .field("bucket", &self.bucket)
            .finish_non_exhaustive()
    }
}

fn validate_name(name: &str) -> Result<(), ServiceError> {
    if name.trim().is_empty() {
        return Err(ServiceError::BadRequest("task name must not be empty".to_string()));
    }
    Ok(())
}

/// Keep only the final path component of a client-supplied filename.
fn sanitize_filename(filename: Option<&str>) -> String {
    filename
        .and_then(|f| Path::new(f.trim()).file_name())
        .and_then(|f| f.to_str())
        .filter(|f| !f.is_empty())
        .unwrap_or("unknown")
        .to_string()
}
