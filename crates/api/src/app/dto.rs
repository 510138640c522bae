use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use docflow_core::{NewTask, Task, TaskId, TaskStatus};
use docflow_infra::service::UploadRequest;

#[derive(Debug, Deserialize)]
pub struct SubmitTaskRequest {
    pub name: String,
    pub doc: String,
    #[serde(default)]
    pub product: Option<String>,
    #[serde(default)]
    pub feature: Option<String>,
}

impl From<SubmitTaskRequest> for NewTask {
    fn from(body: SubmitTaskRequest) -> Self {
        let mut input = NewTask::new(body.name, body.doc);
        input.product = body.product;
        input.feature = body.feature;
        input
    }
}

#[derive(Debug, Serialize)]
pub struct SubmitTaskResponse {
    pub task_id: TaskId,
}

/// Query string of `POST /tasks/upload`; the body carries the raw bytes.
#[derive(Debug, Deserialize)]
pub struct UploadQuery {
    pub name: String,
    #[serde(default)]
    pub product: Option<String>,
    #[serde(default)]
    pub feature: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
}

impl UploadQuery {
    pub fn into_request(self, bytes: Vec<u8>) -> UploadRequest {
        UploadRequest {
            name: self.name,
            product: self.product,
            feature: self.feature,
            filename: self.filename,
            bytes,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct DeleteTasksRequest {
    pub task_ids: Vec<TaskId>,
}

#[derive(Debug, Serialize)]
pub struct DeleteTasksResponse {
    pub deleted: usize,
}

#[derive(Debug, Serialize)]
pub struct TaskResponse {
    pub task_id: TaskId,
    pub task_name: String,
    pub doc: String,
    pub product: Option<String>,
    pub feature: Option<String>,
    pub status: TaskStatus,
    pub result: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
}

impl From<Task> for TaskResponse {
    fn from(task: Task) -> Self {
        Self {
            task_id: task.id,
            task_name: task.name,
            doc: task.doc,
            product: task.product,
            feature: task.feature,
            status: task.status,
            result: task.result,
            created_at: task.created_at,
            processing_started_at: task.processing_started_at,
            retry_count: task.retry_count,
        }
    }
}
