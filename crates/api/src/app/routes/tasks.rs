use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};

use docflow_core::TaskId;

use crate::app::routes::blocking;
use crate::app::services::AppServices;
use crate::app::{dto, errors};

/// Largest accepted upload body.
const MAX_UPLOAD_BYTES: usize = 32 * 1024 * 1024;

pub fn router() -> Router {
    Router::new()
        .route("/", post(submit_task).get(list_tasks))
        .route(
            "/upload",
            post(upload_task).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route("/delete", post(delete_tasks))
        .route("/:id", get(get_task))
        .route("/:id/retry", post(retry_task))
}

fn parse_task_id(raw: &str) -> Result<TaskId, axum::response::Response> {
    raw.parse::<TaskId>()
        .map_err(|e| errors::json_error(StatusCode::BAD_REQUEST, "invalid_task_id", e.to_string()))
}

pub async fn submit_task(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::SubmitTaskRequest>,
) -> axum::response::Response {
    match blocking(move || services.tasks.submit(body.into())).await {
        Ok(task_id) => (StatusCode::CREATED, Json(dto::SubmitTaskResponse { task_id })).into_response(),
        Err(resp) => resp,
    }
}

pub async fn upload_task(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<dto::UploadQuery>,
    body: Bytes,
) -> axum::response::Response {
    let upload = query.into_request(body.to_vec());
    match blocking(move || services.tasks.submit_with_upload(upload)).await {
        Ok(receipt) => (StatusCode::CREATED, Json(receipt)).into_response(),
        Err(resp) => resp,
    }
}

pub async fn list_tasks(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match blocking(move || services.tasks.list()).await {
        Ok(tasks) => {
            let tasks: Vec<dto::TaskResponse> = tasks.into_iter().map(Into::into).collect();
            Json(tasks).into_response()
        }
        Err(resp) => resp,
    }
}

pub async fn get_task(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let task_id = match parse_task_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match blocking(move || services.tasks.get(task_id)).await {
        Ok(task) => Json(dto::TaskResponse::from(task)).into_response(),
        Err(resp) => resp,
    }
}

pub async fn delete_tasks(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::DeleteTasksRequest>,
) -> axum::response::Response {
    match blocking(move || services.tasks.delete(&body.task_ids)).await {
        Ok(deleted) => Json(dto::DeleteTasksResponse { deleted }).into_response(),
        Err(resp) => resp,
    }
}

/// Manual retry: only failed tasks go back to pending.
pub async fn retry_task(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let task_id = match parse_task_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match blocking(move || services.tasks.retry(task_id)).await {
        Ok(task) => Json(dto::TaskResponse::from(task)).into_response(),
        Err(resp) => resp,
    }
}
