use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use docflow_infra::service::ServiceError;

pub fn service_error_to_response(err: ServiceError) -> axum::response::Response {
    let message = err.to_string();
    match err {
        ServiceError::NotFound(_) => json_error(StatusCode::NOT_FOUND, "task_not_found", message),
        ServiceError::InvalidStatus { .. } => {
            json_error(StatusCode::CONFLICT, "invalid_task_status", message)
        }
        ServiceError::BadRequest(_) => json_error(StatusCode::BAD_REQUEST, "bad_request", message),
        ServiceError::Upload(_) => json_error(StatusCode::BAD_GATEWAY, "upload_failed", message),
        ServiceError::Unavailable(_) => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "unavailable", message)
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
