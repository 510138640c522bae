use axum::Router;
use axum::http::StatusCode;
use axum::response::Response;

use docflow_infra::service::ServiceError;

use crate::app::errors;

pub mod system;
pub mod tasks;

/// All API routes except `/health`.
pub fn router() -> Router {
    Router::new()
        .nest("/tasks", tasks::router())
        .merge(system::router())
}

/// Run a store/queue call off the async runtime and map its error.
pub(crate) async fn blocking<T, F>(op: F) -> Result<T, Response>
where
    F: FnOnce() -> Result<T, ServiceError> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(op).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(errors::service_error_to_response(e)),
        Err(e) => Err(errors::json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            format!("blocking task failed: {e}"),
        )),
    }
}
