use std::sync::Arc;

use axum::{
    Json, Router,
    extract::Extension,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};

use crate::app::routes::blocking;
use crate::app::services::AppServices;

pub fn router() -> Router {
    Router::new().route("/stats", get(stats))
}

pub async fn health() -> StatusCode {
    StatusCode::OK
}

/// Task counts per status plus queue depths.
pub async fn stats(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match blocking(move || services.tasks.stats()).await {
        Ok(stats) => Json(stats).into_response(),
        Err(resp) => resp,
    }
}
