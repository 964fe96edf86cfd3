use std::sync::Arc;

use axum::{extract::Extension, http::StatusCode, response::IntoResponse, Json};

use crate::app::errors::json_error;
use crate::app::services::AppServices;

pub async fn health() -> StatusCode {
    StatusCode::OK
}

/// Job queue counters.
pub async fn jobs(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services.jobs.stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "job_store_error", e.to_string()),
    }
}
