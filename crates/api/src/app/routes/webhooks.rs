//! CRM webhook endpoints.
//!
//! The CRM retries anything that is not a 2xx, so every call answers
//! `200 {}` and the outcome only shows up in the logs.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Extension, Path},
    http::StatusCode,
    Json,
};
use serde_json::json;
use tracing::info;

use cabinet_booking::ReconcileMode;

use crate::app::services::AppServices;

async fn reconcile(
    services: &AppServices,
    mode: ReconcileMode,
    secret: &str,
    body: &[u8],
) -> (StatusCode, Json<serde_json::Value>) {
    let outcome = services.reconciler.handle(mode, secret, body).await;
    info!(mode = %mode, outcome = ?outcome, "amocrm webhook processed");
    (StatusCode::OK, Json(json!({})))
}

pub async fn status_only(
    Extension(services): Extension<Arc<AppServices>>,
    Path(secret): Path<String>,
    body: Bytes,
) -> (StatusCode, Json<serde_json::Value>) {
    reconcile(&services, ReconcileMode::StatusOnly, &secret, &body).await
}

pub async fn status(
    Extension(services): Extension<Arc<AppServices>>,
    Path(secret): Path<String>,
    body: Bytes,
) -> (StatusCode, Json<serde_json::Value>) {
    reconcile(&services, ReconcileMode::Status, &secret, &body).await
}

pub async fn update(
    Extension(services): Extension<Arc<AppServices>>,
    Path(secret): Path<String>,
    body: Bytes,
) -> (StatusCode, Json<serde_json::Value>) {
    reconcile(&services, ReconcileMode::Update, &secret, &body).await
}
