//! Raw webhook archive.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cabinet_core::WebhookRequestId;

use crate::error::RepositoryError;

/// Inbound webhook body as received, tagged with the endpoint category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookRequest {
    pub id: WebhookRequestId,
    pub category: String,
    pub body: String,
    pub received_at: DateTime<Utc>,
}

impl WebhookRequest {
    pub fn new(category: impl Into<String>, body: &[u8]) -> Self {
        Self {
            id: WebhookRequestId::new(),
            category: category.into(),
            body: String::from_utf8_lossy(body).into_owned(),
            received_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait WebhookRequestStore: Send + Sync {
    async fn append(&self, request: WebhookRequest) -> Result<(), RepositoryError>;
    async fn list(&self, category: Option<&str>) -> Result<Vec<WebhookRequest>, RepositoryError>;
}
