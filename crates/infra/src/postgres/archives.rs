//! Append-only booking archives: history, change log, raw webhooks.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;

use cabinet_booking::archive::{WebhookRequest, WebhookRequestStore};
use cabinet_booking::change_log::{BookingLog, BookingLogStore};
use cabinet_booking::error::RepositoryError;
use cabinet_booking::history::{BookingHistory, HistoryStore};
use cabinet_core::{BookingId, WebhookRequestId};

use super::map_sqlx_error;

fn decode_entry<T>(row: &sqlx::postgres::PgRow, what: &str) -> Result<T, RepositoryError>
where
    T: serde::de::DeserializeOwned,
{
    let Json(entry): Json<T> = row
        .try_get("entry")
        .map_err(|e| RepositoryError::backend(format!("failed to deserialize {what} row: {e}")))?;
    Ok(entry)
}

#[derive(Debug, Clone)]
pub struct PostgresHistoryStore {
    pool: Arc<PgPool>,
}

impl PostgresHistoryStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl HistoryStore for PostgresHistoryStore {
    #[instrument(skip(self, entry), fields(booking_id = %entry.booking_id), err)]
    async fn append(&self, entry: BookingHistory) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO booking_history (id, booking_id, occurred_at, entry)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(entry.id.as_uuid())
        .bind(entry.booking_id.get())
        .bind(entry.occurred_at)
        .bind(Json(&entry))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("append_history", e))?;
        Ok(())
    }

    async fn for_booking(
        &self,
        booking: BookingId,
    ) -> Result<Vec<BookingHistory>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT entry FROM booking_history WHERE booking_id = $1 ORDER BY occurred_at ASC",
        )
        .bind(booking.get())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("history_for_booking", e))?;
        rows.iter().map(|row| decode_entry(row, "history")).collect()
    }
}

#[derive(Debug, Clone)]
pub struct PostgresBookingLogStore {
    pool: Arc<PgPool>,
}

impl PostgresBookingLogStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl BookingLogStore for PostgresBookingLogStore {
    #[instrument(skip(self, log), fields(use_case = %log.use_case), err)]
    async fn append(&self, log: BookingLog) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO booking_logs (id, booking_id, created_at, entry)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(log.id.as_uuid())
        .bind(log.booking_id.map(|id| id.get()))
        .bind(log.created_at)
        .bind(Json(&log))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("append_booking_log", e))?;
        Ok(())
    }

    async fn for_booking(&self, booking: BookingId) -> Result<Vec<BookingLog>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT entry FROM booking_logs WHERE booking_id = $1 ORDER BY created_at ASC",
        )
        .bind(booking.get())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("logs_for_booking", e))?;
        rows.iter().map(|row| decode_entry(row, "booking log")).collect()
    }
}

#[derive(Debug, Clone)]
pub struct PostgresWebhookRequestStore {
    pool: Arc<PgPool>,
}

impl PostgresWebhookRequestStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

struct WebhookRequestRow {
    id: uuid::Uuid,
    category: String,
    body: String,
    received_at: chrono::DateTime<chrono::Utc>,
}

impl<'r> FromRow<'r, sqlx::postgres::PgRow> for WebhookRequestRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(WebhookRequestRow {
            id: row.try_get("id")?,
            category: row.try_get("category")?,
            body: row.try_get("body")?,
            received_at: row.try_get("received_at")?,
        })
    }
}

impl From<WebhookRequestRow> for WebhookRequest {
    fn from(row: WebhookRequestRow) -> Self {
        WebhookRequest {
            id: WebhookRequestId::from_uuid(row.id),
            category: row.category,
            body: row.body,
            received_at: row.received_at,
        }
    }
}

#[async_trait]
impl WebhookRequestStore for PostgresWebhookRequestStore {
    #[instrument(skip(self, request), fields(category = %request.category), err)]
    async fn append(&self, request: WebhookRequest) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO webhook_requests (id, category, body, received_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(request.id.as_uuid())
        .bind(&request.category)
        .bind(&request.body)
        .bind(request.received_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("append_webhook_request", e))?;
        Ok(())
    }

    async fn list(&self, category: Option<&str>) -> Result<Vec<WebhookRequest>, RepositoryError> {
        let rows = sqlx::query(
            r#"
            SELECT id, category, body, received_at
            FROM webhook_requests
            WHERE $1::TEXT IS NULL OR category = $1
            ORDER BY received_at ASC
            "#,
        )
        .bind(category)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_webhook_requests", e))?;

        rows.iter()
            .map(|row| {
                WebhookRequestRow::from_row(row).map(Into::into).map_err(|e| {
                    RepositoryError::backend(format!("failed to deserialize webhook row: {e}"))
                })
            })
            .collect()
    }
}
