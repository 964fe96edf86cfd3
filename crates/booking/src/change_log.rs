//! Change logging decorator around repository writes.
//!
//! A [`ChangeLogger`] is bound to one operation label and the use case that
//! owns it. Each wrapped call snapshots the booking before and after the
//! write, diffs the two, and schedules a [`BookingLog`] without waiting for it
//! to be stored. Failures of the wrapped call are recorded in the log and
//! surface to the caller as `None`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{error, warn};

use cabinet_core::{BookingId, LogId};

use crate::booking::Booking;
use crate::error::RepositoryError;
use crate::patch::BookingPatch;
use crate::repository::{BookingFilter, BookingRepository};
use crate::tasks::{BookingTask, TaskQueue};

/// Persisted record of one booking write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookingLog {
    pub id: LogId,
    pub booking_id: Option<BookingId>,
    pub created_at: DateTime<Utc>,
    pub state_before: Value,
    pub state_after: Value,
    pub state_difference: Value,
    pub content: String,
    pub use_case: String,
    pub error_data: Option<String>,
}

#[async_trait]
pub trait BookingLogStore: Send + Sync {
    async fn append(&self, log: BookingLog) -> Result<(), RepositoryError>;
    async fn for_booking(&self, booking: BookingId) -> Result<Vec<BookingLog>, RepositoryError>;
}

/// Top-level keys whose values differ, as `{key: {"before": .., "after": ..}}`.
pub fn diff_states(before: &Value, after: &Value) -> Value {
    let empty = Map::new();
    let before = before.as_object().unwrap_or(&empty);
    let after = after.as_object().unwrap_or(&empty);

    let mut diff = Map::new();
    for (key, new) in after {
        let old = before.get(key).unwrap_or(&Value::Null);
        if old != new {
            diff.insert(key.clone(), serde_json::json!({ "before": old, "after": new }));
        }
    }
    for (key, old) in before {
        if !after.contains_key(key) {
            diff.insert(key.clone(), serde_json::json!({ "before": old, "after": Value::Null }));
        }
    }
    Value::Object(diff)
}

/// Repository decorator that records every write it performs.
#[derive(Clone)]
pub struct ChangeLogger {
    repo: Arc<dyn BookingRepository>,
    queue: Arc<dyn TaskQueue>,
    content: String,
    use_case: String,
}

impl ChangeLogger {
    pub fn new(
        repo: Arc<dyn BookingRepository>,
        queue: Arc<dyn TaskQueue>,
        content: impl Into<String>,
        use_case: impl Into<String>,
    ) -> Self {
        Self {
            repo,
            queue,
            content: content.into(),
            use_case: use_case.into(),
        }
    }

    /// Same repository and queue under a different label.
    pub fn labelled(&self, content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..self.clone()
        }
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub async fn update(&self, booking: &Booking, patch: BookingPatch) -> Option<Booking> {
        let before = booking.snapshot();
        let result = self.repo.update(booking, patch).await;
        self.record(Some(booking.id_typed()), before, result).await
    }

    pub async fn create(&self, patch: BookingPatch) -> Option<Booking> {
        let result = self.repo.create(patch).await;
        self.record(None, Value::Object(Map::new()), result).await
    }

    pub async fn bulk_update(
        &self,
        patch: BookingPatch,
        filter: &BookingFilter,
        exclude: Option<&BookingFilter>,
    ) -> Option<u64> {
        let before = serde_json::to_value(&patch).unwrap_or(Value::Null);
        match self.repo.bulk_update(patch, filter, exclude).await {
            Ok(rows) => {
                self.schedule(None, before, serde_json::json!({ "rows": rows }), None)
                    .await;
                Some(rows)
            }
            Err(err) => {
                error!(use_case = %self.use_case, error = %err, "booking bulk update failed");
                self.schedule(None, before, Value::Object(Map::new()), Some(err.to_string()))
                    .await;
                None
            }
        }
    }

    async fn record(
        &self,
        booking_id: Option<BookingId>,
        before: Value,
        result: Result<Booking, RepositoryError>,
    ) -> Option<Booking> {
        match result {
            Ok(booking) => {
                let id = booking_id.unwrap_or_else(|| booking.id_typed());
                self.schedule(Some(id), before, booking.snapshot(), None).await;
                Some(booking)
            }
            Err(err) => {
                error!(
                    use_case = %self.use_case,
                    booking_id = ?booking_id,
                    error = %err,
                    "booking write failed"
                );
                self.schedule(booking_id, before, Value::Object(Map::new()), Some(err.to_string()))
                    .await;
                None
            }
        }
    }

    async fn schedule(
        &self,
        booking_id: Option<BookingId>,
        before: Value,
        after: Value,
        error_data: Option<String>,
    ) {
        let log = BookingLog {
            id: LogId::new(),
            booking_id,
            created_at: Utc::now(),
            state_difference: diff_states(&before, &after),
            state_before: before,
            state_after: after,
            content: self.content.clone(),
            use_case: self.use_case.clone(),
            error_data,
        };
        if let Err(err) = self.queue.enqueue(BookingTask::CreateBookingLog(log)).await {
            warn!(use_case = %self.use_case, error = %err, "failed to schedule booking log");
        }
    }
}
