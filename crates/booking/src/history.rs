//! Append-only, human-readable booking history.

use std::sync::Arc;

use askama::Template;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use cabinet_core::{BookingId, HistoryId};

use crate::booking::Booking;
use crate::constants::{BookingStage, BookingSubstage, OnlinePurchaseStep};
use crate::error::RepositoryError;

/// Document attached to a history entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryDocument {
    pub name: String,
    pub size: u64,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingHistory {
    pub id: HistoryId,
    pub booking_id: BookingId,
    pub occurred_at: DateTime<Utc>,
    pub message: String,
    pub previous_online_purchase_step: Option<OnlinePurchaseStep>,
    pub documents: Vec<Vec<HistoryDocument>>,
}

#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn append(&self, entry: BookingHistory) -> Result<(), RepositoryError>;
    async fn for_booking(&self, booking: BookingId)
    -> Result<Vec<BookingHistory>, RepositoryError>;
}

#[derive(Template)]
#[template(path = "history/activated.txt")]
pub struct ActivatedMessage {
    pub stage: BookingStage,
    pub final_price: Option<Decimal>,
}

#[derive(Template)]
#[template(path = "history/deactivated.txt")]
pub struct DeactivatedMessage {
    pub stages_valid: bool,
}

#[derive(Template)]
#[template(path = "history/expired.txt")]
pub struct ExpiredMessage {
    pub expires: String,
}

#[derive(Template)]
#[template(path = "history/stage_changed.txt")]
pub struct StageChangedMessage {
    pub from: String,
    pub to: BookingSubstage,
}

/// Renders a template and appends it to the booking's history.
#[derive(Clone)]
pub struct HistoryRecorder {
    store: Arc<dyn HistoryStore>,
}

impl HistoryRecorder {
    pub fn new(store: Arc<dyn HistoryStore>) -> Self {
        Self { store }
    }

    /// Records one entry. Rendering or storage failures are logged and
    /// yield `None`; history never blocks the operation it describes.
    pub async fn execute<T: Template>(
        &self,
        booking: &Booking,
        previous_online_purchase_step: Option<OnlinePurchaseStep>,
        message: &T,
        documents: Vec<Vec<HistoryDocument>>,
    ) -> Option<BookingHistory> {
        let rendered = match message.render() {
            Ok(text) => text.trim().to_string(),
            Err(err) => {
                warn!(booking_id = %booking.id_typed(), error = %err, "history template failed to render");
                return None;
            }
        };
        let entry = BookingHistory {
            id: HistoryId::new(),
            booking_id: booking.id_typed(),
            occurred_at: Utc::now(),
            message: rendered,
            previous_online_purchase_step,
            documents,
        };
        match self.store.append(entry.clone()).await {
            Ok(()) => {
                debug!(booking_id = %booking.id_typed(), "history recorded");
                Some(entry)
            }
            Err(err) => {
                warn!(booking_id = %booking.id_typed(), error = %err, "failed to store history");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn templates_render_plain_text() {
        let text = ActivatedMessage {
            stage: BookingStage::Booking,
            final_price: Some(Decimal::new(1_250_000, 0)),
        }
        .render()
        .unwrap();
        assert_eq!(
            text.trim(),
            "Booking activated at stage booking. Final price: 1250000."
        );

        let text = DeactivatedMessage { stages_valid: false }.render().unwrap();
        assert_eq!(
            text.trim(),
            "Booking deactivated: CRM stage is no longer valid."
        );

        let text = StageChangedMessage {
            from: "start".into(),
            to: BookingSubstage::Booking,
        }
        .render()
        .unwrap();
        assert_eq!(text.trim(), "Stage changed from start to booking by CRM webhook.");
    }
}
