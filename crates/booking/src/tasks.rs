//! Fire-and-forget background work requested by booking use cases.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use cabinet_core::{BookingId, LeadId};

use crate::change_log::BookingLog;
use crate::constants::BookingSubstage;
use crate::error::QueueError;
use crate::patch::RegressionAlert;

/// Templated email ready to send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailMessage {
    pub topic: String,
    pub content: String,
    pub recipients: Vec<String>,
    pub template_slug: String,
}

/// Out-of-band report of dropped regressions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionReport {
    pub booking_id: BookingId,
    pub alerts: Vec<RegressionAlert>,
    pub backtrace: String,
}

/// Background task payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum BookingTask {
    ActivateBooking {
        booking_id: BookingId,
        amocrm_substage: Option<BookingSubstage>,
        property_final_price: Option<Decimal>,
        price_with_sale: Option<Decimal>,
    },
    DeactivateBooking {
        booking_id: BookingId,
        stages_valid: bool,
    },
    SendSms {
        booking_id: BookingId,
        sms_slug: String,
    },
    SendEmail(EmailMessage),
    CreateBookingLog(BookingLog),
    CreateAmocrmNote {
        lead_id: LeadId,
        text: String,
    },
    RegressionAlert(RegressionReport),
}

impl BookingTask {
    /// Job kind name used for routing to a handler.
    pub fn kind(&self) -> &'static str {
        match self {
            BookingTask::ActivateBooking { .. } => "booking.activate",
            BookingTask::DeactivateBooking { .. } => "booking.deactivate",
            BookingTask::SendSms { .. } => "booking.send_sms",
            BookingTask::SendEmail(_) => "booking.send_email",
            BookingTask::CreateBookingLog(_) => "booking.create_log",
            BookingTask::CreateAmocrmNote { .. } => "booking.create_amocrm_note",
            BookingTask::RegressionAlert(_) => "booking.regression_alert",
        }
    }

    pub const KINDS: [&'static str; 7] = [
        "booking.activate",
        "booking.deactivate",
        "booking.send_sms",
        "booking.send_email",
        "booking.create_log",
        "booking.create_amocrm_note",
        "booking.regression_alert",
    ];
}

/// Accepts background tasks. Enqueueing never waits for the task to run.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, task: BookingTask) -> Result<(), QueueError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_kind_is_listed() {
        let tasks = [
            BookingTask::DeactivateBooking {
                booking_id: BookingId::new(1),
                stages_valid: false,
            },
            BookingTask::SendSms {
                booking_id: BookingId::new(1),
                sms_slug: "assign_client".into(),
            },
            BookingTask::CreateAmocrmNote {
                lead_id: LeadId::new(9),
                text: "note".into(),
            },
        ];
        for task in tasks {
            assert!(BookingTask::KINDS.contains(&task.kind()));
        }
    }

    #[test]
    fn payload_is_tagged_by_task() {
        let task = BookingTask::DeactivateBooking {
            booking_id: BookingId::new(3),
            stages_valid: true,
        };
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["task"], "deactivate_booking");
        let back: BookingTask = serde_json::from_value(json).unwrap();
        assert_eq!(back, task);
    }
}
