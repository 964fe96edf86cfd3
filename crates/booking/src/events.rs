//! Domain events emitted by booking reconciliation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use cabinet_core::BookingId;
use cabinet_events::{Event, EventBus, EventEnvelope};

use crate::meeting::MeetingStatus;

/// Why a loyalty reward attached to a booking should be cancelled.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewardCancelComment {
    Unbooked,
    Canceled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BookingEvent {
    MeetingStatusChanged {
        booking_id: BookingId,
        old_status: MeetingStatus,
        new_status: MeetingStatus,
        occurred_at: DateTime<Utc>,
    },
    LoyaltyRewardCancelled {
        booking_id: BookingId,
        comment: RewardCancelComment,
        occurred_at: DateTime<Utc>,
    },
}

impl BookingEvent {
    pub fn booking_id(&self) -> BookingId {
        match self {
            BookingEvent::MeetingStatusChanged { booking_id, .. }
            | BookingEvent::LoyaltyRewardCancelled { booking_id, .. } => *booking_id,
        }
    }
}

impl Event for BookingEvent {
    fn event_type(&self) -> &'static str {
        match self {
            BookingEvent::MeetingStatusChanged { .. } => "booking.meeting.status_changed",
            BookingEvent::LoyaltyRewardCancelled { .. } => "booking.loyalty_reward.cancel",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            BookingEvent::MeetingStatusChanged { occurred_at, .. }
            | BookingEvent::LoyaltyRewardCancelled { occurred_at, .. } => *occurred_at,
        }
    }
}

pub type BookingEnvelope = EventEnvelope<BookingEvent>;

/// Object-safe publishing seam over any [`EventBus`] of booking envelopes.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: BookingEvent);
}

impl<B> EventPublisher for B
where
    B: EventBus<BookingEnvelope>,
{
    fn publish(&self, event: BookingEvent) {
        let envelope = EventEnvelope::wrap(event.booking_id(), event);
        let event_type = envelope.event_type().to_string();
        if let Err(err) = EventBus::publish(self, envelope) {
            warn!(event_type = %event_type, error = ?err, "failed to publish booking event");
        }
    }
}
