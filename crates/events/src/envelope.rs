use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use cabinet_core::BookingId;

/// A fact raised by booking reconciliation.
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Dotted routing name, e.g. `booking.meeting.status_changed`.
    fn event_type(&self) -> &'static str;

    /// Payload schema version.
    fn version(&self) -> u32;

    fn occurred_at(&self) -> DateTime<Utc>;
}

/// Envelope for a booking event, carrying routing metadata next to the payload.
///
/// Subscribers filter on `event_type` and `booking_id` without deserializing
/// the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope<E> {
    event_id: Uuid,
    event_type: String,
    version: u32,
    booking_id: BookingId,
    occurred_at: DateTime<Utc>,
    payload: E,
}

impl<E: Event> EventEnvelope<E> {
    /// Wrap an event raised for `booking_id`.
    pub fn wrap(booking_id: BookingId, event: E) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            event_type: event.event_type().to_string(),
            version: event.version(),
            booking_id,
            occurred_at: event.occurred_at(),
            payload: event,
        }
    }
}

impl<E> EventEnvelope<E> {
    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn booking_id(&self) -> BookingId {
        self.booking_id
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn payload(&self) -> &E {
        &self.payload
    }

    pub fn into_payload(self) -> E {
        self.payload
    }
}
