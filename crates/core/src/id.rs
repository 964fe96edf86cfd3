//! Strongly-typed identifiers used across the domain.
//!
//! Two families live here:
//!
//! - **numeric** identifiers for rows owned by the relational store (bookings,
//!   users, projects, ...) and for the CRM's own integer ids (leads, statuses,
//!   pipelines);
//! - **UUID** identifiers for append-only records (history, logs, archived
//!   webhook bodies), generated locally as UUIDv7.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

macro_rules! numeric_id {
    ($(#[$meta:meta])* $t:ident, $name:literal) => {
        $(#[$meta])*
        #[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $t(pub i64);

        impl $t {
            pub const fn new(value: i64) -> Self {
                Self(value)
            }

            pub const fn get(self) -> i64 {
                self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<i64> for $t {
            fn from(value: i64) -> Self {
                Self(value)
            }
        }

        impl From<$t> for i64 {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let value = s
                    .trim()
                    .parse::<i64>()
                    .map_err(|e| DomainError::invalid_id(format!("{}: {}", $name, e)))?;
                Ok(Self(value))
            }
        }
    };
}

macro_rules! uuid_id {
    ($(#[$meta:meta])* $t:ident, $name:literal) => {
        $(#[$meta])*
        #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $t(Uuid);

        impl $t {
            /// Create a new identifier.
            ///
            /// Uses UUIDv7 (time-ordered). Prefer passing IDs explicitly in tests
            /// for determinism.
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $t {
            fn default() -> Self {
                Self::new()
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<Uuid> for $t {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl From<$t> for Uuid {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let uuid = Uuid::from_str(s)
                    .map_err(|e| DomainError::invalid_id(format!("{}: {}", $name, e)))?;
                Ok(Self(uuid))
            }
        }
    };
}

numeric_id!(
    /// Internal booking identifier.
    BookingId,
    "BookingId"
);
numeric_id!(
    /// Client (cabinet user) identifier.
    UserId,
    "UserId"
);
numeric_id!(AgentId, "AgentId");
numeric_id!(AgencyId, "AgencyId");
numeric_id!(ProjectId, "ProjectId");
numeric_id!(
    /// Reserved unit (flat, parking space, commercial premise).
    PropertyId,
    "PropertyId"
);
numeric_id!(BuildingId, "BuildingId");
numeric_id!(FloorId, "FloorId");
numeric_id!(MeetingId, "MeetingId");
numeric_id!(
    /// CRM lead (deal) identifier; mirrored locally as `Booking::amocrm_id`.
    LeadId,
    "LeadId"
);
numeric_id!(
    /// CRM pipeline status identifier.
    StatusId,
    "StatusId"
);
numeric_id!(PipelineId, "PipelineId");

uuid_id!(
    /// Identifier of a booking history entry.
    HistoryId,
    "HistoryId"
);
uuid_id!(
    /// Identifier of a booking change-log row.
    LogId,
    "LogId"
);
uuid_id!(WebhookRequestId, "WebhookRequestId");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_ids_parse_and_display() {
        let id: BookingId = " 42 ".parse().unwrap();
        assert_eq!(id, BookingId::new(42));
        assert_eq!(id.to_string(), "42");
    }

    #[test]
    fn numeric_id_parse_error_names_the_type() {
        let err = "abc".parse::<LeadId>().unwrap_err();
        match err {
            DomainError::InvalidId(msg) if msg.starts_with("LeadId") => {}
            _ => panic!("expected invalid id error"),
        }
    }

    #[test]
    fn uuid_ids_round_trip_through_strings() {
        let id = LogId::new();
        let parsed: LogId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn numeric_ids_serialize_transparently() {
        let json = serde_json::to_string(&StatusId::new(21197641)).unwrap();
        assert_eq!(json, "21197641");
    }
}
