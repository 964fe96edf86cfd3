//! Booking-side error taxonomy.

use thiserror::Error;

use cabinet_core::{BookingId, DomainError};

/// Result type for booking use cases.
pub type BookingResult<T> = Result<T, BookingError>;

/// Storage failure raised by repositories and stores.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RepositoryError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("storage conflict: {0}")]
    Conflict(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl RepositoryError {
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }
}

/// Failure reported by an outbound collaborator (CRM, reservation system,
/// mailer, task-instance service).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IntegrationError {
    #[error("{service} unavailable: {message}")]
    Unavailable { service: &'static str, message: String },

    #[error("{service} rejected the request: {message}")]
    Rejected { service: &'static str, message: String },
}

impl IntegrationError {
    pub fn unavailable(service: &'static str, message: impl Into<String>) -> Self {
        Self::Unavailable {
            service,
            message: message.into(),
        }
    }

    pub fn rejected(service: &'static str, message: impl Into<String>) -> Self {
        Self::Rejected {
            service,
            message: message.into(),
        }
    }
}

/// Failure raised when the task queue cannot accept a job.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("task queue rejected {kind}: {message}")]
pub struct QueueError {
    pub kind: &'static str,
    pub message: String,
}

/// Typed booking failures for synchronous use cases.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum BookingError {
    #[error("booking not found: {0}")]
    NotFound(String),

    #[error("booking {booking_id} is not at step {required} (current step {current})")]
    WrongStep {
        booking_id: BookingId,
        required: u8,
        current: u8,
    },

    #[error("booking {0} has timed out")]
    TimeOut(BookingId),

    #[error("pipeline {0} is not a sales pipeline")]
    WrongPipeline(i64),

    #[error("property is missing or already taken")]
    PropertyMissing,

    #[error("property could not be reserved (booked: {booked}, in deal: {in_deal})")]
    PropertyUnavailable { booked: bool, in_deal: bool },

    #[error("webhook could not be processed: {0}")]
    WebhookFatal(String),

    #[error(transparent)]
    Storage(#[from] RepositoryError),

    #[error(transparent)]
    Integration(#[from] IntegrationError),

    #[error(transparent)]
    Domain(#[from] DomainError),
}

impl BookingError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Stable machine-readable reason code.
    pub fn reason(&self) -> &'static str {
        match self {
            BookingError::NotFound(_) => "booking_not_found",
            BookingError::WrongStep { .. } => "booking_wrong_step",
            BookingError::TimeOut(_) => "booking_time_out",
            BookingError::WrongPipeline(_) => "booking_wrong_pipeline_id",
            BookingError::PropertyMissing => "booking_property_missing",
            BookingError::PropertyUnavailable { .. } => "booking_property_unavailable",
            BookingError::WebhookFatal(_) => "booking_webhook_fatal",
            BookingError::Storage(_) => "booking_storage_error",
            BookingError::Integration(_) => "booking_integration_error",
            BookingError::Domain(_) => "booking_domain_error",
        }
    }
}
