//! `cabinet-core`: identifiers, the domain error and the persisted-model
//! trait shared by the booking crates. No infrastructure concerns live here.

pub mod error;
pub mod id;
pub mod model;

pub use error::DomainError;
pub use id::{
    AgencyId, AgentId, BookingId, BuildingId, FloorId, HistoryId, LeadId, LogId, MeetingId,
    PipelineId, ProjectId, PropertyId, StatusId, UserId, WebhookRequestId,
};
pub use model::AggregateRoot;
