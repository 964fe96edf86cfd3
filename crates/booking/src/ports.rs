//! Collaborator ports.
//!
//! The reconciler only talks to the outside world through these traits:
//! CRM and reservation clients, the importers that mirror contacts and
//! meetings, the task-instance service, mail templates, and the reference
//! data it reads (projects, properties, statuses, purchase matrix).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use cabinet_core::{
    AgentId, BookingId, BuildingId, FloorId, LeadId, MeetingId, PipelineId, ProjectId,
    PropertyId, StatusId, UserId,
};

use crate::constants::PaymentMethod;
use crate::dispatcher::TaskContext;
use crate::error::{IntegrationError, RepositoryError};
use crate::meeting::{Meeting, MeetingStatusWrite};
use crate::webhook::WebhookLead;

pub type IntegrationResult<T> = Result<T, IntegrationError>;

/// Lead as reported by the CRM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrmLead {
    pub id: LeadId,
    pub status_id: Option<StatusId>,
    pub pipeline_id: Option<PipelineId>,
}

/// Lead to create in the CRM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewLead {
    pub pipeline_id: PipelineId,
    pub status_id: StatusId,
    pub user_id: Option<UserId>,
    pub property_id: Option<PropertyId>,
    pub tags: Vec<String>,
    pub price: Option<Decimal>,
}

/// Status move of an existing lead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeadUpdate {
    pub lead_id: LeadId,
    pub pipeline_id: PipelineId,
    pub status_id: StatusId,
}

#[async_trait]
pub trait CrmClient: Send + Sync {
    async fn fetch_leads(&self, ids: &[LeadId]) -> IntegrationResult<Vec<CrmLead>>;
    async fn create_lead(&self, lead: NewLead) -> IntegrationResult<CrmLead>;
    async fn update_lead(&self, update: LeadUpdate) -> IntegrationResult<CrmLead>;
    async fn create_note(&self, lead: LeadId, text: &str) -> IntegrationResult<()>;
}

/// Reply of the reservation system to a booking request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationReply {
    pub success: bool,
    pub code: Option<String>,
}

/// Code the reservation system answers with when the property is already
/// attached to the same deal.
pub const DEALED_CODE: &str = "DEALED";

#[async_trait]
pub trait ReservationClient: Send + Sync {
    async fn book_property(
        &self,
        property: PropertyId,
        deal: LeadId,
    ) -> IntegrationResult<ReservationReply>;

    async fn unbook_property(&self, deal: LeadId) -> IntegrationResult<bool>;
}

/// Local user resolved from the lead's contact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportedUser {
    pub id: UserId,
    pub email: Option<String>,
}

#[async_trait]
pub trait ContactImporter: Send + Sync {
    async fn import_contact(&self, lead: &WebhookLead) -> IntegrationResult<Option<ImportedUser>>;
}

#[async_trait]
pub trait AgentImporter: Send + Sync {
    async fn import_agent(&self, lead: &WebhookLead) -> IntegrationResult<()>;
}

#[async_trait]
pub trait MeetingImporter: Send + Sync {
    /// Mirrors the lead's meeting data; the returned context hints at
    /// rescheduling and the next task status.
    async fn import_meeting(
        &self,
        lead: &WebhookLead,
        user: Option<&ImportedUser>,
    ) -> IntegrationResult<Option<TaskContext>>;
}

#[async_trait]
pub trait PinningChecker: Send + Sync {
    async fn check_pinning(&self, user: UserId) -> IntegrationResult<()>;
}

#[async_trait]
pub trait RoomCreator: Send + Sync {
    async fn create_room(
        &self,
        meeting: MeetingId,
        starts_at: DateTime<Utc>,
    ) -> IntegrationResult<String>;
}

#[async_trait]
pub trait MeetingStore: Send + Sync {
    async fn for_booking(&self, booking: BookingId) -> Result<Option<Meeting>, RepositoryError>;

    async fn save_status(
        &self,
        meeting: MeetingId,
        write: MeetingStatusWrite,
    ) -> Result<Meeting, RepositoryError>;

    async fn set_link(&self, meeting: MeetingId, link: String) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait TaskInstanceService: Send + Sync {
    /// True when the booking has a task instance in the given status.
    async fn exists_with_status(&self, booking: BookingId, status: &str)
    -> IntegrationResult<bool>;

    /// Creates or refreshes the booking's task chain.
    async fn create_chain(
        &self,
        booking: BookingId,
        context: Option<&TaskContext>,
    ) -> IntegrationResult<()>;

    /// Moves the booking's task instance to `status`.
    async fn update_status(&self, booking: BookingId, status: &str) -> IntegrationResult<()>;
}

/// Mail template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailTemplate {
    pub slug: String,
    pub topic: String,
    pub content: String,
    pub is_active: bool,
}

#[async_trait]
pub trait EmailTemplates: Send + Sync {
    async fn template(&self, slug: &str) -> IntegrationResult<Option<EmailTemplate>>;
}

/// Email addresses of booking participants.
#[async_trait]
pub trait ContactDirectory: Send + Sync {
    async fn user_email(&self, user: UserId) -> IntegrationResult<Option<String>>;
    async fn agent_email(&self, agent: AgentId) -> IntegrationResult<Option<String>>;
}

/// Project as far as the booking engine needs it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    pub amocrm_enum: i64,
    pub amo_pipeline_id: Option<PipelineId>,
    pub city_slug: Option<String>,
}

#[async_trait]
pub trait ProjectDirectory: Send + Sync {
    async fn get(&self, id: ProjectId) -> Result<Option<Project>, RepositoryError>;

    /// Current project carrying the CRM project enum.
    async fn current_by_amocrm_enum(&self, enum_id: i64)
    -> Result<Option<Project>, RepositoryError>;
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyStatus {
    Free,
    Booked,
    Sold,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    pub id: PropertyId,
    /// Identifier of the property in the CRM/reservation systems.
    pub external_id: String,
    pub kind: Option<String>,
    pub status: PropertyStatus,
    pub final_price: Option<Decimal>,
    pub project_id: Option<ProjectId>,
    pub building_id: Option<BuildingId>,
    pub floor_id: Option<FloorId>,
}

#[async_trait]
pub trait PropertyStore: Send + Sync {
    async fn get(&self, id: PropertyId) -> Result<Option<Property>, RepositoryError>;

    async fn set_status(&self, id: PropertyId, status: PropertyStatus)
    -> Result<(), RepositoryError>;

    async fn set_final_price(&self, id: PropertyId, price: Decimal)
    -> Result<(), RepositoryError>;

    /// Finds the property by its external id or creates a placeholder.
    async fn upsert_external(
        &self,
        external_id: &str,
        kind: &str,
    ) -> Result<Property, RepositoryError>;
}

/// Mirrored CRM status with its group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmocrmStatus {
    pub id: StatusId,
    pub name: String,
    pub pipeline_id: PipelineId,
    pub group_name: Option<String>,
}

#[async_trait]
pub trait StatusDirectory: Send + Sync {
    async fn status(&self, id: StatusId) -> Result<Option<AmocrmStatus>, RepositoryError>;

    /// First status of `pipeline` whose group name contains `fragment`.
    async fn find_in_group(
        &self,
        pipeline: PipelineId,
        fragment: &str,
    ) -> Result<Option<AmocrmStatus>, RepositoryError>;
}

/// Payment method and mortgage type resolved from the CRM payment-type enum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseTerms {
    pub payment_method: Option<PaymentMethod>,
    pub mortgage_type: Option<String>,
}

#[async_trait]
pub trait PurchaseMatrix: Send + Sync {
    /// Row for `payment_type`, falling back to the default row.
    async fn resolve(&self, payment_type: i64) -> Result<Option<PurchaseTerms>, RepositoryError>;
}
