//! Booking creation for leads that reach the booking group in the CRM
//! before the cabinet knows them.

use std::sync::Arc;

use chrono::DateTime;
use tracing::{info, warn};

use cabinet_core::UserId;

use crate::booking::Booking;
use crate::catalog::StatusCatalog;
use crate::change_log::ChangeLogger;
use crate::constants::{BookingCreatedSource, BookingStage, BookingSubstage};
use crate::error::{BookingError, BookingResult, RepositoryError};
use crate::patch::{BookingField, BookingPatch};
use crate::ports::{AmocrmStatus, ProjectDirectory, PropertyStore, PurchaseMatrix};
use crate::webhook::WebhookLead;

#[derive(Clone)]
pub struct BookingCreationService {
    pub catalog: Arc<StatusCatalog>,
    pub projects: Arc<dyn ProjectDirectory>,
    pub properties: Arc<dyn PropertyStore>,
    pub purchases: Arc<dyn PurchaseMatrix>,
    pub writer: ChangeLogger,
}

impl BookingCreationService {
    /// Creates an active booking for `lead` in `status`.
    ///
    /// The expiry field is required; project, property and purchase terms
    /// are filled in when the lead carries them.
    pub async fn create(
        &self,
        lead: &WebhookLead,
        status: &AmocrmStatus,
        user: Option<UserId>,
    ) -> BookingResult<Booking> {
        let fields = self.catalog.fields();
        let lead_id = lead
            .lead_id
            .ok_or_else(|| BookingError::WebhookFatal("lead id is missing".into()))?;

        let expires = lead
            .field_value(fields.booking_expires)
            .and_then(|v| v.trim().parse::<i64>().ok())
            .and_then(|ts| DateTime::from_timestamp(ts, 0))
            .ok_or_else(|| BookingError::WebhookFatal("booking expiry is not a timestamp".into()))?;

        let mut patch = BookingPatch::new()
            .set(BookingField::Active(true))
            .set(BookingField::AmocrmStage(Some(BookingStage::Booking)))
            .set(BookingField::AmocrmSubstage(Some(BookingSubstage::Booking)))
            .set(BookingField::AmocrmStatusId(Some(status.id)))
            .set(BookingField::AmocrmId(Some(lead_id)))
            .set(BookingField::UserId(user))
            .set(BookingField::CreatedSource(Some(BookingCreatedSource::Amocrm)))
            .set(BookingField::Expires(Some(expires)));

        if let Some(enum_id) = lead.field_enum(fields.project) {
            match self.projects.current_by_amocrm_enum(enum_id).await {
                Ok(Some(project)) => patch.push(BookingField::ProjectId(Some(project.id))),
                Ok(None) => warn!(lead_id = %lead_id, project_enum = enum_id, "no current project for enum"),
                Err(err) => warn!(lead_id = %lead_id, error = %err, "project lookup failed"),
            }
        }

        if let Some(payment_type) = lead.field_enum(fields.booking_payment_type) {
            match self.purchases.resolve(payment_type).await {
                Ok(Some(terms)) => {
                    patch.push(BookingField::AmoPaymentMethod(terms.payment_method));
                    patch.push(BookingField::MortgageType(terms.mortgage_type));
                }
                Ok(None) => {}
                Err(err) => warn!(lead_id = %lead_id, error = %err, "purchase matrix lookup failed"),
            }
        }

        let external = lead.field_value(fields.property);
        let kind = lead.field_value(fields.property_str_type);
        if let (Some(external), Some(kind)) = (external, kind) {
            let property = self
                .properties
                .upsert_external(external, &kind.to_lowercase())
                .await?;
            patch.push(BookingField::PropertyId(Some(property.id)));
            patch.push(BookingField::FloorId(property.floor_id));
            patch.push(BookingField::BuildingId(property.building_id));
            if property.project_id.is_some() {
                patch.push(BookingField::ProjectId(property.project_id));
            }
        }

        let booking = self.writer.create(patch).await.ok_or_else(|| {
            BookingError::Storage(RepositoryError::backend(format!(
                "booking for lead {lead_id} was not created"
            )))
        })?;
        info!(lead_id = %lead_id, booking_id = %booking.id_typed(), "booking created from crm lead");
        Ok(booking)
    }
}
