//! Activation and deactivation of bookings, run as background tasks
//! scheduled by the reconciler.

use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use cabinet_core::{BookingId, LeadId, PipelineId};

use crate::booking::Booking;
use crate::catalog::StatusCatalog;
use crate::change_log::ChangeLogger;
use crate::constants::{BookingStage, BookingSubstage, message_slugs};
use crate::error::{BookingError, BookingResult, RepositoryError};
use crate::history::{ActivatedMessage, DeactivatedMessage, HistoryRecorder};
use crate::patch::{BookingField, BookingPatch};
use crate::ports::{
    CrmClient, CrmLead, DEALED_CODE, LeadUpdate, NewLead, ProjectDirectory, Property,
    PropertyStatus, PropertyStore, ReservationClient,
};
use crate::repository::BookingRepository;
use crate::tasks::{BookingTask, TaskQueue};

/// Payload of an activation task.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivationRequest {
    pub booking_id: BookingId,
    pub amocrm_substage: Option<BookingSubstage>,
    pub property_final_price: Option<Decimal>,
    pub price_with_sale: Option<Decimal>,
}

impl ActivationRequest {
    /// Final price reported by the CRM, zero meaning unset.
    pub fn final_price(&self) -> Option<Decimal> {
        self.property_final_price
            .or(self.price_with_sale)
            .filter(|p| !p.is_zero())
    }
}

/// Pipeline of the lead: the project's pipeline first, then the one the CRM
/// reports for the lead.
pub(crate) async fn lead_pipeline(
    projects: &dyn ProjectDirectory,
    booking: &Booking,
    leads: &[CrmLead],
) -> Option<PipelineId> {
    if let Some(project_id) = booking.project_id {
        match projects.get(project_id).await {
            Ok(Some(project)) if project.amo_pipeline_id.is_some() => {
                return project.amo_pipeline_id;
            }
            Ok(_) => {}
            Err(err) => {
                warn!(booking_id = %booking.id_typed(), error = %err, "project lookup failed")
            }
        }
    }
    leads.iter().find_map(|lead| lead.pipeline_id)
}

async fn load(repo: &dyn BookingRepository, id: BookingId) -> BookingResult<Booking> {
    repo.get(id)
        .await?
        .ok_or_else(|| BookingError::not_found(format!("booking {id}")))
}

fn write_failed(booking_id: BookingId) -> BookingError {
    BookingError::Storage(RepositoryError::backend(format!(
        "write to booking {booking_id} failed"
    )))
}

#[derive(Clone)]
pub struct ActivationService {
    pub repo: Arc<dyn BookingRepository>,
    pub writer: ChangeLogger,
    pub catalog: Arc<StatusCatalog>,
    pub properties: Arc<dyn PropertyStore>,
    pub projects: Arc<dyn ProjectDirectory>,
    pub crm: Arc<dyn CrmClient>,
    pub reservation: Arc<dyn ReservationClient>,
    pub queue: Arc<dyn TaskQueue>,
    pub history: HistoryRecorder,
}

impl ActivationService {
    pub async fn activate(&self, request: ActivationRequest) -> BookingResult<Booking> {
        let booking = load(self.repo.as_ref(), request.booking_id).await?;
        let previous_step = booking.online_purchase_step();

        let patch = BookingPatch::new()
            .set(BookingField::Active(true))
            .set(BookingField::ShouldBeDeactivatedByTimer(true));
        let mut booking = self
            .writer
            .update(&booking, patch)
            .await
            .ok_or_else(|| write_failed(request.booking_id))?;

        let property = match booking.property_id {
            Some(id) => self.properties.get(id).await?,
            None => None,
        };
        if let Some(property) = property {
            self.reserve_property(&booking, &property, request.amocrm_substage)
                .await?;
            if let Some(lead) = booking.amocrm_id {
                match self.book_externally(&booking, &property, lead).await {
                    Ok(updated) => booking = updated,
                    Err(err) => {
                        self.release_property(&booking, &property).await;
                        return Err(err);
                    }
                }
            }
        }

        let final_price = request.final_price();
        if let Some(price) = final_price {
            if let Some(property_id) = booking.property_id {
                if let Err(err) = self.properties.set_final_price(property_id, price).await {
                    warn!(booking_id = %booking.id_typed(), error = %err, "failed to store property final price");
                }
            }
            let patch = BookingPatch::new().set(BookingField::FinalPaymentAmount(Some(price)));
            if let Some(updated) = self.writer.update(&booking, patch).await {
                booking = updated;
            }
        }

        let task = BookingTask::SendSms {
            booking_id: booking.id_typed(),
            sms_slug: message_slugs::BOOKING_NOTIFICATION_SMS.to_string(),
        };
        if let Err(err) = self.queue.enqueue(task).await {
            warn!(booking_id = %booking.id_typed(), error = %err, "failed to schedule booking notification");
        }

        let stage = request
            .amocrm_substage
            .map(BookingSubstage::stage)
            .or(booking.amocrm_stage)
            .unwrap_or(BookingStage::Booking);
        self.history
            .execute(
                &booking,
                previous_step,
                &ActivatedMessage { stage, final_price },
                Vec::new(),
            )
            .await;

        info!(booking_id = %booking.id_typed(), "booking activated");
        Ok(booking)
    }

    async fn reserve_property(
        &self,
        booking: &Booking,
        property: &Property,
        substage: Option<BookingSubstage>,
    ) -> BookingResult<()> {
        let held = booking.profitbase_booked && booking.property_id == Some(property.id);
        if !held && matches!(property.status, PropertyStatus::Sold | PropertyStatus::Booked) {
            warn!(
                booking_id = %booking.id_typed(),
                property_id = %property.id,
                status = ?property.status,
                "property is already taken"
            );
            return Err(BookingError::PropertyMissing);
        }
        let status = if substage.is_some_and(BookingSubstage::is_sold) {
            PropertyStatus::Sold
        } else {
            PropertyStatus::Booked
        };
        self.properties.set_status(property.id, status).await?;
        debug!(booking_id = %booking.id_typed(), property_id = %property.id, status = ?status, "property reserved");
        Ok(())
    }

    /// Puts back the status the property had before `reserve_property`, so a
    /// retried activation finds it free again.
    async fn release_property(&self, booking: &Booking, property: &Property) {
        if let Err(err) = self.properties.set_status(property.id, property.status).await {
            warn!(booking_id = %booking.id_typed(), property_id = %property.id, error = %err, "failed to release property");
        } else {
            debug!(booking_id = %booking.id_typed(), property_id = %property.id, "property reservation rolled back");
        }
    }

    async fn book_externally(
        &self,
        booking: &Booking,
        property: &Property,
        lead: LeadId,
    ) -> BookingResult<Booking> {
        self.book_in_crm(booking, lead).await?;
        self.book_in_reservation(booking, property, lead).await
    }

    /// Moves the lead to the booking status, creating it first when the CRM
    /// does not know it.
    async fn book_in_crm(&self, booking: &Booking, lead: LeadId) -> BookingResult<LeadId> {
        let leads = self.crm.fetch_leads(&[lead]).await?;
        let pipeline = lead_pipeline(self.projects.as_ref(), booking, &leads)
            .await
            .ok_or_else(|| BookingError::not_found(format!("pipeline of lead {lead}")))?;
        let booking_status = self
            .catalog
            .status_id(pipeline, BookingSubstage::Booking.as_str())
            .ok_or(BookingError::WrongPipeline(pipeline.get()))?;

        if leads.iter().any(|l| l.id == lead) {
            let updated = self
                .crm
                .update_lead(LeadUpdate {
                    lead_id: lead,
                    pipeline_id: pipeline,
                    status_id: booking_status,
                })
                .await?;
            return Ok(updated.id);
        }

        let start_status = self
            .catalog
            .status_id(pipeline, BookingSubstage::Start.as_str())
            .ok_or(BookingError::WrongPipeline(pipeline.get()))?;
        let created = self
            .crm
            .create_lead(NewLead {
                pipeline_id: pipeline,
                status_id: start_status,
                user_id: booking.user_id,
                property_id: booking.property_id,
                tags: booking.tags.clone(),
                price: booking.payment_amount,
            })
            .await?;
        self.note(created.id, "lead_created: online booking created").await;

        let updated = self
            .crm
            .update_lead(LeadUpdate {
                lead_id: created.id,
                pipeline_id: pipeline,
                status_id: booking_status,
            })
            .await?;
        self.note(updated.id, "lead_changed: lead moved to booking").await;
        Ok(updated.id)
    }

    async fn book_in_reservation(
        &self,
        booking: &Booking,
        property: &Property,
        deal: LeadId,
    ) -> BookingResult<Booking> {
        let reply = self.reservation.book_property(property.id, deal).await?;
        let booked = reply.success;
        let in_deal = reply.code.as_deref() == Some(DEALED_CODE);
        if !(booked || in_deal) {
            warn!(booking_id = %booking.id_typed(), property_id = %property.id, "reservation system refused the property");
            return Err(BookingError::PropertyUnavailable { booked, in_deal });
        }
        let patch = BookingPatch::new().set(BookingField::ProfitbaseBooked(true));
        Ok(self
            .writer
            .update(booking, patch)
            .await
            .unwrap_or_else(|| booking.clone()))
    }

    async fn note(&self, lead_id: LeadId, text: &str) {
        let task = BookingTask::CreateAmocrmNote {
            lead_id,
            text: text.to_string(),
        };
        if let Err(err) = self.queue.enqueue(task).await {
            warn!(lead_id = %lead_id, error = %err, "failed to schedule crm note");
        }
    }
}

#[derive(Clone)]
pub struct DeactivationService {
    pub repo: Arc<dyn BookingRepository>,
    pub writer: ChangeLogger,
    pub properties: Arc<dyn PropertyStore>,
    pub history: HistoryRecorder,
}

impl DeactivationService {
    /// Deactivates the booking and frees its property. With `stages_valid`
    /// unset the CRM stage is reset to start as well.
    pub async fn deactivate(&self, booking_id: BookingId, stages_valid: bool) -> BookingResult<Booking> {
        let booking = load(self.repo.as_ref(), booking_id).await?;
        let previous_step = booking.online_purchase_step();

        let mut patch = BookingPatch::new().set(BookingField::Active(false));
        if !stages_valid {
            patch.push(BookingField::AmocrmStage(Some(BookingStage::Start)));
            patch.push(BookingField::AmocrmSubstage(Some(BookingSubstage::Start)));
        }
        let booking = self
            .writer
            .update(&booking, patch)
            .await
            .ok_or_else(|| write_failed(booking_id))?;

        if let Some(property_id) = booking.property_id {
            if let Err(err) = self.properties.set_status(property_id, PropertyStatus::Free).await {
                warn!(booking_id = %booking_id, property_id = %property_id, error = %err, "failed to free property");
            }
        }

        self.history
            .execute(
                &booking,
                previous_step,
                &DeactivatedMessage { stages_valid },
                Vec::new(),
            )
            .await;
        info!(booking_id = %booking_id, stages_valid, "booking deactivated");
        Ok(booking)
    }
}
