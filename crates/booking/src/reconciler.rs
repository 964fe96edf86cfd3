//! CRM webhook reconciliation.
//!
//! One reconciler serves the three webhook endpoints. Each call re-derives
//! the booking's desired state from the lead payload, so deliveries may
//! arrive in any order and repeat; the regression guard in the repository
//! keeps progress that a stale payload would otherwise erase.

use core::fmt;
use core::str::FromStr;
use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{Span, debug, error, info, instrument, warn};

use cabinet_core::{BookingId, DomainError, ProjectId, StatusId};

use crate::archive::{WebhookRequest, WebhookRequestStore};
use crate::booking::Booking;
use crate::catalog::{StatusCatalog, SubstageLookup};
use crate::change_log::ChangeLogger;
use crate::constants::{BookingSubstage, message_slugs, stage_is_valid, task_slugs};
use crate::creation::BookingCreationService;
use crate::dispatcher::TaskContext;
use crate::events::{BookingEvent, EventPublisher, RewardCancelComment};
use crate::flags::FeatureFlags;
use crate::history::{HistoryRecorder, StageChangedMessage};
use crate::meeting::{GroupSignal, MeetingWorkflow};
use crate::patch::{BookingField, BookingPatch};
use crate::ports::{
    AgentImporter, AmocrmStatus, ContactImporter, ImportedUser, MeetingImporter, PinningChecker,
    ProjectDirectory, PropertyStore, StatusDirectory, TaskInstanceService,
};
use crate::repository::BookingRepository;
use crate::tasks::{BookingTask, TaskQueue};
use crate::webhook::{WebhookLead, verify_secret};

/// Change-log label of writes made while reconciling.
pub const STATUS_CHANGE_LABEL: &str = "Webhook status change | AMOCRM";
const USE_CASE: &str = "WebhookReconciler";

/// Which webhook endpoint triggered the call.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileMode {
    /// Full status webhook: may create bookings and checks fixation.
    Status,
    /// Status-only webhook.
    StatusOnly,
    /// Lead update webhook.
    Update,
}

impl ReconcileMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            ReconcileMode::Status => "status",
            ReconcileMode::StatusOnly => "status_only",
            ReconcileMode::Update => "update",
        }
    }

    pub const fn may_create_booking(self) -> bool {
        matches!(self, ReconcileMode::Status)
    }

    pub const fn cancels_rewards(self) -> bool {
        matches!(self, ReconcileMode::Status)
    }

    pub const fn checks_fixation(self) -> bool {
        matches!(self, ReconcileMode::Status)
    }

    pub const fn writes_status(self) -> bool {
        matches!(self, ReconcileMode::Status | ReconcileMode::StatusOnly)
    }

    pub const fn imports_agent(self) -> bool {
        matches!(self, ReconcileMode::Update)
    }

    /// The meeting workflow runs even when the substage did not move.
    pub const fn always_runs_meeting_workflow(self) -> bool {
        matches!(self, ReconcileMode::Update)
    }
}

impl fmt::Display for ReconcileMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReconcileMode {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "status" => Ok(Self::Status),
            "status_only" => Ok(Self::StatusOnly),
            "update" => Ok(Self::Update),
            other => Err(DomainError::validation(format!("unknown webhook mode: {other}"))),
        }
    }
}

/// How a webhook call ended. The transport answers success regardless.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Rejected,
    NoCustomFields,
    BookingMissing,
    Failed,
    PipelineGated { booking_id: BookingId },
    Reconciled { booking_id: BookingId },
}

/// Collaborators of the reconciler.
#[derive(Clone)]
pub struct ReconcilerDeps {
    pub repo: Arc<dyn BookingRepository>,
    pub queue: Arc<dyn TaskQueue>,
    pub catalog: Arc<StatusCatalog>,
    pub flags: FeatureFlags,
    pub archive: Arc<dyn WebhookRequestStore>,
    pub contacts: Arc<dyn ContactImporter>,
    pub agents: Arc<dyn AgentImporter>,
    pub meeting_import: Arc<dyn MeetingImporter>,
    pub pinning: Arc<dyn PinningChecker>,
    pub statuses: Arc<dyn StatusDirectory>,
    pub projects: Arc<dyn ProjectDirectory>,
    pub properties: Arc<dyn PropertyStore>,
    pub task_instances: Arc<dyn TaskInstanceService>,
    pub publisher: Arc<dyn EventPublisher>,
    pub history: HistoryRecorder,
    pub creation: BookingCreationService,
    pub meetings: MeetingWorkflow,
}

pub struct WebhookReconciler {
    secret: String,
    deps: ReconcilerDeps,
    writer: ChangeLogger,
}

fn parse_decimal(value: Option<&str>) -> Option<Decimal> {
    let digits: String = value?.split_whitespace().collect();
    digits.replace(',', ".").parse::<Decimal>().ok()
}

fn non_zero(value: Option<Decimal>) -> Option<Decimal> {
    value.filter(|v| !v.is_zero())
}

impl WebhookReconciler {
    pub fn new(secret: impl Into<String>, deps: ReconcilerDeps) -> Self {
        let writer = ChangeLogger::new(
            deps.repo.clone(),
            deps.queue.clone(),
            STATUS_CHANGE_LABEL,
            USE_CASE,
        );
        Self {
            secret: secret.into(),
            deps,
            writer,
        }
    }

    pub fn catalog(&self) -> &StatusCatalog {
        &self.deps.catalog
    }

    #[instrument(
        skip(self, secret, payload),
        fields(mode = %mode, lead_id = tracing::field::Empty)
    )]
    pub async fn handle(&self, mode: ReconcileMode, secret: &str, payload: &[u8]) -> ReconcileOutcome {
        if let Err(err) = self
            .deps
            .archive
            .append(WebhookRequest::new(mode.as_str(), payload))
            .await
        {
            warn!(error = %err, "failed to archive webhook body");
        }

        if !verify_secret(secret, &self.secret) {
            error!("webhook secret mismatch");
            return ReconcileOutcome::Rejected;
        }

        let lead = WebhookLead::parse(payload);
        if let Some(lead_id) = lead.lead_id {
            Span::current().record("lead_id", lead_id.get());
        }

        let user = self.import_contact(&lead).await;
        if mode.imports_agent() && self.deps.flags.import_agent_webhook {
            if let Err(err) = self.deps.agents.import_agent(&lead).await {
                warn!(error = %err, "agent import failed");
            }
        }
        let context = self.import_meeting(&lead, user.as_ref()).await;

        if lead.custom_fields.is_empty() {
            error!(payload_len = payload.len(), "webhook carries no custom fields");
            return ReconcileOutcome::NoCustomFields;
        }

        let outcome = self.reconcile(mode, &lead, user, context).await;
        debug!(outcome = ?outcome, "webhook handled");
        outcome
    }

    async fn reconcile(
        &self,
        mode: ReconcileMode,
        lead: &WebhookLead,
        user: Option<ImportedUser>,
        context: Option<TaskContext>,
    ) -> ReconcileOutcome {
        let Some(lead_id) = lead.lead_id else {
            warn!("webhook without lead id");
            return ReconcileOutcome::BookingMissing;
        };
        let webhook_status = self.lookup_status(lead.new_status_id).await;

        let existing = match self.deps.repo.find_by_amocrm_id(lead_id).await {
            Ok(found) => found,
            Err(err) => {
                error!(error = %err, "booking lookup failed");
                return ReconcileOutcome::Failed;
            }
        };
        if mode.cancels_rewards() {
            if let Some(booking) = &existing {
                self.check_reward_cancel(booking).await;
            }
        }

        let booking = match (existing, user) {
            (Some(booking), Some(user)) => {
                let patch = BookingPatch::new().set(BookingField::UserId(Some(user.id)));
                match self.deps.repo.update(&booking, patch).await {
                    Ok(updated) => updated,
                    Err(err) => {
                        warn!(error = %err, "failed to attach user");
                        booking
                    }
                }
            }
            (Some(booking), None) => booking,
            (None, user) => match self.create_booking(mode, lead, user).await {
                Some(booking) => booking,
                None => {
                    warn!("no booking for lead");
                    return ReconcileOutcome::BookingMissing;
                }
            },
        };
        let loaded = booking.clone();
        let booking_id = booking.id_typed();
        let (substage, stage_valid) = match self.deps.catalog.lookup_substage(lead.new_status_id) {
            SubstageLookup::Mapped(substage) => (Some(substage), stage_is_valid(Some(substage))),
            SubstageLookup::Unmapped(name) => {
                debug!(status = name, "status has no booking substage, keeping the stored one");
                (loaded.amocrm_substage, true)
            }
            SubstageLookup::Unknown => (None, false),
        };

        if mode.checks_fixation() {
            self.check_fixation(&booking, webhook_status.as_ref()).await;
        }
        let booking = if mode.writes_status() {
            self.write_status(mode, booking, webhook_status.as_ref()).await
        } else {
            booking
        };
        let booking = self.project_custom_fields(booking, lead).await;

        if self.deps.flags.check_pinning_webhook {
            self.check_pinning(&loaded, lead, substage).await;
        }

        if !self.deps.catalog.is_sales_pipeline(lead.pipeline_id) {
            if booking.active {
                info!(pipeline_id = ?lead.pipeline_id, "pipeline is not a sales pipeline, deactivating");
                self.enqueue(BookingTask::DeactivateBooking {
                    booking_id,
                    stages_valid: true,
                })
                .await;
            } else {
                debug!(pipeline_id = ?lead.pipeline_id, "pipeline is not a sales pipeline");
            }
            return ReconcileOutcome::PipelineGated { booking_id };
        }

        let booking = self
            .price_workflow(booking, lead, substage, stage_valid)
            .await;

        if mode.always_runs_meeting_workflow() || booking.amocrm_substage != substage {
            self.meeting_workflow(booking, lead, substage, webhook_status.as_ref(), context)
                .await;
        } else {
            self.deps
                .meetings
                .dispatcher
                .dispatch(&booking, None, context.as_ref())
                .await;
        }

        info!(booking_id = %booking_id, substage = ?substage, "webhook reconciled");
        ReconcileOutcome::Reconciled { booking_id }
    }

    async fn import_contact(&self, lead: &WebhookLead) -> Option<ImportedUser> {
        match self.deps.contacts.import_contact(lead).await {
            Ok(user) => user,
            Err(err) => {
                warn!(error = %err, "contact import failed");
                None
            }
        }
    }

    async fn import_meeting(
        &self,
        lead: &WebhookLead,
        user: Option<&ImportedUser>,
    ) -> Option<TaskContext> {
        match self.deps.meeting_import.import_meeting(lead, user).await {
            Ok(context) => context,
            Err(err) => {
                warn!(error = %err, "meeting import failed");
                None
            }
        }
    }

    async fn lookup_status(&self, status: Option<StatusId>) -> Option<AmocrmStatus> {
        let status = status?;
        match self.deps.statuses.status(status).await {
            Ok(found) => found,
            Err(err) => {
                warn!(status_id = %status, error = %err, "status lookup failed");
                None
            }
        }
    }

    async fn create_booking(
        &self,
        mode: ReconcileMode,
        lead: &WebhookLead,
        user: Option<ImportedUser>,
    ) -> Option<Booking> {
        let fields = self.deps.catalog.fields();
        if !mode.may_create_booking()
            || !self.deps.flags.update_contact_webhook
            || lead.field(fields.booking_expires).is_none()
        {
            return None;
        }
        let pipeline = lead.pipeline_id?;
        let fragment = &self.deps.catalog.groups().booking_fragment;
        let status = match self.deps.statuses.find_in_group(pipeline, fragment).await {
            Ok(Some(status)) => status,
            Ok(None) => {
                debug!(pipeline_id = %pipeline, "pipeline has no booking group status");
                return None;
            }
            Err(err) => {
                warn!(pipeline_id = %pipeline, error = %err, "booking group lookup failed");
                return None;
            }
        };
        match self
            .deps
            .creation
            .create(lead, &status, user.map(|u| u.id))
            .await
        {
            Ok(booking) => Some(booking),
            Err(err) => {
                error!(error = %err, reason = err.reason(), "booking creation failed");
                None
            }
        }
    }

    async fn check_reward_cancel(&self, booking: &Booking) {
        if booking.loyalty_discount.is_none() || booking.loyalty_discount_name.is_none() {
            return;
        }
        let Some(group) = self
            .lookup_status(booking.amocrm_status_id)
            .await
            .and_then(|s| s.group_name)
        else {
            return;
        };
        let groups = self.deps.catalog.groups();
        let comment = if group == groups.start || group == groups.make_decision {
            RewardCancelComment::Unbooked
        } else if group == groups.unrealized {
            RewardCancelComment::Canceled
        } else {
            return;
        };
        info!(booking_id = %booking.id_typed(), comment = ?comment, "cancelling loyalty reward");
        self.deps.publisher.publish(BookingEvent::LoyaltyRewardCancelled {
            booking_id: booking.id_typed(),
            comment,
            occurred_at: chrono::Utc::now(),
        });
    }

    async fn check_fixation(&self, booking: &Booking, status: Option<&AmocrmStatus>) {
        let Some(group) = status.and_then(|s| s.group_name.as_deref()) else {
            return;
        };
        if self.deps.catalog.may_follow_fixation(group) {
            return;
        }
        warn!(booking_id = %booking.id_typed(), group, "status group may not follow a fixation");
        if let Err(err) = self
            .deps
            .task_instances
            .update_status(booking.id_typed(), task_slugs::DEAL_ALREADY_BOOKED)
            .await
        {
            warn!(booking_id = %booking.id_typed(), error = %err, "failed to flag already booked deal");
        }
    }

    async fn write_status(
        &self,
        mode: ReconcileMode,
        booking: Booking,
        status: Option<&AmocrmStatus>,
    ) -> Booking {
        let Some(status) = status else {
            return booking;
        };
        let catalog = &self.deps.catalog;
        let skip = match mode {
            ReconcileMode::StatusOnly => catalog.is_status_only_skip(status.id),
            _ => {
                booking.is_agent_assigned()
                    && (catalog.is_agent_assigned_skip(status.id)
                        || (catalog.is_assign_agent_status(status.id)
                            && !booking
                                .amocrm_status_id
                                .is_some_and(|s| catalog.is_start_status(s))))
            }
        };
        if skip {
            debug!(booking_id = %booking.id_typed(), status_id = %status.id, "status write skipped");
            return booking;
        }
        let patch = BookingPatch::new().set(BookingField::AmocrmStatusId(Some(status.id)));
        match self.writer.update(&booking, patch).await {
            Some(updated) => updated,
            None => booking,
        }
    }

    async fn project_custom_fields(&self, booking: Booking, lead: &WebhookLead) -> Booking {
        let fields = self.deps.catalog.fields();
        let project = match lead.field_enum(fields.project) {
            Some(enum_id) => self.current_project(enum_id).await,
            None => None,
        };
        let patch = BookingPatch::new()
            .set(BookingField::Commission(parse_decimal(lead.field_value(fields.commission))))
            .set(BookingField::CommissionValue(parse_decimal(
                lead.field_value(fields.commission_value),
            )))
            .set(BookingField::FinalDiscount(
                lead.field_value(fields.final_discount).map(str::to_string),
            ))
            .set(BookingField::FinalAdditionalOptions(
                lead.field_value(fields.final_additional_options)
                    .map(str::to_string),
            ))
            .set(BookingField::Tags(lead.tag_names()))
            .set(BookingField::ProjectId(project));
        match self.deps.repo.update(&booking, patch).await {
            Ok(updated) => updated,
            Err(err) => {
                warn!(booking_id = %booking.id_typed(), error = %err, "failed to store custom fields");
                booking
            }
        }
    }

    async fn current_project(&self, enum_id: i64) -> Option<ProjectId> {
        match self.deps.projects.current_by_amocrm_enum(enum_id).await {
            Ok(project) => project.map(|p| p.id),
            Err(err) => {
                warn!(project_enum = enum_id, error = %err, "project lookup failed");
                None
            }
        }
    }

    async fn check_pinning(
        &self,
        booking: &Booking,
        lead: &WebhookLead,
        substage: Option<BookingSubstage>,
    ) {
        let Some(user) = booking.user_id else {
            return;
        };
        let moved = if substage != booking.amocrm_substage {
            true
        } else {
            self.lookup_status(booking.amocrm_status_id)
                .await
                .is_some_and(|s| Some(s.pipeline_id) != lead.pipeline_id)
        };
        if !moved {
            return;
        }
        if let Err(err) = self.deps.pinning.check_pinning(user).await {
            warn!(user_id = %user, error = %err, "pinning check failed");
        }
    }

    async fn price_workflow(
        &self,
        booking: Booking,
        lead: &WebhookLead,
        substage: Option<BookingSubstage>,
        valid: bool,
    ) -> Booking {
        let fields = self.deps.catalog.fields();
        let booking_id = booking.id_typed();
        let final_price = parse_decimal(lead.field_value(fields.property_final_price));
        let price_with_sale = parse_decimal(lead.field_value(fields.property_price_with_sale));

        let has_property = lead.field_value(fields.property).is_some();
        let safe = booking.amocrm_substage == Some(BookingSubstage::AssignAgent);

        if ((!has_property && !safe) || !valid) && booking.active {
            self.enqueue(BookingTask::DeactivateBooking {
                booking_id,
                stages_valid: valid,
            })
            .await;
        } else if has_property && valid && !booking.active {
            self.enqueue(BookingTask::ActivateBooking {
                booking_id,
                amocrm_substage: substage,
                property_final_price: final_price,
                price_with_sale,
            })
            .await;
        }

        let Some(amount) = non_zero(final_price).or(non_zero(price_with_sale)) else {
            return booking;
        };
        let patch = BookingPatch::new().set(BookingField::FinalPaymentAmount(Some(amount)));
        let booking = self.writer.update(&booking, patch).await.unwrap_or(booking);
        if let Some(property_id) = booking.property_id {
            let price = non_zero(price_with_sale).unwrap_or(amount);
            if let Err(err) = self.deps.properties.set_final_price(property_id, price).await {
                warn!(booking_id = %booking_id, property_id = %property_id, error = %err, "failed to store property final price");
            }
        }
        booking
    }

    async fn meeting_workflow(
        &self,
        booking: Booking,
        lead: &WebhookLead,
        substage: Option<BookingSubstage>,
        status: Option<&AmocrmStatus>,
        context: Option<TaskContext>,
    ) {
        let catalog = &self.deps.catalog;
        let previous = booking.amocrm_substage;
        let previous_step = booking.online_purchase_step();

        let mut patch = BookingPatch::new()
            .set(BookingField::AmocrmSubstage(substage))
            .set(BookingField::AmocrmStage(substage.map(BookingSubstage::stage)))
            .set(BookingField::ShouldBeDeactivatedByTimer(false));
        if let Some(payed) = lead
            .field_enum(catalog.fields().booking_payment)
            .and_then(|e| catalog.price_payed_for(e))
        {
            patch.push(BookingField::PricePayed(payed));
        }
        let booking = self.writer.update(&booking, patch).await.unwrap_or(booking);

        if let Some(to) = substage.filter(|s| Some(*s) != previous) {
            let from = previous.map(|p| p.as_str()).unwrap_or("none").to_string();
            self.deps
                .history
                .execute(&booking, previous_step, &StageChangedMessage { from, to }, Vec::new())
                .await;
        }

        if booking.amocrm_substage == Some(BookingSubstage::Booking) && booking.user_id.is_some() {
            self.enqueue(BookingTask::SendSms {
                booking_id: booking.id_typed(),
                sms_slug: message_slugs::ASSIGN_CLIENT_SMS.to_string(),
            })
            .await;
        }

        let group = match status.and_then(|s| s.group_name.as_deref()) {
            Some(name) if !name.is_empty() => GroupSignal::Group(catalog.meeting_group(name)),
            _ => GroupSignal::Absent,
        };
        self.deps
            .meetings
            .run(&booking, group, substage, context)
            .await;
    }

    async fn enqueue(&self, task: BookingTask) {
        let kind = task.kind();
        if let Err(err) = self.deps.queue.enqueue(task).await {
            warn!(task = kind, error = %err, "failed to schedule booking task");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modes_parse_and_expose_capabilities() {
        assert_eq!("status_only".parse::<ReconcileMode>().unwrap(), ReconcileMode::StatusOnly);
        assert!("other".parse::<ReconcileMode>().is_err());
        assert!(ReconcileMode::Status.may_create_booking());
        assert!(!ReconcileMode::Update.writes_status());
        assert!(ReconcileMode::Update.always_runs_meeting_workflow());
        assert_eq!(ReconcileMode::StatusOnly.to_string(), "status_only");
    }

    #[test]
    fn decimals_tolerate_grouping_and_commas() {
        assert_eq!(parse_decimal(Some("1 250 000")), Some(Decimal::new(1_250_000, 0)));
        assert_eq!(parse_decimal(Some("2,5")), Some(Decimal::new(25, 1)));
        assert_eq!(parse_decimal(Some("n/a")), None);
        assert_eq!(non_zero(Some(Decimal::ZERO)), None);
    }
}
