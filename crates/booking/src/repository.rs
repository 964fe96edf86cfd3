//! Booking persistence port.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::warn;

use cabinet_core::{BookingId, LeadId, PropertyId, UserId};

use crate::booking::Booking;
use crate::error::RepositoryError;
use crate::patch::{BookingField, BookingPatch, GuardOutcome, regression_alerts};
use crate::tasks::{BookingTask, RegressionReport, TaskQueue};

/// Conjunctive row filter; unset criteria match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BookingFilter {
    pub ids: Option<Vec<BookingId>>,
    pub amocrm_id: Option<LeadId>,
    pub user_id: Option<UserId>,
    pub property_id: Option<PropertyId>,
    pub active: Option<bool>,
    pub price_payed: Option<bool>,
    pub should_be_deactivated_by_timer: Option<bool>,
    pub expires_before: Option<DateTime<Utc>>,
}

impl BookingFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(mut self, id: BookingId) -> Self {
        self.ids = Some(vec![id]);
        self
    }

    pub fn ids(mut self, ids: Vec<BookingId>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn amocrm_id(mut self, lead: LeadId) -> Self {
        self.amocrm_id = Some(lead);
        self
    }

    pub fn user_id(mut self, user: UserId) -> Self {
        self.user_id = Some(user);
        self
    }

    pub fn property_id(mut self, property: PropertyId) -> Self {
        self.property_id = Some(property);
        self
    }

    pub fn active(mut self, active: bool) -> Self {
        self.active = Some(active);
        self
    }

    pub fn price_payed(mut self, payed: bool) -> Self {
        self.price_payed = Some(payed);
        self
    }

    pub fn should_be_deactivated_by_timer(mut self, value: bool) -> Self {
        self.should_be_deactivated_by_timer = Some(value);
        self
    }

    /// Matches bookings whose `expires` is at or before `at`.
    pub fn expires_before(mut self, at: DateTime<Utc>) -> Self {
        self.expires_before = Some(at);
        self
    }

    pub fn matches(&self, booking: &Booking) -> bool {
        self.ids
            .as_ref()
            .is_none_or(|ids| ids.contains(&booking.id_typed()))
            && self.amocrm_id.is_none_or(|v| booking.amocrm_id == Some(v))
            && self.user_id.is_none_or(|v| booking.user_id == Some(v))
            && self.property_id.is_none_or(|v| booking.property_id == Some(v))
            && self.active.is_none_or(|v| booking.active == v)
            && self.price_payed.is_none_or(|v| booking.price_payed == v)
            && self
                .should_be_deactivated_by_timer
                .is_none_or(|v| booking.should_be_deactivated_by_timer == v)
            && self
                .expires_before
                .is_none_or(|at| booking.expires.is_some_and(|e| e <= at))
    }

    /// Equality criteria as assignments, used to seed a row created by
    /// `update_or_create`.
    pub fn seed(&self) -> BookingPatch {
        let mut patch = BookingPatch::new();
        if let Some(v) = self.amocrm_id {
            patch.push(BookingField::AmocrmId(Some(v)));
        }
        if let Some(v) = self.user_id {
            patch.push(BookingField::UserId(Some(v)));
        }
        if let Some(v) = self.property_id {
            patch.push(BookingField::PropertyId(Some(v)));
        }
        if let Some(v) = self.active {
            patch.push(BookingField::Active(v));
        }
        if let Some(v) = self.price_payed {
            patch.push(BookingField::PricePayed(v));
        }
        if let Some(v) = self.should_be_deactivated_by_timer {
            patch.push(BookingField::ShouldBeDeactivatedByTimer(v));
        }
        patch
    }
}

/// Booking persistence.
///
/// Every mutating call runs its patch through [`crate::patch::guard`]
/// before writing; dropped regressions are reported to the optional
/// [`RegressionMonitor`] and never fail the call.
#[async_trait]
pub trait BookingRepository: Send + Sync {
    async fn get(&self, id: BookingId) -> Result<Option<Booking>, RepositoryError>;

    async fn find_by_amocrm_id(&self, lead: LeadId) -> Result<Option<Booking>, RepositoryError>;

    async fn list(&self, filter: &BookingFilter) -> Result<Vec<Booking>, RepositoryError>;

    /// Inserts a new booking built from `patch` on top of the defaults.
    async fn create(&self, patch: BookingPatch) -> Result<Booking, RepositoryError>;

    /// Applies `patch` to the stored row of `booking` and returns the
    /// refreshed model.
    async fn update(&self, booking: &Booking, patch: BookingPatch)
    -> Result<Booking, RepositoryError>;

    /// Row-locking update of every booking matching `filter` and not matching
    /// `exclude`. Returns the number of rows written.
    async fn bulk_update(
        &self,
        patch: BookingPatch,
        filter: &BookingFilter,
        exclude: Option<&BookingFilter>,
    ) -> Result<u64, RepositoryError>;

    /// Updates the single booking matching `filter`, or creates one seeded
    /// from the filter. The flag is `true` when a row was created.
    async fn update_or_create(
        &self,
        filter: &BookingFilter,
        patch: BookingPatch,
    ) -> Result<(Booking, bool), RepositoryError>;
}

#[async_trait]
impl<T> BookingRepository for Arc<T>
where
    T: BookingRepository + ?Sized,
{
    async fn get(&self, id: BookingId) -> Result<Option<Booking>, RepositoryError> {
        (**self).get(id).await
    }

    async fn find_by_amocrm_id(&self, lead: LeadId) -> Result<Option<Booking>, RepositoryError> {
        (**self).find_by_amocrm_id(lead).await
    }

    async fn list(&self, filter: &BookingFilter) -> Result<Vec<Booking>, RepositoryError> {
        (**self).list(filter).await
    }

    async fn create(&self, patch: BookingPatch) -> Result<Booking, RepositoryError> {
        (**self).create(patch).await
    }

    async fn update(
        &self,
        booking: &Booking,
        patch: BookingPatch,
    ) -> Result<Booking, RepositoryError> {
        (**self).update(booking, patch).await
    }

    async fn bulk_update(
        &self,
        patch: BookingPatch,
        filter: &BookingFilter,
        exclude: Option<&BookingFilter>,
    ) -> Result<u64, RepositoryError> {
        (**self).bulk_update(patch, filter, exclude).await
    }

    async fn update_or_create(
        &self,
        filter: &BookingFilter,
        patch: BookingPatch,
    ) -> Result<(Booking, bool), RepositoryError> {
        (**self).update_or_create(filter, patch).await
    }
}

/// Receives regression alerts raised while guarding a write.
#[async_trait]
pub trait RegressionMonitor: Send + Sync {
    async fn report(&self, report: RegressionReport);
}

/// Schedules a `RegressionAlert` task per report.
pub struct QueueRegressionMonitor {
    queue: Arc<dyn TaskQueue>,
}

impl QueueRegressionMonitor {
    pub fn new(queue: Arc<dyn TaskQueue>) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl RegressionMonitor for QueueRegressionMonitor {
    async fn report(&self, report: RegressionReport) {
        let booking_id = report.booking_id;
        if let Err(err) = self.queue.enqueue(BookingTask::RegressionAlert(report)).await {
            warn!(booking_id = %booking_id, error = %err, "failed to schedule regression alert");
        }
    }
}

/// Runs the monitor for the dropped half of a guard outcome, if any field
/// previously held a value.
pub async fn report_regressions(
    monitor: Option<&Arc<dyn RegressionMonitor>>,
    stored: &Booking,
    outcome: &GuardOutcome,
) {
    let Some(monitor) = monitor else {
        return;
    };
    let alerts = regression_alerts(stored, &outcome.dropped);
    if alerts.is_empty() {
        return;
    }
    warn!(
        booking_id = %stored.id_typed(),
        fields = ?alerts.iter().map(|a| a.field.as_str()).collect::<Vec<_>>(),
        "dropped update that would clear populated booking fields"
    );
    monitor
        .report(RegressionReport {
            booking_id: stored.id_typed(),
            alerts,
            backtrace: std::backtrace::Backtrace::force_capture().to_string(),
        })
        .await;
}
