//! Periodic release of expired, unpaid bookings.
//!
//! One sweep runs at a time across all instances: the sweep takes a
//! [`DistributedLock`] lease and skips the round when another holder has it.
//! The lease is renewed before every booking it touches, and the round stops
//! early once the lease is lost.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::activation::lead_pipeline;
use crate::booking::Booking;
use crate::catalog::StatusCatalog;
use crate::change_log::ChangeLogger;
use crate::constants::{BookingStage, BookingSubstage};
use crate::error::RepositoryError;
use crate::history::{ExpiredMessage, HistoryRecorder};
use crate::patch::{BookingField, BookingPatch};
use crate::ports::{
    CrmClient, LeadUpdate, ProjectDirectory, PropertyStatus, PropertyStore, ReservationClient,
};
use crate::repository::{BookingFilter, BookingRepository};

pub const SWEEP_LOCK_KEY: &str = "cabinet:booking:expired-sweep";
pub const SWEEP_LOCK_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LockError {
    #[error("lock backend error: {0}")]
    Backend(String),
}

impl LockError {
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }
}

/// Lease held on a lock key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockLease {
    pub key: String,
    pub token: String,
}

/// Cross-instance mutual exclusion with expiring leases.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Takes the lock, or returns `None` when someone else holds it.
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockLease>, LockError>;

    /// Extends a held lease to `ttl` from now. `false` when the lease expired
    /// or passed to another holder.
    async fn renew(&self, lease: &LockLease, ttl: Duration) -> Result<bool, LockError>;

    /// Releases the lease if it is still the current holder.
    async fn release(&self, lease: &LockLease) -> Result<(), LockError>;
}

#[derive(Debug, Error)]
pub enum SweepError {
    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Storage(#[from] RepositoryError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// The lock was held elsewhere and nothing ran.
    pub skipped: bool,
    /// The lease was lost mid-round and the remaining bookings were left.
    pub interrupted: bool,
    /// Paid bookings whose timer flag was cleared.
    pub timers_cleared: usize,
    pub deactivated: usize,
}

#[derive(Clone)]
pub struct ExpiredBookingSweep {
    pub repo: Arc<dyn BookingRepository>,
    pub writer: ChangeLogger,
    pub catalog: Arc<StatusCatalog>,
    pub properties: Arc<dyn PropertyStore>,
    pub projects: Arc<dyn ProjectDirectory>,
    pub crm: Arc<dyn CrmClient>,
    pub reservation: Arc<dyn ReservationClient>,
    pub history: HistoryRecorder,
    pub lock: Arc<dyn DistributedLock>,
}

impl ExpiredBookingSweep {
    pub async fn run(&self, now: DateTime<Utc>) -> Result<SweepReport, SweepError> {
        let Some(lease) = self.lock.try_acquire(SWEEP_LOCK_KEY, SWEEP_LOCK_TTL).await? else {
            debug!("expired sweep already running elsewhere");
            return Ok(SweepReport {
                skipped: true,
                ..SweepReport::default()
            });
        };

        let result = self.sweep(&lease, now).await;
        if let Err(err) = self.lock.release(&lease).await {
            warn!(error = %err, "failed to release sweep lock");
        }
        let report = result?;
        info!(
            timers_cleared = report.timers_cleared,
            deactivated = report.deactivated,
            interrupted = report.interrupted,
            "expired booking sweep finished"
        );
        Ok(report)
    }

    async fn still_held(&self, lease: &LockLease) -> Result<bool, SweepError> {
        let held = self.lock.renew(lease, SWEEP_LOCK_TTL).await?;
        if !held {
            warn!(key = %lease.key, "sweep lock lease lost, stopping the round");
        }
        Ok(held)
    }

    async fn sweep(&self, lease: &LockLease, now: DateTime<Utc>) -> Result<SweepReport, SweepError> {
        let mut report = SweepReport::default();

        let paid = BookingFilter::new()
            .active(true)
            .price_payed(true)
            .should_be_deactivated_by_timer(true);
        for booking in self.repo.list(&paid).await? {
            if !self.still_held(lease).await? {
                report.interrupted = true;
                return Ok(report);
            }
            let patch = BookingPatch::new().set(BookingField::ShouldBeDeactivatedByTimer(false));
            if self.writer.update(&booking, patch).await.is_some() {
                report.timers_cleared += 1;
            }
        }

        let expired = BookingFilter::new()
            .active(true)
            .price_payed(false)
            .should_be_deactivated_by_timer(true)
            .expires_before(now);
        for booking in self.repo.list(&expired).await? {
            if !self.still_held(lease).await? {
                report.interrupted = true;
                return Ok(report);
            }
            if self.release(&booking).await {
                report.deactivated += 1;
            }
        }
        Ok(report)
    }

    async fn release(&self, booking: &Booking) -> bool {
        let booking_id = booking.id_typed();
        let previous_step = booking.online_purchase_step();

        if let Some(property_id) = booking.property_id {
            if let Err(err) = self.properties.set_status(property_id, PropertyStatus::Free).await {
                warn!(booking_id = %booking_id, property_id = %property_id, error = %err, "failed to free property");
            }
        }

        if booking.step_one() && !booking.step_two() && booking.amocrm_id.is_some() {
            self.move_lead_to_start(booking).await;
        } else if booking.step_two() {
            if let Some(lead) = booking.amocrm_id {
                match self.reservation.unbook_property(lead).await {
                    Ok(true) => {}
                    Ok(false) => warn!(booking_id = %booking_id, "reservation system kept the property"),
                    Err(err) => warn!(booking_id = %booking_id, error = %err, "unbooking failed"),
                }
            }
            self.move_lead_to_start(booking).await;
        }

        let patch = BookingPatch::new()
            .set(BookingField::Active(false))
            .set(BookingField::ProfitbaseBooked(false))
            .set(BookingField::AmocrmStage(Some(BookingStage::Start)))
            .set(BookingField::AmocrmSubstage(Some(BookingSubstage::Start)))
            .set(BookingField::ShouldBeDeactivatedByTimer(false));
        let Some(updated) = self.writer.update(booking, patch).await else {
            return false;
        };

        let expires = booking
            .expires
            .map(|e| e.to_rfc3339())
            .unwrap_or_default();
        self.history
            .execute(&updated, previous_step, &ExpiredMessage { expires }, Vec::new())
            .await;
        info!(booking_id = %booking_id, "expired booking released");
        true
    }

    async fn move_lead_to_start(&self, booking: &Booking) {
        let Some(lead) = booking.amocrm_id else {
            return;
        };
        let leads = match self.crm.fetch_leads(&[lead]).await {
            Ok(leads) => leads,
            Err(err) => {
                warn!(lead_id = %lead, error = %err, "failed to fetch lead");
                Vec::new()
            }
        };
        let Some(pipeline) = lead_pipeline(self.projects.as_ref(), booking, &leads).await else {
            warn!(lead_id = %lead, "lead pipeline unknown, crm left as is");
            return;
        };
        let Some(status_id) = self
            .catalog
            .status_id(pipeline, BookingSubstage::Start.as_str())
        else {
            warn!(lead_id = %lead, pipeline_id = %pipeline, "pipeline has no start status");
            return;
        };
        let update = LeadUpdate {
            lead_id: lead,
            pipeline_id: pipeline,
            status_id,
        };
        if let Err(err) = self.crm.update_lead(update).await {
            warn!(lead_id = %lead, error = %err, "failed to move lead back to start");
        }
    }
}
