//! The booking aggregate.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use cabinet_core::{
    AgencyId, AgentId, AggregateRoot, BookingId, BuildingId, FloorId, LeadId, ProjectId,
    PropertyId, StatusId, UserId,
};

use crate::constants::{
    BookingCreatedSource, BookingStage, BookingSubstage, OnlinePurchaseStep, PaymentMethod,
};
use crate::error::{BookingError, BookingResult};

/// Highest step `current_step` reports.
pub const MAX_STEP: u8 = 3;

/// Aggregate root: Booking.
///
/// Fields are public for reading and for storage adapters. Every persisted
/// change goes through [`crate::BookingRepository`], which enforces the
/// regression guard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Booking {
    id: BookingId,
    version: u64,

    pub amocrm_id: Option<LeadId>,
    pub online_purchase_id: Option<String>,
    pub amocrm_stage: Option<BookingStage>,
    pub amocrm_substage: Option<BookingSubstage>,
    pub amocrm_status_id: Option<StatusId>,

    pub active: bool,
    pub should_be_deactivated_by_timer: bool,
    pub profitbase_booked: bool,
    pub until: Option<DateTime<Utc>>,
    pub expires: Option<DateTime<Utc>>,
    pub fixation_expires: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,

    pub contract_accepted: bool,
    pub personal_filled: bool,
    pub params_checked: bool,
    pub price_payed: bool,

    pub online_purchase_started: bool,
    pub payment_method_selected: bool,
    pub amocrm_agent_data_validated: bool,
    pub ddu_created: bool,
    pub amocrm_ddu_uploaded_by_lawyer: bool,
    pub ddu_accepted: bool,
    pub escrow_uploaded: bool,
    pub amocrm_signing_date_set: bool,
    pub amocrm_signed: bool,

    pub payment_id: Option<String>,
    pub payment_amount: Option<Decimal>,
    pub payment_url: Option<String>,
    pub payment_order_number: Option<String>,
    pub final_payment_amount: Option<Decimal>,
    pub amo_payment_method: Option<PaymentMethod>,
    pub mortgage_type: Option<String>,

    pub extension_number: Option<i32>,
    pub loyalty_point_amount: Option<i32>,
    pub loyalty_discount: Option<Decimal>,
    pub loyalty_discount_name: Option<String>,

    pub commission: Option<Decimal>,
    pub commission_value: Option<Decimal>,
    pub final_discount: Option<String>,
    pub final_additional_options: Option<String>,
    pub tags: Vec<String>,

    pub created_source: Option<BookingCreatedSource>,
    pub origin: Option<String>,

    pub user_id: Option<UserId>,
    pub agent_id: Option<AgentId>,
    pub agency_id: Option<AgencyId>,
    pub project_id: Option<ProjectId>,
    pub building_id: Option<BuildingId>,
    pub floor_id: Option<FloorId>,
    pub property_id: Option<PropertyId>,
    pub ddu_id: Option<i64>,
    pub bank_contact_info_id: Option<i64>,
}

impl Booking {
    /// A fresh, active booking with every flag cleared.
    pub fn new(id: BookingId, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            version: 0,
            amocrm_id: None,
            online_purchase_id: None,
            amocrm_stage: None,
            amocrm_substage: None,
            amocrm_status_id: None,
            active: true,
            should_be_deactivated_by_timer: false,
            profitbase_booked: false,
            until: None,
            expires: None,
            fixation_expires: None,
            created_at,
            contract_accepted: false,
            personal_filled: false,
            params_checked: false,
            price_payed: false,
            online_purchase_started: false,
            payment_method_selected: false,
            amocrm_agent_data_validated: false,
            ddu_created: false,
            amocrm_ddu_uploaded_by_lawyer: false,
            ddu_accepted: false,
            escrow_uploaded: false,
            amocrm_signing_date_set: false,
            amocrm_signed: false,
            payment_id: None,
            payment_amount: None,
            payment_url: None,
            payment_order_number: None,
            final_payment_amount: None,
            amo_payment_method: None,
            mortgage_type: None,
            extension_number: None,
            loyalty_point_amount: None,
            loyalty_discount: None,
            loyalty_discount_name: None,
            commission: None,
            commission_value: None,
            final_discount: None,
            final_additional_options: None,
            tags: Vec::new(),
            created_source: None,
            origin: None,
            user_id: None,
            agent_id: None,
            agency_id: None,
            project_id: None,
            building_id: None,
            floor_id: None,
            property_id: None,
            ddu_id: None,
            bank_contact_info_id: None,
        }
    }

    /// Storage adapters restore the persisted version with this.
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// Storage adapters call this on every persisted write.
    pub fn bump_version(&mut self) {
        self.version += 1;
    }

    pub fn id_typed(&self) -> BookingId {
        self.id
    }

    pub fn step_one(&self) -> bool {
        self.contract_accepted
    }

    pub fn step_two(&self) -> bool {
        self.step_one() && self.personal_filled
    }

    pub fn step_three(&self) -> bool {
        self.step_two() && self.params_checked
    }

    pub fn step_four(&self) -> bool {
        self.step_three() && self.price_payed
    }

    /// 1-based step the client is on, clamped to [`MAX_STEP`].
    pub fn current_step(&self) -> u8 {
        let flags = [
            self.contract_accepted,
            self.personal_filled,
            self.params_checked,
            self.price_payed,
        ];
        let completed = flags.iter().take_while(|done| **done).count() as u8;
        (completed + 1).min(MAX_STEP)
    }

    pub fn online_purchase_step(&self) -> Option<OnlinePurchaseStep> {
        if !self.price_payed {
            return None;
        }
        let step = if self.amocrm_signed {
            OnlinePurchaseStep::Finished
        } else if self.amocrm_signing_date_set && self.escrow_uploaded {
            OnlinePurchaseStep::AmocrmSigning
        } else if self.escrow_uploaded {
            OnlinePurchaseStep::AmocrmSigningDate
        } else if self.ddu_accepted {
            OnlinePurchaseStep::EscrowUpload
        } else if self.amocrm_ddu_uploaded_by_lawyer {
            OnlinePurchaseStep::DduAccept
        } else if self.ddu_created {
            OnlinePurchaseStep::AmocrmDduUploadingByLawyer
        } else if self.amocrm_agent_data_validated
            || (self.payment_method_selected
                && matches!(
                    self.amo_payment_method,
                    Some(PaymentMethod::Cash) | Some(PaymentMethod::InstallmentPlan)
                ))
        {
            OnlinePurchaseStep::DduCreate
        } else if self.payment_method_selected {
            OnlinePurchaseStep::AmocrmAgentDataValidation
        } else if self.online_purchase_started {
            OnlinePurchaseStep::PaymentMethodSelect
        } else {
            OnlinePurchaseStep::OnlinePurchaseStart
        };
        Some(step)
    }

    pub fn is_agent_assigned(&self) -> bool {
        self.agent_id.is_some()
    }

    pub fn is_agency_assigned(&self) -> bool {
        self.agency_id.is_some()
    }

    /// A booking without an expiry is never time-valid.
    pub fn time_valid(&self, now: DateTime<Utc>) -> bool {
        self.expires.is_some_and(|expires| expires > now)
    }

    /// Fails with `WrongStep` unless `step` (1..=4) is complete.
    pub fn require_step(&self, step: u8) -> BookingResult<()> {
        let done = match step {
            0 => true,
            1 => self.step_one(),
            2 => self.step_two(),
            3 => self.step_three(),
            _ => self.step_four(),
        };
        if done {
            Ok(())
        } else {
            Err(BookingError::WrongStep {
                booking_id: self.id,
                required: step,
                current: self.current_step(),
            })
        }
    }

    pub fn require_time_valid(&self, now: DateTime<Utc>) -> BookingResult<()> {
        if self.time_valid(now) {
            Ok(())
        } else {
            Err(BookingError::TimeOut(self.id))
        }
    }

    /// Serialized snapshot used by the change log.
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

impl AggregateRoot for Booking {
    type Id = BookingId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}
