//! Typed partial updates for bookings and the regression guard.
//!
//! A [`BookingPatch`] is an ordered set of [`BookingField`] assignments. Every
//! repository write passes it through [`guard`] first: guarded nullable
//! fields are never cleared and progression flags are never reset, no matter
//! which webhook arrives last.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use cabinet_core::{
    AgencyId, AgentId, BuildingId, FloorId, LeadId, ProjectId, PropertyId, StatusId, UserId,
};

use crate::booking::Booking;
use crate::constants::{BookingCreatedSource, BookingStage, BookingSubstage, PaymentMethod};

/// One field assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "field", content = "value", rename_all = "snake_case")]
pub enum BookingField {
    Active(bool),
    ShouldBeDeactivatedByTimer(bool),
    ProfitbaseBooked(bool),
    AmocrmId(Option<LeadId>),
    AmocrmStage(Option<BookingStage>),
    AmocrmSubstage(Option<BookingSubstage>),
    AmocrmStatusId(Option<StatusId>),
    ContractAccepted(bool),
    PersonalFilled(bool),
    ParamsChecked(bool),
    PricePayed(bool),
    Until(Option<DateTime<Utc>>),
    Expires(Option<DateTime<Utc>>),
    FixationExpires(Option<DateTime<Utc>>),
    PaymentId(Option<String>),
    PaymentAmount(Option<Decimal>),
    PaymentUrl(Option<String>),
    PaymentOrderNumber(Option<String>),
    FinalPaymentAmount(Option<Decimal>),
    AmoPaymentMethod(Option<PaymentMethod>),
    MortgageType(Option<String>),
    ExtensionNumber(Option<i32>),
    LoyaltyPointAmount(Option<i32>),
    Commission(Option<Decimal>),
    CommissionValue(Option<Decimal>),
    FinalDiscount(Option<String>),
    FinalAdditionalOptions(Option<String>),
    Tags(Vec<String>),
    CreatedSource(Option<BookingCreatedSource>),
    Origin(Option<String>),
    UserId(Option<UserId>),
    AgentId(Option<AgentId>),
    AgencyId(Option<AgencyId>),
    ProjectId(Option<ProjectId>),
    BuildingId(Option<BuildingId>),
    FloorId(Option<FloorId>),
    PropertyId(Option<PropertyId>),
}

impl BookingField {
    /// Column name of the field.
    pub fn name(&self) -> &'static str {
        use BookingField::*;
        match self {
            Active(_) => "active",
            ShouldBeDeactivatedByTimer(_) => "should_be_deactivated_by_timer",
            ProfitbaseBooked(_) => "profitbase_booked",
            AmocrmId(_) => "amocrm_id",
            AmocrmStage(_) => "amocrm_stage",
            AmocrmSubstage(_) => "amocrm_substage",
            AmocrmStatusId(_) => "amocrm_status_id",
            ContractAccepted(_) => "contract_accepted",
            PersonalFilled(_) => "personal_filled",
            ParamsChecked(_) => "params_checked",
            PricePayed(_) => "price_payed",
            Until(_) => "until",
            Expires(_) => "expires",
            FixationExpires(_) => "fixation_expires",
            PaymentId(_) => "payment_id",
            PaymentAmount(_) => "payment_amount",
            PaymentUrl(_) => "payment_url",
            PaymentOrderNumber(_) => "payment_order_number",
            FinalPaymentAmount(_) => "final_payment_amount",
            AmoPaymentMethod(_) => "amo_payment_method",
            MortgageType(_) => "mortgage_type",
            ExtensionNumber(_) => "extension_number",
            LoyaltyPointAmount(_) => "loyalty_point_amount",
            Commission(_) => "commission",
            CommissionValue(_) => "commission_value",
            FinalDiscount(_) => "final_discount",
            FinalAdditionalOptions(_) => "final_additional_options",
            Tags(_) => "tags",
            CreatedSource(_) => "created_source",
            Origin(_) => "origin",
            UserId(_) => "user_id",
            AgentId(_) => "agent_id",
            AgencyId(_) => "agency_id",
            ProjectId(_) => "project_id",
            BuildingId(_) => "building_id",
            FloorId(_) => "floor_id",
            PropertyId(_) => "property_id",
        }
    }

    /// True when the assignment would clear a guarded field.
    pub fn is_regression(&self) -> bool {
        use BookingField::*;
        match self {
            ContractAccepted(v) | PersonalFilled(v) | ParamsChecked(v) | PricePayed(v) => !*v,
            Until(v) | Expires(v) | FixationExpires(v) => v.is_none(),
            PaymentId(v) | PaymentUrl(v) | PaymentOrderNumber(v) => v.is_none(),
            PaymentAmount(v) | FinalPaymentAmount(v) => v.is_none(),
            ExtensionNumber(v) | LoyaltyPointAmount(v) => v.is_none(),
            PropertyId(v) => v.is_none(),
            ProjectId(v) => v.is_none(),
            _ => false,
        }
    }

    /// True when the booking currently holds a non-empty value for this field.
    pub fn is_set_on(&self, booking: &Booking) -> bool {
        use BookingField::*;
        match self {
            ContractAccepted(_) => booking.contract_accepted,
            PersonalFilled(_) => booking.personal_filled,
            ParamsChecked(_) => booking.params_checked,
            PricePayed(_) => booking.price_payed,
            Until(_) => booking.until.is_some(),
            Expires(_) => booking.expires.is_some(),
            FixationExpires(_) => booking.fixation_expires.is_some(),
            PaymentId(_) => booking.payment_id.is_some(),
            PaymentAmount(_) => booking.payment_amount.is_some(),
            PaymentUrl(_) => booking.payment_url.is_some(),
            PaymentOrderNumber(_) => booking.payment_order_number.is_some(),
            FinalPaymentAmount(_) => booking.final_payment_amount.is_some(),
            ExtensionNumber(_) => booking.extension_number.is_some(),
            LoyaltyPointAmount(_) => booking.loyalty_point_amount.is_some(),
            PropertyId(_) => booking.property_id.is_some(),
            ProjectId(_) => booking.project_id.is_some(),
            _ => false,
        }
    }

    pub fn apply(self, booking: &mut Booking) {
        use BookingField::*;
        match self {
            Active(v) => booking.active = v,
            ShouldBeDeactivatedByTimer(v) => booking.should_be_deactivated_by_timer = v,
            ProfitbaseBooked(v) => booking.profitbase_booked = v,
            AmocrmId(v) => booking.amocrm_id = v,
            AmocrmStage(v) => booking.amocrm_stage = v,
            AmocrmSubstage(v) => booking.amocrm_substage = v,
            AmocrmStatusId(v) => booking.amocrm_status_id = v,
            ContractAccepted(v) => booking.contract_accepted = v,
            PersonalFilled(v) => booking.personal_filled = v,
            ParamsChecked(v) => booking.params_checked = v,
            PricePayed(v) => booking.price_payed = v,
            Until(v) => booking.until = v,
            Expires(v) => booking.expires = v,
            FixationExpires(v) => booking.fixation_expires = v,
            PaymentId(v) => booking.payment_id = v,
            PaymentAmount(v) => booking.payment_amount = v,
            PaymentUrl(v) => booking.payment_url = v,
            PaymentOrderNumber(v) => booking.payment_order_number = v,
            FinalPaymentAmount(v) => booking.final_payment_amount = v,
            AmoPaymentMethod(v) => booking.amo_payment_method = v,
            MortgageType(v) => booking.mortgage_type = v,
            ExtensionNumber(v) => booking.extension_number = v,
            LoyaltyPointAmount(v) => booking.loyalty_point_amount = v,
            Commission(v) => booking.commission = v,
            CommissionValue(v) => booking.commission_value = v,
            FinalDiscount(v) => booking.final_discount = v,
            FinalAdditionalOptions(v) => booking.final_additional_options = v,
            Tags(v) => booking.tags = v,
            CreatedSource(v) => booking.created_source = v,
            Origin(v) => booking.origin = v,
            UserId(v) => booking.user_id = v,
            AgentId(v) => booking.agent_id = v,
            AgencyId(v) => booking.agency_id = v,
            ProjectId(v) => booking.project_id = v,
            BuildingId(v) => booking.building_id = v,
            FloorId(v) => booking.floor_id = v,
            PropertyId(v) => booking.property_id = v,
        }
    }
}

/// Ordered set of field assignments; a later assignment to the same field
/// replaces the earlier one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BookingPatch {
    fields: Vec<BookingField>,
}

impl BookingPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, field: BookingField) -> Self {
        self.push(field);
        self
    }

    pub fn push(&mut self, field: BookingField) {
        let name = field.name();
        self.fields.retain(|f| f.name() != name);
        self.fields.push(field);
    }

    pub fn extend(&mut self, other: BookingPatch) {
        for field in other.fields {
            self.push(field);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn fields(&self) -> &[BookingField] {
        &self.fields
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.iter().any(|f| f.name() == name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.fields.iter().map(BookingField::name).collect()
    }

    /// Applies every assignment without guarding. Repositories call this
    /// only with the `applied` half of a [`GuardOutcome`].
    pub fn apply_to(&self, booking: &mut Booking) {
        for field in &self.fields {
            field.clone().apply(booking);
        }
    }
}

impl FromIterator<BookingField> for BookingPatch {
    fn from_iter<I: IntoIterator<Item = BookingField>>(iter: I) -> Self {
        let mut patch = BookingPatch::new();
        for field in iter {
            patch.push(field);
        }
        patch
    }
}

/// Result of running a patch through the regression guard.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GuardOutcome {
    pub applied: BookingPatch,
    pub dropped: Vec<BookingField>,
}

/// Splits `patch` into the assignments that may be written and the
/// regressions that are silently dropped.
pub fn guard(patch: BookingPatch) -> GuardOutcome {
    let (dropped, applied): (Vec<_>, Vec<_>) =
        patch.fields.into_iter().partition(BookingField::is_regression);
    GuardOutcome {
        applied: BookingPatch { fields: applied },
        dropped,
    }
}

/// A dropped regression that would have cleared a populated field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionAlert {
    pub field: String,
    pub previous: serde_json::Value,
}

/// Dropped assignments that would have zeroed a previously non-empty field.
pub fn regression_alerts(booking: &Booking, dropped: &[BookingField]) -> Vec<RegressionAlert> {
    let snapshot = booking.snapshot();
    dropped
        .iter()
        .filter(|field| field.is_set_on(booking))
        .map(|field| RegressionAlert {
            field: field.name().to_string(),
            previous: snapshot
                .get(field.name())
                .cloned()
                .unwrap_or(serde_json::Value::Null),
        })
        .collect()
}
