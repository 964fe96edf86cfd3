//! Stage, substage and other slug-valued vocabularies of the booking model.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use cabinet_core::DomainError;

macro_rules! slug_enum {
    ($(#[$meta:meta])* $t:ident { $($variant:ident => $slug:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $t {
            $(#[serde(rename = $slug)] $variant,)+
        }

        impl $t {
            pub const ALL: &'static [$t] = &[$($t::$variant,)+];

            pub const fn as_str(self) -> &'static str {
                match self {
                    $($t::$variant => $slug,)+
                }
            }

            pub fn from_slug(slug: &str) -> Option<Self> {
                match slug {
                    $($slug => Some($t::$variant),)+
                    _ => None,
                }
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::from_slug(s.trim()).ok_or_else(|| {
                    DomainError::validation(format!("unknown {}: {s}", stringify!($t)))
                })
            }
        }
    };
}

slug_enum! {
    /// Coarse booking stage.
    BookingStage {
        Start => "start",
        Booking => "booking",
        DduProcess => "ddu_process",
        DduSigning => "ddu_signing",
        DduRegister => "ddu_register",
        DduFinished => "ddu_finished",
        DduUnregistered => "ddu_unregistered",
    }
}

slug_enum! {
    /// Fine-grained booking substage; drives the reconciliation logic.
    BookingSubstage {
        Start => "start",
        AssignAgent => "assign_agent",
        MakeAppointment => "make_appointment",
        Meeting => "meeting",
        MeetingInProgress => "meeting_in_progress",
        MakeDecision => "make_decision",
        ReMeeting => "re_meeting",
        Booking => "booking",
        PaidBooking => "paid_booking",
        MortgageLead => "mortgage_lead",
        ApplyForAMortgage => "apply_for_a_mortgage",
        MortgageFiled => "mortgage_filed",
        MortgageDone => "mortgage_done",
        DduProcess => "ddu_process",
        Confirmation => "confirmation",
        DduSigning => "ddu_signing",
        DduRegister => "ddu_register",
        Realized => "realized",
        MoneyProcess => "money_process",
        Unrealized => "unrealized",
        Termination => "termination",
    }
}

impl BookingSubstage {
    /// Stage this substage belongs to.
    pub const fn stage(self) -> BookingStage {
        use BookingSubstage::*;
        match self {
            Start | AssignAgent | MakeAppointment | Meeting | MeetingInProgress | MakeDecision
            | ReMeeting => BookingStage::Start,
            Booking | PaidBooking | MortgageLead | ApplyForAMortgage | MortgageFiled
            | MortgageDone => BookingStage::Booking,
            DduProcess | Confirmation => BookingStage::DduProcess,
            DduSigning => BookingStage::DduSigning,
            DduRegister => BookingStage::DduRegister,
            Realized | MoneyProcess => BookingStage::DduFinished,
            Unrealized | Termination => BookingStage::DduUnregistered,
        }
    }

    /// Substages that belong to the meeting family.
    pub const fn is_meeting_family(self) -> bool {
        matches!(
            self,
            BookingSubstage::MakeAppointment
                | BookingSubstage::Meeting
                | BookingSubstage::MeetingInProgress
        )
    }

    /// Substages in which the property reservation counts as a sale.
    pub const fn is_sold(self) -> bool {
        matches!(
            self,
            BookingSubstage::MoneyProcess | BookingSubstage::Realized
        )
    }
}

/// A substage keeps a booking alive unless it is absent or terminal-failed.
pub fn stage_is_valid(substage: Option<BookingSubstage>) -> bool {
    !matches!(
        substage,
        None | Some(BookingSubstage::Termination) | Some(BookingSubstage::Unrealized)
    )
}

slug_enum! {
    /// How the client pays for the property.
    PaymentMethod {
        Cash => "cash",
        Mortgage => "mortgage",
        InstallmentPlan => "installment_plan",
    }
}

slug_enum! {
    /// Where a booking row was first created.
    BookingCreatedSource {
        Amocrm => "amocrm",
        LkBooking => "lk_booking",
        LkBookingAssign => "lk_booking_assign",
        FastBooking => "fast_booking",
    }
}

slug_enum! {
    /// Derived position in the online purchase flow.
    OnlinePurchaseStep {
        OnlinePurchaseStart => "online_purchase_start",
        PaymentMethodSelect => "payment_method_select",
        AmocrmAgentDataValidation => "amocrm_agent_data_validation",
        DduCreate => "ddu_create",
        AmocrmDduUploadingByLawyer => "amocrm_ddu_uploading_by_lawyer",
        DduAccept => "ddu_accept",
        EscrowUpload => "escrow_upload",
        AmocrmSigningDate => "amocrm_signing_date",
        AmocrmSigning => "amocrm_signing",
        Finished => "finished",
    }
}

/// Task-instance status slugs the booking engine pushes.
pub mod task_slugs {
    pub const MEETINGS_CONFIRMED: &str = "meetings_confirmed";
    pub const MEETINGS_CONFIRMED_RESCHEDULED: &str = "meetings_confirmed_rescheduled";
    pub const MEETINGS_START: &str = "meetings_start";
    pub const MEETINGS_FINISH: &str = "meetings_finish";
    pub const DEAL_ALREADY_BOOKED: &str = "deal_already_booked";
}

/// Template and SMS slugs.
pub mod message_slugs {
    pub const MEETING_STATUS_TO_BROKER: &str = "meeting_change_status_to_broker_mail";
    pub const MEETING_STATUS_TO_CLIENT: &str = "meeting_change_status_to_client_mail";
    pub const ASSIGN_CLIENT_SMS: &str = "assign_client";
    pub const BOOKING_NOTIFICATION_SMS: &str = "booking_notification";
    pub const REGRESSION_ALERT_MAIL: &str = "booking_regression_alert_mail";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_substage_maps_to_a_stage() {
        assert_eq!(BookingSubstage::ALL.len(), 21);
        assert_eq!(BookingSubstage::AssignAgent.stage(), BookingStage::Start);
        assert_eq!(BookingSubstage::MortgageDone.stage(), BookingStage::Booking);
        assert_eq!(BookingSubstage::Confirmation.stage(), BookingStage::DduProcess);
        assert_eq!(BookingSubstage::MoneyProcess.stage(), BookingStage::DduFinished);
        assert_eq!(BookingSubstage::Termination.stage(), BookingStage::DduUnregistered);
    }

    #[test]
    fn slugs_round_trip_through_serde_and_from_str() {
        for substage in BookingSubstage::ALL {
            let json = serde_json::to_string(substage).unwrap();
            assert_eq!(json, format!("\"{}\"", substage.as_str()));
            assert_eq!(substage.as_str().parse::<BookingSubstage>().unwrap(), *substage);
        }
        assert!("redial".parse::<BookingSubstage>().is_err());
    }

    #[test]
    fn stage_validity() {
        assert!(!stage_is_valid(None));
        assert!(!stage_is_valid(Some(BookingSubstage::Termination)));
        assert!(!stage_is_valid(Some(BookingSubstage::Unrealized)));
        assert!(stage_is_valid(Some(BookingSubstage::Booking)));
    }
}
