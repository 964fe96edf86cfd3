use serde::Serialize;

use cabinet_booking::{Booking, BookingStage, BookingSubstage, OnlinePurchaseStep};

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct BookingSummary {
    pub id: i64,
    pub amocrm_id: Option<i64>,
    pub amocrm_stage: Option<BookingStage>,
    pub amocrm_substage: Option<BookingSubstage>,
    pub active: bool,
    pub price_payed: bool,
    pub current_step: u8,
    pub online_purchase_step: Option<OnlinePurchaseStep>,
}

impl From<&Booking> for BookingSummary {
    fn from(booking: &Booking) -> Self {
        Self {
            id: booking.id_typed().get(),
            amocrm_id: booking.amocrm_id.map(|lead| lead.get()),
            amocrm_stage: booking.amocrm_stage,
            amocrm_substage: booking.amocrm_substage,
            active: booking.active,
            price_payed: booking.price_payed,
            current_step: booking.current_step(),
            online_purchase_step: booking.online_purchase_step(),
        }
    }
}
