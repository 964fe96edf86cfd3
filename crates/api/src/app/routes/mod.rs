use axum::{
    routing::{get, post},
    Router,
};

pub mod bookings;
pub mod system;
pub mod webhooks;

/// Booking endpoints: CRM webhooks and the booking lookup.
pub fn router() -> Router {
    Router::new()
        .route("/amocrm/:secret", post(webhooks::status_only))
        .route("/amocrm/status/:secret", post(webhooks::status))
        .route("/amocrm/update/:secret", post(webhooks::update))
        .route("/:id", get(bookings::get_booking))
}
