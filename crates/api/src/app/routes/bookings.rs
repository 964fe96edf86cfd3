use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    Json,
};

use cabinet_booking::BookingError;
use cabinet_core::BookingId;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub async fn get_booking(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id: BookingId = match id.parse() {
        Ok(id) => id,
        Err(e) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", format!("{e}")),
    };

    match services.bookings.get(id).await {
        Ok(Some(booking)) => Json(dto::BookingSummary::from(&booking)).into_response(),
        Ok(None) => errors::booking_error_to_response(BookingError::not_found(format!("booking {id}"))),
        Err(e) => errors::booking_error_to_response(BookingError::Storage(e)),
    }
}
