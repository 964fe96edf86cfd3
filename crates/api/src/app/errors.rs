use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use cabinet_booking::BookingError;

pub fn booking_error_to_response(err: BookingError) -> axum::response::Response {
    let status = match &err {
        BookingError::NotFound(_) => StatusCode::NOT_FOUND,
        BookingError::WrongStep { .. } | BookingError::TimeOut(_) => StatusCode::CONFLICT,
        BookingError::WrongPipeline(_)
        | BookingError::PropertyMissing
        | BookingError::PropertyUnavailable { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        BookingError::WebhookFatal(_) | BookingError::Domain(_) => StatusCode::BAD_REQUEST,
        BookingError::Integration(_) => StatusCode::BAD_GATEWAY,
        BookingError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    json_error(status, err.reason(), err.to_string())
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
