use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use conreg_infra::jobs::{JobError, ProduceError};
use conreg_infra::queue::QueueError;
use conreg_tickets::TicketError;

pub fn job_error_status(err: &JobError) -> StatusCode {
    match err {
        JobError::Malformed(_)
        | JobError::UnknownAction(_)
        | JobError::MissingField { .. }
        | JobError::InvalidIdentifier { .. } => StatusCode::BAD_REQUEST,
        JobError::Rule(rule) => match rule {
            TicketError::UserNotFound(_)
            | TicketError::TicketTierNotFound(_)
            | TicketError::TicketNotFound(_) => StatusCode::NOT_FOUND,
            TicketError::UserBlacklisted(_) => StatusCode::FORBIDDEN,
            TicketError::UserAlreadyHasTicket { .. }
            | TicketError::OutOfStock(_)
            | TicketError::InvalidTicketStatus { .. } => StatusCode::CONFLICT,
            TicketError::TicketDenied(_) | TicketError::CannotDowngrade { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
        },
        JobError::Database { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        JobError::Timeout(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

pub fn job_error_to_response(err: &JobError) -> Response {
    json_error(job_error_status(err), err.code(), err.to_string())
}

pub fn produce_error_to_response(err: &ProduceError) -> Response {
    match err {
        ProduceError::Invalid(e) => job_error_to_response(e),
        ProduceError::Queue(QueueError::Disabled) => json_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "queue_disabled",
            "job queue is not configured",
        ),
        ProduceError::Queue(e) => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "queue_unavailable", e.to_string())
        }
        ProduceError::Encode(e) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "encode_error", e.to_string())
        }
    }
}

pub fn json_error(status: StatusCode, code: &'static str, message: impl Into<String>) -> Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
