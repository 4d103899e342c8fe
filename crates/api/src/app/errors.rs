use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use larder_core::DomainError;
use larder_infra::jobs::{QueueError, StatusError, WaitError};
use larder_infra::storage::StoreError;

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

pub fn domain_error_to_response(err: DomainError) -> axum::response::Response {
    match err {
        DomainError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        DomainError::InvalidId(msg) => json_error(StatusCode::BAD_REQUEST, "invalid_id", msg),
        DomainError::NotFound => json_error(StatusCode::NOT_FOUND, "not_found", "not found"),
        DomainError::Conflict(msg) => json_error(StatusCode::CONFLICT, "conflict", msg),
    }
}

pub fn queue_error_to_response(err: QueueError) -> axum::response::Response {
    match err {
        QueueError::NotFound(id) => json_error(StatusCode::NOT_FOUND, "not_found", format!("job {id} not found")),
        QueueError::StoreUnavailable(msg) => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "store_unavailable", msg)
        }
        other @ (QueueError::InvalidTransition { .. } | QueueError::LeaseLost { .. }) => {
            json_error(StatusCode::CONFLICT, "conflict", other.to_string())
        }
        QueueError::Serialization(msg) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "serialization_error", msg)
        }
    }
}

pub fn status_error_to_response(err: StatusError) -> axum::response::Response {
    match err {
        StatusError::NotFound(_) => json_error(StatusCode::NOT_FOUND, "not_found", "job not found"),
        StatusError::Forbidden(_) => {
            json_error(StatusCode::FORBIDDEN, "forbidden", "unauthorized access to job")
        }
        StatusError::Store(e) => queue_error_to_response(e),
    }
}

pub fn wait_error_to_response(err: WaitError) -> axum::response::Response {
    match err {
        WaitError::TimedOut { job_id, .. } => json_error(
            StatusCode::GATEWAY_TIMEOUT,
            "timeout",
            format!("job {job_id} is still running; poll its status for the result"),
        ),
        WaitError::Store(e) => queue_error_to_response(e),
    }
}

pub fn store_error_to_response(err: StoreError) -> axum::response::Response {
    match err {
        StoreError::NotFound(msg) => json_error(StatusCode::NOT_FOUND, "not_found", msg),
        StoreError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        StoreError::Conflict(msg) => json_error(StatusCode::CONFLICT, "conflict", msg),
        StoreError::Unavailable(msg) => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "store_unavailable", msg)
        }
    }
}

/// Parse a path id, answering 400 on garbage.
pub fn parse_id<T>(raw: &str) -> Result<T, axum::response::Response>
where
    T: std::str::FromStr<Err = DomainError>,
{
    raw.parse::<T>().map_err(domain_error_to_response)
}
