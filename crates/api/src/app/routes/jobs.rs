use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use tracing::info;

use larder_core::JobId;
use larder_infra::jobs::{get_status, JobPayload, QueueName};

use crate::app::{dto, errors, services::AppServices};
use crate::context::OwnerContext;

pub fn router() -> Router {
    Router::new()
        .route("/:queue", post(enqueue_job))
        .route("/:queue/:job_id", get(job_status))
}

/// Unknown lanes are answered with 404 `unknown_queue` on every route.
pub(crate) fn parse_queue(raw: &str) -> Result<QueueName, axum::response::Response> {
    raw.parse::<QueueName>().map_err(|e| {
        errors::json_error(StatusCode::NOT_FOUND, "unknown_queue", e.to_string())
    })
}

/// Validate the payload for the lane and enqueue it. Invalid payloads never
/// produce a job id.
pub async fn enqueue_job(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(owner): Extension<OwnerContext>,
    Path(queue): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> axum::response::Response {
    let queue = match parse_queue(&queue) {
        Ok(q) => q,
        Err(resp) => return resp,
    };

    let payload = match JobPayload::from_json(queue, body) {
        Ok(p) => p,
        Err(e) => return errors::domain_error_to_response(e),
    };

    match services.queue.enqueue(owner.owner_id(), payload).await {
        Ok(job_id) => {
            info!(queue = %queue, job_id = %job_id, "job enqueued");
            (StatusCode::ACCEPTED, Json(dto::JobAccepted { job_id })).into_response()
        }
        Err(e) => errors::queue_error_to_response(e),
    }
}

pub async fn job_status(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(owner): Extension<OwnerContext>,
    Path((queue, job_id)): Path<(String, String)>,
) -> axum::response::Response {
    let queue = match parse_queue(&queue) {
        Ok(q) => q,
        Err(resp) => return resp,
    };
    let job_id: JobId = match errors::parse_id(&job_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match get_status(services.queue.as_ref(), queue, job_id, owner.owner_id()).await {
        Ok(view) => Json(view).into_response(),
        Err(e) => errors::status_error_to_response(e),
    }
}
