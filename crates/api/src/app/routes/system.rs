use std::sync::Arc;

use axum::{extract::Extension, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;
use tracing::warn;

use larder_infra::jobs::QueueName;

use crate::app::{errors, services::AppServices};
use crate::context::OwnerContext;

pub async fn health() -> StatusCode {
    StatusCode::OK
}

/// Per-lane counts and recent processing latency.
pub async fn queue_health(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    let mut queues = Vec::with_capacity(QueueName::ALL.len());
    for queue in QueueName::ALL {
        match services.queue.metrics(queue).await {
            Ok(metrics) => queues.push(metrics),
            Err(e) => {
                warn!(queue = %queue, error = %e, "queue metrics unavailable");
                return errors::queue_error_to_response(e);
            }
        }
    }

    Json(json!({ "status": "ok", "queues": queues })).into_response()
}

pub async fn whoami(Extension(owner): Extension<OwnerContext>) -> impl IntoResponse {
    Json(json!({
        "owner_id": owner.owner_id().to_string(),
        "roles": owner.roles().iter().map(|r| r.as_str()).collect::<Vec<_>>(),
    }))
}
