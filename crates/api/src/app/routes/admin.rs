//! Queue maintenance routes. Require the `admin` role.

use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    routing::delete,
    Json, Router,
};
use axum::response::IntoResponse;
use serde_json::json;
use tracing::warn;

use larder_auth::Role;

use crate::app::{errors, services::AppServices};
use crate::context::OwnerContext;

pub fn router() -> Router {
    Router::new().route("/queues/:queue", delete(obliterate_queue))
}

/// Remove every job of a lane, whatever its state.
pub async fn obliterate_queue(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(owner): Extension<OwnerContext>,
    Path(queue): Path<String>,
) -> axum::response::Response {
    if !owner.has_role(Role::ADMIN) {
        return errors::json_error(StatusCode::FORBIDDEN, "forbidden", "admin role required");
    }

    let queue = match super::jobs::parse_queue(&queue) {
        Ok(q) => q,
        Err(resp) => return resp,
    };

    match services.queue.obliterate(queue).await {
        Ok(removed) => {
            warn!(queue = %queue, removed, owner_id = %owner.owner_id(), "queue obliterated");
            Json(json!({ "queue": queue, "removed": removed })).into_response()
        }
        Err(e) => errors::queue_error_to_response(e),
    }
}
