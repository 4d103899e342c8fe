use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Extension, Path},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use tracing::info;

use larder_core::InventoryId;
use larder_infra::jobs::{ImageOcrPayload, JobPayload};
use larder_infra::storage::NewItem;

use crate::app::{dto, errors, services::AppServices};
use crate::context::OwnerContext;

/// Upload size cap for image scans.
const MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;

pub fn router() -> Router {
    Router::new()
        .route("/", post(create_inventory))
        .route("/:id/items", post(add_item).get(list_items))
        .route(
            "/:id/items/from-image",
            post(scan_image).layer(DefaultBodyLimit::max(MAX_IMAGE_BYTES)),
        )
}

pub async fn create_inventory(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(owner): Extension<OwnerContext>,
    Json(body): Json<dto::CreateInventoryRequest>,
) -> axum::response::Response {
    match services.inventory.create_inventory(owner.owner_id(), &body.name).await {
        Ok(inventory) => (StatusCode::CREATED, Json(inventory)).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

pub async fn add_item(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(owner): Extension<OwnerContext>,
    Path(id): Path<String>,
    Json(body): Json<NewItem>,
) -> axum::response::Response {
    let inventory_id: InventoryId = match errors::parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.inventory.add_item(owner.owner_id(), inventory_id, body).await {
        Ok(item) => (StatusCode::CREATED, Json(item)).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

pub async fn list_items(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(owner): Extension<OwnerContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let inventory_id: InventoryId = match errors::parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.inventory.list_items(owner.owner_id(), inventory_id).await {
        Ok(items) => Json(items).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

/// Store the raw image and enqueue an `image-processing` job for it.
pub async fn scan_image(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(owner): Extension<OwnerContext>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> axum::response::Response {
    let inventory_id: InventoryId = match errors::parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    if let Err(e) = services.inventory.get_inventory(owner.owner_id(), inventory_id).await {
        return errors::store_error_to_response(e);
    }

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream");

    let image_url = match services.objects.store(body.to_vec(), content_type).await {
        Ok(url) => url,
        Err(e) => return errors::store_error_to_response(e),
    };

    let payload = JobPayload::ImageProcessing(ImageOcrPayload {
        image_url,
        inventory_id,
    });
    match services.queue.enqueue(owner.owner_id(), payload).await {
        Ok(job_id) => {
            info!(job_id = %job_id, inventory_id = %inventory_id, "image scan enqueued");
            (StatusCode::ACCEPTED, Json(dto::JobAccepted { job_id })).into_response()
        }
        Err(e) => errors::queue_error_to_response(e),
    }
}
