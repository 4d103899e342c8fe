use axum::{routing::get, Router};

pub mod admin;
pub mod intelligence;
pub mod inventory;
pub mod jobs;
pub mod system;

/// Router for all authenticated (owner-scoped) endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/whoami", get(system::whoami))
        .nest("/jobs", jobs::router())
        .nest("/inventories", inventory::router())
        .nest("/intelligence", intelligence::router())
        .nest("/admin", admin::router())
}
