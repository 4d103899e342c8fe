//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: queue store, collaborators and in-process workers
//! - `routes/`: HTTP routes + handlers (one file per area)
//! - `dto.rs`: request/response DTOs
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{routing::get, Extension, Router};
use tower::ServiceBuilder;

use crate::middleware;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

use services::AppServices;

/// Build the full HTTP router (public entrypoint used by `main.rs`).
pub fn build_app(jwt_secret: &str, services: Arc<AppServices>) -> Router {
    let resolver = Arc::new(larder_auth::Hs256JwtValidator::new(jwt_secret.as_bytes()));
    let auth_state = middleware::AuthState { resolver };

    // Protected routes: require a resolved owner identity.
    let protected = routes::router()
        .layer(Extension(services.clone()))
        .layer(axum::middleware::from_fn_with_state(
            auth_state,
            middleware::auth_middleware,
        ));

    Router::new()
        .route("/health", get(routes::system::health))
        .route("/system/health", get(routes::system::queue_health))
        .layer(Extension(services))
        .merge(protected)
        .layer(ServiceBuilder::new())
}
