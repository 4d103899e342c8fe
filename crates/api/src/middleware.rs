use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};
use chrono::Utc;
use tracing::debug;

use larder_auth::IdentityResolver;

use crate::app::errors::json_error;
use crate::context::OwnerContext;

#[derive(Clone)]
pub struct AuthState {
    pub resolver: Arc<dyn IdentityResolver>,
}

pub async fn auth_middleware(
    State(state): State<AuthState>,
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Result<Response, Response> {
    let token = extract_bearer(req.headers()).ok_or_else(unauthenticated)?;

    let identity = state.resolver.resolve(token, Utc::now()).map_err(|e| {
        debug!(error = %e, "rejected credential");
        unauthenticated()
    })?;

    req.extensions_mut().insert(OwnerContext::from(identity));
    Ok(next.run(req).await)
}

fn unauthenticated() -> Response {
    json_error(StatusCode::UNAUTHORIZED, "unauthenticated", "missing or invalid bearer token")
}

fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    let header = headers.get(axum::http::header::AUTHORIZATION)?;
    let token = header.to_str().ok()?.strip_prefix("Bearer ")?.trim();
    if token.is_empty() {
        return None;
    }
    Some(token)
}
