use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};

use pixgate_store::TenantRepository;

use crate::auth::{sha256_hex, verify_api_key};
use crate::context::TenantContext;
use crate::errors::json_error;

#[derive(Clone)]
pub struct AuthState {
    pub tenants: Arc<dyn TenantRepository>,
}

pub async fn auth_middleware(
    State(state): State<AuthState>,
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Response {
    let Some(api_key) = extract_api_key(req.headers()) else {
        return json_error(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", "missing API key");
    };

    // Index by the unsalted hash, then decide on the salted fingerprint.
    let lookup = sha256_hex(api_key);
    let tenant = match state.tenants.find_by_api_key_lookup(&lookup).await {
        Ok(tenant) => tenant,
        Err(e) => {
            tracing::error!(error = %e, "tenant lookup failed");
            return json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL",
                "internal error",
            );
        }
    };

    let Some(tenant) = tenant else {
        return json_error(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", "invalid API key");
    };
    if !verify_api_key(&tenant, api_key) {
        return json_error(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", "invalid API key");
    }

    req.extensions_mut().insert(TenantContext::new(tenant));
    next.run(req).await
}

/// `Authorization: Bearer <key>` or `X-API-Key: <key>`.
fn extract_api_key(headers: &HeaderMap) -> Option<&str> {
    if let Some(header) = headers.get(axum::http::header::AUTHORIZATION) {
        let header = header.to_str().ok()?;
        let token = header.strip_prefix("Bearer ")?.trim();
        if !token.is_empty() {
            return Some(token);
        }
        return None;
    }

    let header = headers.get("x-api-key")?;
    let token = header.to_str().ok()?.trim();
    if token.is_empty() {
        return None;
    }
    Some(token)
}
