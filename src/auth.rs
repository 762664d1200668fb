//! Bearer-token authentication middleware, the enforcement point every
//! request to the HTTP surface passes through before reaching a handler.
use axum::{
    extract::{Request, State},
    http::{HeaderMap, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use std::sync::Arc;
use tracing::warn;

#[derive(Clone)]
pub struct AuthState {
    pub admin_api_key: String,
}

pub async fn auth_middleware(
    State(auth_state): State<Arc<AuthState>>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Result<Response, Response> {
    let method = request.method().clone();
    let path = request.uri().path();
    let client_ip = headers
        .get("x-forwarded-for")
        .or_else(|| headers.get("x-real-ip"))
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown");

    // CORS preflight carries no credentials; the browser never attaches one.
    if method == Method::OPTIONS {
        return Ok(next.run(request).await);
    }

    let unauthorized = || {
        (StatusCode::UNAUTHORIZED, Json(json!({"error": "unauthorized"}))).into_response()
    };

    let provided_key = if let Some(header_value) = headers.get("x-api-key") {
        header_value.to_str().map_err(|_| unauthorized())?
    } else if let Some(header_value) = headers.get("authorization") {
        let auth_str = header_value.to_str().map_err(|_| unauthorized())?;
        auth_str.strip_prefix("Bearer ").ok_or_else(unauthorized)?
    } else {
        warn!("missing credentials for {} from {}", path, client_ip);
        return Err(unauthorized());
    };

    use subtle::ConstantTimeEq;
    if provided_key.as_bytes().ct_eq(auth_state.admin_api_key.as_bytes()).into() {
        Ok(next.run(request).await)
    } else {
        warn!("rejected credentials for {} from {}", path, client_ip);
        Err(unauthorized())
    }
}

pub fn create_auth_state(admin_api_key: String) -> Arc<AuthState> {
    Arc::new(AuthState { admin_api_key })
}
