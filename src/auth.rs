//! API key authentication middleware for the operator-facing HTTP surface.

use crate::config::ApiConfig;
use axum::{
    extract::{Request, State},
    http::{HeaderMap, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::warn;

#[derive(Clone)]
pub struct AuthState {
    pub config: ApiConfig,
}

pub fn create_auth_state(config: ApiConfig) -> Arc<AuthState> {
    Arc::new(AuthState { config })
}

/// Accepts `x-api-key` or `Authorization: Bearer <key>`, compared against
/// the configured key in constant time. CORS preflight requests bypass
/// auth so browser clients can complete the handshake.
pub async fn auth_middleware(
    State(auth_state): State<Arc<AuthState>>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Result<Response, Response> {
    if !auth_state.config.enable_auth {
        return Ok(next.run(request).await);
    }

    let method = request.method().clone();
    let path = request.uri().path().to_string();

    if method == Method::OPTIONS {
        return Ok(next.run(request).await);
    }

    let unauthorized = || {
        (StatusCode::UNAUTHORIZED, Json(json!({"error": "Unauthorized"}))).into_response()
    };

    let provided_key = if let Some(header_value) = headers.get("x-api-key") {
        header_value.to_str().map_err(|_| unauthorized())?
    } else if let Some(header_value) = headers.get("authorization") {
        let auth_str = header_value.to_str().map_err(|_| unauthorized())?;
        auth_str.strip_prefix("Bearer ").ok_or_else(unauthorized)?
    } else {
        warn!(path, "missing API key");
        return Err(unauthorized());
    };

    match &auth_state.config.api_key {
        Some(expected_key) => {
            if provided_key.as_bytes().ct_eq(expected_key.as_bytes()).into() {
                Ok(next.run(request).await)
            } else {
                warn!(path, "authentication failed: invalid key");
                Err(unauthorized())
            }
        }
        None => {
            warn!("auth enabled but no API key configured");
            Err((StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": "Internal Server Error"}))).into_response())
        }
    }
}
