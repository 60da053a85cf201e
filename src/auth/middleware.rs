//! Authentication middleware for Axum
//!
//! Resolves the caller's identity and stores it in request extensions.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Request, State},
    http::{header::AUTHORIZATION, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

use super::{ApiKeyValidator, AuthContext, AuthError, API_KEY_PREFIX};

/// Resolves request credentials to an identity
pub struct Authenticator {
    api_key_validator: Arc<ApiKeyValidator>,
}

impl Authenticator {
    pub fn new(api_key_validator: Arc<ApiKeyValidator>) -> Self {
        Self { api_key_validator }
    }

    /// Accepts `Bearer <key>`, `ApiKey <key>` or a bare key
    pub fn authenticate(&self, auth_header: Option<&str>) -> Result<AuthContext, AuthError> {
        let header = auth_header.ok_or(AuthError::MissingAuth)?;

        let key = header
            .strip_prefix("Bearer ")
            .or_else(|| header.strip_prefix("ApiKey "))
            .unwrap_or(header)
            .trim();

        if key.starts_with(API_KEY_PREFIX) {
            return self.api_key_validator.validate(key);
        }

        Err(AuthError::InvalidApiKey)
    }
}

/// Auth context extension for request
#[derive(Clone, Copy)]
pub struct AuthContextExt(pub AuthContext);

/// Authentication middleware configuration/state.
#[derive(Clone)]
pub struct AuthMiddlewareState {
    pub authenticator: Arc<Authenticator>,
    /// If false, every request runs as the anonymous user (dev mode).
    pub require_auth: bool,
}

/// Authentication middleware
pub async fn auth_middleware(
    State(state): State<AuthMiddlewareState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let auth_header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    let context = match state.authenticator.authenticate(auth_header) {
        Ok(context) => context,
        Err(e) if state.require_auth => return auth_error_response(e),
        Err(_) => AuthContext::anonymous(),
    };

    request.extensions_mut().insert(AuthContextExt(context));
    next.run(request).await
}

/// Convert auth error to HTTP response
fn auth_error_response(error: AuthError) -> Response {
    let (status, code, message) = match error {
        AuthError::MissingAuth => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", "Missing authentication"),
        AuthError::InvalidApiKey => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", "Invalid API key"),
        AuthError::InvalidConfig(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL_ERROR",
            "Authentication misconfigured",
        ),
    };

    (
        status,
        axum::Json(serde_json::json!({
            "error": message,
            "code": code,
        })),
    )
        .into_response()
}
