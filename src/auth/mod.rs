//! Authentication for the prover API
//!
//! The pipeline only needs an opaque user identity. This module maps an API
//! key presented on the request to that identity; nothing else about users is
//! modelled here.
//!
//! # Configuration
//!
//! - `AUTH_MODE`: `required` (default) or `disabled` for development
//! - `API_KEYS`: comma-separated `key:user_uuid` pairs

mod api_key;
mod middleware;

pub use api_key::*;
pub use middleware::*;

use crate::domain::UserId;

/// Authentication context extracted from request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthContext {
    pub user_id: UserId,
}

impl AuthContext {
    pub fn new(user_id: UserId) -> Self {
        Self { user_id }
    }

    /// Context used for every request when authentication is disabled
    pub fn anonymous() -> Self {
        Self {
            user_id: UserId::anonymous(),
        }
    }
}

/// Authentication error
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing authentication")]
    MissingAuth,

    #[error("invalid API key")]
    InvalidApiKey,

    #[error("malformed API key configuration: {0}")]
    InvalidConfig(String),
}
