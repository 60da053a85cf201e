//! Structured API error responses with error codes
//!
//! Every failure leaves the API as an [`ApiError`] with a stable,
//! machine-readable code and a human-readable message.

use axum::http::header::{HeaderName, HeaderValue, RETRY_AFTER};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::infra::ProverError;

/// Seconds a client should wait after a quota rejection
pub const QUOTA_RETRY_AFTER_SECS: u64 = 60;

// ============================================================================
// Error Codes
// ============================================================================

/// Error codes for API responses
///
/// These codes are stable and can be used by clients for programmatic error handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Authentication and access (1xxx)
    AuthRequired,
    AccessDenied,

    // Backpressure (2xxx)
    /// Too many active proof jobs for the caller
    QuotaExceeded,

    // Validation (3xxx)
    InvalidRequestBody,
    InvalidFieldValue,
    /// Model content already registered
    DuplicateModel,
    /// Operation not allowed in the job's current status
    InvalidJobState,

    // Resources (4xxx)
    ResourceNotFound,
    ModelNotFound,
    ProofJobNotFound,

    // Infrastructure (8xxx)
    DatabaseError,
    EngineError,
    Timeout,
    InternalError,
}

impl ErrorCode {
    /// Get the numeric code for this error
    pub fn numeric_code(&self) -> u32 {
        match self {
            ErrorCode::AuthRequired => 1001,
            ErrorCode::AccessDenied => 1002,

            ErrorCode::QuotaExceeded => 2002,

            ErrorCode::InvalidRequestBody => 3001,
            ErrorCode::InvalidFieldValue => 3002,
            ErrorCode::DuplicateModel => 3003,
            ErrorCode::InvalidJobState => 3004,

            ErrorCode::ResourceNotFound => 4001,
            ErrorCode::ModelNotFound => 4002,
            ErrorCode::ProofJobNotFound => 4003,

            ErrorCode::DatabaseError => 8001,
            ErrorCode::EngineError => 8002,
            ErrorCode::Timeout => 8003,
            ErrorCode::InternalError => 8999,
        }
    }

    /// Get the HTTP status code for this error
    pub fn http_status(&self) -> StatusCode {
        match self {
            ErrorCode::AuthRequired => StatusCode::UNAUTHORIZED,
            ErrorCode::AccessDenied => StatusCode::FORBIDDEN,

            ErrorCode::QuotaExceeded => StatusCode::TOO_MANY_REQUESTS,

            ErrorCode::InvalidRequestBody
            | ErrorCode::InvalidFieldValue
            | ErrorCode::DuplicateModel
            | ErrorCode::InvalidJobState => StatusCode::BAD_REQUEST,

            ErrorCode::ResourceNotFound | ErrorCode::ModelNotFound | ErrorCode::ProofJobNotFound => {
                StatusCode::NOT_FOUND
            }

            ErrorCode::DatabaseError
            | ErrorCode::EngineError
            | ErrorCode::Timeout
            | ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let code_str = match self {
            ErrorCode::AuthRequired => "AUTH_REQUIRED",
            ErrorCode::AccessDenied => "ACCESS_DENIED",
            ErrorCode::QuotaExceeded => "QUOTA_EXCEEDED",
            ErrorCode::InvalidRequestBody => "INVALID_REQUEST_BODY",
            ErrorCode::InvalidFieldValue => "INVALID_FIELD_VALUE",
            ErrorCode::DuplicateModel => "DUPLICATE_MODEL",
            ErrorCode::InvalidJobState => "INVALID_JOB_STATE",
            ErrorCode::ResourceNotFound => "RESOURCE_NOT_FOUND",
            ErrorCode::ModelNotFound => "MODEL_NOT_FOUND",
            ErrorCode::ProofJobNotFound => "PROOF_JOB_NOT_FOUND",
            ErrorCode::DatabaseError => "DATABASE_ERROR",
            ErrorCode::EngineError => "ENGINE_ERROR",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        };
        write!(f, "{}", code_str)
    }
}

// ============================================================================
// Structured Error Response
// ============================================================================

/// Structured error response for API endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub error: ErrorDetails,
}

/// Detailed error information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Machine-readable error code
    pub code: ErrorCode,

    /// Numeric error code for easy categorization
    pub numeric_code: u32,

    /// Human-readable error message
    pub message: String,

    /// Additional error details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,

    /// Seconds to wait before retrying, mirrored in the `Retry-After` header
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,

    /// Related resource ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            error: ErrorDetails {
                code,
                numeric_code: code.numeric_code(),
                message: message.into(),
                details: None,
                retry_after: None,
                resource_id: None,
            },
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.error.details = Some(details);
        self
    }

    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.error.retry_after = Some(seconds);
        self
    }

    pub fn with_resource_id(mut self, id: impl Into<String>) -> Self {
        self.error.resource_id = Some(id.into());
        self
    }

    pub fn status(&self) -> StatusCode {
        self.error.code.http_status()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code_str = self.error.code.to_string();
        let retry_after = self.error.retry_after;
        let mut response = (status, Json(self)).into_response();

        if let Ok(code_value) = HeaderValue::from_str(&code_str) {
            response
                .headers_mut()
                .insert(HeaderName::from_static("x-error-code"), code_value);
        }
        if let Some(seconds) = retry_after {
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from(seconds));
        }

        response
    }
}

// ============================================================================
// Conversion from ProverError
// ============================================================================

impl From<ProverError> for ApiError {
    fn from(err: ProverError) -> Self {
        match err {
            ProverError::ModelNotFound(id) => {
                ApiError::new(ErrorCode::ModelNotFound, "Model not found")
                    .with_resource_id(id.to_string())
            }
            ProverError::JobNotFound(id) => {
                ApiError::new(ErrorCode::ProofJobNotFound, "Proof job not found")
                    .with_resource_id(id.to_string())
            }
            ProverError::Validation(msg) => ApiError::new(ErrorCode::InvalidFieldValue, msg),
            ProverError::DuplicateModel { ref fingerprint } => {
                let fingerprint = fingerprint.clone();
                ApiError::new(ErrorCode::DuplicateModel, err.to_string())
                    .with_details(serde_json::json!({ "fingerprint": fingerprint }))
            }
            ProverError::AccessDenied(msg) => ApiError::new(ErrorCode::AccessDenied, msg),
            ProverError::QuotaExceeded { active, limit } => {
                ApiError::new(ErrorCode::QuotaExceeded, err.to_string())
                    .with_details(serde_json::json!({ "active": active, "limit": limit }))
                    .with_retry_after(QUOTA_RETRY_AFTER_SECS)
            }
            ProverError::InvalidStateTransition { job_id, from, to } => ApiError::new(
                ErrorCode::InvalidJobState,
                format!("invalid state transition: {from} -> {to}"),
            )
            .with_resource_id(job_id.to_string()),
            ProverError::Database(ref e) => {
                error!(error = %e, "database error");
                ApiError::new(ErrorCode::DatabaseError, "Database error")
            }
            ProverError::Stage { .. } | ProverError::Engine(_) => {
                ApiError::new(ErrorCode::EngineError, err.to_string())
            }
            ProverError::Timeout(msg) => ApiError::new(ErrorCode::Timeout, msg),
            ProverError::Io(_)
            | ProverError::Serialization(_)
            | ProverError::Cache(_)
            | ProverError::Configuration(_)
            | ProverError::Internal(_) => {
                error!(error = %err, "internal error");
                ApiError::new(ErrorCode::InternalError, "Internal server error")
            }
        }
    }
}
