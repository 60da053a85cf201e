//! Request and response types for REST API handlers.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{ModelFilter, ModelFormat, Page, UserId};

// ============================================================================
// Paging
// ============================================================================

/// `?skip=&limit=` query parameters
#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub skip: Option<u32>,
    pub limit: Option<u32>,
}

impl PageQuery {
    pub fn page(&self) -> Page {
        Page::new(self.skip, self.limit)
    }
}

// ============================================================================
// Model types
// ============================================================================

/// Query parameters for `GET /v1/models`
#[derive(Debug, Default, Deserialize)]
pub struct ModelListQuery {
    pub skip: Option<u32>,
    pub limit: Option<u32>,
    pub owner: Option<Uuid>,
    pub format: Option<ModelFormat>,
    #[serde(default)]
    pub public_only: bool,
}

impl ModelListQuery {
    pub fn page(&self) -> Page {
        Page::new(self.skip, self.limit)
    }

    pub fn filter(&self) -> ModelFilter {
        ModelFilter {
            owner: self.owner.map(UserId::from_uuid),
            format: self.format,
            public_only: self.public_only,
        }
    }
}

/// Body of `PATCH /v1/models/:id/visibility`
#[derive(Debug, Deserialize)]
pub struct VisibilityRequest {
    pub is_public: bool,
}

// ============================================================================
// Proof types
// ============================================================================

/// Body of `POST /v1/proofs/verify`
#[derive(Debug, Deserialize)]
pub struct VerifyProofRequest {
    pub proof_job_id: Uuid,
}

/// Response for `POST /v1/proofs/verify`
#[derive(Debug, Serialize)]
pub struct VerifyProofResponse {
    pub verification_id: Uuid,
    pub proof_job_id: Uuid,
    pub is_valid: bool,
    pub verification_time_ms: u64,
    pub verification_method: String,
    pub verified_at: chrono::DateTime<chrono::Utc>,
}

impl From<crate::domain::VerificationRecord> for VerifyProofResponse {
    fn from(record: crate::domain::VerificationRecord) -> Self {
        Self {
            verification_id: record.id,
            proof_job_id: record.job_id.0,
            is_valid: record.is_valid,
            verification_time_ms: record.latency_ms,
            verification_method: record.method,
            verified_at: record.verified_at,
        }
    }
}
