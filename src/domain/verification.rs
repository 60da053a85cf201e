//! Verification records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{JobId, ModelId, UserId};

/// Method recorded for engine-backed verification
pub const VERIFICATION_METHOD: &str = "ezkl";

/// One verification of a completed proof. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationRecord {
    pub id: Uuid,
    pub job_id: JobId,
    pub model_id: ModelId,
    pub verifier: UserId,
    pub is_valid: bool,
    pub latency_ms: u64,
    pub method: String,
    pub verified_at: DateTime<Utc>,
}

impl VerificationRecord {
    pub fn new(
        job_id: JobId,
        model_id: ModelId,
        verifier: UserId,
        is_valid: bool,
        latency_ms: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            model_id,
            verifier,
            is_valid,
            latency_ms,
            method: VERIFICATION_METHOD.to_string(),
            verified_at: Utc::now(),
        }
    }
}
