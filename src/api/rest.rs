//! REST API endpoints for the prover.

use axum::extract::{Extension, Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use tracing::instrument;
use uuid::Uuid;

use super::error::ApiError;
use super::types::{
    ModelListQuery, PageQuery, VerifyProofRequest, VerifyProofResponse, VisibilityRequest,
};
use crate::auth::AuthContextExt;
use crate::domain::{
    JobId, JobStatusView, ModelEntry, ModelId, NewModel, Paged, ProofJob, VerificationRecord,
};
use crate::server::AppState;
use crate::service::SubmitProof;

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Build the `/api` router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/models", post(register_model).get(list_models))
        .route("/v1/models/:id", get(get_model))
        .route("/v1/models/:id/visibility", patch(set_model_visibility))
        .route("/v1/proofs", post(submit_proof).get(list_proofs))
        .route("/v1/proofs/verify", post(verify_proof))
        .route("/v1/proofs/:id", get(get_proof))
        .route("/v1/proofs/:id/status", get(get_proof_status))
        .route("/v1/proofs/:id/verifications", get(list_verifications))
}

// ============================================================================
// Models
// ============================================================================

/// POST /api/v1/models - Register a model file already on the server.
#[instrument(skip(state, auth, request), fields(user_id = %auth.user_id))]
async fn register_model(
    State(state): State<AppState>,
    Extension(AuthContextExt(auth)): Extension<AuthContextExt>,
    Json(request): Json<NewModel>,
) -> Result<(StatusCode, Json<ModelEntry>), ApiError> {
    let entry = state.models.register(auth.user_id, request).await?;
    Ok((StatusCode::CREATED, Json(entry)))
}

/// GET /api/v1/models - Public models plus the caller's own.
async fn list_models(
    State(state): State<AppState>,
    Extension(AuthContextExt(auth)): Extension<AuthContextExt>,
    Query(query): Query<ModelListQuery>,
) -> ApiResult<Paged<ModelEntry>> {
    let models = state
        .models
        .list(&auth.user_id, &query.filter(), query.page())
        .await?;
    Ok(Json(models))
}

/// GET /api/v1/models/:id
async fn get_model(
    State(state): State<AppState>,
    Extension(AuthContextExt(auth)): Extension<AuthContextExt>,
    Path(id): Path<Uuid>,
) -> ApiResult<ModelEntry> {
    let model = state
        .models
        .get(&ModelId::from_uuid(id), &auth.user_id)
        .await?;
    Ok(Json(model))
}

/// PATCH /api/v1/models/:id/visibility - Owner only.
#[instrument(skip(state, auth, request), fields(model_id = %id))]
async fn set_model_visibility(
    State(state): State<AppState>,
    Extension(AuthContextExt(auth)): Extension<AuthContextExt>,
    Path(id): Path<Uuid>,
    Json(request): Json<VisibilityRequest>,
) -> ApiResult<ModelEntry> {
    let model = state
        .models
        .set_visibility(&ModelId::from_uuid(id), &auth.user_id, request.is_public)
        .await?;
    Ok(Json(model))
}

// ============================================================================
// Proofs
// ============================================================================

/// POST /api/v1/proofs - Submit a proof job; answered before any proving starts.
#[instrument(skip(state, auth, request), fields(user_id = %auth.user_id, model_id = %request.model_id))]
async fn submit_proof(
    State(state): State<AppState>,
    Extension(AuthContextExt(auth)): Extension<AuthContextExt>,
    Json(request): Json<SubmitProof>,
) -> Result<(StatusCode, Json<ProofJob>), ApiError> {
    let job = state.proofs.submit(auth.user_id, request).await?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

/// GET /api/v1/proofs - The caller's jobs, newest first.
async fn list_proofs(
    State(state): State<AppState>,
    Extension(AuthContextExt(auth)): Extension<AuthContextExt>,
    Query(query): Query<PageQuery>,
) -> ApiResult<Paged<ProofJob>> {
    let jobs = state.proofs.list(&auth.user_id, query.page()).await?;
    Ok(Json(jobs))
}

/// GET /api/v1/proofs/:id
async fn get_proof(
    State(state): State<AppState>,
    Extension(AuthContextExt(auth)): Extension<AuthContextExt>,
    Path(id): Path<Uuid>,
) -> ApiResult<ProofJob> {
    let job = state
        .proofs
        .job(&JobId::from_uuid(id), &auth.user_id)
        .await?;
    Ok(Json(job))
}

/// GET /api/v1/proofs/:id/status - Polling endpoint.
async fn get_proof_status(
    State(state): State<AppState>,
    Extension(AuthContextExt(auth)): Extension<AuthContextExt>,
    Path(id): Path<Uuid>,
) -> ApiResult<JobStatusView> {
    let status = state
        .proofs
        .status(&JobId::from_uuid(id), &auth.user_id)
        .await?;
    Ok(Json(status))
}

/// POST /api/v1/proofs/verify - Verify a completed proof and record the result.
#[instrument(skip(state, auth), fields(proof_job_id = %request.proof_job_id))]
async fn verify_proof(
    State(state): State<AppState>,
    Extension(AuthContextExt(auth)): Extension<AuthContextExt>,
    Json(request): Json<VerifyProofRequest>,
) -> ApiResult<VerifyProofResponse> {
    let record = state
        .proofs
        .verify(&JobId::from_uuid(request.proof_job_id), &auth.user_id)
        .await?;
    Ok(Json(record.into()))
}

/// GET /api/v1/proofs/:id/verifications
async fn list_verifications(
    State(state): State<AppState>,
    Extension(AuthContextExt(auth)): Extension<AuthContextExt>,
    Path(id): Path<Uuid>,
) -> ApiResult<Vec<VerificationRecord>> {
    let records = state
        .proofs
        .verifications(&JobId::from_uuid(id), &auth.user_id)
        .await?;
    Ok(Json(records))
}
