//! SQLite-backed model registry, job table and verification history

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqlitePool};
use sqlx::{FromRow, Sqlite, Transaction};
use uuid::Uuid;

use crate::domain::{
    ArtifactPaths, AttemptStart, JobId, JobStatus, ModelEntry, ModelFilter, ModelFormat, ModelId,
    Page, Paged, ProofJob, UserId, VerificationRecord,
};
use crate::infra::{JobStore, ModelStore, ProverError, Result, VerificationStore};

const JOB_COLUMNS: &str = r#"
    id, model_id, user_id, input_hash, input_path, status,
    compiled_circuit_path, settings_path, proving_key_path, verifying_key_path,
    srs_path, witness_path, proof_path, cache_hit, error_message, task_id,
    created_at, started_at, completed_at
"#;

const MODEL_COLUMNS: &str = r#"
    id, owner_id, name, description, version, format, fingerprint, merkle_root,
    size_bytes, storage_path, is_public, created_at
"#;

/// `status IN (...)` clause admitting exactly the statuses allowed to move to `to`
fn transition_guard(to: JobStatus) -> String {
    let sources: Vec<String> = JobStatus::sources(to)
        .map(|s| format!("'{}'", s.as_str()))
        .collect();
    format!("status IN ({})", sources.join(", "))
}

/// Fixed-width UTC timestamps so text comparison matches time order
fn timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn path_text(path: &Option<PathBuf>) -> Option<String> {
    path.as_ref().map(|p| p.to_string_lossy().into_owned())
}

/// SQLite store implementing every persistence trait
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Create a new store with the given connection pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a new store from a database URL
    pub async fn from_url(url: &str) -> Result<Self> {
        let pool = SqlitePool::connect(url).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Initialize the database schema
    pub async fn initialize(&self) -> Result<()> {
        crate::migrations::run_sqlite(&self.pool)
            .await
            .map_err(|e| ProverError::Configuration(format!("migration failed: {e}")))
    }

    async fn current_status(
        tx: &mut Transaction<'_, Sqlite>,
        id: &JobId,
    ) -> Result<Option<JobStatus>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT status FROM proof_jobs WHERE id = ?")
            .bind(id.0.to_string())
            .fetch_optional(&mut **tx)
            .await?;

        row.map(|(s,)| s.parse::<JobStatus>().map_err(ProverError::Internal))
            .transpose()
    }

    /// Explain why a guarded status update touched no rows
    async fn rejected_transition(
        tx: &mut Transaction<'_, Sqlite>,
        id: &JobId,
        to: JobStatus,
    ) -> ProverError {
        match Self::current_status(tx, id).await {
            Ok(Some(from)) => ProverError::InvalidStateTransition {
                job_id: id.0,
                from,
                to,
            },
            Ok(None) => ProverError::JobNotFound(id.0),
            Err(e) => e,
        }
    }

    /// Run a status update whose `WHERE` clause carries `transition_guard(to)`
    async fn guarded_update<'q>(
        &self,
        id: &JobId,
        to: JobStatus,
        update: Query<'q, Sqlite, SqliteArguments<'q>>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let result = update.execute(&mut *tx).await?;

        if result.rows_affected() == 0 {
            let err = Self::rejected_transition(&mut tx, id, to).await;
            tx.rollback().await?;
            return Err(err);
        }

        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for SqliteStore {
    async fn create_job(&self, job: &ProofJob, max_active: u32) -> Result<()> {
        let user = job.user_id.0.to_string();

        // Single statement: the quota check and the insert cannot interleave
        let result = sqlx::query(
            r#"
            INSERT INTO proof_jobs (
                id, model_id, user_id, input_hash, input_path, status, cache_hit, created_at
            )
            SELECT ?, ?, ?, ?, ?, ?, 0, ?
            WHERE (
                SELECT COUNT(*) FROM proof_jobs
                WHERE user_id = ? AND status IN ('PENDING', 'PROCESSING')
            ) < ?
            "#,
        )
        .bind(job.id.0.to_string())
        .bind(job.model_id.0.to_string())
        .bind(&user)
        .bind(&job.input_hash)
        .bind(job.input_path.to_string_lossy().into_owned())
        .bind(JobStatus::Pending.as_str())
        .bind(timestamp(job.created_at))
        .bind(&user)
        .bind(max_active as i64)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let active = self.count_active_jobs(&job.user_id).await?;
            return Err(ProverError::QuotaExceeded {
                active,
                limit: max_active,
            });
        }

        Ok(())
    }

    async fn get_job(&self, id: &JobId) -> Result<Option<ProofJob>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM proof_jobs WHERE id = ?"
        ))
        .bind(id.0.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(ProofJob::try_from).transpose()
    }

    async fn list_jobs(&self, user: &UserId, page: Page) -> Result<Paged<ProofJob>> {
        let user = user.0.to_string();

        let rows = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM proof_jobs
            WHERE user_id = ?
            ORDER BY created_at DESC, id DESC
            LIMIT ? OFFSET ?
            "#
        ))
        .bind(&user)
        .bind(page.limit as i64)
        .bind(page.skip as i64)
        .fetch_all(&self.pool)
        .await?;

        let (total,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM proof_jobs WHERE user_id = ?")
            .bind(&user)
            .fetch_one(&self.pool)
            .await?;

        Ok(Paged {
            items: rows
                .into_iter()
                .map(ProofJob::try_from)
                .collect::<Result<_>>()?,
            total: total as u64,
            skip: page.skip,
            limit: page.limit,
        })
    }

    async fn count_active_jobs(&self, user: &UserId) -> Result<u32> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM proof_jobs WHERE user_id = ? AND status IN ('PENDING', 'PROCESSING')",
        )
        .bind(user.0.to_string())
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u32)
    }

    async fn begin_attempt(&self, id: &JobId, task_id: &str) -> Result<AttemptStart> {
        let mut tx = self.pool.begin().await?;
        let now = timestamp(Utc::now());

        let sql = format!(
            r#"
            UPDATE proof_jobs
            SET status = 'PROCESSING', task_id = ?, started_at = COALESCE(started_at, ?)
            WHERE id = ? AND {}
            "#,
            transition_guard(JobStatus::Processing)
        );
        let result = sqlx::query(&sql)
            .bind(task_id)
            .bind(&now)
            .bind(id.0.to_string())
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() == 1 {
            tx.commit().await?;
            return Ok(AttemptStart::Started);
        }

        let status = Self::current_status(&mut tx, id).await?;
        tx.rollback().await?;

        match status {
            Some(JobStatus::Completed) => Ok(AttemptStart::AlreadyCompleted),
            Some(JobStatus::Failed) => Ok(AttemptStart::AlreadyFailed),
            Some(from) => Err(ProverError::InvalidStateTransition {
                job_id: id.0,
                from,
                to: JobStatus::Processing,
            }),
            None => Err(ProverError::JobNotFound(id.0)),
        }
    }

    async fn record_retry(&self, id: &JobId, message: &str) -> Result<()> {
        // Annotates a running attempt; not a transition
        let update = sqlx::query(
            "UPDATE proof_jobs SET error_message = ? WHERE id = ? AND status = 'PROCESSING'",
        )
        .bind(message)
        .bind(id.0.to_string());

        self.guarded_update(id, JobStatus::Processing, update).await
    }

    async fn complete_job(
        &self,
        id: &JobId,
        artifacts: &ArtifactPaths,
        cache_hit: bool,
    ) -> Result<()> {
        let sql = format!(
            r#"
            UPDATE proof_jobs
            SET status = 'COMPLETED',
                compiled_circuit_path = ?, settings_path = ?, proving_key_path = ?,
                verifying_key_path = ?, srs_path = ?, witness_path = ?, proof_path = ?,
                cache_hit = ?, error_message = NULL, completed_at = ?
            WHERE id = ? AND {}
            "#,
            transition_guard(JobStatus::Completed)
        );
        let update = sqlx::query(&sql)
            .bind(path_text(&artifacts.compiled_circuit))
            .bind(path_text(&artifacts.settings))
            .bind(path_text(&artifacts.proving_key))
            .bind(path_text(&artifacts.verifying_key))
            .bind(path_text(&artifacts.srs))
            .bind(path_text(&artifacts.witness))
            .bind(path_text(&artifacts.proof))
            .bind(cache_hit)
            .bind(timestamp(Utc::now()))
            .bind(id.0.to_string());

        self.guarded_update(id, JobStatus::Completed, update).await
    }

    async fn fail_job(&self, id: &JobId, message: &str) -> Result<()> {
        let sql = format!(
            r#"
            UPDATE proof_jobs
            SET status = 'FAILED', error_message = ?, completed_at = ?
            WHERE id = ? AND {}
            "#,
            transition_guard(JobStatus::Failed)
        );
        let update = sqlx::query(&sql)
            .bind(message)
            .bind(timestamp(Utc::now()))
            .bind(id.0.to_string());

        self.guarded_update(id, JobStatus::Failed, update).await
    }

    async fn recoverable_jobs(&self) -> Result<Vec<JobId>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT id FROM proof_jobs
            WHERE status IN ('PENDING', 'PROCESSING')
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(id,)| parse_uuid("id", &id).map(JobId::from_uuid))
            .collect()
    }

    async fn completed_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<ProofJob>> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM proof_jobs
            WHERE status = 'COMPLETED' AND completed_at < ?
              AND (proof_path IS NOT NULL OR witness_path IS NOT NULL
                   OR compiled_circuit_path IS NOT NULL)
            ORDER BY completed_at ASC
            "#
        ))
        .bind(timestamp(cutoff))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ProofJob::try_from).collect()
    }

    async fn clear_artifacts(&self, id: &JobId) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE proof_jobs
            SET compiled_circuit_path = NULL, settings_path = NULL, proving_key_path = NULL,
                verifying_key_path = NULL, srs_path = NULL, witness_path = NULL, proof_path = NULL
            WHERE id = ?
            "#,
        )
        .bind(id.0.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ModelStore for SqliteStore {
    async fn insert_model(&self, model: &ModelEntry) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO models (
                id, owner_id, name, description, version, format, fingerprint,
                merkle_root, size_bytes, storage_path, is_public, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(model.id.0.to_string())
        .bind(model.owner.0.to_string())
        .bind(&model.name)
        .bind(&model.description)
        .bind(&model.version)
        .bind(model.format.as_str())
        .bind(&model.fingerprint)
        .bind(&model.merkle_root)
        .bind(model.size_bytes as i64)
        .bind(model.storage_path.to_string_lossy().into_owned())
        .bind(model.is_public)
        .bind(timestamp(model.created_at))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                if db_err.message().contains("fingerprint") {
                    Err(ProverError::DuplicateModel {
                        fingerprint: model.fingerprint.clone(),
                    })
                } else {
                    Err(ProverError::Validation(format!(
                        "a model named {:?} already exists for this owner",
                        model.name
                    )))
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_model(&self, id: &ModelId) -> Result<Option<ModelEntry>> {
        let row = sqlx::query_as::<_, ModelRow>(&format!(
            "SELECT {MODEL_COLUMNS} FROM models WHERE id = ?"
        ))
        .bind(id.0.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(ModelEntry::try_from).transpose()
    }

    async fn find_by_fingerprint(&self, fingerprint: &str) -> Result<Option<ModelEntry>> {
        let row = sqlx::query_as::<_, ModelRow>(&format!(
            "SELECT {MODEL_COLUMNS} FROM models WHERE fingerprint = ?"
        ))
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ModelEntry::try_from).transpose()
    }

    async fn find_by_owner_and_name(
        &self,
        owner: &UserId,
        name: &str,
    ) -> Result<Option<ModelEntry>> {
        let row = sqlx::query_as::<_, ModelRow>(&format!(
            "SELECT {MODEL_COLUMNS} FROM models WHERE owner_id = ? AND name = ?"
        ))
        .bind(owner.0.to_string())
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ModelEntry::try_from).transpose()
    }

    async fn list_models(
        &self,
        viewer: &UserId,
        filter: &ModelFilter,
        page: Page,
    ) -> Result<Paged<ModelEntry>> {
        const VISIBLE: &str = r#"
            FROM models
            WHERE (is_public = 1 OR owner_id = ?)
              AND (? IS NULL OR owner_id = ?)
              AND (? IS NULL OR format = ?)
              AND (? = 0 OR is_public = 1)
        "#;

        let viewer = viewer.0.to_string();
        let owner = filter.owner.map(|o| o.0.to_string());
        let format = filter.format.map(|f| f.as_str());

        let rows = sqlx::query_as::<_, ModelRow>(&format!(
            "SELECT {MODEL_COLUMNS} {VISIBLE} ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?"
        ))
        .bind(&viewer)
        .bind(&owner)
        .bind(&owner)
        .bind(format)
        .bind(format)
        .bind(filter.public_only)
        .bind(page.limit as i64)
        .bind(page.skip as i64)
        .fetch_all(&self.pool)
        .await?;

        let (total,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) {VISIBLE}"))
            .bind(&viewer)
            .bind(&owner)
            .bind(&owner)
            .bind(format)
            .bind(format)
            .bind(filter.public_only)
            .fetch_one(&self.pool)
            .await?;

        Ok(Paged {
            items: rows
                .into_iter()
                .map(ModelEntry::try_from)
                .collect::<Result<_>>()?,
            total: total as u64,
            skip: page.skip,
            limit: page.limit,
        })
    }

    async fn set_visibility(&self, id: &ModelId, is_public: bool) -> Result<()> {
        let result = sqlx::query("UPDATE models SET is_public = ? WHERE id = ?")
            .bind(is_public)
            .bind(id.0.to_string())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(ProverError::ModelNotFound(id.0));
        }
        Ok(())
    }
}

#[async_trait]
impl VerificationStore for SqliteStore {
    async fn insert_verification(&self, record: &VerificationRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO verifications (
                id, proof_job_id, model_id, verifier_id, is_valid, latency_ms, method, verified_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.id.to_string())
        .bind(record.job_id.0.to_string())
        .bind(record.model_id.0.to_string())
        .bind(record.verifier.0.to_string())
        .bind(record.is_valid)
        .bind(record.latency_ms as i64)
        .bind(&record.method)
        .bind(timestamp(record.verified_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_verifications(&self, job_id: &JobId) -> Result<Vec<VerificationRecord>> {
        let rows = sqlx::query_as::<_, VerificationRow>(
            r#"
            SELECT id, proof_job_id, model_id, verifier_id, is_valid, latency_ms, method, verified_at
            FROM verifications
            WHERE proof_job_id = ?
            ORDER BY verified_at ASC, rowid ASC
            "#,
        )
        .bind(job_id.0.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(VerificationRecord::try_from).collect()
    }
}

// ============================================================================
// Row types
// ============================================================================

fn parse_uuid(field: &str, value: &str) -> Result<Uuid> {
    Uuid::parse_str(value).map_err(|e| ProverError::Internal(format!("Invalid {field}: {e}")))
}

fn parse_timestamp(field: &str, value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| ProverError::Internal(format!("Invalid {field}: {e}")))
}

fn parse_optional_timestamp(field: &str, value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value.map(|s| parse_timestamp(field, &s)).transpose()
}

/// Raw row from proof_jobs table
#[derive(Debug, FromRow)]
struct JobRow {
    id: String,
    model_id: String,
    user_id: String,
    input_hash: String,
    input_path: String,
    status: String,
    compiled_circuit_path: Option<String>,
    settings_path: Option<String>,
    proving_key_path: Option<String>,
    verifying_key_path: Option<String>,
    srs_path: Option<String>,
    witness_path: Option<String>,
    proof_path: Option<String>,
    cache_hit: bool,
    error_message: Option<String>,
    task_id: Option<String>,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
}

impl TryFrom<JobRow> for ProofJob {
    type Error = ProverError;

    fn try_from(row: JobRow) -> Result<Self> {
        let status = row.status.parse::<JobStatus>().map_err(ProverError::Internal)?;

        Ok(ProofJob {
            id: JobId::from_uuid(parse_uuid("id", &row.id)?),
            model_id: ModelId::from_uuid(parse_uuid("model_id", &row.model_id)?),
            user_id: UserId::from_uuid(parse_uuid("user_id", &row.user_id)?),
            input_hash: row.input_hash,
            input_path: PathBuf::from(row.input_path),
            status,
            artifacts: ArtifactPaths {
                compiled_circuit: row.compiled_circuit_path.map(PathBuf::from),
                settings: row.settings_path.map(PathBuf::from),
                proving_key: row.proving_key_path.map(PathBuf::from),
                verifying_key: row.verifying_key_path.map(PathBuf::from),
                srs: row.srs_path.map(PathBuf::from),
                witness: row.witness_path.map(PathBuf::from),
                proof: row.proof_path.map(PathBuf::from),
            },
            cache_hit: row.cache_hit,
            error_message: row.error_message,
            task_id: row.task_id,
            created_at: parse_timestamp("created_at", &row.created_at)?,
            started_at: parse_optional_timestamp("started_at", row.started_at)?,
            completed_at: parse_optional_timestamp("completed_at", row.completed_at)?,
        })
    }
}

/// Raw row from models table
#[derive(Debug, FromRow)]
struct ModelRow {
    id: String,
    owner_id: String,
    name: String,
    description: Option<String>,
    version: String,
    format: String,
    fingerprint: String,
    merkle_root: Option<String>,
    size_bytes: i64,
    storage_path: String,
    is_public: bool,
    created_at: String,
}

impl TryFrom<ModelRow> for ModelEntry {
    type Error = ProverError;

    fn try_from(row: ModelRow) -> Result<Self> {
        let format = row
            .format
            .parse::<ModelFormat>()
            .map_err(ProverError::Internal)?;

        Ok(ModelEntry {
            id: ModelId::from_uuid(parse_uuid("id", &row.id)?),
            owner: UserId::from_uuid(parse_uuid("owner_id", &row.owner_id)?),
            name: row.name,
            description: row.description,
            version: row.version,
            format,
            fingerprint: row.fingerprint,
            merkle_root: row.merkle_root,
            size_bytes: row.size_bytes as u64,
            storage_path: PathBuf::from(row.storage_path),
            is_public: row.is_public,
            created_at: parse_timestamp("created_at", &row.created_at)?,
        })
    }
}

/// Raw row from verifications table
#[derive(Debug, FromRow)]
struct VerificationRow {
    id: String,
    proof_job_id: String,
    model_id: String,
    verifier_id: String,
    is_valid: bool,
    latency_ms: i64,
    method: String,
    verified_at: String,
}

impl TryFrom<VerificationRow> for VerificationRecord {
    type Error = ProverError;

    fn try_from(row: VerificationRow) -> Result<Self> {
        Ok(VerificationRecord {
            id: parse_uuid("id", &row.id)?,
            job_id: JobId::from_uuid(parse_uuid("proof_job_id", &row.proof_job_id)?),
            model_id: ModelId::from_uuid(parse_uuid("model_id", &row.model_id)?),
            verifier: UserId::from_uuid(parse_uuid("verifier_id", &row.verifier_id)?),
            is_valid: row.is_valid,
            latency_ms: row.latency_ms as u64,
            method: row.method,
            verified_at: parse_timestamp("verified_at", &row.verified_at)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn create_test_db() -> SqliteStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = SqliteStore::new(pool);
        store.initialize().await.unwrap();
        store
    }

    fn model(owner: UserId, name: &str, fingerprint: &str, is_public: bool) -> ModelEntry {
        ModelEntry {
            id: ModelId::new(),
            owner,
            name: name.to_string(),
            description: None,
            version: "1.0.0".to_string(),
            format: ModelFormat::Onnx,
            fingerprint: fingerprint.to_string(),
            merkle_root: None,
            size_bytes: 42,
            storage_path: PathBuf::from(format!("/models/{name}.onnx")),
            is_public,
            created_at: Utc::now(),
        }
    }

    async fn seeded(store: &SqliteStore, owner: UserId) -> ModelEntry {
        let m = model(owner, "mnist", &"a".repeat(64), false);
        store.insert_model(&m).await.unwrap();
        m
    }

    fn job(model: &ModelEntry, user: UserId) -> ProofJob {
        let id = JobId::new();
        ProofJob::new(
            id,
            model.id,
            user,
            "f".repeat(64),
            PathBuf::from(format!("/proofs/{id}/input.json")),
        )
    }

    #[tokio::test]
    async fn test_job_lifecycle() {
        let store = create_test_db().await;
        let user = UserId::new();
        let m = seeded(&store, user).await;
        let j = job(&m, user);

        store.create_job(&j, 10).await.unwrap();
        assert_eq!(
            store.begin_attempt(&j.id, "task-1").await.unwrap(),
            AttemptStart::Started
        );

        let artifacts = ArtifactPaths {
            proof: Some(PathBuf::from("/proofs/x/proof.json")),
            ..Default::default()
        };
        store.complete_job(&j.id, &artifacts, true).await.unwrap();

        let loaded = store.get_job(&j.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Completed);
        assert!(loaded.cache_hit);
        assert!(loaded.started_at.is_some());
        assert!(loaded.completed_at.is_some());
        assert_eq!(loaded.task_id.as_deref(), Some("task-1"));
        assert!(loaded.proof_available());

        // A late retry sees the finished job instead of restarting it
        assert_eq!(
            store.begin_attempt(&j.id, "task-2").await.unwrap(),
            AttemptStart::AlreadyCompleted
        );
    }

    #[tokio::test]
    async fn test_started_at_survives_reentry() {
        let store = create_test_db().await;
        let user = UserId::new();
        let m = seeded(&store, user).await;
        let j = job(&m, user);
        store.create_job(&j, 10).await.unwrap();

        store.begin_attempt(&j.id, "a").await.unwrap();
        let first = store.get_job(&j.id).await.unwrap().unwrap().started_at;
        store.record_retry(&j.id, "Retry 1: busy").await.unwrap();
        store.begin_attempt(&j.id, "b").await.unwrap();
        let second = store.get_job(&j.id).await.unwrap().unwrap();

        assert_eq!(second.started_at, first);
        assert_eq!(second.error_message.as_deref(), Some("Retry 1: busy"));
    }

    #[tokio::test]
    async fn test_terminal_writes_are_guarded() {
        let store = create_test_db().await;
        let user = UserId::new();
        let m = seeded(&store, user).await;
        let j = job(&m, user);
        store.create_job(&j, 10).await.unwrap();

        // Pending jobs cannot jump straight to a terminal state
        let err = store.fail_job(&j.id, "boom").await.unwrap_err();
        assert!(matches!(
            err,
            ProverError::InvalidStateTransition {
                from: JobStatus::Pending,
                to: JobStatus::Failed,
                ..
            }
        ));

        store.begin_attempt(&j.id, "t").await.unwrap();
        store.fail_job(&j.id, "boom").await.unwrap();

        let err = store
            .complete_job(&j.id, &ArtifactPaths::default(), false)
            .await
            .unwrap_err();
        assert!(matches!(err, ProverError::InvalidStateTransition { .. }));

        let err = store.record_retry(&j.id, "late").await.unwrap_err();
        assert!(matches!(
            err,
            ProverError::InvalidStateTransition {
                from: JobStatus::Failed,
                ..
            }
        ));

        let loaded = store.get_job(&j.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Failed);
        assert_eq!(loaded.error_message.as_deref(), Some("boom"));
    }

    #[test]
    fn test_transition_guard_matches_domain_rule() {
        assert_eq!(
            transition_guard(JobStatus::Processing),
            "status IN ('PENDING', 'PROCESSING')"
        );
        assert_eq!(
            transition_guard(JobStatus::Completed),
            "status IN ('PROCESSING')"
        );
    }

    #[tokio::test]
    async fn test_quota_is_enforced_on_insert() {
        let store = create_test_db().await;
        let user = UserId::new();
        let m = seeded(&store, user).await;

        for _ in 0..3 {
            store.create_job(&job(&m, user), 3).await.unwrap();
        }
        let err = store.create_job(&job(&m, user), 3).await.unwrap_err();
        assert!(matches!(
            err,
            ProverError::QuotaExceeded {
                active: 3,
                limit: 3
            }
        ));

        // Another user is unaffected
        store.create_job(&job(&m, UserId::new()), 3).await.unwrap();
        assert_eq!(store.count_active_jobs(&user).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_recoverable_and_listing() {
        let store = create_test_db().await;
        let user = UserId::new();
        let m = seeded(&store, user).await;
        let a = job(&m, user);
        let b = job(&m, user);
        store.create_job(&a, 10).await.unwrap();
        store.create_job(&b, 10).await.unwrap();
        store.begin_attempt(&a.id, "t").await.unwrap();

        let recoverable = store.recoverable_jobs().await.unwrap();
        assert_eq!(recoverable.len(), 2);

        let page = store.list_jobs(&user, Page::new(None, Some(1))).await.unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.total, 2);

        let other = store.list_jobs(&UserId::new(), Page::default()).await.unwrap();
        assert_eq!(other.total, 0);
    }

    #[tokio::test]
    async fn test_completed_before_and_clear() {
        let store = create_test_db().await;
        let user = UserId::new();
        let m = seeded(&store, user).await;
        let j = job(&m, user);
        store.create_job(&j, 10).await.unwrap();
        store.begin_attempt(&j.id, "t").await.unwrap();
        let artifacts = ArtifactPaths {
            proof: Some(PathBuf::from("/p/proof.json")),
            ..Default::default()
        };
        store.complete_job(&j.id, &artifacts, false).await.unwrap();

        let future = Utc::now() + chrono::Duration::seconds(5);
        assert_eq!(store.completed_before(future).await.unwrap().len(), 1);
        assert!(store
            .completed_before(Utc::now() - chrono::Duration::days(1))
            .await
            .unwrap()
            .is_empty());

        store.clear_artifacts(&j.id).await.unwrap();
        assert!(store.completed_before(future).await.unwrap().is_empty());
        let loaded = store.get_job(&j.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Completed);
        assert!(loaded.artifacts.is_empty());
    }

    #[tokio::test]
    async fn test_model_uniqueness() {
        let store = create_test_db().await;
        let owner = UserId::new();
        let m = seeded(&store, owner).await;

        let same_bytes = model(UserId::new(), "other", &m.fingerprint, true);
        assert!(matches!(
            store.insert_model(&same_bytes).await.unwrap_err(),
            ProverError::DuplicateModel { .. }
        ));

        let same_name = model(owner, "mnist", &"b".repeat(64), false);
        assert!(matches!(
            store.insert_model(&same_name).await.unwrap_err(),
            ProverError::Validation(_)
        ));

        let found = store.find_by_fingerprint(&m.fingerprint).await.unwrap();
        assert_eq!(found.map(|f| f.id), Some(m.id));
        let found = store.find_by_owner_and_name(&owner, "mnist").await.unwrap();
        assert_eq!(found.map(|f| f.id), Some(m.id));
    }

    #[tokio::test]
    async fn test_model_listing_respects_visibility() {
        let store = create_test_db().await;
        let alice = UserId::new();
        let bob = UserId::new();
        store
            .insert_model(&model(alice, "private", &"1".repeat(64), false))
            .await
            .unwrap();
        let public = model(alice, "public", &"2".repeat(64), true);
        store.insert_model(&public).await.unwrap();

        let page = Page::default();
        let for_alice = store
            .list_models(&alice, &ModelFilter::default(), page)
            .await
            .unwrap();
        assert_eq!(for_alice.total, 2);

        let for_bob = store
            .list_models(&bob, &ModelFilter::default(), page)
            .await
            .unwrap();
        assert_eq!(for_bob.total, 1);
        assert_eq!(for_bob.items[0].id, public.id);

        let public_only = ModelFilter {
            public_only: true,
            ..Default::default()
        };
        assert_eq!(
            store.list_models(&alice, &public_only, page).await.unwrap().total,
            1
        );

        store.set_visibility(&public.id, false).await.unwrap();
        assert_eq!(
            store
                .list_models(&bob, &ModelFilter::default(), page)
                .await
                .unwrap()
                .total,
            0
        );
    }

    #[tokio::test]
    async fn test_verification_history() {
        let store = create_test_db().await;
        let user = UserId::new();
        let m = seeded(&store, user).await;
        let j = job(&m, user);
        store.create_job(&j, 10).await.unwrap();

        for valid in [true, false] {
            let record = VerificationRecord::new(j.id, m.id, user, valid, 12);
            store.insert_verification(&record).await.unwrap();
        }

        let history = store.list_verifications(&j.id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|r| r.method == "ezkl"));
    }
}
