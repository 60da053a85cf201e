//! HTTP server bootstrap for the prover.
//!
//! This module wires together:
//! - configuration
//! - the SQLite pool and migrations
//! - the proving engine, artifact cache and pipeline
//! - background workers (task runner, retention sweeper)
//! - the Axum router

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::auth::{ApiKeyValidator, AuthMiddlewareState, Authenticator};
use crate::engine::{EzklCli, EzklCliConfig, ProvingEngine};
use crate::infra::{
    shutdown_signal, spawn_retention_sweeper, spawn_task_runner, ArtifactCache, RetentionConfig,
    RetentionSweeper, ShutdownConfig, ShutdownCoordinator, SqliteStore, TaskRunner,
    TaskRunnerConfig,
};
use crate::metrics::MetricsRegistry;
use crate::pipeline::ProofPipeline;
use crate::service::{ModelRegistry, ProofService, ProofServiceConfig};
use crate::telemetry::{init_telemetry, TelemetryConfig};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite connection URL.
    pub database_url: String,
    /// Server listen address.
    pub listen_addr: SocketAddr,
    /// Maximum database connections.
    pub max_connections: u32,
    /// Root of the per-job directories.
    pub proofs_dir: PathBuf,
    /// Base for relative model paths given at registration.
    pub models_dir: PathBuf,
    /// Root of the setup artifact cache.
    pub cache_dir: PathBuf,
    /// Pending plus processing jobs allowed per user.
    pub max_active_jobs: u32,
    pub migrate_on_startup: bool,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://veranode.db?mode=rwc".to_string());

        let port: u16 = std::env::var("PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(8000);

        let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());

        let listen_addr: SocketAddr = format!("{host}:{port}")
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid listen address {host}:{port}: {e}"))?;

        let max_connections: u32 = std::env::var("MAX_DB_CONNECTIONS")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(5);

        let proofs_dir = std::env::var("PROOFS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data/proofs"));
        let models_dir = std::env::var("MODELS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data/models"));
        let cache_dir = std::env::var("CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| proofs_dir.join("_cache"));

        let max_active_jobs = std::env::var("MAX_ACTIVE_JOBS_PER_USER")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(10);

        let migrate_on_startup = std::env::var("DB_MIGRATE_ON_STARTUP")
            .ok()
            .map(|v| {
                !matches!(
                    v.trim().to_ascii_lowercase().as_str(),
                    "0" | "false" | "off"
                )
            })
            .unwrap_or(true);

        Ok(Self {
            database_url,
            listen_addr,
            max_connections,
            proofs_dir,
            models_dir,
            cache_dir,
            max_active_jobs,
            migrate_on_startup,
        })
    }

    pub fn proof_service(&self) -> ProofServiceConfig {
        ProofServiceConfig {
            proofs_dir: self.proofs_dir.clone(),
            max_active_jobs: self.max_active_jobs,
        }
    }
}

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub models: Arc<ModelRegistry>,
    pub proofs: Arc<ProofService>,
    pub cache: Arc<ArtifactCache>,
    pub metrics: Arc<MetricsRegistry>,
    pub pool: SqlitePool,
}

/// Start the HTTP server and background workers.
pub async fn run() -> anyhow::Result<()> {
    init_telemetry(&TelemetryConfig::from_env())
        .map_err(|e| anyhow::anyhow!("failed to initialise logging: {e}"))?;

    info!("Starting VeraNode prover v{}", env!("CARGO_PKG_VERSION"));

    let auth_state = auth_state_from_env()?;

    let config = Config::from_env()?;
    info!("Configuration loaded");
    info!("  Listen address: {}", config.listen_addr);
    info!("  Proofs directory: {}", config.proofs_dir.display());
    info!("  Cache directory: {}", config.cache_dir.display());

    for dir in [&config.proofs_dir, &config.cache_dir, &config.models_dir] {
        std::fs::create_dir_all(dir)?;
    }

    info!("Connecting to SQLite...");
    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.database_url)
        .await?;
    info!("Connected to SQLite");

    if config.migrate_on_startup {
        info!("Running database migrations...");
        crate::migrations::run_sqlite(&pool).await?;
        info!("Database migrations applied");
    } else {
        info!("DB migrations skipped (DB_MIGRATE_ON_STARTUP=0)");
    }

    let store = Arc::new(SqliteStore::new(pool.clone()));
    let metrics = Arc::new(MetricsRegistry::new());
    let cache = Arc::new(ArtifactCache::new(&config.cache_dir));
    let engine: Arc<dyn ProvingEngine> = Arc::new(EzklCli::new(EzklCliConfig::from_env()));
    let pipeline = Arc::new(ProofPipeline::new(Arc::clone(&engine), Arc::clone(&cache)));

    let coordinator = ShutdownCoordinator::new();

    let runner = TaskRunner::new(
        TaskRunnerConfig::from_env(),
        store.clone(),
        store.clone(),
        pipeline,
        metrics.clone(),
        coordinator.subscribe(),
    );
    let (runner_handle, queue) = spawn_task_runner(runner);
    coordinator.track("task_runner", runner_handle).await;

    let sweeper = RetentionSweeper::new(RetentionConfig::from_env(), store.clone(), metrics.clone());
    coordinator
        .track(
            "retention_sweeper",
            spawn_retention_sweeper(sweeper, coordinator.subscribe()),
        )
        .await;

    let models = Arc::new(ModelRegistry::new(
        store.clone(),
        &config.models_dir,
        metrics.clone(),
    ));
    let proofs = Arc::new(ProofService::new(
        config.proof_service(),
        store.clone(),
        store.clone(),
        store,
        engine,
        queue,
        metrics.clone(),
    ));

    let state = AppState {
        models,
        proofs,
        cache,
        metrics,
        pool: pool.clone(),
    };

    let app = build_router(auth_state)?.with_state(state);

    info!("Starting HTTP server on {}", config.listen_addr);
    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;

    info!("VeraNode prover is ready to accept connections");
    let stopped = coordinator.signal();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = shutdown_signal() => {}
                _ = stopped.wait() => {}
            }
        })
        .await?;

    if !coordinator.shutdown(&ShutdownConfig::from_env()).await {
        warn!("Some background tasks were still running at exit; their jobs resume on next start");
    }
    pool.close().await;

    Ok(())
}

fn auth_state_from_env() -> anyhow::Result<AuthMiddlewareState> {
    let auth_mode = std::env::var("AUTH_MODE").unwrap_or_else(|_| "required".to_string());
    let require_auth = auth_mode != "disabled";

    let validator = match std::env::var("API_KEYS") {
        Ok(entries) => ApiKeyValidator::parse(&entries)?,
        Err(_) => ApiKeyValidator::new(),
    };

    if require_auth && validator.is_empty() {
        anyhow::bail!(
            "AUTH_MODE=required but no API keys are configured; set API_KEYS (or set AUTH_MODE=disabled for local dev)"
        );
    }
    if !require_auth {
        warn!("Authentication disabled; every request runs as the anonymous user");
    }
    info!("  API keys configured: {}", validator.len());

    Ok(AuthMiddlewareState {
        authenticator: Arc::new(Authenticator::new(Arc::new(validator))),
        require_auth,
    })
}

/// Build the full router: authenticated `/api` plus open health and metrics routes.
pub fn build_router(auth_state: AuthMiddlewareState) -> anyhow::Result<Router<AppState>> {
    let api = crate::api::router().layer(axum::middleware::from_fn_with_state(
        auth_state,
        crate::auth::auth_middleware,
    ));

    let mut router = Router::new()
        .nest("/api", api)
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(metrics_export))
        .route("/metrics/json", get(metrics_json))
        .layer(TraceLayer::new_for_http());

    if let Some(cors_layer) = cors_layer_from_env()? {
        router = router.layer(cors_layer);
    }

    Ok(router)
}

fn cors_layer_from_env() -> anyhow::Result<Option<CorsLayer>> {
    let origins = match std::env::var("CORS_ALLOW_ORIGINS") {
        Ok(v) => v,
        Err(_) => return Ok(None),
    };

    let origins = origins.trim();
    if origins.is_empty() {
        return Ok(None);
    }

    let allow_origin = if origins == "*" {
        AllowOrigin::any()
    } else {
        let origins: Vec<HeaderValue> = origins
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<HeaderValue>()
                    .map_err(|e| anyhow::anyhow!("Invalid CORS origin {s:?}: {e}"))
            })
            .collect::<anyhow::Result<_>>()?;
        AllowOrigin::list(origins)
    };

    Ok(Some(
        CorsLayer::new()
            .allow_origin(allow_origin)
            .allow_methods([Method::GET, Method::POST, Method::PATCH])
            .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]),
    ))
}

/// Health check endpoint.
async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "veranode-prover",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Readiness check endpoint.
async fn readiness_check(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    match sqlx::query("SELECT 1").execute(&state.pool).await {
        Ok(_) => Ok(Json(serde_json::json!({
            "status": "ready",
            "database": "connected",
            "cache": state.cache.stats().to_json(),
        }))),
        Err(e) => Err((
            StatusCode::SERVICE_UNAVAILABLE,
            format!("Database unavailable: {}", e),
        )),
    }
}

/// Prometheus text export.
async fn metrics_export(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.to_prometheus().await,
    )
}

/// JSON snapshot of every metric plus cache statistics.
async fn metrics_json(State(state): State<AppState>) -> Json<serde_json::Value> {
    let mut snapshot = state.metrics.to_json().await;
    if let Some(obj) = snapshot.as_object_mut() {
        obj.insert("artifact_cache".to_string(), state.cache.stats().to_json());
    }
    Json(snapshot)
}
