//! VeraNode Prover Library
//!
//! Registers machine-learning models, commits to their weights, and drives
//! zero-knowledge proof jobs through a persistent, retrying pipeline.
//!
//! ## Modules
//!
//! - [`domain`] - Core domain types (models, jobs, verifications, job layout)
//! - [`crypto`] - Content fingerprints and Merkle commitments
//! - [`engine`] - Proving engine capability and the `ezkl` binding
//! - [`pipeline`] - Ordered proof stages with setup caching
//! - [`infra`] - Persistence, artifact cache, task runner, retention
//! - [`service`] - Model registry and proof service
//! - [`auth`] - API key authentication
//! - [`metrics`] - Counters, gauges and histograms
//! - [`telemetry`] - Logging setup
//! - [`api`] - REST API routes

pub mod api;
pub mod auth;
pub mod crypto;
pub mod domain;
pub mod engine;
pub mod infra;
pub mod metrics;
pub mod migrations;
pub mod pipeline;
pub mod server;
pub mod service;
pub mod telemetry;

// Re-export commonly used types
pub use domain::{
    JobId, JobStatus, ModelEntry, ModelFormat, ModelId, ProofJob, UserId, VerificationRecord,
};

pub use infra::{ErrorKind, JobStore, ModelStore, ProverError, Result, VerificationStore};
