//! Application services behind the REST API
//!
//! - [`ModelRegistry`] registers model files and manages their visibility
//! - [`ProofService`] accepts proof submissions, answers status queries and
//!   verifies finished proofs

mod models;
mod proofs;

pub use models::ModelRegistry;
pub use proofs::{ProofService, ProofServiceConfig, SubmitProof};
