//! Domain models for the prover
//!
//! Models, proof jobs and their state machine, verification records, and the
//! on-disk artifact layout shared by the pipeline and the cache.

mod artifact;
mod job;
mod model;
mod types;
mod verification;

pub use artifact::*;
pub use job::*;
pub use model::*;
pub use types::*;
pub use verification::*;
