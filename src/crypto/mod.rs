//! Cryptographic utilities for the prover
//!
//! Provides:
//! - Streaming SHA-256 fingerprints of model files
//! - Canonical JSON hashing of submitted inputs
//! - Merkle commitments over model weight chunks, with inclusion proofs

mod hash;
mod merkle;

pub use hash::*;
pub use merkle::*;
