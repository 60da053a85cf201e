//! REST API layer for the prover

mod error;
mod rest;
mod types;

pub use error::{ApiError, ErrorCode, ErrorDetails, QUOTA_RETRY_AFTER_SECS};
pub use rest::router;
pub use types::*;
