//! SQLite persistence for models, proof jobs and verifications

mod store;

pub use store::SqliteStore;
