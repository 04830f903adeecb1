//! Contextual store
//!
//! SQLite storage for committed cycles:
//! - Schema migrations (additive after version 1)
//! - Transactional, idempotent cycle commit
//! - Query API over cycles and file history

pub mod repo;
pub mod schema;

pub use repo::{CommitOutcome, CycleFilter, Database};
