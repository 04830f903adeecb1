//! # contextlog-core
//!
//! Core library for contextlog - a contextual changelog for coding-assistant
//! sessions. It records not just *what* changed but *why*, using the
//! assistant's own transcript as the source of intent.
//!
//! This library provides:
//! - Hook event parsing and dispatch ([`hook`], [`engine`])
//! - Per-agent ephemeral tool logs ([`recorder`])
//! - Transcript reading and intent extraction ([`transcript`])
//! - Cycle aggregation into a SQLite store ([`aggregate`], [`db`])
//! - Retention of ephemeral logs ([`retention`])
//! - Layered settings and logging infrastructure
//!
//! ## Data flow
//!
//! Tool events are appended to one log per agent while a request is in
//! flight. When the main agent stops, the aggregator reads the transcript,
//! infers the intent, merges every agent log into one [`Cycle`] with its
//! child rows and commits them in a single transaction. Only then does the
//! retention manager delete superseded logs.
//!
//! ## Example
//!
//! ```rust,no_run
//! use contextlog_core::{Database, ResolvedSettings};
//! use contextlog_core::config::EnginePaths;
//!
//! let settings = ResolvedSettings::resolve(None);
//! let paths = EnginePaths::resolve(&settings);
//!
//! let db = Database::open(&paths.database).expect("failed to open database");
//! db.migrate().expect("failed to run migrations");
//! for cycle in db.recent_cycles(5).expect("query failed") {
//!     println!("#{} {}: {}", cycle.cycle_id, cycle.primary_activity, cycle.user_intent);
//! }
//! ```

// Re-export commonly used items at the crate root
pub use config::{EnginePaths, ResolvedSettings};
pub use db::{CommitOutcome, CycleFilter, Database};
pub use error::{Error, Result};
pub use hook::{HookEvent, HookResponse};
pub use types::*;

// Public modules
pub mod aggregate;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod hook;
pub mod logging;
pub mod recorder;
pub mod retention;
pub mod transcript;
pub mod types;
