//! schemaledger - versioned schema migrations with a per-engine history ledger.
//!
//! The crate applies ordered, embedded SQL migration files to a metadata
//! database exactly once, records every application in an engine-specific
//! migration history ledger, and exposes a pluggable driver interface for
//! Postgres, MySQL, MongoDB and an in-process backend.

pub mod cli;
pub mod config;
pub mod driver;
pub mod error;
pub mod migrations;
pub mod sql;
pub mod version;

pub use error::AppError;
pub use version::Version;
