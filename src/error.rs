//! Error types for drivers, the migration runner and the application.

use thiserror::Error;

use crate::driver::tls::TlsError;
use crate::driver::{EngineType, FilePathError, MigrationStatus};
use crate::version::{Version, VersionError};

/// Maximum statement length echoed back in execution errors.
const STATEMENT_PREVIEW: usize = 200;

/// Errors raised by database drivers and the history ledger.
///
/// Transaction begin, statement execution and commit failures are kept
/// apart so an operator can tell which step broke.
#[derive(Error, Debug)]
pub enum DriverError {
    #[error("no driver registered for engine {0}")]
    UnknownDriver(EngineType),

    #[error("{engine} driver does not support {capability}")]
    Unsupported {
        engine: EngineType,
        capability: &'static str,
    },

    #[error("invalid connection config: {0}")]
    Config(String),

    #[error("TLS configuration error: {0}")]
    Tls(#[from] TlsError),

    #[error("failed to connect to {engine}: {message}")]
    Connect { engine: EngineType, message: String },

    #[error("ping failed: {0}")]
    Ping(String),

    #[error("failed to begin transaction: {0}")]
    Begin(String),

    #[error("failed to execute statement {statement:?}: {message}")]
    Execute { message: String, statement: String },

    #[error("failed to commit transaction: {0}")]
    Commit(String),

    #[error("failed to rollback transaction: {0}")]
    Rollback(String),

    #[error("failed to set up migration history: {0}")]
    Setup(String),

    #[error("failed to query migration history: {0}")]
    Query(String),

    #[error("failed to insert migration history: {0}")]
    HistoryInsert(String),

    #[error("failed to update migration history {id}: {message}")]
    HistoryUpdate { id: String, message: String },

    /// The statement ran but its ledger row could not be marked done.
    #[error(
        "version {version} of {namespace:?} was applied but history row {id} could not be \
         marked DONE ({message}); reconcile before retrying"
    )]
    HistoryNotRecorded {
        namespace: String,
        version: String,
        id: String,
        message: String,
    },

    #[error("version {version} of {namespace:?} has already been applied")]
    DuplicateVersion { namespace: String, version: String },

    #[error("concurrent migration detected for {namespace:?}, retry once it finishes")]
    ConcurrentMigration { namespace: String },

    #[error(
        "version {version} of {namespace:?} is {status} in migration history; \
         reconcile it or retry with force"
    )]
    Unresolved {
        namespace: String,
        version: String,
        status: MigrationStatus,
    },

    #[error(
        "{namespace:?} has already applied version {applied}, which is not older than {version}"
    )]
    OutOfOrder {
        namespace: String,
        version: String,
        applied: String,
    },
}

impl DriverError {
    /// Builds an execution error carrying a bounded preview of the statement.
    pub fn execute(message: impl Into<String>, statement: &str) -> Self {
        let statement = match statement.char_indices().nth(STATEMENT_PREVIEW) {
            Some((cut, _)) => format!("{}...", &statement[..cut]),
            None => statement.to_string(),
        };
        Self::Execute {
            message: message.into(),
            statement,
        }
    }
}

/// Errors raised by the migration runner and seed loader.
#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("invalid migration file name {name:?}: {reason}")]
    InvalidFileName { name: String, reason: String },

    #[error("migration file {name:?} is not valid UTF-8")]
    InvalidEncoding { name: String },

    #[error("duplicate migration version {version}: {first} and {second}")]
    DuplicateVersion {
        version: Version,
        first: String,
        second: String,
    },

    #[error(transparent)]
    Version(#[from] VersionError),

    #[error("stored schema version {0:?} is not a valid integer version")]
    InvalidStoredVersion(String),

    #[error(
        "schema major version mismatch: database is at {current}, \
         this binary supports major version {supported}"
    )]
    MajorVersionMismatch { current: Version, supported: u32 },

    #[error(
        "most recent migration of {namespace:?} (version {version}) is {status}; \
         reconcile migration history before migrating"
    )]
    UnresolvedHistory {
        namespace: String,
        version: String,
        status: MigrationStatus,
    },

    #[error("no migration file for sentinel version {0}; cannot create database")]
    MissingBootstrap(Version),

    #[error("failed to create database at version {version}: {source}")]
    Bootstrap {
        version: Version,
        #[source]
        source: DriverError,
    },

    #[error("failed to apply migration {file} (version {version}): {source}")]
    Apply {
        file: String,
        version: Version,
        #[source]
        source: DriverError,
    },

    #[error("failed to apply seed {file}: {source}")]
    Seed {
        file: String,
        #[source]
        source: DriverError,
    },

    #[error(transparent)]
    Driver(#[from] DriverError),
}

/// Application-level errors.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error(transparent)]
    Migration(#[from] MigrationError),

    #[error(transparent)]
    Version(#[from] VersionError),

    #[error("Invalid migration file path: {0}")]
    FilePath(#[from] FilePathError),

    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}
