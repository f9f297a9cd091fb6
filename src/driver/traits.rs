//! Core traits for database driver abstraction.
//!
//! This module defines the trait hierarchy that backends implement:
//!
//! - [`Driver`] - Required for every engine: liveness, teardown, raw execution
//! - [`MigrationCapable`] - Optional capability for engines that keep a
//!   migration history ledger
//! - [`DriverFactory`] - Builds a connected driver; registered per engine in
//!   a [`Registry`](crate::driver::Registry)

use async_trait::async_trait;

use crate::driver::types::{
    ConnectionConfig, ConnectionContext, DriverConfig, EngineType, ExecuteOptions,
    MigrationHistory, MigrationHistoryFind, MigrationInfo, MigrationOutcome,
};
use crate::error::DriverError;

/// A connection to one database engine.
#[async_trait]
pub trait Driver: Send + Sync {
    fn engine(&self) -> EngineType;

    /// Lightweight liveness check.
    async fn ping(&self) -> Result<(), DriverError>;

    /// Releases every resource. Safe to call more than once.
    async fn close(&self) -> Result<(), DriverError>;

    /// Runs a possibly multi-statement body against the connected database
    /// and returns the number of affected rows.
    async fn execute(&self, statement: &str, options: ExecuteOptions) -> Result<i64, DriverError>;

    /// Probes for the migration history capability.
    fn as_migration(&self) -> Option<&dyn MigrationCapable> {
        None
    }
}

/// Migration history capability.
///
/// `execute_migration` runs a statement and records exactly one ledger row
/// for it. Where the engine allows, both happen in one transaction; where it
/// does not, the row goes through PENDING before DONE or FAILED so a crash in
/// between stays visible.
#[async_trait]
pub trait MigrationCapable: Driver {
    /// True iff the ledger table/collection does not exist yet.
    async fn needs_setup_migration(&self) -> Result<bool, DriverError>;

    /// Creates the ledger if missing. Safe against concurrent callers.
    async fn setup_migration_if_needed(&self) -> Result<(), DriverError>;

    async fn execute_migration(
        &self,
        info: &MigrationInfo,
        statement: &str,
    ) -> Result<MigrationOutcome, DriverError>;

    /// Ledger rows matching `find`, most recent first.
    async fn find_migration_history_list(
        &self,
        find: &MigrationHistoryFind,
    ) -> Result<Vec<MigrationHistory>, DriverError>;
}

/// Returns the migration capability or an `Unsupported` error.
pub fn require_migration(driver: &dyn Driver) -> Result<&dyn MigrationCapable, DriverError> {
    driver.as_migration().ok_or(DriverError::Unsupported {
        engine: driver.engine(),
        capability: "migration history",
    })
}

/// Builds connected drivers for one engine.
#[async_trait]
pub trait DriverFactory: Send + Sync {
    async fn open(
        &self,
        engine: EngineType,
        config: &DriverConfig,
        connection: &ConnectionConfig,
        context: &ConnectionContext,
    ) -> Result<Box<dyn Driver>, DriverError>;
}
