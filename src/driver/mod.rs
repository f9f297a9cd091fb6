//! Database drivers.
//!
//! A [`Driver`] is one connection to one engine. Engines that keep a
//! migration ledger also implement [`MigrationCapable`], which callers probe
//! for with [`Driver::as_migration`] or [`require_migration`]. Drivers are
//! opened through a [`Registry`], which maps each [`EngineType`] to a
//! [`DriverFactory`].
//!
//! # Example
//!
//! ```no_run
//! use schemaledger::driver::{
//!     require_migration, ConnectionConfig, ConnectionContext, DriverConfig, EngineType,
//!     MigrationHistoryFind, Registry,
//! };
//!
//! # async fn example() -> Result<(), schemaledger::error::DriverError> {
//! let registry = Registry::with_default_drivers();
//! let connection = ConnectionConfig {
//!     host: "localhost".into(),
//!     database: "meta".into(),
//!     ..Default::default()
//! };
//! let driver = registry
//!     .open(
//!         EngineType::Postgres,
//!         &DriverConfig::default(),
//!         &connection,
//!         &ConnectionContext::default(),
//!     )
//!     .await?;
//! let ledger = require_migration(driver.as_ref())?;
//! let latest = ledger
//!     .find_migration_history_list(&MigrationHistoryFind::namespace("meta").with_limit(1))
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod backends;
pub mod ledger;
pub mod registry;
pub mod tls;
pub mod traits;
pub mod types;

pub use registry::Registry;
pub use tls::{TlsConfig, TlsError};
pub use traits::{require_migration, Driver, DriverFactory, MigrationCapable};
pub use types::{
    ConnectionConfig, ConnectionContext, DriverConfig, EngineType, ExecuteOptions, FilePathError,
    FilterValue, MigrationHistory, MigrationHistoryFind, MigrationInfo, MigrationOutcome,
    MigrationSource, MigrationStatus, MigrationType,
};
