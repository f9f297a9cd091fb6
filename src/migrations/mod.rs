//! Versioned schema migrations.
//!
//! Migration files are embedded from `migration/` and applied in version
//! order through a driver's migration ledger by the [`Migrator`]. Seed files
//! from `seed/` run afterwards for the versions the run reached.
//!
//! Migrations are:
//! - **Forward-only**: No rollback support - ship a compensating migration
//! - **Exactly-once**: A DONE ledger row marks a version as applied
//! - **Ordered**: Applied strictly by ascending version, one at a time

mod files;
mod runner;
pub mod seed;

pub use files::{MigrationFile, MigrationSet};
pub use runner::{MigrationResult, Migrator, MigratorOptions};

use crate::version::Version;

/// Major schema version this binary understands.
pub const MAJOR_SCHEMA_VERSION: u32 = 1;

/// Newest schema version this binary may apply.
pub const SCHEMA_VERSION: Version = Version::from_int(10002);
