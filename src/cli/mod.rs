//! CLI module for schemaledger.
//!
//! Subcommands:
//! - `migrate`: Apply pending migrations and seed data
//! - `status`: Show the current and supported schema versions
//! - `history`: List migration history rows
//! - `reconcile`: List PENDING/FAILED history rows left by interrupted runs
//! - `apply`: Apply one repository migration file named after a path template

mod apply;
mod history;
mod migrate;
mod reconcile;
mod status;

use std::future::Future;

use clap::{Parser, Subcommand};

use crate::config::Config;
use crate::driver::{Driver, Registry};
use crate::error::AppError;
use crate::migrations::MigratorOptions;

pub use apply::ApplyCommand;

/// schemaledger - versioned schema migrations
#[derive(Parser)]
#[command(name = "schemaledger")]
#[command(about = "Versioned schema migrations with a per-engine migration history ledger")]
#[command(version)]
pub struct App {
    /// Run in verbose mode
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Apply pending migrations, then load seed data for the new versions
    Migrate {
        /// Reload every seed file, not only the new ones
        #[arg(long)]
        force_reset_seed: bool,

        /// Retry PENDING/FAILED history rows instead of refusing to run
        #[arg(long)]
        force: bool,
    },

    /// Show the current and supported schema versions
    Status,

    /// List migration history, most recent first
    History {
        /// Maximum number of rows to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// List history rows that are not DONE
    Reconcile,

    /// Apply one migration file whose path follows a template
    Apply(ApplyCommand),
}

impl App {
    /// Run the CLI application.
    pub async fn run(self) -> color_eyre::Result<()> {
        match self.command {
            Command::Migrate {
                force_reset_seed,
                force,
            } => self.run_migrate(force_reset_seed, force).await,
            Command::Status => self.run_status().await,
            Command::History { limit } => self.run_history(limit).await,
            Command::Reconcile => self.run_reconcile().await,
            Command::Apply(ref cmd) => cmd.run().await,
        }
    }
}

/// Opens the metadata database described by `config`.
async fn open_metadata(config: &Config) -> Result<Box<dyn Driver>, AppError> {
    let engine = config.metadata.engine;
    tracing::info!(
        "Connecting to {} at {}",
        engine,
        config.metadata.connection.target(engine)
    );
    let registry = Registry::with_default_drivers();
    let driver = registry
        .open(
            engine,
            &config.driver_config(),
            &config.metadata.connection,
            &config.connection_context(),
        )
        .await?;
    Ok(driver)
}

/// Runs `work`, then closes `driver` whatever the outcome. A failed close
/// is logged and never masks the result of `work`.
async fn close_after<T, F>(driver: &dyn Driver, work: F) -> color_eyre::Result<T>
where
    F: Future<Output = color_eyre::Result<T>>,
{
    let result = work.await;
    if let Err(e) = driver.close().await {
        tracing::warn!("Failed to close driver: {}", e);
    }
    result
}

fn migrator_options(config: &Config) -> MigratorOptions {
    let mut options = MigratorOptions::new(config.namespace());
    options.force_reset_seed = config.migration.force_reset_seed;
    options.force = config.migration.force;
    options.create_database = config.migration.create_database;
    if let Some(release_version) = &config.migration.release_version {
        options.release_version = release_version.clone();
    }
    if let Some(creator) = &config.migration.creator {
        options.creator = creator.clone();
    }
    options
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::backends::memory::{MemoryDriver, MemoryOptions, MemoryStore};
    use crate::driver::{require_migration, MigrationHistoryFind};

    #[tokio::test]
    async fn test_close_after_closes_driver_when_work_fails() {
        let store = MemoryStore::new();
        let driver = MemoryDriver::new(store.clone(), MemoryOptions::default());

        let result: color_eyre::Result<()> = close_after(&driver, async {
            Err(color_eyre::eyre::eyre!("failed to query migration history"))
        })
        .await;

        assert!(result.is_err());
        assert!(store.is_closed());
    }

    #[tokio::test]
    async fn test_close_after_returns_work_result() {
        let store = MemoryStore::new();
        let driver = MemoryDriver::new(store.clone(), MemoryOptions::default());

        let rows = close_after(&driver, async {
            let ledger = require_migration(&driver)?;
            ledger.setup_migration_if_needed().await?;
            let rows = ledger
                .find_migration_history_list(&MigrationHistoryFind::namespace("meta"))
                .await?;
            Ok::<_, color_eyre::Report>(rows)
        })
        .await
        .unwrap();

        assert!(rows.is_empty());
        assert!(store.is_closed());
    }
}
