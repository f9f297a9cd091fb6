//! Migrate command handler.

use color_eyre::Result;

use crate::config::Config;
use crate::driver::require_migration;
use crate::migrations::Migrator;

use super::{close_after, migrator_options, open_metadata, App};

impl App {
    /// Apply pending migrations and the seed data they introduce.
    pub async fn run_migrate(&self, force_reset_seed: bool, force: bool) -> Result<()> {
        let config = Config::load()?;
        let mut options = migrator_options(&config);
        options.force_reset_seed |= force_reset_seed;
        options.force |= force;

        let driver = open_metadata(&config).await?;
        let result = close_after(driver.as_ref(), async {
            let ledger = require_migration(driver.as_ref())?;
            let migrator = Migrator::embedded(ledger, options)?;
            Ok::<_, color_eyre::Report>(migrator.run().await?)
        })
        .await?;

        if result.applied_migrations.is_empty() {
            tracing::info!(
                "Database already at v{}, no migrations needed",
                result.current_version
            );
        } else {
            tracing::info!(
                "Migrations complete: v{} -> v{}, applied: {:?}",
                result.previous_version,
                result.current_version,
                result.applied_migrations
            );
        }
        if !result.skipped_migrations.is_empty() {
            tracing::warn!(
                "Skipped migrations newer than this binary: {:?}",
                result.skipped_migrations
            );
        }
        if !result.applied_seeds.is_empty() {
            tracing::info!("Loaded seed data: {:?}", result.applied_seeds);
        }
        if !result.checksum_mismatches.is_empty() {
            tracing::warn!(
                "Migration files changed after they were applied: {:?}",
                result.checksum_mismatches
            );
        }
        Ok(())
    }
}
