//! Apply command handler.

use std::path::PathBuf;

use clap::Args;
use color_eyre::Result;

use crate::config::Config;
use crate::driver::{require_migration, MigrationInfo};
use crate::error::AppError;

use super::{close_after, open_metadata};

/// Apply one migration file from a repository checkout.
#[derive(Debug, Args)]
pub struct ApplyCommand {
    /// Migration file, relative to the repository root
    pub file: PathBuf,

    /// Path template, e.g. `schema/{{ENV_NAME}}/{{DB_NAME}}__{{VERSION}}__{{TYPE}}__{{DESCRIPTION}}.sql`
    #[arg(short, long)]
    pub template: String,

    /// Issue the change belongs to
    #[arg(long)]
    pub issue: Option<String>,

    /// Create the target database if it does not exist
    #[arg(long)]
    pub create_database: bool,

    /// Retry a PENDING/FAILED history row for this version
    #[arg(long)]
    pub force: bool,
}

impl ApplyCommand {
    pub async fn run(&self) -> Result<()> {
        let config = Config::load()?;
        let path = self.file.to_string_lossy();
        let statement = std::fs::read_to_string(&self.file).map_err(|source| AppError::Io {
            path: path.to_string(),
            source,
        })?;

        let mut info =
            MigrationInfo::from_file_path(&path, &self.template).map_err(AppError::from)?;
        info.issue_id = self.issue.clone();
        info.create_database = self.create_database;
        info.force = self.force;
        info.release_version = config
            .migration
            .release_version
            .clone()
            .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string());
        info.creator = config.migration.creator.clone().unwrap_or_default();
        info.payload = Some(serde_json::json!({ "file": path }));

        let driver = open_metadata(&config).await?;
        let outcome = close_after(driver.as_ref(), async {
            let ledger = require_migration(driver.as_ref())?;
            ledger.setup_migration_if_needed().await?;

            tracing::info!(
                database = %info.database,
                version = %info.version,
                migration_type = %info.migration_type,
                "Applying {}",
                path
            );
            Ok::<_, color_eyre::Report>(ledger.execute_migration(&info, &statement).await?)
        })
        .await?;

        if outcome.already_applied {
            tracing::info!(history_id = %outcome.history_id, "Version already applied");
        } else {
            tracing::info!(
                history_id = %outcome.history_id,
                "Applied in {:.1}ms",
                outcome.duration_ns as f64 / 1_000_000.0
            );
        }
        Ok(())
    }
}
