//! History command handler.

use color_eyre::Result;

use crate::config::Config;
use crate::driver::{require_migration, MigrationHistory};
use crate::migrations::Migrator;

use super::{close_after, migrator_options, open_metadata, App};

impl App {
    /// Print the most recent ledger rows.
    pub async fn run_history(&self, limit: usize) -> Result<()> {
        let config = Config::load()?;
        let driver = open_metadata(&config).await?;
        let rows = close_after(driver.as_ref(), async {
            let ledger = require_migration(driver.as_ref())?;
            let migrator = Migrator::embedded(ledger, migrator_options(&config))?;
            Ok::<_, color_eyre::Report>(migrator.history(Some(limit)).await?)
        })
        .await?;

        if rows.is_empty() {
            println!("No migration history for {}", config.namespace());
        }
        for row in &rows {
            println!("{}", format_row(row));
        }
        Ok(())
    }
}

pub(super) fn format_row(row: &MigrationHistory) -> String {
    let applied_at = chrono::DateTime::from_timestamp(row.created_ts, 0)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| row.created_ts.to_string());
    format!(
        "#{:<4} {:<8} {:<8} {:<7} v{:<14} {} {:>8.1}ms  {}",
        row.sequence,
        row.migration_type.as_str(),
        row.source.as_str(),
        row.status.as_str(),
        row.version,
        applied_at,
        row.execution_duration_ns as f64 / 1_000_000.0,
        row.description
    )
}
