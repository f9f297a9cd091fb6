//! Reconcile command handler.
//!
//! A PENDING row means a run stopped between executing a statement and
//! recording it; a FAILED row means the statement failed on an engine whose
//! DDL is not transactional, so part of it may have taken effect. Both need
//! a human to compare the database with the statement before retrying with
//! `migrate --force`.

use color_eyre::Result;

use crate::config::Config;
use crate::driver::require_migration;
use crate::migrations::Migrator;

use super::history::format_row;
use super::{close_after, migrator_options, open_metadata, App};

impl App {
    pub async fn run_reconcile(&self) -> Result<()> {
        let config = Config::load()?;
        let driver = open_metadata(&config).await?;
        let rows = close_after(driver.as_ref(), async {
            let ledger = require_migration(driver.as_ref())?;
            let migrator = Migrator::embedded(ledger, migrator_options(&config))?;
            Ok::<_, color_eyre::Report>(migrator.unresolved().await?)
        })
        .await?;

        if rows.is_empty() {
            println!("Migration history of {} is consistent", config.namespace());
        } else {
            println!(
                "{} unresolved migration(s) in {}:",
                rows.len(),
                config.namespace()
            );
            for row in &rows {
                println!("{}", format_row(row));
                println!("    checksum {}", row.checksum);
            }
            println!(
                "Verify whether each statement took effect, then rerun with `migrate --force`."
            );
        }
        Ok(())
    }
}
