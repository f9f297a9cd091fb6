//! Status command handler.

use color_eyre::Result;

use crate::config::Config;
use crate::driver::require_migration;
use crate::migrations::{Migrator, MAJOR_SCHEMA_VERSION, SCHEMA_VERSION};

use super::{close_after, migrator_options, open_metadata, App};

impl App {
    /// Print the stored schema version next to what this binary supports.
    pub async fn run_status(&self) -> Result<()> {
        let config = Config::load()?;
        let driver = open_metadata(&config).await?;

        println!("Engine:            {}", config.metadata.engine);
        println!("Namespace:         {}", config.namespace());
        println!(
            "Supported version: {} (major {})",
            SCHEMA_VERSION, MAJOR_SCHEMA_VERSION
        );

        close_after(driver.as_ref(), async {
            let ledger = require_migration(driver.as_ref())?;
            if ledger.needs_setup_migration().await? {
                println!("Current version:   none (migration history not set up)");
                return Ok(());
            }
            let migrator = Migrator::embedded(ledger, migrator_options(&config))?;
            match migrator.current_version().await {
                Ok(current) => {
                    println!("Current version:   {current}");
                    let pending: Vec<_> = migrator.pending(current).collect();
                    println!("Pending files:     {}", pending.len());
                    for file in pending {
                        println!("  {}", file.name);
                    }
                }
                Err(e) => println!("Current version:   unknown ({e})"),
            }
            Ok::<_, color_eyre::Report>(())
        })
        .await
    }
}
