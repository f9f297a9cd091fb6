//! Seed loader.
//!
//! Seed files carry the version of the migration that introduced the data
//! they insert. After a run only the seeds in `(before, after]` execute, so
//! a database upgraded from 1.1 to 1.3 gets the seeds of 1.2 and 1.3 and
//! nothing it already has. Seeds are not recorded in the ledger.

use crate::driver::{Driver, ExecuteOptions};
use crate::error::MigrationError;
use crate::migrations::files::{MigrationFile, MigrationSet};
use crate::version::Version;

/// Seeds that a run from `before` to `after` should load, or all of them
/// when `force_reset` is set.
pub fn pending(
    seeds: &MigrationSet,
    before: Version,
    after: Version,
    force_reset: bool,
) -> Vec<&MigrationFile> {
    if force_reset {
        return seeds.iter().collect();
    }
    seeds.window(before, after).collect()
}

/// Executes pending seeds in version order, each through one
/// [`Driver::execute`] call. Stops at the first failure; migrations that
/// already ran are left as they are.
pub async fn load<D>(
    driver: &D,
    seeds: &MigrationSet,
    before: Version,
    after: Version,
    force_reset: bool,
) -> Result<Vec<String>, MigrationError>
where
    D: Driver + ?Sized,
{
    let pending = pending(seeds, before, after, force_reset);
    if pending.is_empty() {
        tracing::debug!(%before, %after, "No seed data to load");
        return Ok(Vec::new());
    }
    if force_reset {
        tracing::warn!("Reloading every seed file");
    }

    let mut applied = Vec::with_capacity(pending.len());
    for file in pending {
        tracing::info!(file = %file.name, version = %file.version, "Loading seed data");
        driver
            .execute(&file.body, ExecuteOptions::default())
            .await
            .map_err(|source| MigrationError::Seed {
                file: file.name.clone(),
                source,
            })?;
        applied.push(file.name.clone());
    }
    Ok(applied)
}
