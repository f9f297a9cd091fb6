//! Migration orchestrator.

use std::collections::HashMap;

use crate::driver::ledger;
use crate::driver::{
    MigrationCapable, MigrationHistory, MigrationHistoryFind, MigrationInfo, MigrationSource,
    MigrationStatus, MigrationType,
};
use crate::error::MigrationError;
use crate::migrations::files::{MigrationFile, MigrationSet};
use crate::migrations::seed;
use crate::migrations::{MAJOR_SCHEMA_VERSION, SCHEMA_VERSION};
use crate::version::Version;

/// Knobs for one orchestrator run.
#[derive(Debug, Clone)]
pub struct MigratorOptions {
    /// Namespace (and database) the migrations belong to.
    pub namespace: String,
    /// Major version this binary understands.
    pub major_version: u32,
    /// Newest version this binary may apply. Newer files are skipped.
    pub max_version: Version,
    /// Run every seed file, not only the ones the run made reachable.
    pub force_reset_seed: bool,
    /// Retry PENDING/FAILED history rows instead of refusing to run.
    pub force: bool,
    pub create_database: bool,
    pub release_version: String,
    pub creator: String,
}

impl MigratorOptions {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            major_version: MAJOR_SCHEMA_VERSION,
            max_version: SCHEMA_VERSION,
            force_reset_seed: false,
            force: false,
            create_database: false,
            release_version: env!("CARGO_PKG_VERSION").to_string(),
            creator: "schemaledger".to_string(),
        }
    }
}

/// Result of running migrations.
#[derive(Debug, Clone, Default)]
pub struct MigrationResult {
    /// Schema version before migrations ran.
    pub previous_version: Version,
    /// Schema version after migrations ran.
    pub current_version: Version,
    /// Names of migration files that were applied, bootstrap included.
    pub applied_migrations: Vec<String>,
    /// Files newer than this binary supports.
    pub skipped_migrations: Vec<String>,
    /// Names of seed files that ran.
    pub applied_seeds: Vec<String>,
    /// Applied files whose body no longer matches the recorded checksum.
    pub checksum_mismatches: Vec<String>,
}

/// Applies embedded migration files through a driver's ledger.
///
/// One run is strictly sequential: each file goes through
/// [`MigrationCapable::execute_migration`] and the next one starts only
/// after the previous one is recorded. Any failure stops the run; files
/// already recorded stay recorded and the next run resumes after them.
pub struct Migrator<'a> {
    driver: &'a dyn MigrationCapable,
    migrations: MigrationSet,
    seeds: MigrationSet,
    options: MigratorOptions,
}

impl<'a> Migrator<'a> {
    pub fn new(
        driver: &'a dyn MigrationCapable,
        migrations: MigrationSet,
        seeds: MigrationSet,
        options: MigratorOptions,
    ) -> Self {
        Self {
            driver,
            migrations,
            seeds,
            options,
        }
    }

    /// A migrator over the files compiled into the binary.
    pub fn embedded(
        driver: &'a dyn MigrationCapable,
        options: MigratorOptions,
    ) -> Result<Self, MigrationError> {
        Ok(Self::new(
            driver,
            MigrationSet::embedded_migrations()?,
            MigrationSet::embedded_seeds()?,
            options,
        ))
    }

    pub fn options(&self) -> &MigratorOptions {
        &self.options
    }

    /// Files a run starting at `current` would apply.
    pub fn pending(&self, current: Version) -> impl Iterator<Item = &MigrationFile> {
        self.migrations.window(current, self.options.max_version)
    }

    /// Runs pending migrations, then the seeds they made reachable.
    pub async fn run(&self) -> Result<MigrationResult, MigrationError> {
        self.driver.setup_migration_if_needed().await?;

        let previous_version = self.current_version().await?;
        // Major 0 predates major versioning and upgrades like any older minor.
        let major = previous_version.major();
        if major != 0 && major != self.options.major_version {
            return Err(MigrationError::MajorVersionMismatch {
                current: previous_version,
                supported: self.options.major_version,
            });
        }

        let mut result = MigrationResult {
            previous_version,
            ..Default::default()
        };

        let mut current = previous_version;
        if current.is_zero() {
            let bootstrap = self.bootstrap().await?;
            result.applied_migrations.push(bootstrap.name.clone());
            current = bootstrap.version;
        }

        for file in self.migrations.iter() {
            if file.version.bigger_than(&self.options.max_version) {
                tracing::warn!(
                    file = %file.name,
                    version = %file.version,
                    max_version = %self.options.max_version,
                    "Skipping migration newer than this binary supports"
                );
                result.skipped_migrations.push(file.name.clone());
                continue;
            }
            if !file.version.bigger_than(&current) {
                tracing::debug!(file = %file.name, version = %file.version, "Already applied");
                continue;
            }

            tracing::info!(
                file = %file.name,
                version = %file.version,
                "Applying migration: {}",
                file.description
            );
            let info = self.info(file, MigrationType::Migrate);
            self.driver
                .execute_migration(&info, &file.body)
                .await
                .map_err(|source| {
                    tracing::error!(file = %file.name, error = %source, "Migration failed");
                    MigrationError::Apply {
                        file: file.name.clone(),
                        version: file.version,
                        source,
                    }
                })?;
            result.applied_migrations.push(file.name.clone());
            current = file.version;
        }

        result.current_version = self.current_version().await?;
        tracing::info!(
            before = %result.previous_version,
            after = %result.current_version,
            applied = result.applied_migrations.len(),
            "Migration finished"
        );

        result.applied_seeds = seed::load(
            self.driver,
            &self.seeds,
            result.previous_version,
            result.current_version,
            self.options.force_reset_seed,
        )
        .await?;

        result.checksum_mismatches = self.checksum_drift().await?;
        Ok(result)
    }

    /// Version of the most recent ledger row, [`Version::ZERO`] when the
    /// ledger is empty.
    ///
    /// A most recent row that is not DONE means an earlier run was cut
    /// short; that is an error unless `force` is set, in which case the
    /// most recent DONE row counts.
    pub async fn current_version(&self) -> Result<Version, MigrationError> {
        let find = MigrationHistoryFind::namespace(&self.options.namespace).with_limit(1);
        let Some(latest) = self.latest(find).await? else {
            return Ok(Version::ZERO);
        };
        if latest.status == MigrationStatus::Done {
            return parse_stored(&latest.version);
        }

        if !self.options.force {
            return Err(MigrationError::UnresolvedHistory {
                namespace: latest.namespace,
                version: latest.version,
                status: latest.status,
            });
        }
        tracing::warn!(
            version = %latest.version,
            status = %latest.status,
            "Most recent migration is unresolved, continuing from the last DONE row"
        );
        let find = MigrationHistoryFind::namespace(&self.options.namespace)
            .with_status(MigrationStatus::Done)
            .with_limit(1);
        match self.latest(find).await? {
            Some(done) => parse_stored(&done.version),
            None => Ok(Version::ZERO),
        }
    }

    /// PENDING and FAILED rows, most recent first.
    pub async fn unresolved(&self) -> Result<Vec<MigrationHistory>, MigrationError> {
        let mut rows = Vec::new();
        for status in [MigrationStatus::Pending, MigrationStatus::Failed] {
            let find = MigrationHistoryFind::namespace(&self.options.namespace).with_status(status);
            rows.extend(self.driver.find_migration_history_list(&find).await?);
        }
        rows.sort_by(|a, b| b.sequence.cmp(&a.sequence));
        Ok(rows)
    }

    /// Every ledger row of the namespace, most recent first.
    pub async fn history(
        &self,
        limit: Option<usize>,
    ) -> Result<Vec<MigrationHistory>, MigrationError> {
        let mut find = MigrationHistoryFind::namespace(&self.options.namespace);
        if let Some(limit) = limit {
            find = find.with_limit(limit);
        }
        Ok(self.driver.find_migration_history_list(&find).await?)
    }

    /// Applies the sentinel file `{major}.0` on a fresh install.
    async fn bootstrap(&self) -> Result<&MigrationFile, MigrationError> {
        let sentinel = Version::new(self.options.major_version, 0)?;
        let file = self
            .migrations
            .get(sentinel)
            .ok_or(MigrationError::MissingBootstrap(sentinel))?;

        tracing::info!(
            namespace = %self.options.namespace,
            version = %sentinel,
            "Fresh install, creating database from {}",
            file.name
        );
        let mut info = self.info(file, MigrationType::Migrate);
        info.create_database = self.options.create_database;
        self.driver
            .execute_migration(&info, &file.body)
            .await
            .map_err(|source| MigrationError::Bootstrap {
                version: sentinel,
                source,
            })?;
        Ok(file)
    }

    /// Applied files whose recorded checksum differs from the embedded body.
    async fn checksum_drift(&self) -> Result<Vec<String>, MigrationError> {
        let rows = self
            .driver
            .find_migration_history_list(&MigrationHistoryFind::namespace(&self.options.namespace))
            .await?;
        let recorded: HashMap<&str, &MigrationHistory> = rows
            .iter()
            .filter(|row| row.status == MigrationStatus::Done)
            .map(|row| (row.version.as_str(), row))
            .collect();

        let mut drifted = Vec::new();
        for file in self.migrations.iter() {
            let version = file.version.to_int().to_string();
            let Some(row) = recorded.get(version.as_str()) else {
                continue;
            };
            if row.checksum != ledger::checksum(&file.body) {
                tracing::warn!(
                    file = %file.name,
                    history_id = %row.id,
                    "Migration file changed after it was applied"
                );
                drifted.push(file.name.clone());
            }
        }
        Ok(drifted)
    }

    async fn latest(
        &self,
        find: MigrationHistoryFind,
    ) -> Result<Option<MigrationHistory>, MigrationError> {
        Ok(self
            .driver
            .find_migration_history_list(&find)
            .await?
            .into_iter()
            .next())
    }

    fn info(&self, file: &MigrationFile, migration_type: MigrationType) -> MigrationInfo {
        MigrationInfo {
            release_version: self.options.release_version.clone(),
            source: MigrationSource::Library,
            migration_type,
            description: file.description.clone(),
            creator: self.options.creator.clone(),
            force: self.options.force,
            ..MigrationInfo::new(&self.options.namespace, file.version.to_int().to_string())
        }
    }
}

fn parse_stored(version: &str) -> Result<Version, MigrationError> {
    Version::parse_int(version)
        .map_err(|_| MigrationError::InvalidStoredVersion(version.to_string()))
}
