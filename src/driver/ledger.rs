//! Migration history ledger protocol shared by the drivers.
//!
//! Every driver stores rows in its own format, but they agree on how a
//! migration is admitted (pre-check), how rows are sequenced, and how
//! engines without transactional DDL record an attempt (two-phase).

use std::cmp::Ordering;
use std::future::Future;
use std::time::Instant;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::driver::types::{
    MigrationHistory, MigrationHistoryFind, MigrationInfo, MigrationOutcome, MigrationStatus,
    MigrationType,
};
use crate::error::DriverError;
use crate::sql;

/// Name of the ledger table or collection in every engine.
pub const HISTORY_TABLE: &str = "migration_history";

/// Unique index over `(namespace, version)`.
pub const UNIQUE_VERSION_INDEX: &str = "uk_migration_history_namespace_version";

/// Unique index over `(namespace, sequence)`.
pub const UNIQUE_SEQUENCE_INDEX: &str = "uk_migration_history_namespace_sequence";

/// Row-level access to an engine's ledger.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn find_history(
        &self,
        find: &MigrationHistoryFind,
    ) -> Result<Vec<MigrationHistory>, DriverError>;

    /// Inserts a row and returns its id.
    async fn insert_history(&self, row: &NewHistory<'_>) -> Result<String, DriverError>;

    async fn update_history_status(
        &self,
        id: &str,
        status: MigrationStatus,
        duration_ns: i64,
    ) -> Result<(), DriverError>;
}

/// A row about to be written.
#[derive(Debug, Clone)]
pub struct NewHistory<'a> {
    pub info: &'a MigrationInfo,
    pub statement: &'a str,
    pub checksum: String,
    pub sequence: i64,
    pub status: MigrationStatus,
    pub execution_duration_ns: i64,
}

impl<'a> NewHistory<'a> {
    pub fn new(
        info: &'a MigrationInfo,
        statement: &'a str,
        sequence: i64,
        status: MigrationStatus,
    ) -> Self {
        Self {
            info,
            statement,
            checksum: checksum(statement),
            sequence,
            status,
            execution_duration_ns: 0,
        }
    }

    pub fn with_duration(mut self, duration_ns: i64) -> Self {
        self.execution_duration_ns = duration_ns;
        self
    }

    /// Payload as JSON text, for engines without a native JSON column.
    pub fn payload_text(&self) -> Option<String> {
        self.info.payload.as_ref().map(|p| p.to_string())
    }

    /// Materializes the row as it would be read back.
    pub fn into_history(self, id: String, now: i64) -> MigrationHistory {
        MigrationHistory {
            id,
            creator: self.info.creator.clone(),
            created_ts: now,
            updater: self.info.creator.clone(),
            updated_ts: now,
            release_version: self.info.release_version.clone(),
            namespace: self.info.namespace.clone(),
            sequence: self.sequence,
            source: self.info.source,
            migration_type: self.info.migration_type,
            status: self.status,
            version: self.info.version.clone(),
            description: self.info.description.clone(),
            statement: self.statement.to_string(),
            checksum: self.checksum,
            execution_duration_ns: self.execution_duration_ns,
            issue_id: self.info.issue_id.clone(),
            payload: self.info.payload.clone(),
        }
    }
}

/// What the pre-check decided.
#[derive(Debug, Clone, PartialEq)]
pub enum Precheck {
    /// A DONE row exists for this version; nothing to do.
    AlreadyApplied(MigrationHistory),
    /// Apply with this sequence. `retry_id` is a PENDING/FAILED row being
    /// forced over, which must be updated instead of inserting a new one.
    Proceed {
        sequence: i64,
        retry_id: Option<String>,
    },
}

/// Decides whether `info` may be applied.
///
/// - DONE row with the same version: [`Precheck::AlreadyApplied`].
/// - PENDING or FAILED row: error, unless `info.force`.
/// - A version not older than `info.version` recorded since the latest
///   baseline or branch: [`DriverError::OutOfOrder`].
pub async fn precheck<S>(store: &S, info: &MigrationInfo) -> Result<Precheck, DriverError>
where
    S: HistoryStore + ?Sized,
{
    let same_version = store
        .find_history(
            &MigrationHistoryFind::namespace(&info.namespace)
                .with_version(&info.version)
                .with_limit(1),
        )
        .await?;

    if let Some(row) = same_version.into_iter().next() {
        return match row.status {
            MigrationStatus::Done => {
                tracing::info!(
                    namespace = %info.namespace,
                    version = %info.version,
                    history_id = %row.id,
                    "Migration already applied, skipping"
                );
                Ok(Precheck::AlreadyApplied(row))
            }
            status if info.force => {
                tracing::warn!(
                    namespace = %info.namespace,
                    version = %info.version,
                    status = %status,
                    "Forcing migration over unresolved history row {}",
                    row.id
                );
                Ok(Precheck::Proceed {
                    sequence: row.sequence,
                    retry_id: Some(row.id),
                })
            }
            status => Err(DriverError::Unresolved {
                namespace: info.namespace.clone(),
                version: info.version.clone(),
                status,
            }),
        };
    }

    let history = store
        .find_history(&MigrationHistoryFind::namespace(&info.namespace))
        .await?;
    let sequence = history.first().map_or(1, |row| row.sequence + 1);

    if let Some(applied) = largest_version_since_baseline(&history) {
        if compare_versions(applied, &info.version) != Ordering::Less {
            return Err(DriverError::OutOfOrder {
                namespace: info.namespace.clone(),
                version: info.version.clone(),
                applied: applied.to_string(),
            });
        }
    }

    Ok(Precheck::Proceed {
        sequence,
        retry_id: None,
    })
}

/// Largest version among rows since (and including) the most recent
/// baseline or branch. `history` must be ordered most recent first.
fn largest_version_since_baseline(history: &[MigrationHistory]) -> Option<&str> {
    let cut = history
        .iter()
        .position(|row| {
            matches!(
                row.migration_type,
                MigrationType::Baseline | MigrationType::Branch
            )
        })
        .map_or(history.len(), |pos| pos + 1);
    history[..cut]
        .iter()
        .map(|row| row.version.as_str())
        .max_by(|a, b| compare_versions(a, b))
}

/// Numeric when both sides are integers, lexicographic otherwise.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    match (a.parse::<i64>(), b.parse::<i64>()) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        _ => a.cmp(b),
    }
}

/// SHA-256 hex digest of a statement.
pub fn checksum(statement: &str) -> String {
    hex::encode(Sha256::digest(statement.as_bytes()))
}

/// Whether a statement has to run at all. Baseline and branch rows, and
/// empty bodies, are recorded without executing anything.
pub fn should_execute(info: &MigrationInfo, statement: &str) -> bool {
    info.migration_type.executes_statement() && !sql::is_blank(statement)
}

/// Nanoseconds since `started`, saturating.
pub fn elapsed_ns(started: Instant) -> i64 {
    i64::try_from(started.elapsed().as_nanos()).unwrap_or(i64::MAX)
}

/// Applies a migration on an engine that cannot commit the statement and its
/// ledger row together.
///
/// Writes a PENDING row, runs `run`, then marks the row DONE or FAILED. If
/// the statement succeeds but the DONE update fails, the row stays PENDING
/// and [`DriverError::HistoryNotRecorded`] is returned.
pub async fn execute_two_phase<S, F, Fut>(
    store: &S,
    info: &MigrationInfo,
    statement: &str,
    sequence: i64,
    retry_id: Option<String>,
    run: F,
) -> Result<MigrationOutcome, DriverError>
where
    S: HistoryStore + ?Sized,
    F: FnOnce() -> Fut + Send,
    Fut: Future<Output = Result<(), DriverError>> + Send,
{
    let id = match retry_id {
        Some(id) => {
            store
                .update_history_status(&id, MigrationStatus::Pending, 0)
                .await?;
            id
        }
        None => {
            let row = NewHistory::new(info, statement, sequence, MigrationStatus::Pending);
            store.insert_history(&row).await?
        }
    };

    let started = Instant::now();
    let result = if should_execute(info, statement) {
        run().await
    } else {
        Ok(())
    };
    let duration_ns = elapsed_ns(started);

    match result {
        Ok(()) => {
            store
                .update_history_status(&id, MigrationStatus::Done, duration_ns)
                .await
                .map_err(|err| DriverError::HistoryNotRecorded {
                    namespace: info.namespace.clone(),
                    version: info.version.clone(),
                    id: id.clone(),
                    message: err.to_string(),
                })?;
            Ok(MigrationOutcome {
                history_id: id,
                duration_ns,
                already_applied: false,
            })
        }
        Err(err) => {
            if let Err(update_err) = store
                .update_history_status(&id, MigrationStatus::Failed, duration_ns)
                .await
            {
                tracing::error!(
                    namespace = %info.namespace,
                    version = %info.version,
                    history_id = %id,
                    error = %update_err,
                    "Failed to mark migration history FAILED; row is left PENDING"
                );
            }
            Err(err)
        }
    }
}

/// Outcome for a version that was already DONE.
pub fn already_applied(row: MigrationHistory) -> MigrationOutcome {
    MigrationOutcome {
        history_id: row.id,
        duration_ns: row.execution_duration_ns,
        already_applied: true,
    }
}
