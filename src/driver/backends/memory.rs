//! In-process backend.
//!
//! Keeps executed statements and the migration ledger in memory. It can
//! behave like an engine with transactional DDL (a failing body leaves no
//! trace) or like one without it (statements before the failure stick and
//! the ledger goes through PENDING), and it can be told to fail specific
//! statements or ledger writes. Tests and dry runs use it.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use async_trait::async_trait;

use crate::driver::ledger::{self, HistoryStore, NewHistory, Precheck};
use crate::driver::traits::{Driver, DriverFactory, MigrationCapable};
use crate::driver::types::{
    ConnectionConfig, ConnectionContext, DriverConfig, EngineType, ExecuteOptions,
    MigrationHistory, MigrationHistoryFind, MigrationInfo, MigrationOutcome, MigrationStatus,
};
use crate::error::DriverError;
use crate::sql;

#[derive(Debug, Default)]
struct MemoryState {
    ledger_created: bool,
    history: Vec<MigrationHistory>,
    next_id: i64,
    executed: Vec<String>,
    fail_on: Vec<String>,
    fail_history_inserts: bool,
    fail_history_updates: bool,
    closed: bool,
}

impl MemoryState {
    /// Runs statements in order and returns the ones that succeeded, plus
    /// the failure if any.
    fn run(&self, statement: &str) -> (Vec<String>, Option<DriverError>) {
        let mut applied = Vec::new();
        for stmt in sql::split_statements(statement) {
            if let Some(pattern) = self.fail_on.iter().find(|p| stmt.contains(p.as_str())) {
                let err = DriverError::execute(format!("injected failure on {pattern:?}"), &stmt);
                return (applied, Some(err));
            }
            applied.push(stmt);
        }
        (applied, None)
    }

    fn insert(&mut self, row: &NewHistory<'_>) -> Result<String, DriverError> {
        if self.fail_history_inserts {
            return Err(DriverError::HistoryInsert("injected insert failure".into()));
        }
        let namespace = &row.info.namespace;
        if self
            .history
            .iter()
            .any(|h| h.namespace == *namespace && h.version == row.info.version)
        {
            return Err(DriverError::DuplicateVersion {
                namespace: namespace.clone(),
                version: row.info.version.clone(),
            });
        }
        if self
            .history
            .iter()
            .any(|h| h.namespace == *namespace && h.sequence == row.sequence)
        {
            return Err(DriverError::ConcurrentMigration {
                namespace: namespace.clone(),
            });
        }

        self.next_id += 1;
        let id = self.next_id.to_string();
        let now = chrono::Utc::now().timestamp();
        self.history.push(row.clone().into_history(id.clone(), now));
        Ok(id)
    }
}

/// Shared state behind every driver opened from the same store.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Statements that took effect, in order.
    pub fn executed(&self) -> Vec<String> {
        self.lock().executed.clone()
    }

    /// Ledger rows in insertion order.
    pub fn history(&self) -> Vec<MigrationHistory> {
        self.lock().history.clone()
    }

    /// Makes any statement containing `pattern` fail.
    pub fn fail_statements_containing(&self, pattern: impl Into<String>) {
        self.lock().fail_on.push(pattern.into());
    }

    pub fn fail_history_inserts(&self, fail: bool) {
        self.lock().fail_history_inserts = fail;
    }

    pub fn fail_history_updates(&self, fail: bool) {
        self.lock().fail_history_updates = fail;
    }

    pub fn clear_failures(&self) {
        let mut state = self.lock();
        state.fail_on.clear();
        state.fail_history_inserts = false;
        state.fail_history_updates = false;
    }

    /// Writes a ledger row directly, as if an earlier run had produced it.
    pub fn record(
        &self,
        namespace: &str,
        version: &str,
        status: MigrationStatus,
    ) -> Result<String, DriverError> {
        let info = MigrationInfo::new(namespace, version);
        let mut state = self.lock();
        state.ledger_created = true;
        let sequence = state
            .history
            .iter()
            .filter(|h| h.namespace == namespace)
            .map(|h| h.sequence)
            .max()
            .unwrap_or(0)
            + 1;
        state.insert(&NewHistory::new(&info, "", sequence, status))
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MemoryOptions {
    /// A failing body rolls back entirely and the ledger row is written in
    /// the same unit. When false, behaves like an engine whose DDL commits
    /// statement by statement.
    pub transactional: bool,
    pub ping_fails: bool,
}

impl Default for MemoryOptions {
    fn default() -> Self {
        Self {
            transactional: true,
            ping_fails: false,
        }
    }
}

pub struct MemoryDriver {
    store: MemoryStore,
    options: MemoryOptions,
}

impl MemoryDriver {
    pub fn new(store: MemoryStore, options: MemoryOptions) -> Self {
        Self { store, options }
    }

    /// Executes `statement` with this driver's transaction semantics.
    fn apply(&self, statement: &str) -> Result<i64, DriverError> {
        let mut state = self.store.lock();
        let (applied, failure) = state.run(statement);
        let count = applied.len() as i64;
        if failure.is_none() || !self.options.transactional {
            state.executed.extend(applied);
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(count),
        }
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    fn engine(&self) -> EngineType {
        EngineType::Memory
    }

    async fn ping(&self) -> Result<(), DriverError> {
        if self.options.ping_fails {
            return Err(DriverError::Ping("memory driver configured to fail".into()));
        }
        if self.store.is_closed() {
            return Err(DriverError::Ping("driver is closed".into()));
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), DriverError> {
        self.store.lock().closed = true;
        Ok(())
    }

    async fn execute(&self, statement: &str, _options: ExecuteOptions) -> Result<i64, DriverError> {
        self.apply(statement)
    }

    fn as_migration(&self) -> Option<&dyn MigrationCapable> {
        Some(self)
    }
}

#[async_trait]
impl HistoryStore for MemoryDriver {
    async fn find_history(
        &self,
        find: &MigrationHistoryFind,
    ) -> Result<Vec<MigrationHistory>, DriverError> {
        let state = self.store.lock();
        if !state.ledger_created {
            return Err(DriverError::Query(format!(
                "{} does not exist",
                ledger::HISTORY_TABLE
            )));
        }
        let mut rows: Vec<_> = state
            .history
            .iter()
            .filter(|row| find.matches(row))
            .cloned()
            .collect();
        rows.sort_by_key(|row| {
            std::cmp::Reverse((row.sequence, row.id.parse::<i64>().unwrap_or_default()))
        });
        if let Some(limit) = find.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    async fn insert_history(&self, row: &NewHistory<'_>) -> Result<String, DriverError> {
        self.store.lock().insert(row)
    }

    async fn update_history_status(
        &self,
        id: &str,
        status: MigrationStatus,
        duration_ns: i64,
    ) -> Result<(), DriverError> {
        let mut state = self.store.lock();
        if state.fail_history_updates {
            return Err(DriverError::HistoryUpdate {
                id: id.to_string(),
                message: "injected update failure".into(),
            });
        }
        let row = state
            .history
            .iter_mut()
            .find(|row| row.id == id)
            .ok_or_else(|| DriverError::HistoryUpdate {
                id: id.to_string(),
                message: "no such row".into(),
            })?;
        row.status = status;
        row.execution_duration_ns = duration_ns;
        row.updated_ts = chrono::Utc::now().timestamp();
        Ok(())
    }
}

#[async_trait]
impl MigrationCapable for MemoryDriver {
    async fn needs_setup_migration(&self) -> Result<bool, DriverError> {
        Ok(!self.store.lock().ledger_created)
    }

    async fn setup_migration_if_needed(&self) -> Result<(), DriverError> {
        if self.needs_setup_migration().await? {
            tracing::info!("Creating {} in memory", ledger::HISTORY_TABLE);
            self.store.lock().ledger_created = true;
        }
        Ok(())
    }

    async fn execute_migration(
        &self,
        info: &MigrationInfo,
        statement: &str,
    ) -> Result<MigrationOutcome, DriverError> {
        let (sequence, retry_id) = match ledger::precheck(self, info).await? {
            Precheck::AlreadyApplied(row) => return Ok(ledger::already_applied(row)),
            Precheck::Proceed { sequence, retry_id } => (sequence, retry_id),
        };

        if !self.options.transactional || retry_id.is_some() {
            return ledger::execute_two_phase(self, info, statement, sequence, retry_id, || async {
                self.apply(statement).map(|_| ())
            })
            .await;
        }

        // Statement and DONE row commit together or not at all.
        let started = Instant::now();
        let mut state = self.store.lock();
        let applied = if ledger::should_execute(info, statement) {
            match state.run(statement) {
                (applied, None) => applied,
                (_, Some(err)) => return Err(err),
            }
        } else {
            Vec::new()
        };
        let duration_ns = ledger::elapsed_ns(started);
        let row = NewHistory::new(info, statement, sequence, MigrationStatus::Done)
            .with_duration(duration_ns);
        let history_id = state.insert(&row)?;
        state.executed.extend(applied);

        Ok(MigrationOutcome {
            history_id,
            duration_ns,
            already_applied: false,
        })
    }

    async fn find_migration_history_list(
        &self,
        find: &MigrationHistoryFind,
    ) -> Result<Vec<MigrationHistory>, DriverError> {
        self.find_history(find).await
    }
}

/// Opens [`MemoryDriver`]s over one shared [`MemoryStore`].
#[derive(Debug, Clone, Default)]
pub struct MemoryFactory {
    store: MemoryStore,
    options: MemoryOptions,
}

impl MemoryFactory {
    pub fn new(store: MemoryStore, options: MemoryOptions) -> Self {
        Self { store, options }
    }
}

#[async_trait]
impl DriverFactory for MemoryFactory {
    async fn open(
        &self,
        _engine: EngineType,
        _config: &DriverConfig,
        _connection: &ConnectionConfig,
        _context: &ConnectionContext,
    ) -> Result<Box<dyn Driver>, DriverError> {
        self.store.lock().closed = false;
        Ok(Box::new(MemoryDriver::new(self.store.clone(), self.options)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::types::MigrationType;

    fn driver(transactional: bool) -> (MemoryDriver, MemoryStore) {
        let store = MemoryStore::new();
        let driver = MemoryDriver::new(
            store.clone(),
            MemoryOptions {
                transactional,
                ..MemoryOptions::default()
            },
        );
        (driver, store)
    }

    #[tokio::test]
    async fn test_setup_is_idempotent() {
        let (driver, _) = driver(true);
        assert!(driver.needs_setup_migration().await.unwrap());
        driver.setup_migration_if_needed().await.unwrap();
        driver.setup_migration_if_needed().await.unwrap();
        assert!(!driver.needs_setup_migration().await.unwrap());
    }

    #[tokio::test]
    async fn test_execute_migration_records_one_row() {
        let (driver, store) = driver(true);
        driver.setup_migration_if_needed().await.unwrap();

        let info = MigrationInfo::new("meta", "10001");
        let outcome = driver
            .execute_migration(&info, "CREATE TABLE a (id INT); CREATE TABLE b (id INT);")
            .await
            .unwrap();
        assert!(!outcome.already_applied);

        let history = store.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, MigrationStatus::Done);
        assert_eq!(history[0].sequence, 1);
        assert_eq!(history[0].id, outcome.history_id);
        assert_eq!(store.executed().len(), 2);
    }

    #[tokio::test]
    async fn test_reapplying_done_version_is_noop() {
        let (driver, store) = driver(true);
        driver.setup_migration_if_needed().await.unwrap();
        let info = MigrationInfo::new("meta", "10001");

        let first = driver.execute_migration(&info, "CREATE TABLE a (id INT)").await.unwrap();
        let second = driver.execute_migration(&info, "CREATE TABLE a (id INT)").await.unwrap();

        assert!(second.already_applied);
        assert_eq!(first.history_id, second.history_id);
        assert_eq!(store.executed().len(), 1);
        assert_eq!(store.history().len(), 1);
    }

    #[tokio::test]
    async fn test_transactional_failure_leaves_nothing() {
        let (driver, store) = driver(true);
        driver.setup_migration_if_needed().await.unwrap();
        store.fail_statements_containing("broken");

        let info = MigrationInfo::new("meta", "10001");
        let err = driver
            .execute_migration(&info, "CREATE TABLE ok (id INT); CREATE TABLE broken (id INT);")
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::Execute { .. }));
        assert!(store.executed().is_empty());
        assert!(store.history().is_empty());
    }

    #[tokio::test]
    async fn test_non_transactional_failure_is_marked_failed() {
        let (driver, store) = driver(false);
        driver.setup_migration_if_needed().await.unwrap();
        store.fail_statements_containing("broken");

        let info = MigrationInfo::new("meta", "10001");
        driver
            .execute_migration(&info, "CREATE TABLE ok (id INT); CREATE TABLE broken (id INT);")
            .await
            .unwrap_err();

        // The first statement committed on its own; the ledger says so.
        assert_eq!(store.executed(), vec!["CREATE TABLE ok (id INT)"]);
        let history = store.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, MigrationStatus::Failed);

        // Retrying without force is refused.
        store.clear_failures();
        let err = driver
            .execute_migration(&info, "CREATE TABLE broken (id INT);")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DriverError::Unresolved {
                status: MigrationStatus::Failed,
                ..
            }
        ));

        // Forcing reuses the row.
        let forced = MigrationInfo {
            force: true,
            ..info.clone()
        };
        let outcome = driver
            .execute_migration(&forced, "CREATE TABLE broken (id INT);")
            .await
            .unwrap();
        assert_eq!(outcome.history_id, history[0].id);
        assert_eq!(store.history()[0].status, MigrationStatus::Done);
    }

    #[tokio::test]
    async fn test_unrecorded_success_is_distinct_error() {
        let (driver, store) = driver(false);
        driver.setup_migration_if_needed().await.unwrap();
        store.fail_history_updates(true);

        let info = MigrationInfo::new("meta", "10001");
        let err = driver
            .execute_migration(&info, "CREATE TABLE a (id INT)")
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::HistoryNotRecorded { .. }));
        assert_eq!(store.executed().len(), 1);
        assert_eq!(store.history()[0].status, MigrationStatus::Pending);
    }

    #[tokio::test]
    async fn test_out_of_order_rejected() {
        let (driver, _) = driver(true);
        driver.setup_migration_if_needed().await.unwrap();
        driver
            .execute_migration(&MigrationInfo::new("meta", "10002"), "SELECT 1")
            .await
            .unwrap();
        let err = driver
            .execute_migration(&MigrationInfo::new("meta", "10001"), "SELECT 1")
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::OutOfOrder { .. }));

        // Other namespaces are sequenced independently.
        driver
            .execute_migration(&MigrationInfo::new("other", "10001"), "SELECT 1")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_baseline_records_without_executing() {
        let (driver, store) = driver(true);
        driver.setup_migration_if_needed().await.unwrap();
        let info = MigrationInfo {
            migration_type: MigrationType::Baseline,
            ..MigrationInfo::new("meta", "5")
        };
        driver
            .execute_migration(&info, "CREATE TABLE a (id INT)")
            .await
            .unwrap();
        assert!(store.executed().is_empty());
        assert_eq!(store.history()[0].migration_type, MigrationType::Baseline);
        assert_eq!(
            store.history()[0].checksum,
            ledger::checksum("CREATE TABLE a (id INT)")
        );
    }

    #[tokio::test]
    async fn test_find_orders_by_sequence_and_limits() {
        let (driver, store) = driver(true);
        store.record("meta", "10000", MigrationStatus::Done).unwrap();
        store.record("meta", "10001", MigrationStatus::Done).unwrap();
        store.record("meta", "10002", MigrationStatus::Failed).unwrap();

        let latest = driver
            .find_migration_history_list(&MigrationHistoryFind::namespace("meta").with_limit(1))
            .await
            .unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].version, "10002");

        let done = driver
            .find_migration_history_list(
                &MigrationHistoryFind::namespace("meta").with_status(MigrationStatus::Done),
            )
            .await
            .unwrap();
        let versions: Vec<_> = done.iter().map(|r| r.version.as_str()).collect();
        assert_eq!(versions, vec!["10001", "10000"]);
    }
}
