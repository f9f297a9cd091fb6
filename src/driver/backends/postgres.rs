//! PostgreSQL backend.
//!
//! Connection pooling goes through deadpool-postgres, one pool per database
//! touched. Postgres DDL is transactional, so a migration against the ledger
//! database runs its statement and inserts its DONE row in one transaction.
//! Migrations against another database cannot share that transaction and go
//! through the two-phase ledger protocol instead.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod};
use tokio::sync::Mutex;
use tokio_postgres::config::SslMode;
use tokio_postgres::error::SqlState;
use tokio_postgres::types::ToSql;
use tokio_postgres::{GenericClient, NoTls, SimpleQueryMessage};
use tokio_postgres_rustls::MakeRustlsConnect;

use crate::driver::ledger::{
    self, HistoryStore, NewHistory, Precheck, HISTORY_TABLE, UNIQUE_SEQUENCE_INDEX,
    UNIQUE_VERSION_INDEX,
};
use crate::driver::traits::{Driver, DriverFactory, MigrationCapable};
use crate::driver::types::{
    ConnectionConfig, ConnectionContext, DriverConfig, EngineType, ExecuteOptions, FilterValue,
    MigrationHistory, MigrationHistoryFind, MigrationInfo, MigrationOutcome, MigrationStatus,
};
use crate::error::DriverError;
use crate::sql;

const DEFAULT_PORT: u16 = 5432;
const DEFAULT_DATABASE: &str = "postgres";

const CREATE_HISTORY_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS migration_history (
    id BIGSERIAL PRIMARY KEY,
    created_by TEXT NOT NULL,
    created_ts BIGINT NOT NULL,
    updated_by TEXT NOT NULL,
    updated_ts BIGINT NOT NULL,
    release_version TEXT NOT NULL,
    namespace TEXT NOT NULL,
    sequence BIGINT NOT NULL CHECK (sequence >= 0),
    source TEXT NOT NULL CHECK (source IN ('UI', 'VCS', 'LIBRARY')),
    type TEXT NOT NULL CHECK (type IN ('BASELINE', 'MIGRATE', 'BRANCH', 'DATA')),
    status TEXT NOT NULL CHECK (status IN ('PENDING', 'DONE', 'FAILED')),
    version TEXT NOT NULL,
    description TEXT NOT NULL,
    statement TEXT NOT NULL,
    checksum TEXT NOT NULL,
    execution_duration_ns BIGINT NOT NULL,
    issue_id TEXT,
    payload JSONB
);
CREATE UNIQUE INDEX IF NOT EXISTS uk_migration_history_namespace_version
    ON migration_history (namespace, version);
CREATE UNIQUE INDEX IF NOT EXISTS uk_migration_history_namespace_sequence
    ON migration_history (namespace, sequence);
"#;

const HISTORY_COLUMNS: &str = "id, created_by, created_ts, updated_by, updated_ts, \
    release_version, namespace, sequence, source, type, status, version, description, \
    statement, checksum, execution_duration_ns, issue_id, payload";

const INSERT_HISTORY: &str = r#"
INSERT INTO migration_history (
    created_by, created_ts, updated_by, updated_ts, release_version, namespace, sequence,
    source, type, status, version, description, statement, checksum,
    execution_duration_ns, issue_id, payload
)
VALUES ($1, $2, $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
RETURNING id
"#;

const UPDATE_HISTORY_STATUS: &str = r#"
UPDATE migration_history
SET status = $1, execution_duration_ns = $2, updated_ts = $3
WHERE id = $4
"#;

/// Opens [`PostgresDriver`]s.
pub struct PostgresFactory;

#[async_trait]
impl DriverFactory for PostgresFactory {
    async fn open(
        &self,
        _engine: EngineType,
        config: &DriverConfig,
        connection: &ConnectionConfig,
        context: &ConnectionContext,
    ) -> Result<Box<dyn Driver>, DriverError> {
        Ok(Box::new(PostgresDriver::connect(config, connection, context)?))
    }
}

/// PostgreSQL driver.
///
/// Pools connect lazily; [`Registry::open`](crate::driver::Registry::open)
/// pings before handing the driver out.
pub struct PostgresDriver {
    connection: ConnectionConfig,
    context: ConnectionContext,
    pool_size: usize,
    connect_timeout: Duration,
    tls: Option<MakeRustlsConnect>,
    /// Database holding `migration_history`.
    database: String,
    pool: Pool,
    others: Mutex<HashMap<String, Pool>>,
}

impl PostgresDriver {
    pub fn connect(
        config: &DriverConfig,
        connection: &ConnectionConfig,
        context: &ConnectionContext,
    ) -> Result<Self, DriverError> {
        if connection.host.is_empty() {
            return Err(DriverError::Config("postgres host is required".into()));
        }
        let tls = connection.tls.client_config()?.map(MakeRustlsConnect::new);
        let database = if connection.database.is_empty() {
            DEFAULT_DATABASE.to_string()
        } else {
            connection.database.clone()
        };

        let pool = build_pool(
            connection,
            &database,
            tls.as_ref(),
            config.pool_size,
            config.connect_timeout,
        )?;

        Ok(Self {
            connection: connection.clone(),
            context: context.clone(),
            pool_size: config.pool_size,
            connect_timeout: config.connect_timeout,
            tls,
            database,
            pool,
            others: Mutex::new(HashMap::new()),
        })
    }

    fn is_ledger_database(&self, database: &str) -> bool {
        database.is_empty() || database == self.database
    }

    /// Pool for `database`, created on first use.
    async fn pool_for(&self, database: &str) -> Result<Pool, DriverError> {
        if self.is_ledger_database(database) {
            return Ok(self.pool.clone());
        }
        let mut others = self.others.lock().await;
        if let Some(pool) = others.get(database) {
            return Ok(pool.clone());
        }
        let pool = build_pool(
            &self.connection,
            database,
            self.tls.as_ref(),
            self.pool_size,
            self.connect_timeout,
        )?;
        others.insert(database.to_string(), pool.clone());
        Ok(pool)
    }

    async fn get_connection(&self, pool: &Pool) -> Result<Object, DriverError> {
        pool.get().await.map_err(|e| DriverError::Connect {
            engine: EngineType::Postgres,
            message: format!("failed to get connection from pool: {e}"),
        })
    }

    /// Runs a body in its own transaction on `pool`.
    async fn run_in_transaction(&self, pool: &Pool, statement: &str) -> Result<i64, DriverError> {
        let mut conn = self.get_connection(pool).await?;
        let tx = conn
            .transaction()
            .await
            .map_err(|e| DriverError::Begin(describe(&e)))?;

        let messages = match tx.simple_query(statement).await {
            Ok(messages) => messages,
            Err(e) => {
                rollback(tx).await;
                return Err(DriverError::execute(describe(&e), statement));
            }
        };

        tx.commit()
            .await
            .map_err(|e| DriverError::Commit(describe(&e)))?;
        Ok(rows_affected(&messages))
    }

    /// Creates `database` unless it exists. Runs outside any transaction.
    pub async fn ensure_database(&self, database: &str) -> Result<(), DriverError> {
        let conn = self.get_connection(&self.pool).await?;
        let exists = conn
            .query_opt("SELECT 1 FROM pg_database WHERE datname = $1", &[&database])
            .await
            .map_err(|e| DriverError::Query(describe(&e)))?
            .is_some();
        if exists {
            return Ok(());
        }

        let statement = format!("CREATE DATABASE {}", quote_ident(database));
        conn.batch_execute(&statement)
            .await
            .map_err(|e| DriverError::execute(describe(&e), &statement))?;
        tracing::info!(
            database,
            instance = %self.context.instance_name,
            "Created database"
        );
        Ok(())
    }
}

#[async_trait]
impl Driver for PostgresDriver {
    fn engine(&self) -> EngineType {
        EngineType::Postgres
    }

    async fn ping(&self) -> Result<(), DriverError> {
        let conn = self.get_connection(&self.pool).await?;
        conn.simple_query("SELECT 1")
            .await
            .map_err(|e| DriverError::Ping(describe(&e)))?;
        Ok(())
    }

    async fn close(&self) -> Result<(), DriverError> {
        self.pool.close();
        for pool in self.others.lock().await.values() {
            pool.close();
        }
        Ok(())
    }

    async fn execute(&self, statement: &str, options: ExecuteOptions) -> Result<i64, DriverError> {
        if !options.create_database {
            return self.run_in_transaction(&self.pool, statement).await;
        }

        // CREATE DATABASE cannot run inside a transaction block.
        let mut statements = sql::split_statements(statement).into_iter();
        let Some(create) = statements.next() else {
            return Ok(0);
        };
        let conn = self.get_connection(&self.pool).await?;
        conn.batch_execute(&create)
            .await
            .map_err(|e| DriverError::execute(describe(&e), &create))?;

        let rest = statements.collect::<Vec<_>>().join(";\n");
        if rest.is_empty() {
            return Ok(0);
        }
        self.run_in_transaction(&self.pool, &rest).await
    }

    fn as_migration(&self) -> Option<&dyn MigrationCapable> {
        Some(self)
    }
}

#[async_trait]
impl HistoryStore for PostgresDriver {
    async fn find_history(
        &self,
        find: &MigrationHistoryFind,
    ) -> Result<Vec<MigrationHistory>, DriverError> {
        let Some(conditions) = find.conditions() else {
            return Ok(Vec::new());
        };
        let query = build_find_query(&conditions, find.limit);
        let params: Vec<&(dyn ToSql + Sync)> =
            conditions.iter().map(|(_, value)| sql_param(value)).collect();

        let conn = self.get_connection(&self.pool).await?;
        let rows = conn
            .query(query.as_str(), &params)
            .await
            .map_err(|e| DriverError::Query(describe(&e)))?;
        rows.iter().map(history_from_row).collect()
    }

    async fn insert_history(&self, row: &NewHistory<'_>) -> Result<String, DriverError> {
        let conn = self.get_connection(&self.pool).await?;
        let client: &tokio_postgres::Client = &conn;
        insert_row(client, row)
            .await
            .map(|id| id.to_string())
            .map_err(|e| history_insert_error(&e, row.info))
    }

    async fn update_history_status(
        &self,
        id: &str,
        status: MigrationStatus,
        duration_ns: i64,
    ) -> Result<(), DriverError> {
        let update_error = |message: String| DriverError::HistoryUpdate {
            id: id.to_string(),
            message,
        };
        let numeric_id: i64 = id
            .parse()
            .map_err(|_| update_error("not a numeric id".into()))?;
        let now = chrono::Utc::now().timestamp();
        let status = status.as_str();

        let conn = self.get_connection(&self.pool).await?;
        let updated = conn
            .execute(
                UPDATE_HISTORY_STATUS,
                &[&status, &duration_ns, &now, &numeric_id],
            )
            .await
            .map_err(|e| update_error(describe(&e)))?;
        if updated == 0 {
            return Err(update_error("no such row".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl MigrationCapable for PostgresDriver {
    async fn needs_setup_migration(&self) -> Result<bool, DriverError> {
        let conn = self.get_connection(&self.pool).await?;
        let row = conn
            .query_one(
                "SELECT NOT EXISTS (SELECT 1 FROM pg_catalog.pg_tables \
                 WHERE schemaname = current_schema() AND tablename = $1)",
                &[&HISTORY_TABLE],
            )
            .await
            .map_err(|e| DriverError::Query(describe(&e)))?;
        row.try_get(0).map_err(|e| DriverError::Query(describe(&e)))
    }

    async fn setup_migration_if_needed(&self) -> Result<(), DriverError> {
        if !self.needs_setup_migration().await? {
            return Ok(());
        }

        tracing::info!(
            database = %self.database,
            environment = %self.context.environment_name,
            instance = %self.context.instance_name,
            "Creating migration history table"
        );
        let conn = self.get_connection(&self.pool).await?;
        if let Err(e) = conn.batch_execute(CREATE_HISTORY_TABLE).await {
            // Two processes racing on CREATE TABLE IF NOT EXISTS can still
            // collide in the catalog; the loser sees the winner's table.
            let raced = e.code().is_some_and(|code| {
                *code == SqlState::UNIQUE_VIOLATION || *code == SqlState::DUPLICATE_TABLE
            });
            if !raced || self.needs_setup_migration().await? {
                return Err(DriverError::Setup(describe(&e)));
            }
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

        if info.create_database && !self.is_ledger_database(&info.database) {
            self.ensure_database(&info.database).await?;
        }

        if retry_id.is_some() || !self.is_ledger_database(&info.database) {
            let pool = self.pool_for(&info.database).await?;
            return ledger::execute_two_phase(self, info, statement, sequence, retry_id, move || {
                async move { self.run_in_transaction(&pool, statement).await.map(|_| ()) }
            })
            .await;
        }

        let started = Instant::now();
        let mut conn = self.get_connection(&self.pool).await?;
        let tx = conn
            .transaction()
            .await
            .map_err(|e| DriverError::Begin(describe(&e)))?;

        if ledger::should_execute(info, statement) {
            if let Err(e) = tx.batch_execute(statement).await {
                rollback(tx).await;
                return Err(DriverError::execute(describe(&e), statement));
            }
        }

        let duration_ns = ledger::elapsed_ns(started);
        let row = NewHistory::new(info, statement, sequence, MigrationStatus::Done)
            .with_duration(duration_ns);
        let tx_client: &tokio_postgres::Transaction<'_> = &tx;
        let history_id = match insert_row(tx_client, &row).await {
            Ok(id) => id,
            Err(e) => {
                let err = history_insert_error(&e, info);
                rollback(tx).await;
                return Err(err);
            }
        };

        tx.commit()
            .await
            .map_err(|e| DriverError::Commit(describe(&e)))?;

        Ok(MigrationOutcome {
            history_id: history_id.to_string(),
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

fn build_pool(
    connection: &ConnectionConfig,
    database: &str,
    tls: Option<&MakeRustlsConnect>,
    pool_size: usize,
    connect_timeout: Duration,
) -> Result<Pool, DriverError> {
    let mut pg_config = tokio_postgres::Config::new();
    pg_config
        .host(&connection.host)
        .port(connection.port.unwrap_or(DEFAULT_PORT))
        .dbname(database)
        .application_name("schemaledger")
        .connect_timeout(connect_timeout);
    if !connection.username.is_empty() {
        pg_config.user(&connection.username);
    }
    if !connection.password.is_empty() {
        pg_config.password(&connection.password);
    }
    if connection.read_only {
        pg_config.options("-c default_transaction_read_only=on");
    }

    let mgr_config = ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    };
    let mgr = match tls {
        Some(tls) => {
            pg_config.ssl_mode(SslMode::Require);
            Manager::from_config(pg_config, tls.clone(), mgr_config)
        }
        None => Manager::from_config(pg_config, NoTls, mgr_config),
    };

    Pool::builder(mgr)
        .max_size(pool_size)
        .build()
        .map_err(|e| DriverError::Connect {
            engine: EngineType::Postgres,
            message: format!("failed to create connection pool: {e}"),
        })
}

async fn insert_row<C>(client: &C, row: &NewHistory<'_>) -> Result<i64, tokio_postgres::Error>
where
    C: GenericClient + Sync,
{
    let info = row.info;
    let now = chrono::Utc::now().timestamp();
    let source = info.source.as_str();
    let migration_type = info.migration_type.as_str();
    let status = row.status.as_str();

    let inserted = client
        .query_one(
            INSERT_HISTORY,
            &[
                &info.creator,
                &now,
                &info.release_version,
                &info.namespace,
                &row.sequence,
                &source,
                &migration_type,
                &status,
                &info.version,
                &info.description,
                &row.statement,
                &row.checksum,
                &row.execution_duration_ns,
                &info.issue_id,
                &info.payload,
            ],
        )
        .await?;
    inserted.try_get(0)
}

async fn rollback(tx: deadpool_postgres::Transaction<'_>) {
    if let Err(e) = tx.rollback().await {
        tracing::warn!("{}", DriverError::Rollback(describe(&e)));
    }
}

/// `SELECT ... WHERE a = $1 AND b = $2 ORDER BY sequence DESC [LIMIT n]`.
fn build_find_query(conditions: &[(&'static str, FilterValue)], limit: Option<usize>) -> String {
    let mut query = format!("SELECT {HISTORY_COLUMNS} FROM {HISTORY_TABLE}");
    if !conditions.is_empty() {
        let clauses: Vec<String> = conditions
            .iter()
            .enumerate()
            .map(|(idx, (column, _))| format!("{column} = ${}", idx + 1))
            .collect();
        query.push_str(" WHERE ");
        query.push_str(&clauses.join(" AND "));
    }
    query.push_str(" ORDER BY sequence DESC, id DESC");
    if let Some(limit) = limit {
        query.push_str(&format!(" LIMIT {limit}"));
    }
    query
}

fn sql_param(value: &FilterValue) -> &(dyn ToSql + Sync) {
    match value {
        FilterValue::Int(v) => v as &(dyn ToSql + Sync),
        FilterValue::Text(v) => v as &(dyn ToSql + Sync),
    }
}

fn history_from_row(row: &tokio_postgres::Row) -> Result<MigrationHistory, DriverError> {
    let decode =
        |e: tokio_postgres::Error| DriverError::Query(format!("failed to decode row: {e}"));
    let invalid = |e: String| DriverError::Query(format!("failed to decode row: {e}"));

    let id: i64 = row.try_get("id").map_err(decode)?;
    Ok(MigrationHistory {
        id: id.to_string(),
        creator: row.try_get("created_by").map_err(decode)?,
        created_ts: row.try_get("created_ts").map_err(decode)?,
        updater: row.try_get("updated_by").map_err(decode)?,
        updated_ts: row.try_get("updated_ts").map_err(decode)?,
        release_version: row.try_get("release_version").map_err(decode)?,
        namespace: row.try_get("namespace").map_err(decode)?,
        sequence: row.try_get("sequence").map_err(decode)?,
        source: row
            .try_get::<_, String>("source")
            .map_err(decode)?
            .parse()
            .map_err(invalid)?,
        migration_type: row
            .try_get::<_, String>("type")
            .map_err(decode)?
            .parse()
            .map_err(invalid)?,
        status: row
            .try_get::<_, String>("status")
            .map_err(decode)?
            .parse()
            .map_err(invalid)?,
        version: row.try_get("version").map_err(decode)?,
        description: row.try_get("description").map_err(decode)?,
        statement: row.try_get("statement").map_err(decode)?,
        checksum: row.try_get("checksum").map_err(decode)?,
        execution_duration_ns: row.try_get("execution_duration_ns").map_err(decode)?,
        issue_id: row.try_get("issue_id").map_err(decode)?,
        payload: row.try_get("payload").map_err(decode)?,
    })
}

/// Maps unique-index violations to the ledger errors they stand for.
fn history_insert_error(e: &tokio_postgres::Error, info: &MigrationInfo) -> DriverError {
    if let Some(db_err) = e.as_db_error() {
        if *db_err.code() == SqlState::UNIQUE_VIOLATION {
            match db_err.constraint() {
                Some(UNIQUE_VERSION_INDEX) => {
                    return DriverError::DuplicateVersion {
                        namespace: info.namespace.clone(),
                        version: info.version.clone(),
                    }
                }
                Some(UNIQUE_SEQUENCE_INDEX) => {
                    return DriverError::ConcurrentMigration {
                        namespace: info.namespace.clone(),
                    }
                }
                _ => {}
            }
        }
    }
    DriverError::HistoryInsert(describe(e))
}

/// Extracts detailed error information from PostgreSQL.
fn describe(e: &tokio_postgres::Error) -> String {
    e.as_db_error()
        .map(|db_err| {
            format!(
                "{}: {} [{}] position={:?} (detail: {:?}, hint: {:?})",
                db_err.severity(),
                db_err.message(),
                db_err.code().code(),
                db_err.position(),
                db_err.detail(),
                db_err.hint()
            )
        })
        .unwrap_or_else(|| e.to_string())
}

fn rows_affected(messages: &[SimpleQueryMessage]) -> i64 {
    messages
        .iter()
        .map(|message| match message {
            SimpleQueryMessage::CommandComplete(rows) => i64::try_from(*rows).unwrap_or(i64::MAX),
            _ => 0,
        })
        .sum()
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}
