//! MySQL backend.
//!
//! MySQL commits DDL implicitly, so a body containing any DDL cannot be
//! rolled back and cannot share a transaction with its ledger row. Such
//! bodies run statement by statement under the two-phase ledger protocol.
//! Pure DML bodies against the ledger database run in one transaction
//! together with their DONE row.

use std::time::Instant;

use async_trait::async_trait;
use sqlx::mysql::{
    MySql, MySqlConnectOptions, MySqlConnection, MySqlPool, MySqlPoolOptions, MySqlRow,
    MySqlSslMode,
};
use sqlx::{Connection, Executor, Row};

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
use crate::sql::{self, Dialect};

const DEFAULT_PORT: u16 = 3306;

const CREATE_HISTORY_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS migration_history (
    id BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY,
    created_by VARCHAR(255) NOT NULL,
    created_ts BIGINT NOT NULL,
    updated_by VARCHAR(255) NOT NULL,
    updated_ts BIGINT NOT NULL,
    release_version VARCHAR(255) NOT NULL,
    namespace VARCHAR(255) NOT NULL,
    sequence BIGINT NOT NULL,
    source VARCHAR(16) NOT NULL,
    type VARCHAR(16) NOT NULL,
    status VARCHAR(16) NOT NULL,
    version VARCHAR(255) NOT NULL,
    description TEXT NOT NULL,
    statement LONGTEXT NOT NULL,
    checksum CHAR(64) NOT NULL,
    execution_duration_ns BIGINT NOT NULL,
    issue_id VARCHAR(255) NULL,
    payload LONGTEXT NULL,
    UNIQUE KEY uk_migration_history_namespace_version (namespace, version),
    UNIQUE KEY uk_migration_history_namespace_sequence (namespace, sequence)
)
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
VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
"#;

/// Opens [`MySqlDriver`]s.
pub struct MySqlFactory;

#[async_trait]
impl DriverFactory for MySqlFactory {
    async fn open(
        &self,
        _engine: EngineType,
        config: &DriverConfig,
        connection: &ConnectionConfig,
        context: &ConnectionContext,
    ) -> Result<Box<dyn Driver>, DriverError> {
        Ok(Box::new(MySqlDriver::connect(config, connection, context)?))
    }
}

pub struct MySqlDriver {
    options: MySqlConnectOptions,
    pool: MySqlPool,
    /// Database holding `migration_history`.
    database: String,
    context: ConnectionContext,
}

impl MySqlDriver {
    pub fn connect(
        config: &DriverConfig,
        connection: &ConnectionConfig,
        context: &ConnectionContext,
    ) -> Result<Self, DriverError> {
        if connection.host.is_empty() {
            return Err(DriverError::Config("mysql host is required".into()));
        }
        if connection.database.is_empty() {
            return Err(DriverError::Config(
                "mysql needs a database to hold migration history".into(),
            ));
        }

        let mut options = MySqlConnectOptions::new()
            .host(&connection.host)
            .port(connection.port.unwrap_or(DEFAULT_PORT))
            .username(&connection.username)
            .password(&connection.password)
            .database(&connection.database);
        if let Some(material) = connection.tls.material()? {
            // VerifyCa checks the chain against the CA but not the host name.
            options = options
                .ssl_mode(MySqlSslMode::VerifyCa)
                .ssl_ca_from_pem(material.ca.as_bytes().to_vec());
            if let Some((cert, key)) = material.client {
                options = options
                    .ssl_client_cert_from_pem(cert.as_bytes())
                    .ssl_client_key_from_pem(key.as_bytes());
            }
        }

        let mut pool_options = MySqlPoolOptions::new()
            .max_connections(u32::try_from(config.pool_size).unwrap_or(u32::MAX))
            .acquire_timeout(config.connect_timeout);
        if connection.read_only {
            pool_options = pool_options.after_connect(|conn, _meta| {
                Box::pin(async move {
                    Executor::execute(conn, sqlx::raw_sql("SET SESSION TRANSACTION READ ONLY"))
                        .await?;
                    Ok(())
                })
            });
        }
        let pool = pool_options.connect_lazy_with(options.clone());

        Ok(Self {
            options,
            pool,
            database: connection.database.clone(),
            context: context.clone(),
        })
    }

    fn is_ledger_database(&self, database: &str) -> bool {
        database.is_empty() || database == self.database
    }

    /// Runs a body against `database`, on the pool for the ledger database
    /// and on a dedicated connection otherwise.
    async fn run_body(&self, database: &str, statement: &str) -> Result<i64, DriverError> {
        let statements = split(statement);
        if self.is_ledger_database(database) {
            let mut conn = self.pool.acquire().await.map_err(connect_error)?;
            return run_statements(&mut *conn, &statements).await;
        }

        let options = self.options.clone().database(database);
        let mut conn = MySqlConnection::connect_with(&options)
            .await
            .map_err(connect_error)?;
        let result = run_statements(&mut conn, &statements).await;
        if let Err(e) = conn.close().await {
            tracing::warn!(database, "Failed to close connection: {}", e);
        }
        result
    }
}

#[async_trait]
impl Driver for MySqlDriver {
    fn engine(&self) -> EngineType {
        EngineType::MySql
    }

    async fn ping(&self) -> Result<(), DriverError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| DriverError::Ping(describe(&e)))?;
        Ok(())
    }

    async fn close(&self) -> Result<(), DriverError> {
        self.pool.close().await;
        Ok(())
    }

    /// `CREATE DATABASE` needs no special handling here: MySQL runs it like
    /// any other DDL.
    async fn execute(&self, statement: &str, _options: ExecuteOptions) -> Result<i64, DriverError> {
        self.run_body(&self.database, statement).await
    }

    fn as_migration(&self) -> Option<&dyn MigrationCapable> {
        Some(self)
    }
}

#[async_trait]
impl HistoryStore for MySqlDriver {
    async fn find_history(
        &self,
        find: &MigrationHistoryFind,
    ) -> Result<Vec<MigrationHistory>, DriverError> {
        let Some(conditions) = find.conditions() else {
            return Ok(Vec::new());
        };
        let query_text = build_find_query(&conditions, find.limit);
        let mut query = sqlx::query(&query_text);
        for (_, value) in conditions {
            query = match value {
                FilterValue::Int(v) => query.bind(v),
                FilterValue::Text(v) => query.bind(v),
            };
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| DriverError::Query(describe(&e)))?;
        rows.iter().map(history_from_row).collect()
    }

    async fn insert_history(&self, row: &NewHistory<'_>) -> Result<String, DriverError> {
        let mut conn = self.pool.acquire().await.map_err(connect_error)?;
        insert_row(&mut *conn, row)
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

        let result = sqlx::query(
            r#"
            UPDATE migration_history
            SET status = ?, execution_duration_ns = ?, updated_ts = ?
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(duration_ns)
        .bind(chrono::Utc::now().timestamp())
        .bind(numeric_id)
        .execute(&self.pool)
        .await
        .map_err(|e| update_error(describe(&e)))?;

        if result.rows_affected() == 0 {
            return Err(update_error("no such row".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl MigrationCapable for MySqlDriver {
    async fn needs_setup_migration(&self) -> Result<bool, DriverError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM information_schema.tables \
             WHERE table_schema = DATABASE() AND table_name = ?",
        )
        .bind(HISTORY_TABLE)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| DriverError::Query(describe(&e)))?;
        Ok(count == 0)
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
        sqlx::raw_sql(CREATE_HISTORY_TABLE)
            .execute(&self.pool)
            .await
            .map_err(|e| DriverError::Setup(describe(&e)))?;
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
            let create = format!(
                "CREATE DATABASE IF NOT EXISTS {}",
                quote_ident(&info.database)
            );
            sqlx::raw_sql(&create)
                .execute(&self.pool)
                .await
                .map_err(|e| DriverError::execute(describe(&e), &create))?;
        }

        let statements = split(statement);
        let has_ddl = statements.iter().any(|s| sql::is_ddl(s));
        if has_ddl || retry_id.is_some() || !self.is_ledger_database(&info.database) {
            return ledger::execute_two_phase(self, info, statement, sequence, retry_id, || async {
                self.run_body(&info.database, statement).await.map(|_| ())
            })
            .await;
        }

        let started = Instant::now();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| DriverError::Begin(describe(&e)))?;
        if ledger::should_execute(info, statement) {
            for stmt in &statements {
                if let Err(e) = Executor::execute(&mut *tx, sqlx::raw_sql(stmt)).await {
                    rollback(tx).await;
                    return Err(DriverError::execute(describe(&e), stmt));
                }
            }
        }

        let duration_ns = ledger::elapsed_ns(started);
        let row = NewHistory::new(info, statement, sequence, MigrationStatus::Done)
            .with_duration(duration_ns);
        let history_id = match insert_row(&mut *tx, &row).await {
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

/// Runs statements in one transaction, or one by one when any of them is
/// DDL (which would commit the transaction implicitly anyway).
async fn run_statements(
    conn: &mut MySqlConnection,
    statements: &[String],
) -> Result<i64, DriverError> {
    let mut affected = 0i64;
    if statements.iter().any(|s| sql::is_ddl(s)) {
        for stmt in statements {
            let result = Executor::execute(&mut *conn, sqlx::raw_sql(stmt))
                .await
                .map_err(|e| DriverError::execute(describe(&e), stmt))?;
            affected += i64::try_from(result.rows_affected()).unwrap_or(i64::MAX);
        }
        return Ok(affected);
    }

    let mut tx = conn
        .begin()
        .await
        .map_err(|e| DriverError::Begin(describe(&e)))?;
    for stmt in statements {
        match Executor::execute(&mut *tx, sqlx::raw_sql(stmt)).await {
            Ok(result) => affected += i64::try_from(result.rows_affected()).unwrap_or(i64::MAX),
            Err(e) => {
                rollback(tx).await;
                return Err(DriverError::execute(describe(&e), stmt));
            }
        }
    }
    tx.commit()
        .await
        .map_err(|e| DriverError::Commit(describe(&e)))?;
    Ok(affected)
}

/// Splits a body with MySQL lexical rules (backslash escapes, `#` comments).
fn split(statement: &str) -> Vec<String> {
    sql::split_statements_with(statement, Dialect::MySql)
}

async fn insert_row(conn: &mut MySqlConnection, row: &NewHistory<'_>) -> Result<i64, sqlx::Error> {
    let info = row.info;
    let now = chrono::Utc::now().timestamp();
    let result = sqlx::query(INSERT_HISTORY)
        .bind(info.creator.clone())
        .bind(now)
        .bind(info.creator.clone())
        .bind(now)
        .bind(info.release_version.clone())
        .bind(info.namespace.clone())
        .bind(row.sequence)
        .bind(info.source.as_str())
        .bind(info.migration_type.as_str())
        .bind(row.status.as_str())
        .bind(info.version.clone())
        .bind(info.description.clone())
        .bind(row.statement.to_string())
        .bind(row.checksum.clone())
        .bind(row.execution_duration_ns)
        .bind(info.issue_id.clone())
        .bind(row.payload_text())
        .execute(conn)
        .await?;
    Ok(i64::try_from(result.last_insert_id()).unwrap_or(i64::MAX))
}

async fn rollback(tx: sqlx::Transaction<'_, MySql>) {
    if let Err(e) = tx.rollback().await {
        tracing::warn!("{}", DriverError::Rollback(describe(&e)));
    }
}

fn build_find_query(conditions: &[(&'static str, FilterValue)], limit: Option<usize>) -> String {
    let mut query = format!("SELECT {HISTORY_COLUMNS} FROM {HISTORY_TABLE}");
    if !conditions.is_empty() {
        let clauses: Vec<String> = conditions
            .iter()
            .map(|(column, _)| format!("{column} = ?"))
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

fn history_from_row(row: &MySqlRow) -> Result<MigrationHistory, DriverError> {
    let decode = |e: sqlx::Error| DriverError::Query(format!("failed to decode row: {e}"));
    let invalid = |e: String| DriverError::Query(format!("failed to decode row: {e}"));

    let id: i64 = row.try_get("id").map_err(decode)?;
    let payload: Option<String> = row.try_get("payload").map_err(decode)?;
    let payload = payload
        .map(|text| serde_json::from_str(&text))
        .transpose()
        .map_err(|e| invalid(e.to_string()))?;

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
            .try_get::<String, _>("source")
            .map_err(decode)?
            .parse()
            .map_err(invalid)?,
        migration_type: row
            .try_get::<String, _>("type")
            .map_err(decode)?
            .parse()
            .map_err(invalid)?,
        status: row
            .try_get::<String, _>("status")
            .map_err(decode)?
            .parse()
            .map_err(invalid)?,
        version: row.try_get("version").map_err(decode)?,
        description: row.try_get("description").map_err(decode)?,
        statement: row.try_get("statement").map_err(decode)?,
        checksum: row.try_get("checksum").map_err(decode)?,
        execution_duration_ns: row.try_get("execution_duration_ns").map_err(decode)?,
        issue_id: row.try_get("issue_id").map_err(decode)?,
        payload,
    })
}

fn history_insert_error(e: &sqlx::Error, info: &MigrationInfo) -> DriverError {
    if let Some(db_err) = e.as_database_error() {
        if db_err.is_unique_violation() {
            let message = db_err.message();
            if message.contains(UNIQUE_VERSION_INDEX) {
                return DriverError::DuplicateVersion {
                    namespace: info.namespace.clone(),
                    version: info.version.clone(),
                };
            }
            if message.contains(UNIQUE_SEQUENCE_INDEX) {
                return DriverError::ConcurrentMigration {
                    namespace: info.namespace.clone(),
                };
            }
        }
    }
    DriverError::HistoryInsert(describe(e))
}

fn connect_error(e: sqlx::Error) -> DriverError {
    DriverError::Connect {
        engine: EngineType::MySql,
        message: describe(&e),
    }
}

fn describe(e: &sqlx::Error) -> String {
    match e.as_database_error() {
        Some(db_err) => format!(
            "{} [{}]",
            db_err.message(),
            db_err.code().as_deref().unwrap_or("-")
        ),
        None => e.to_string(),
    }
}

fn quote_ident(ident: &str) -> String {
    format!("`{}`", ident.replace('`', "``"))
}
