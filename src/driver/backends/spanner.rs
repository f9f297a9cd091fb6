//! Cloud Spanner backend.
//!
//! Spanner separates schema from data: DDL goes through the database admin
//! API as a long-running operation and cannot join a transaction, while DML
//! runs in read-write transactions. A body containing DDL therefore runs
//! under the two-phase ledger protocol. Pure DML bodies against the ledger
//! database run in one read-write transaction together with their DONE row.
//!
//! Credentials come from application default credentials, or from nowhere
//! when `SPANNER_EMULATOR_HOST` points at the emulator.

use std::time::Instant;

use async_trait::async_trait;
use google_cloud_googleapis::spanner::admin::database::v1::{
    CreateDatabaseRequest, UpdateDatabaseDdlRequest,
};
use google_cloud_spanner::admin::client::Client as AdminClient;
use google_cloud_spanner::admin::AdminClientConfig;
use google_cloud_spanner::client::{Client, ClientConfig, Error as SpannerError};
use google_cloud_spanner::row::Row;
use google_cloud_spanner::statement::Statement;
use google_cloud_spanner::transaction_rw::ReadWriteTransaction;

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

const EMULATOR_HOST_ENV: &str = "SPANNER_EMULATOR_HOST";

const CREATE_HISTORY_TABLE: &[&str] = &[
    r#"CREATE TABLE migration_history (
    id INT64 NOT NULL,
    created_by STRING(MAX) NOT NULL,
    created_ts INT64 NOT NULL,
    updated_by STRING(MAX) NOT NULL,
    updated_ts INT64 NOT NULL,
    release_version STRING(MAX) NOT NULL,
    namespace STRING(MAX) NOT NULL,
    sequence INT64 NOT NULL,
    source STRING(16) NOT NULL,
    type STRING(16) NOT NULL,
    status STRING(16) NOT NULL,
    version STRING(MAX) NOT NULL,
    description STRING(MAX) NOT NULL,
    statement STRING(MAX) NOT NULL,
    checksum STRING(64) NOT NULL,
    execution_duration_ns INT64 NOT NULL,
    issue_id STRING(MAX),
    payload STRING(MAX),
    CONSTRAINT ck_migration_history_sequence CHECK (sequence >= 0)
) PRIMARY KEY (id)"#,
    "CREATE UNIQUE INDEX uk_migration_history_namespace_version \
     ON migration_history (namespace, version)",
    "CREATE UNIQUE INDEX uk_migration_history_namespace_sequence \
     ON migration_history (namespace, sequence)",
];

const HISTORY_COLUMNS: &str = "id, created_by, created_ts, updated_by, updated_ts, \
    release_version, namespace, sequence, source, type, status, version, description, \
    statement, checksum, execution_duration_ns, issue_id, payload";

const INSERT_HISTORY: &str = r#"
INSERT INTO migration_history (
    id, created_by, created_ts, updated_by, updated_ts, release_version, namespace, sequence,
    source, type, status, version, description, statement, checksum,
    execution_duration_ns, issue_id, payload
)
VALUES (
    @id, @creator, @now, @creator, @now, @release_version, @namespace, @sequence,
    @source, @migration_type, @status, @version, @description, @statement, @checksum,
    @execution_duration_ns, @issue_id, @payload
)
"#;

const NEXT_HISTORY_ID: &str = "SELECT COALESCE(MAX(id), 0) + 1 AS next_id FROM migration_history";

/// Opens [`SpannerDriver`]s.
pub struct SpannerFactory;

#[async_trait]
impl DriverFactory for SpannerFactory {
    async fn open(
        &self,
        _engine: EngineType,
        config: &DriverConfig,
        connection: &ConnectionConfig,
        context: &ConnectionContext,
    ) -> Result<Box<dyn Driver>, DriverError> {
        Ok(Box::new(
            SpannerDriver::connect(config, connection, context).await?,
        ))
    }
}

/// `projects/<project>/instances/<instance>` plus the ledger database.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Location {
    project: String,
    instance: String,
    database: String,
}

impl Location {
    fn from_connection(connection: &ConnectionConfig) -> Result<Self, DriverError> {
        let required = |value: Option<&String>, what: &str| match value {
            Some(v) if !v.is_empty() => Ok(v.clone()),
            _ => Err(DriverError::Config(format!("spanner {what} is required"))),
        };
        let project = required(connection.project.as_ref(), "project")?;
        let instance = required(connection.instance.as_ref(), "instance")?;
        if connection.database.is_empty() {
            return Err(DriverError::Config(
                "spanner needs a database to hold migration history".into(),
            ));
        }
        Ok(Self {
            project,
            instance,
            database: connection.database.clone(),
        })
    }

    fn instance_path(&self) -> String {
        format!("projects/{}/instances/{}", self.project, self.instance)
    }

    fn database_path(&self, database: &str) -> String {
        format!("{}/databases/{}", self.instance_path(), database)
    }
}

/// How a body runs on Spanner.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Plan {
    /// Only whitespace and comments.
    Nothing,
    /// `CREATE DATABASE` followed by DDL applied as part of the creation.
    CreateDatabase { create: String, extra: Vec<String> },
    /// Schema change batch for the admin API.
    Ddl(Vec<String>),
    /// Statements for one read-write transaction.
    Dml(Vec<String>),
}

/// Routes a body to the admin API or to a read-write transaction.
///
/// A body with any DDL goes to the admin API in full; Spanner rejects DML
/// there, which surfaces as an execution error instead of a half-applied mix.
fn plan(statement: &str, create_database: bool) -> Result<Plan, DriverError> {
    let statements = sql::split_statements_with(statement, Dialect::GoogleSql);
    if statements.is_empty() {
        return Ok(Plan::Nothing);
    }

    if create_database {
        let mut statements = statements.into_iter();
        let Some(create) = statements.next() else {
            return Ok(Plan::Nothing);
        };
        if !creates_database(&create) {
            return Err(DriverError::execute(
                "expected the body to start with CREATE DATABASE",
                &create,
            ));
        }
        return Ok(Plan::CreateDatabase {
            create,
            extra: statements.collect(),
        });
    }

    if statements.iter().any(|s| sql::is_ddl(s)) {
        Ok(Plan::Ddl(statements))
    } else {
        Ok(Plan::Dml(statements))
    }
}

fn creates_database(statement: &str) -> bool {
    if sql::leading_keyword(statement).as_deref() != Some("CREATE") {
        return false;
    }
    let upper = statement.to_ascii_uppercase();
    upper
        .find("CREATE")
        .map(|pos| &upper[pos + "CREATE".len()..])
        .and_then(|rest| rest.split_whitespace().next())
        == Some("DATABASE")
}

pub struct SpannerDriver {
    client: Client,
    admin: AdminClient,
    location: Location,
    pool_size: usize,
    context: ConnectionContext,
}

impl SpannerDriver {
    pub async fn connect(
        config: &DriverConfig,
        connection: &ConnectionConfig,
        context: &ConnectionContext,
    ) -> Result<Self, DriverError> {
        let location = Location::from_connection(connection)?;

        let admin_config = if emulated() {
            AdminClientConfig::default()
        } else {
            AdminClientConfig::default()
                .with_auth()
                .await
                .map_err(|e| connect_error(e.to_string()))?
        };
        let admin = AdminClient::new(admin_config)
            .await
            .map_err(|e| connect_error(e.to_string()))?;

        let database_path = location.database_path(&location.database);
        let client = tokio::time::timeout(
            config.connect_timeout,
            open_client(&database_path, config.pool_size),
        )
        .await
        .map_err(|_| connect_error(format!("timed out opening sessions on {database_path}")))??;

        tracing::debug!(
            database = %location.database,
            instance = %location.instance_path(),
            "Opened spanner client"
        );
        Ok(Self {
            client,
            admin,
            location,
            pool_size: config.pool_size,
            context: context.clone(),
        })
    }

    fn is_ledger_database(&self, database: &str) -> bool {
        database.is_empty() || database == self.location.database
    }

    fn database_name<'a>(&'a self, database: &'a str) -> &'a str {
        if database.is_empty() {
            &self.location.database
        } else {
            database
        }
    }

    /// Applies a schema change batch and waits for the operation to finish.
    async fn update_ddl(&self, database: &str, statements: Vec<String>) -> Result<(), DriverError> {
        let body = statements.join(";\n");
        let request = UpdateDatabaseDdlRequest {
            database: self.location.database_path(database),
            statements,
            ..Default::default()
        };
        let mut operation = self
            .admin
            .database()
            .update_database_ddl(request, None)
            .await
            .map_err(|e| DriverError::execute(e.to_string(), &body))?;
        operation
            .wait(None)
            .await
            .map_err(|e| DriverError::execute(e.to_string(), &body))?;
        Ok(())
    }

    async fn create_database(&self, create: String, extra: Vec<String>) -> Result<(), DriverError> {
        let request = CreateDatabaseRequest {
            parent: self.location.instance_path(),
            create_statement: create.clone(),
            extra_statements: extra,
            ..Default::default()
        };
        let mut operation = self
            .admin
            .database()
            .create_database(request, None)
            .await
            .map_err(|e| DriverError::execute(e.to_string(), &create))?;
        operation
            .wait(None)
            .await
            .map_err(|e| DriverError::execute(e.to_string(), &create))?;
        Ok(())
    }

    /// Creates `database` unless it exists.
    pub async fn ensure_database(&self, database: &str) -> Result<(), DriverError> {
        let create = format!("CREATE DATABASE `{database}`");
        match self.create_database(create, Vec::new()).await {
            Ok(()) => {
                tracing::info!(
                    database,
                    instance = %self.context.instance_name,
                    "Created database"
                );
                Ok(())
            }
            Err(DriverError::Execute { message, .. }) if already_exists(&message) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Runs DML statements in one read-write transaction on `database`.
    async fn run_dml(&self, database: &str, statements: Vec<String>) -> Result<i64, DriverError> {
        if self.is_ledger_database(database) {
            return run_dml(&self.client, statements).await;
        }
        let path = self.location.database_path(database);
        let client = open_client(&path, self.pool_size).await?;
        let result = run_dml(&client, statements).await;
        client.close().await;
        result
    }

    /// Runs a body against `database` following its [`Plan`].
    async fn run_body(
        &self,
        database: &str,
        statement: &str,
        create_database: bool,
    ) -> Result<i64, DriverError> {
        match plan(statement, create_database)? {
            Plan::Nothing => Ok(0),
            Plan::CreateDatabase { create, extra } => {
                self.create_database(create, extra).await?;
                Ok(0)
            }
            Plan::Ddl(statements) => {
                self.update_ddl(database, statements).await?;
                Ok(0)
            }
            Plan::Dml(statements) => self.run_dml(database, statements).await,
        }
    }
}

#[async_trait]
impl Driver for SpannerDriver {
    fn engine(&self) -> EngineType {
        EngineType::Spanner
    }

    async fn ping(&self) -> Result<(), DriverError> {
        let mut tx = self
            .client
            .single()
            .await
            .map_err(|e| DriverError::Ping(e.to_string()))?;
        let mut rows = tx
            .query(Statement::new("SELECT 1"))
            .await
            .map_err(|e| DriverError::Ping(e.to_string()))?;
        rows.next()
            .await
            .map_err(|e| DriverError::Ping(e.to_string()))?;
        Ok(())
    }

    async fn close(&self) -> Result<(), DriverError> {
        self.client.clone().close().await;
        Ok(())
    }

    async fn execute(&self, statement: &str, options: ExecuteOptions) -> Result<i64, DriverError> {
        self.run_body(&self.location.database, statement, options.create_database)
            .await
    }

    fn as_migration(&self) -> Option<&dyn MigrationCapable> {
        Some(self)
    }
}

#[async_trait]
impl HistoryStore for SpannerDriver {
    async fn find_history(
        &self,
        find: &MigrationHistoryFind,
    ) -> Result<Vec<MigrationHistory>, DriverError> {
        let Some(conditions) = find.conditions() else {
            return Ok(Vec::new());
        };
        let query = find_statement(&conditions, find.limit);

        let mut tx = self
            .client
            .single()
            .await
            .map_err(|e| DriverError::Query(e.to_string()))?;
        let mut rows = tx
            .query(query)
            .await
            .map_err(|e| DriverError::Query(e.to_string()))?;
        let mut history = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DriverError::Query(e.to_string()))?
        {
            history.push(history_from_row(&row)?);
        }
        Ok(history)
    }

    async fn insert_history(&self, row: &NewHistory<'_>) -> Result<String, DriverError> {
        let record = HistoryRecord::from_new(row);
        let result: Result<_, SpannerError> = self
            .client
            .read_write_transaction(|tx| {
                let record = record.clone();
                Box::pin(async move { insert_record(tx, &record).await })
            })
            .await;
        let (_, id) = result.map_err(|e| history_insert_error(&e, row.info))?;
        Ok(id.to_string())
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
        let status = status.as_str().to_string();

        let result: Result<_, SpannerError> = self
            .client
            .read_write_transaction(|tx| {
                let status = status.clone();
                Box::pin(async move {
                    let mut stmt = Statement::new(
                        "UPDATE migration_history \
                         SET status = @status, execution_duration_ns = @duration, \
                         updated_ts = @now WHERE id = @id",
                    );
                    stmt.add_param("status", &status);
                    stmt.add_param("duration", &duration_ns);
                    stmt.add_param("now", &chrono::Utc::now().timestamp());
                    stmt.add_param("id", &numeric_id);
                    Ok(tx.update(stmt).await?)
                })
            })
            .await;
        let (_, updated) = result.map_err(|e| update_error(e.to_string()))?;
        if updated == 0 {
            return Err(update_error("no such row".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl MigrationCapable for SpannerDriver {
    async fn needs_setup_migration(&self) -> Result<bool, DriverError> {
        let mut stmt = Statement::new(
            "SELECT COUNT(*) AS table_count FROM INFORMATION_SCHEMA.TABLES \
             WHERE TABLE_SCHEMA = '' AND TABLE_NAME = @table_name",
        );
        stmt.add_param("table_name", &HISTORY_TABLE.to_string());

        let mut tx = self
            .client
            .single()
            .await
            .map_err(|e| DriverError::Query(e.to_string()))?;
        let mut rows = tx
            .query(stmt)
            .await
            .map_err(|e| DriverError::Query(e.to_string()))?;
        let count = match rows
            .next()
            .await
            .map_err(|e| DriverError::Query(e.to_string()))?
        {
            Some(row) => row
                .column_by_name::<i64>("table_count")
                .map_err(|e| DriverError::Query(e.to_string()))?,
            None => 0,
        };
        Ok(count == 0)
    }

    async fn setup_migration_if_needed(&self) -> Result<(), DriverError> {
        if !self.needs_setup_migration().await? {
            return Ok(());
        }
        tracing::info!(
            database = %self.location.database,
            environment = %self.context.environment_name,
            instance = %self.context.instance_name,
            "Creating migration history table"
        );
        let statements = CREATE_HISTORY_TABLE.iter().map(|s| s.to_string()).collect();
        if let Err(e) = self.update_ddl(&self.location.database, statements).await {
            // A concurrent setup may have won the race.
            if self.needs_setup_migration().await? {
                return Err(DriverError::Setup(e.to_string()));
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

        let database = self.database_name(&info.database);
        if info.create_database && !self.is_ledger_database(database) {
            self.ensure_database(database).await?;
        }

        let execute = ledger::should_execute(info, statement);
        let statements = match plan(statement, false)? {
            Plan::Dml(statements) if execute => statements,
            Plan::Nothing | Plan::Dml(_) => Vec::new(),
            Plan::Ddl(_) | Plan::CreateDatabase { .. } if !execute => Vec::new(),
            Plan::Ddl(_) | Plan::CreateDatabase { .. } => {
                return ledger::execute_two_phase(
                    self,
                    info,
                    statement,
                    sequence,
                    retry_id,
                    || async { self.run_body(database, statement, false).await.map(|_| ()) },
                )
                .await;
            }
        };

        if retry_id.is_some() || !self.is_ledger_database(database) {
            return ledger::execute_two_phase(self, info, statement, sequence, retry_id, || async {
                self.run_dml(database, statements.clone()).await.map(|_| ())
            })
            .await;
        }

        let started = Instant::now();
        let record = HistoryRecord::from_new(&NewHistory::new(
            info,
            statement,
            sequence,
            MigrationStatus::Done,
        ));
        let result: Result<_, SpannerError> = self
            .client
            .read_write_transaction(|tx| {
                let statements = statements.clone();
                let mut record = record.clone();
                Box::pin(async move {
                    if !statements.is_empty() {
                        tx.batch_update(statements.into_iter().map(Statement::new).collect())
                            .await?;
                    }
                    record.execution_duration_ns = ledger::elapsed_ns(started);
                    let id = insert_record(tx, &record).await?;
                    Ok((id, record.execution_duration_ns))
                })
            })
            .await;
        let (_, (history_id, duration_ns)) = result.map_err(|e| {
            if is_unique_violation(&e.to_string()) {
                history_insert_error(&e, info)
            } else {
                DriverError::execute(e.to_string(), statement)
            }
        })?;

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

/// Owned copy of a [`NewHistory`] that a retried transaction can reuse.
#[derive(Debug, Clone)]
struct HistoryRecord {
    creator: String,
    release_version: String,
    namespace: String,
    sequence: i64,
    source: String,
    migration_type: String,
    status: String,
    version: String,
    description: String,
    statement: String,
    checksum: String,
    execution_duration_ns: i64,
    issue_id: Option<String>,
    payload: Option<String>,
}

impl HistoryRecord {
    fn from_new(row: &NewHistory<'_>) -> Self {
        let info = row.info;
        Self {
            creator: info.creator.clone(),
            release_version: info.release_version.clone(),
            namespace: info.namespace.clone(),
            sequence: row.sequence,
            source: info.source.as_str().to_string(),
            migration_type: info.migration_type.as_str().to_string(),
            status: row.status.as_str().to_string(),
            version: info.version.clone(),
            description: info.description.clone(),
            statement: row.statement.to_string(),
            checksum: row.checksum.clone(),
            execution_duration_ns: row.execution_duration_ns,
            issue_id: info.issue_id.clone(),
            payload: row.payload_text(),
        }
    }

    fn insert_statement(&self, id: i64, now: i64) -> Statement {
        let mut stmt = Statement::new(INSERT_HISTORY);
        stmt.add_param("id", &id);
        stmt.add_param("creator", &self.creator);
        stmt.add_param("now", &now);
        stmt.add_param("release_version", &self.release_version);
        stmt.add_param("namespace", &self.namespace);
        stmt.add_param("sequence", &self.sequence);
        stmt.add_param("source", &self.source);
        stmt.add_param("migration_type", &self.migration_type);
        stmt.add_param("status", &self.status);
        stmt.add_param("version", &self.version);
        stmt.add_param("description", &self.description);
        stmt.add_param("statement", &self.statement);
        stmt.add_param("checksum", &self.checksum);
        stmt.add_param("execution_duration_ns", &self.execution_duration_ns);
        stmt.add_param("issue_id", &self.issue_id);
        stmt.add_param("payload", &self.payload);
        stmt
    }
}

/// Allocates the next id and inserts the row inside `tx`.
async fn insert_record(
    tx: &mut ReadWriteTransaction,
    record: &HistoryRecord,
) -> Result<i64, SpannerError> {
    let id = {
        let mut rows = tx.query(Statement::new(NEXT_HISTORY_ID)).await?;
        match rows.next().await? {
            Some(row) => row.column_by_name::<i64>("next_id")?,
            None => 1,
        }
    };
    tx.update(record.insert_statement(id, chrono::Utc::now().timestamp()))
        .await?;
    Ok(id)
}

async fn run_dml(client: &Client, statements: Vec<String>) -> Result<i64, DriverError> {
    if statements.is_empty() {
        return Ok(0);
    }
    let body = statements.join(";\n");
    let result: Result<_, SpannerError> = client
        .read_write_transaction(|tx| {
            let statements = statements.clone();
            Box::pin(async move {
                let stmts = statements.into_iter().map(Statement::new).collect();
                Ok(tx.batch_update(stmts).await?)
            })
        })
        .await;
    let (_, counts) = result.map_err(|e| DriverError::execute(e.to_string(), &body))?;
    Ok(counts.iter().sum())
}

async fn open_client(database_path: &str, pool_size: usize) -> Result<Client, DriverError> {
    let mut config = if emulated() {
        ClientConfig::default()
    } else {
        ClientConfig::default()
            .with_auth()
            .await
            .map_err(|e| connect_error(e.to_string()))?
    };
    config.session_config.max_opened = pool_size.max(1);
    config.session_config.min_opened = config
        .session_config
        .min_opened
        .min(config.session_config.max_opened);
    Client::new(database_path, config)
        .await
        .map_err(|e| connect_error(e.to_string()))
}

fn emulated() -> bool {
    std::env::var_os(EMULATOR_HOST_ENV).is_some()
}

/// `SELECT ... WHERE a = @a AND b = @b ORDER BY sequence DESC [LIMIT n]`.
fn build_find_query(conditions: &[(&'static str, FilterValue)], limit: Option<usize>) -> String {
    let mut query = format!("SELECT {HISTORY_COLUMNS} FROM {HISTORY_TABLE}");
    if !conditions.is_empty() {
        let clauses: Vec<String> = conditions
            .iter()
            .map(|(column, _)| format!("{column} = @{column}"))
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

fn find_statement(conditions: &[(&'static str, FilterValue)], limit: Option<usize>) -> Statement {
    let mut stmt = Statement::new(build_find_query(conditions, limit));
    for (column, value) in conditions {
        match value {
            FilterValue::Int(v) => stmt.add_param(column, v),
            FilterValue::Text(v) => stmt.add_param(column, v),
        }
    }
    stmt
}

fn history_from_row(row: &Row) -> Result<MigrationHistory, DriverError> {
    let decode = |e: google_cloud_spanner::row::Error| {
        DriverError::Query(format!("failed to decode row: {e}"))
    };
    let invalid = |e: String| DriverError::Query(format!("failed to decode row: {e}"));
    let text = |column: &str| row.column_by_name::<String>(column).map_err(decode);
    let int = |column: &str| row.column_by_name::<i64>(column).map_err(decode);

    let payload = row
        .column_by_name::<Option<String>>("payload")
        .map_err(decode)?
        .map(|text| serde_json::from_str(&text))
        .transpose()
        .map_err(|e| invalid(e.to_string()))?;

    Ok(MigrationHistory {
        id: int("id")?.to_string(),
        creator: text("created_by")?,
        created_ts: int("created_ts")?,
        updater: text("updated_by")?,
        updated_ts: int("updated_ts")?,
        release_version: text("release_version")?,
        namespace: text("namespace")?,
        sequence: int("sequence")?,
        source: text("source")?.parse().map_err(invalid)?,
        migration_type: text("type")?.parse().map_err(invalid)?,
        status: text("status")?.parse().map_err(invalid)?,
        version: text("version")?,
        description: text("description")?,
        statement: text("statement")?,
        checksum: text("checksum")?,
        execution_duration_ns: int("execution_duration_ns")?,
        issue_id: row
            .column_by_name::<Option<String>>("issue_id")
            .map_err(decode)?,
        payload,
    })
}

fn is_unique_violation(message: &str) -> bool {
    message.contains(UNIQUE_VERSION_INDEX) || message.contains(UNIQUE_SEQUENCE_INDEX)
}

/// Maps unique-index violations to the ledger errors they stand for.
fn history_insert_error(e: &SpannerError, info: &MigrationInfo) -> DriverError {
    let message = e.to_string();
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
    DriverError::HistoryInsert(message)
}

fn already_exists(message: &str) -> bool {
    message.contains("AlreadyExists") || message.contains("already exists")
}

fn connect_error(message: String) -> DriverError {
    DriverError::Connect {
        engine: EngineType::Spanner,
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection() -> ConnectionConfig {
        ConnectionConfig {
            project: Some("acme".into()),
            instance: Some("main".into()),
            database: "meta".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_location_paths() {
        let location = Location::from_connection(&connection()).unwrap();
        assert_eq!(location.instance_path(), "projects/acme/instances/main");
        assert_eq!(
            location.database_path("shop"),
            "projects/acme/instances/main/databases/shop"
        );
    }

    #[test]
    fn test_location_requires_project_instance_and_database() {
        let mut missing_project = connection();
        missing_project.project = None;
        let mut empty_instance = connection();
        empty_instance.instance = Some(String::new());
        let mut missing_database = connection();
        missing_database.database.clear();

        for config in [missing_project, empty_instance, missing_database] {
            assert!(matches!(
                Location::from_connection(&config),
                Err(DriverError::Config(_))
            ));
        }
    }

    #[test]
    fn test_plan_routes_ddl_to_admin_api() {
        let body = "CREATE TABLE t (id INT64) PRIMARY KEY (id);\n\
                    CREATE INDEX t_by_id ON t (id);";
        assert_eq!(
            plan(body, false).unwrap(),
            Plan::Ddl(vec![
                "CREATE TABLE t (id INT64) PRIMARY KEY (id)".into(),
                "CREATE INDEX t_by_id ON t (id)".into(),
            ])
        );
    }

    #[test]
    fn test_plan_sends_mixed_body_to_admin_api() {
        let body = "INSERT INTO t (id) VALUES (1);\nALTER TABLE t ADD COLUMN name STRING(MAX);";
        assert!(matches!(plan(body, false).unwrap(), Plan::Ddl(statements) if statements.len() == 2));
    }

    #[test]
    fn test_plan_routes_dml_to_transaction() {
        let body = "-- seed\nINSERT INTO t (id) VALUES (1);\nUPDATE t SET id = 2 WHERE id = 1;";
        assert_eq!(
            plan(body, false).unwrap(),
            Plan::Dml(vec![
                "-- seed\nINSERT INTO t (id) VALUES (1)".into(),
                "UPDATE t SET id = 2 WHERE id = 1".into(),
            ])
        );
    }

    #[test]
    fn test_plan_of_comment_only_body_is_nothing() {
        assert_eq!(plan("-- nothing\n# here\n;", false).unwrap(), Plan::Nothing);
        assert_eq!(plan("", true).unwrap(), Plan::Nothing);
    }

    #[test]
    fn test_plan_splits_with_backslash_escapes() {
        let body = r"INSERT INTO t (s) VALUES ('it\'s; fine');";
        assert_eq!(
            plan(body, false).unwrap(),
            Plan::Dml(vec![r"INSERT INTO t (s) VALUES ('it\'s; fine')".into()])
        );
    }

    #[test]
    fn test_plan_create_database_carries_extra_statements() {
        let body = "/* new */ create database shop;\nCREATE TABLE t (id INT64) PRIMARY KEY (id);";
        assert_eq!(
            plan(body, true).unwrap(),
            Plan::CreateDatabase {
                create: "/* new */ create database shop".into(),
                extra: vec!["CREATE TABLE t (id INT64) PRIMARY KEY (id)".into()],
            }
        );
    }

    #[test]
    fn test_plan_create_database_requires_create_statement_first() {
        let result = plan("CREATE TABLE t (id INT64) PRIMARY KEY (id);", true);
        assert!(matches!(result, Err(DriverError::Execute { .. })));
    }

    #[test]
    fn test_creates_database() {
        assert!(creates_database("CREATE DATABASE shop"));
        assert!(creates_database("-- x\ncreate\n  database `shop`"));
        assert!(!creates_database("CREATE TABLE database (id INT64) PRIMARY KEY (id)"));
        assert!(!creates_database("DROP DATABASE shop"));
    }

    #[test]
    fn test_build_find_query_uses_named_params() {
        let find = MigrationHistoryFind::namespace("meta")
            .with_version("10001")
            .with_limit(1);
        let conditions = find.conditions().unwrap();
        let query = build_find_query(&conditions, find.limit);
        assert!(query.ends_with(
            "WHERE namespace = @namespace AND version = @version \
             ORDER BY sequence DESC, id DESC LIMIT 1"
        ));
        assert!(!query.contains("meta"));
    }

    #[test]
    fn test_history_table_declares_unique_indexes() {
        assert_eq!(CREATE_HISTORY_TABLE.len(), 3);
        assert!(CREATE_HISTORY_TABLE[1].contains(UNIQUE_VERSION_INDEX));
        assert!(CREATE_HISTORY_TABLE[2].contains(UNIQUE_SEQUENCE_INDEX));
        for column in HISTORY_COLUMNS.split(", ") {
            assert!(CREATE_HISTORY_TABLE[0].contains(column.trim()), "{column}");
            assert!(INSERT_HISTORY.contains(column.trim()), "{column}");
        }
        for stmt in CREATE_HISTORY_TABLE {
            assert!(sql::is_ddl(stmt));
        }
    }

    #[test]
    fn test_already_exists() {
        assert!(already_exists(
            "status: AlreadyExists, message: \"Database already exists\""
        ));
        assert!(!already_exists("status: NotFound"));
    }
}
