//! Value types shared by every driver.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::driver::tls::TlsConfig;

/// Characters a path-template placeholder may capture.
const PLACEHOLDER_PATTERN: &str = r#"[^\\/?%*:|"<>]+"#;

const PLACEHOLDERS: [&str; 5] = ["ENV_NAME", "VERSION", "DB_NAME", "TYPE", "DESCRIPTION"];

// =============================================================================
// Engine and connection settings
// =============================================================================

/// Database engines a driver can be registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineType {
    Postgres,
    MySql,
    MongoDb,
    Spanner,
    /// In-process backend used by tests and dry runs.
    Memory,
}

impl EngineType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::MySql => "mysql",
            Self::MongoDb => "mongodb",
            Self::Spanner => "spanner",
            Self::Memory => "memory",
        }
    }
}

impl fmt::Display for EngineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngineType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "mysql" => Ok(Self::MySql),
            "mongodb" | "mongo" => Ok(Self::MongoDb),
            "spanner" => Ok(Self::Spanner),
            "memory" => Ok(Self::Memory),
            other => Err(format!("unknown engine {other:?}")),
        }
    }
}

/// Driver-wide tuning that does not depend on a particular connection.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Upper bound of pooled connections per database.
    pub pool_size: usize,
    pub connect_timeout: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            pool_size: 8,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Connection parameters, the superset of what every engine needs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: Option<u16>,
    pub username: String,
    pub password: String,
    pub database: String,
    pub tls: TlsConfig,
    /// Open sessions that refuse writes.
    pub read_only: bool,
    /// MongoDB: resolve `host` through DNS SRV records.
    pub srv: bool,
    /// MongoDB: database holding the user's credentials.
    pub auth_source: Option<String>,
    /// Spanner: owning project.
    pub project: Option<String>,
    /// Spanner: instance within the project.
    pub instance: Option<String>,
}

impl ConnectionConfig {
    /// Human-readable target for logs. Never includes credentials.
    pub fn target(&self, engine: EngineType) -> String {
        match engine {
            EngineType::Spanner => format!(
                "projects/{}/instances/{}/databases/{}",
                self.project.as_deref().unwrap_or("-"),
                self.instance.as_deref().unwrap_or("-"),
                self.database
            ),
            _ => match self.port {
                Some(port) => format!("{}:{}/{}", self.host, port, self.database),
                None => format!("{}/{}", self.host, self.database),
            },
        }
    }
}

/// Display-only context about where a connection points.
#[derive(Debug, Clone, Default)]
pub struct ConnectionContext {
    pub environment_name: String,
    pub instance_name: String,
}

/// Options for [`Driver::execute`](crate::driver::Driver::execute).
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecuteOptions {
    /// The first statement creates a database and must run outside a
    /// transaction.
    pub create_database: bool,
}

// =============================================================================
// Migration enums
// =============================================================================

macro_rules! string_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(format!(
                        concat!("invalid ", stringify!($name), " {:?}"),
                        other
                    )),
                }
            }
        }
    };
}

string_enum! {
    /// Where a migration came from.
    MigrationSource {
        Ui => "UI",
        Vcs => "VCS",
        Library => "LIBRARY",
    }
}

string_enum! {
    /// What a migration does.
    MigrationType {
        Baseline => "BASELINE",
        Migrate => "MIGRATE",
        Branch => "BRANCH",
        Data => "DATA",
    }
}

string_enum! {
    /// Lifecycle of a ledger row.
    MigrationStatus {
        Pending => "PENDING",
        Done => "DONE",
        Failed => "FAILED",
    }
}

impl MigrationType {
    /// Baseline and branch rows record a state; they run no statement.
    pub fn executes_statement(&self) -> bool {
        matches!(self, Self::Migrate | Self::Data)
    }
}

// =============================================================================
// Migration info and history rows
// =============================================================================

/// One attempt to apply a migration. Translated by each driver into its
/// own history row format.
#[derive(Debug, Clone)]
pub struct MigrationInfo {
    pub release_version: String,
    /// Integer-encoded version for library migrations, free-form for VCS.
    pub version: String,
    /// Logical database group the ledger sequences by.
    pub namespace: String,
    /// Target database; empty means the connected database.
    pub database: String,
    pub environment: String,
    pub source: MigrationSource,
    pub migration_type: MigrationType,
    pub description: String,
    pub creator: String,
    pub issue_id: Option<String>,
    pub payload: Option<serde_json::Value>,
    pub create_database: bool,
    /// Retry over a PENDING or FAILED row with the same version.
    pub force: bool,
}

impl MigrationInfo {
    /// A `LIBRARY`/`MIGRATE` migration of `namespace` at `version`.
    pub fn new(namespace: impl Into<String>, version: impl Into<String>) -> Self {
        let namespace = namespace.into();
        Self {
            release_version: String::new(),
            version: version.into(),
            database: namespace.clone(),
            namespace,
            environment: String::new(),
            source: MigrationSource::Library,
            migration_type: MigrationType::Migrate,
            description: String::new(),
            creator: String::new(),
            issue_id: None,
            payload: None,
            create_database: false,
            force: false,
        }
    }

    /// Parses migration metadata out of a repository file path.
    ///
    /// `template` may contain the placeholders `{{ENV_NAME}}`, `{{VERSION}}`,
    /// `{{DB_NAME}}`, `{{TYPE}}` (`migrate` or `data`) and `{{DESCRIPTION}}`,
    /// plus `/*/` (one directory) and `**` (anything) wildcards.
    ///
    /// ```
    /// use schemaledger::driver::{MigrationInfo, MigrationType};
    ///
    /// let info = MigrationInfo::from_file_path(
    ///     "schema/prod/shop__2021.1__data__seed_products.sql",
    ///     "schema/{{ENV_NAME}}/{{DB_NAME}}__{{VERSION}}__{{TYPE}}__{{DESCRIPTION}}.sql",
    /// )
    /// .unwrap();
    /// assert_eq!(info.database, "shop");
    /// assert_eq!(info.migration_type, MigrationType::Data);
    /// assert_eq!(info.description, "Seed products");
    /// ```
    pub fn from_file_path(path: &str, template: &str) -> Result<Self, FilePathError> {
        let mut pattern = template
            .replace('.', r"\.")
            .replace("/*/", "/[^/]*/")
            .replace("**", ".*");
        for placeholder in PLACEHOLDERS {
            pattern = pattern.replace(
                &format!("{{{{{placeholder}}}}}"),
                &format!("(?P<{placeholder}>{PLACEHOLDER_PATTERN})"),
            );
        }
        let regex = Regex::new(&pattern).map_err(|e| FilePathError::InvalidTemplate {
            template: template.to_string(),
            message: e.to_string(),
        })?;
        let captures = regex
            .captures(path)
            .ok_or_else(|| FilePathError::NoMatch {
                path: path.to_string(),
                template: template.to_string(),
            })?;
        let capture = |name: &str| captures.name(name).map(|m| m.as_str().to_string());

        let version = capture("VERSION").ok_or(FilePathError::MissingPlaceholder("VERSION"))?;
        let database = capture("DB_NAME").ok_or(FilePathError::MissingPlaceholder("DB_NAME"))?;
        let migration_type = match capture("TYPE").as_deref() {
            None | Some("migrate") => MigrationType::Migrate,
            Some("data") => MigrationType::Data,
            Some(other) => return Err(FilePathError::InvalidType(other.to_string())),
        };
        let description = match capture("DESCRIPTION") {
            Some(raw) => humanize(&raw),
            None => match migration_type {
                MigrationType::Baseline => format!("Create {database} baseline"),
                MigrationType::Data => format!("Create {database} data change"),
                _ => format!("Create {database} schema migration"),
            },
        };

        let mut info = Self::new(database, version);
        info.environment = capture("ENV_NAME").unwrap_or_default();
        info.source = MigrationSource::Vcs;
        info.migration_type = migration_type;
        info.description = description;
        Ok(info)
    }
}

/// `add_user_table` -> `Add user table`.
fn humanize(raw: &str) -> String {
    let spaced = raw.replace('_', " ");
    let mut chars = spaced.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => spaced,
    }
}

/// Errors from [`MigrationInfo::from_file_path`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilePathError {
    #[error("invalid file path template {template:?}: {message}")]
    InvalidTemplate { template: String, message: String },

    #[error("file path {path:?} does not match file path template {template:?}")]
    NoMatch { path: String, template: String },

    #[error("file path template does not contain {{{{{0}}}}}")]
    MissingPlaceholder(&'static str),

    #[error("invalid migration type {0:?}, must be 'migrate' or 'data'")]
    InvalidType(String),
}

/// A persisted ledger row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationHistory {
    pub id: String,
    pub creator: String,
    pub created_ts: i64,
    pub updater: String,
    pub updated_ts: i64,
    pub release_version: String,
    pub namespace: String,
    pub sequence: i64,
    pub source: MigrationSource,
    pub migration_type: MigrationType,
    pub status: MigrationStatus,
    pub version: String,
    pub description: String,
    pub statement: String,
    /// SHA-256 hex of `statement`.
    pub checksum: String,
    pub execution_duration_ns: i64,
    pub issue_id: Option<String>,
    pub payload: Option<serde_json::Value>,
}

/// Filter for [`MigrationCapable::find_migration_history_list`].
///
/// Results are always most recent first (by sequence).
///
/// [`MigrationCapable::find_migration_history_list`]: crate::driver::MigrationCapable::find_migration_history_list
#[derive(Debug, Clone, Default)]
pub struct MigrationHistoryFind {
    pub id: Option<String>,
    pub namespace: Option<String>,
    pub source: Option<MigrationSource>,
    pub version: Option<String>,
    pub status: Option<MigrationStatus>,
    pub limit: Option<usize>,
}

/// A typed filter value for parameterized history queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterValue {
    Int(i64),
    Text(String),
}

impl MigrationHistoryFind {
    pub fn namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            ..Self::default()
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_status(mut self, status: MigrationStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Column/value pairs for a `WHERE a = ? AND b = ?` clause.
    ///
    /// Returns `None` when the filter can never match (a non-numeric id).
    pub fn conditions(&self) -> Option<Vec<(&'static str, FilterValue)>> {
        let mut conditions = Vec::new();
        if let Some(id) = &self.id {
            conditions.push(("id", FilterValue::Int(id.parse().ok()?)));
        }
        if let Some(namespace) = &self.namespace {
            conditions.push(("namespace", FilterValue::Text(namespace.clone())));
        }
        if let Some(source) = &self.source {
            conditions.push(("source", FilterValue::Text(source.as_str().to_string())));
        }
        if let Some(version) = &self.version {
            conditions.push(("version", FilterValue::Text(version.clone())));
        }
        if let Some(status) = &self.status {
            conditions.push(("status", FilterValue::Text(status.as_str().to_string())));
        }
        Some(conditions)
    }

    /// In-process equivalent of [`conditions`](Self::conditions).
    pub fn matches(&self, row: &MigrationHistory) -> bool {
        self.id.as_ref().map_or(true, |id| *id == row.id)
            && self.namespace.as_ref().map_or(true, |ns| *ns == row.namespace)
            && self.source.map_or(true, |source| source == row.source)
            && self.version.as_ref().map_or(true, |v| *v == row.version)
            && self.status.map_or(true, |status| status == row.status)
    }
}

/// What `execute_migration` reports back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationOutcome {
    pub history_id: String,
    pub duration_ns: i64,
    /// The version already had a DONE row; nothing was executed.
    pub already_applied: bool,
}
