//! Configuration with layered resolution using figment.
//!
//! Resolution order (highest priority last):
//! 1. User config: `~/.config/schemaledger/config.toml` (XDG) or platform config dir
//! 2. Project config: `.schemaledger.toml`
//! 3. Environment variables: `SCHEMALEDGER_*`, nested keys split on `__`
//!    (`SCHEMALEDGER_METADATA__HOST`, `SCHEMALEDGER_MIGRATION__FORCE_RESET_SEED`)
//!
//! # Intended Usage
//!
//! **Global config** (`~/.config/schemaledger/config.toml`):
//! ```toml
//! [metadata]
//! engine = "postgres"
//! host = "db.internal"
//! port = 5432
//! username = "schemaledger"
//! password = "secret"
//!
//! [metadata.tls]
//! ssl_ca = "-----BEGIN CERTIFICATE-----..."
//! ```
//!
//! **Project config** (`.schemaledger.toml`):
//! ```toml
//! [metadata]
//! database = "meta"
//! environment = "staging"
//!
//! [migration]
//! release_version = "2.4.0"
//! create_database = true
//! ```

use std::path::PathBuf;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;
use thiserror::Error;

use crate::driver::{ConnectionConfig, ConnectionContext, DriverConfig, EngineType};

/// Namespace used when no database is configured.
pub const DEFAULT_NAMESPACE: &str = "schemaledger";

/// Project config file name, looked up in the working directory.
pub const PROJECT_CONFIG_FILE: &str = ".schemaledger.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    /// Boxed to keep `Result<_, ConfigError>` small on the stack.
    #[error(transparent)]
    Figment(Box<figment::Error>),

    #[error("{engine} requires metadata.{key}")]
    Missing {
        engine: EngineType,
        key: &'static str,
    },

    #[error("invalid {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub migration: MigrationConfig,
    #[serde(default)]
    pub pool: PoolConfig,
}

/// Where the metadata database lives.
#[derive(Debug, Clone, Deserialize)]
pub struct MetadataConfig {
    #[serde(default = "default_engine")]
    pub engine: EngineType,
    /// Display name of the environment, for logs only.
    #[serde(default)]
    pub environment: String,
    /// Display name of the instance, for logs only.
    #[serde(default)]
    pub instance: String,
    #[serde(flatten)]
    pub connection: ConnectionConfig,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            engine: default_engine(),
            environment: String::new(),
            instance: String::new(),
            connection: ConnectionConfig::default(),
        }
    }
}

fn default_engine() -> EngineType {
    EngineType::Postgres
}

/// Orchestrator settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Reload every seed file after migrating. Test and demo setups only.
    pub force_reset_seed: bool,
    /// Retry PENDING/FAILED ledger rows instead of refusing to run.
    pub force: bool,
    /// Create the metadata database on a fresh install.
    pub create_database: bool,
    /// Recorded on every ledger row. Defaults to the crate version.
    pub release_version: Option<String>,
    /// Recorded as creator on every ledger row.
    pub creator: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max_size: usize,
    pub connect_timeout_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let defaults = DriverConfig::default();
        Self {
            max_size: defaults.pool_size,
            connect_timeout_secs: defaults.connect_timeout.as_secs(),
        }
    }
}

impl Config {
    /// Load config with layered resolution (user → project → env), then
    /// validate it.
    pub fn load() -> Result<Self, ConfigError> {
        let figment = Figment::new()
            // Layer 1: User config (lowest priority)
            .merge(Toml::file(Self::user_config_path()))
            // Layer 2: Project config
            .merge(Toml::file(PROJECT_CONFIG_FILE))
            // Layer 3: Environment variables (highest priority)
            .merge(Env::prefixed("SCHEMALEDGER_").split("__"));
        Self::from_figment(figment)
    }

    /// Extracts and validates a config from any figment.
    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Checks what can be checked without touching the network.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let engine = self.metadata.engine;
        let connection = &self.metadata.connection;
        let missing = |key| ConfigError::Missing { engine, key };

        match engine {
            EngineType::Memory => {}
            EngineType::Spanner => {
                if connection.project.as_deref().unwrap_or_default().is_empty() {
                    return Err(missing("project"));
                }
                if connection.instance.as_deref().unwrap_or_default().is_empty() {
                    return Err(missing("instance"));
                }
                if connection.database.is_empty() {
                    return Err(missing("database"));
                }
            }
            EngineType::MySql => {
                if connection.host.is_empty() {
                    return Err(missing("host"));
                }
                if connection.database.is_empty() {
                    return Err(missing("database"));
                }
            }
            EngineType::Postgres | EngineType::MongoDb => {
                if connection.host.is_empty() {
                    return Err(missing("host"));
                }
            }
        }

        connection
            .tls
            .material()
            .map_err(|e| ConfigError::Invalid {
                key: "metadata.tls",
                message: e.to_string(),
            })?;

        if self.pool.max_size == 0 {
            return Err(ConfigError::Invalid {
                key: "pool.max_size",
                message: "must be at least 1".into(),
            });
        }
        Ok(())
    }

    /// Namespace the metadata migrations are recorded under.
    pub fn namespace(&self) -> &str {
        match self.metadata.connection.database.as_str() {
            "" => DEFAULT_NAMESPACE,
            database => database,
        }
    }

    pub fn driver_config(&self) -> DriverConfig {
        DriverConfig {
            pool_size: self.pool.max_size,
            connect_timeout: Duration::from_secs(self.pool.connect_timeout_secs),
        }
    }

    pub fn connection_context(&self) -> ConnectionContext {
        ConnectionContext {
            environment_name: self.metadata.environment.clone(),
            instance_name: self.metadata.instance.clone(),
        }
    }

    /// User config path: ~/.config/schemaledger/config.toml (XDG) or platform config dir.
    pub fn user_config_path() -> PathBuf {
        // Prefer XDG config location (~/.config) on all platforms
        if let Some(home) = dirs::home_dir() {
            let xdg_path = home.join(".config").join("schemaledger").join("config.toml");
            if xdg_path.exists() {
                return xdg_path;
            }
        }
        // Fall back to platform-specific config dir
        dirs::config_dir()
            .map(|p| p.join("schemaledger").join("config.toml"))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml: &str) -> Result<Config, ConfigError> {
        Config::from_figment(Figment::from(Toml::string(toml)))
    }

    #[test]
    fn test_postgres_config() {
        let config = parse(
            r#"
            [metadata]
            engine = "postgres"
            host = "db.internal"
            port = 5433
            username = "ledger"
            database = "meta"
            environment = "prod"
            read_only = true

            [migration]
            force_reset_seed = true
            release_version = "2.4.0"

            [pool]
            max_size = 4
            "#,
        )
        .unwrap();

        assert_eq!(config.metadata.engine, EngineType::Postgres);
        assert_eq!(config.metadata.connection.host, "db.internal");
        assert_eq!(config.metadata.connection.port, Some(5433));
        assert!(config.metadata.connection.read_only);
        assert_eq!(config.namespace(), "meta");
        assert!(config.migration.force_reset_seed);
        assert_eq!(config.migration.release_version.as_deref(), Some("2.4.0"));
        assert_eq!(config.driver_config().pool_size, 4);
        assert_eq!(config.driver_config().connect_timeout, Duration::from_secs(10));
        assert_eq!(config.connection_context().environment_name, "prod");
    }

    #[test]
    fn test_engine_defaults_to_postgres_and_namespace_to_default() {
        let config = parse("[metadata]\nhost = \"localhost\"").unwrap();
        assert_eq!(config.metadata.engine, EngineType::Postgres);
        assert_eq!(config.namespace(), DEFAULT_NAMESPACE);
    }

    #[test]
    fn test_missing_host_is_rejected_before_connecting() {
        let err = parse("[metadata]\nengine = \"postgres\"").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Missing {
                engine: EngineType::Postgres,
                key: "host"
            }
        ));

        let err = parse("[metadata]\nengine = \"mysql\"\nhost = \"h\"").unwrap_err();
        assert!(matches!(err, ConfigError::Missing { key: "database", .. }));

        let err = parse("[metadata]\nengine = \"spanner\"\ndatabase = \"d\"").unwrap_err();
        assert!(matches!(err, ConfigError::Missing { key: "project", .. }));
    }

    #[test]
    fn test_memory_needs_nothing() {
        let config = parse("[metadata]\nengine = \"memory\"").unwrap();
        assert_eq!(config.metadata.engine, EngineType::Memory);
    }

    #[test]
    fn test_half_tls_pair_is_a_config_error() {
        let err = parse(
            r#"
            [metadata]
            host = "localhost"
            [metadata.tls]
            ssl_ca = "x"
            ssl_cert = "y"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "metadata.tls", .. }));
        assert!(err.to_string().contains("both set or unset"));
    }

    #[test]
    fn test_unknown_engine_is_a_parse_error() {
        let err = parse("[metadata]\nengine = \"oracle\"\nhost = \"h\"").unwrap_err();
        assert!(matches!(err, ConfigError::Figment(_)));
    }

    #[test]
    fn test_zero_pool_is_rejected() {
        let err = parse("[metadata]\nhost = \"h\"\n[pool]\nmax_size = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "pool.max_size", .. }));
    }
}
