//! Integration tests for the PostgreSQL backend.
//!
//! These tests require a running PostgreSQL instance.
//! Run with: `cargo test --features integration --test postgres_integration`
//!
//! Connection defaults to `postgres:postgres@localhost:5432/schemaledger_test`
//! and can be overridden with `SCHEMALEDGER_TEST_PG_HOST` / `_PORT`.

#![cfg(feature = "integration")]

use schemaledger::driver::backends::postgres::PostgresDriver;
use schemaledger::driver::{
    ConnectionConfig, ConnectionContext, Driver, DriverConfig, DriverError, ExecuteOptions,
    MigrationCapable, MigrationHistoryFind, MigrationInfo, MigrationStatus, MigrationType,
};
use schemaledger::error::MigrationError;
use schemaledger::migrations::{MigrationSet, Migrator, MigratorOptions, SCHEMA_VERSION};
use serial_test::serial;

const TEST_DATABASE: &str = "schemaledger_test";

const RESET: &str = r#"
DROP TABLE IF EXISTS migration_history, activity, data_source, db, instance, project,
    environment, principal, it_atomic CASCADE;
"#;

fn connection(database: &str) -> ConnectionConfig {
    ConnectionConfig {
        host: std::env::var("SCHEMALEDGER_TEST_PG_HOST").unwrap_or_else(|_| "localhost".into()),
        port: std::env::var("SCHEMALEDGER_TEST_PG_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .or(Some(5432)),
        username: "postgres".into(),
        password: "postgres".into(),
        database: database.into(),
        ..Default::default()
    }
}

/// Connects to the test database, creating it if needed, and drops every
/// table the tests touch.
async fn create_driver() -> PostgresDriver {
    let admin = PostgresDriver::connect(
        &DriverConfig::default(),
        &connection("postgres"),
        &ConnectionContext::default(),
    )
    .expect("Failed to build admin driver");
    admin
        .ensure_database(TEST_DATABASE)
        .await
        .expect("Failed to create test database");
    admin.close().await.unwrap();

    let driver = PostgresDriver::connect(
        &DriverConfig::default(),
        &connection(TEST_DATABASE),
        &ConnectionContext::default(),
    )
    .expect("Failed to build driver");
    driver
        .execute(RESET, ExecuteOptions::default())
        .await
        .expect("Failed to reset test database");
    driver
}

fn options() -> MigratorOptions {
    MigratorOptions::new(TEST_DATABASE)
}

// All tests share one database and run serially
#[serial]
mod database_tests {
    use super::*;

    #[tokio::test]
    async fn test_ping() {
        let driver = create_driver().await;
        driver.ping().await.expect("Ping failed");
    }

    #[tokio::test]
    async fn test_setup_is_idempotent() {
        let driver = create_driver().await;
        assert!(driver.needs_setup_migration().await.unwrap());

        driver.setup_migration_if_needed().await.unwrap();
        driver.setup_migration_if_needed().await.unwrap();

        assert!(!driver.needs_setup_migration().await.unwrap());
    }

    #[tokio::test]
    async fn test_embedded_migrations_fresh_install_and_rerun() {
        let driver = create_driver().await;

        let migrator = Migrator::embedded(&driver, options()).unwrap();
        let result = migrator.run().await.expect("Migration failed");
        assert_eq!(result.current_version, SCHEMA_VERSION);
        assert_eq!(result.applied_migrations.len(), 3);
        assert_eq!(result.applied_seeds.len(), 2);

        let rows = driver
            .find_migration_history_list(&MigrationHistoryFind::namespace(TEST_DATABASE))
            .await
            .unwrap();
        let versions: Vec<_> = rows.iter().rev().map(|r| r.version.as_str()).collect();
        assert_eq!(versions, ["10000", "10001", "10002"]);
        assert!(rows.iter().all(|r| r.status == MigrationStatus::Done));

        let again = migrator.run().await.unwrap();
        assert!(again.applied_migrations.is_empty());
        assert!(again.applied_seeds.is_empty());
    }

    #[tokio::test]
    async fn test_failed_file_rolls_back_ddl() {
        let driver = create_driver().await;
        let broken = MigrationSet::parse([
            ("10000__init.sql", "CREATE TABLE principal (id INT);"),
            (
                "10001__atomic.sql",
                "CREATE TABLE it_atomic (id INT);\nSELECT no_such_function();",
            ),
        ])
        .unwrap();
        let err = Migrator::new(&driver, broken, MigrationSet::default(), options())
            .run()
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MigrationError::Apply {
                source: DriverError::Execute { .. },
                ..
            }
        ));

        // it_atomic was rolled back, so creating it again succeeds.
        let fixed = MigrationSet::parse([
            ("10000__init.sql", "CREATE TABLE principal (id INT);"),
            ("10001__atomic.sql", "CREATE TABLE it_atomic (id INT);"),
        ])
        .unwrap();
        let result = Migrator::new(&driver, fixed, MigrationSet::default(), options())
            .run()
            .await
            .unwrap();
        assert_eq!(result.applied_migrations, ["10001__atomic.sql"]);
    }

    #[tokio::test]
    async fn test_execute_migration_precheck() {
        let driver = create_driver().await;
        driver.setup_migration_if_needed().await.unwrap();

        let info = MigrationInfo::new(TEST_DATABASE, "5");
        let first = driver
            .execute_migration(&info, "CREATE TABLE it_atomic (id INT)")
            .await
            .unwrap();
        assert!(!first.already_applied);

        let second = driver
            .execute_migration(&info, "CREATE TABLE it_atomic (id INT)")
            .await
            .unwrap();
        assert!(second.already_applied);
        assert_eq!(second.history_id, first.history_id);

        let older = MigrationInfo::new(TEST_DATABASE, "4");
        assert!(matches!(
            driver.execute_migration(&older, "SELECT 1").await,
            Err(DriverError::OutOfOrder { .. })
        ));

        let baseline = MigrationInfo {
            migration_type: MigrationType::Baseline,
            ..MigrationInfo::new(TEST_DATABASE, "6")
        };
        driver
            .execute_migration(&baseline, "THIS IS NOT SQL")
            .await
            .expect("Baseline rows are recorded without executing");
    }
}
