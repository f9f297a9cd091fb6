//! Orchestrator scenarios against the in-memory driver.
//!
//! Run with: `cargo test --test migrator_scenarios`

use std::sync::Arc;

use proptest::prelude::*;
use schemaledger::driver::backends::memory::{
    MemoryDriver, MemoryFactory, MemoryOptions, MemoryStore,
};
use schemaledger::driver::{
    require_migration, ConnectionConfig, ConnectionContext, DriverConfig,
    EngineType, MigrationStatus, Registry,
};
use schemaledger::error::{DriverError, MigrationError};
use schemaledger::migrations::{MigrationSet, Migrator, MigratorOptions};
use schemaledger::Version;

const NAMESPACE: &str = "meta";

fn files(entries: &[(&str, &str)]) -> MigrationSet {
    MigrationSet::parse(entries.iter().copied()).unwrap()
}

fn three_files() -> MigrationSet {
    files(&[
        ("10000__initial_schema.sql", "CREATE TABLE principal (id INT);"),
        ("10001__add_instance.sql", "CREATE TABLE instance (id INT);"),
        ("10002__add_activity.sql", "CREATE TABLE activity (id INT);"),
    ])
}

fn options() -> MigratorOptions {
    MigratorOptions::new(NAMESPACE)
}

fn versions(store: &MemoryStore) -> Vec<String> {
    store.history().into_iter().map(|row| row.version).collect()
}

#[tokio::test]
async fn test_fresh_install_applies_every_file_in_order() {
    let store = MemoryStore::new();
    let driver = MemoryDriver::new(store.clone(), MemoryOptions::default());
    let migrator = Migrator::new(&driver, three_files(), MigrationSet::default(), options());

    let result = migrator.run().await.unwrap();

    assert_eq!(result.previous_version, Version::ZERO);
    assert_eq!(result.current_version, Version::new(1, 2).unwrap());
    assert_eq!(result.current_version.to_string(), "1.2");
    assert_eq!(
        result.applied_migrations,
        [
            "10000__initial_schema.sql",
            "10001__add_instance.sql",
            "10002__add_activity.sql"
        ]
    );
    assert_eq!(versions(&store), ["10000", "10001", "10002"]);
    assert!(store
        .history()
        .iter()
        .all(|row| row.status == MigrationStatus::Done));
    let sequences: Vec<_> = store.history().iter().map(|row| row.sequence).collect();
    assert_eq!(sequences, [1, 2, 3]);
}

#[tokio::test]
async fn test_partial_resume_applies_only_newer_files() {
    let store = MemoryStore::new();
    store.record(NAMESPACE, "10000", MigrationStatus::Done).unwrap();
    store.record(NAMESPACE, "10001", MigrationStatus::Done).unwrap();
    let driver = MemoryDriver::new(store.clone(), MemoryOptions::default());

    let set = files(&[
        ("10000__a.sql", "CREATE TABLE a (id INT);"),
        ("10001__b.sql", "CREATE TABLE b (id INT);"),
        ("10002__c.sql", "CREATE TABLE c (id INT);"),
        ("10003__d.sql", "CREATE TABLE d (id INT);"),
    ]);
    let migrator = Migrator::new(
        &driver,
        set,
        MigrationSet::default(),
        MigratorOptions {
            max_version: Version::from_int(10003),
            ..options()
        },
    );

    let result = migrator.run().await.unwrap();

    assert_eq!(result.applied_migrations, ["10002__c.sql", "10003__d.sql"]);
    assert_eq!(
        store.executed(),
        ["CREATE TABLE c (id INT)", "CREATE TABLE d (id INT)"]
    );
    assert_eq!(versions(&store), ["10000", "10001", "10002", "10003"]);
}

#[tokio::test]
async fn test_files_newer_than_binary_are_skipped() {
    let store = MemoryStore::new();
    let driver = MemoryDriver::new(store.clone(), MemoryOptions::default());
    let migrator = Migrator::new(
        &driver,
        three_files(),
        MigrationSet::default(),
        MigratorOptions {
            max_version: Version::from_int(10001),
            ..options()
        },
    );

    let result = migrator.run().await.unwrap();

    assert_eq!(result.current_version, Version::from_int(10001));
    assert_eq!(result.skipped_migrations, ["10002__add_activity.sql"]);
    assert_eq!(versions(&store), ["10000", "10001"]);
}

#[tokio::test]
async fn test_major_mismatch_aborts_before_touching_files() {
    let store = MemoryStore::new();
    store.record(NAMESPACE, "20003", MigrationStatus::Done).unwrap();
    let driver = MemoryDriver::new(store.clone(), MemoryOptions::default());
    let migrator = Migrator::new(&driver, three_files(), MigrationSet::default(), options());

    let err = migrator.run().await.unwrap_err();

    assert!(matches!(
        err,
        MigrationError::MajorVersionMismatch { current, supported: 1 }
            if current == Version::new(2, 3).unwrap()
    ));
    assert!(store.executed().is_empty());
    assert_eq!(store.history().len(), 1);
}

#[tokio::test]
async fn test_major_zero_ledger_upgrades_without_bootstrap() {
    let store = MemoryStore::new();
    store.record(NAMESPACE, "5", MigrationStatus::Done).unwrap();
    let driver = MemoryDriver::new(store.clone(), MemoryOptions::default());
    let migrator = Migrator::new(
        &driver,
        files(&[
            ("10000__initial_schema.sql", "CREATE TABLE principal (id INT);"),
            ("10001__add_instance.sql", "CREATE TABLE instance (id INT);"),
        ]),
        MigrationSet::default(),
        options(),
    );

    let result = migrator.run().await.unwrap();

    assert_eq!(result.previous_version, Version::from_int(5));
    assert_eq!(result.current_version, Version::new(1, 1).unwrap());
    assert_eq!(
        result.applied_migrations,
        ["10000__initial_schema.sql", "10001__add_instance.sql"]
    );
    assert_eq!(versions(&store), ["5", "10000", "10001"]);
}

#[tokio::test]
async fn test_second_run_is_a_no_op() {
    let store = MemoryStore::new();
    let driver = MemoryDriver::new(store.clone(), MemoryOptions::default());
    let seeds = files(&[("10000__principal.sql", "INSERT INTO principal VALUES (1);")]);

    let migrator = Migrator::new(&driver, three_files(), seeds.clone(), options());
    migrator.run().await.unwrap();
    let rows = store.history().len();
    let executed = store.executed().len();

    let again = Migrator::new(&driver, three_files(), seeds, options());
    let result = again.run().await.unwrap();

    assert!(result.applied_migrations.is_empty());
    assert!(result.applied_seeds.is_empty());
    assert_eq!(result.previous_version, result.current_version);
    assert_eq!(store.history().len(), rows);
    assert_eq!(store.executed().len(), executed);
}

#[tokio::test]
async fn test_failed_file_leaves_no_row_on_transactional_engine() {
    let store = MemoryStore::new();
    store.fail_statements_containing("broken");
    let driver = MemoryDriver::new(store.clone(), MemoryOptions::default());
    let set = files(&[
        ("10000__a.sql", "CREATE TABLE a (id INT);"),
        (
            "10001__b.sql",
            "CREATE TABLE b (id INT);\nCREATE TABLE broken (id INT);",
        ),
        ("10002__c.sql", "CREATE TABLE c (id INT);"),
    ]);
    let migrator = Migrator::new(&driver, set, MigrationSet::default(), options());

    let err = migrator.run().await.unwrap_err();

    match err {
        MigrationError::Apply {
            file,
            version,
            source: DriverError::Execute { .. },
        } => {
            assert_eq!(file, "10001__b.sql");
            assert_eq!(version, Version::from_int(10001));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(versions(&store), ["10000"]);
    assert_eq!(store.executed(), ["CREATE TABLE a (id INT)"]);

    // Fixed file, next start resumes at 10001.
    store.clear_failures();
    let result = migrator.run().await.unwrap();
    assert_eq!(result.applied_migrations, ["10001__b.sql", "10002__c.sql"]);
}

#[tokio::test]
async fn test_failed_file_is_flagged_on_non_transactional_engine() {
    let store = MemoryStore::new();
    store.fail_statements_containing("broken");
    let driver = MemoryDriver::new(
        store.clone(),
        MemoryOptions {
            transactional: false,
            ..MemoryOptions::default()
        },
    );
    let set = files(&[
        ("10000__a.sql", "CREATE TABLE a (id INT);"),
        (
            "10001__b.sql",
            "CREATE TABLE b (id INT);\nCREATE TABLE broken (id INT);",
        ),
    ]);
    let migrator = Migrator::new(&driver, set.clone(), MigrationSet::default(), options());

    assert!(matches!(
        migrator.run().await,
        Err(MigrationError::Apply { .. })
    ));

    // The first statement stuck and the attempt is visible as FAILED.
    assert_eq!(
        store.executed(),
        ["CREATE TABLE a (id INT)", "CREATE TABLE b (id INT)"]
    );
    let failed = store.history().pop().unwrap();
    assert_eq!(failed.version, "10001");
    assert_eq!(failed.status, MigrationStatus::Failed);

    store.clear_failures();
    assert!(matches!(
        migrator.run().await,
        Err(MigrationError::UnresolvedHistory { status: MigrationStatus::Failed, .. })
    ));
    assert_eq!(migrator.unresolved().await.unwrap().len(), 1);

    let forced = Migrator::new(
        &driver,
        set,
        MigrationSet::default(),
        MigratorOptions {
            force: true,
            ..options()
        },
    );
    let result = forced.run().await.unwrap();
    assert_eq!(result.current_version, Version::from_int(10001));
    assert!(forced.unresolved().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unrecorded_success_is_surfaced_distinctly() {
    let store = MemoryStore::new();
    let driver = MemoryDriver::new(
        store.clone(),
        MemoryOptions {
            transactional: false,
            ..MemoryOptions::default()
        },
    );
    let set = files(&[
        ("10000__a.sql", "CREATE TABLE a (id INT);"),
        ("10001__b.sql", "CREATE TABLE b (id INT);"),
    ]);
    let migrator = Migrator::new(&driver, set, MigrationSet::default(), options());

    store.fail_history_updates(true);
    let err = migrator.run().await.unwrap_err();

    assert!(matches!(
        err,
        MigrationError::Bootstrap {
            source: DriverError::HistoryNotRecorded { .. },
            ..
        }
    ));
    assert_eq!(store.executed(), ["CREATE TABLE a (id INT)"]);
    assert_eq!(store.history()[0].status, MigrationStatus::Pending);

    store.fail_history_updates(false);
    assert!(matches!(
        migrator.run().await,
        Err(MigrationError::UnresolvedHistory { status: MigrationStatus::Pending, .. })
    ));
}

#[tokio::test]
async fn test_seeds_follow_the_version_window() {
    let store = MemoryStore::new();
    let driver = MemoryDriver::new(store.clone(), MemoryOptions::default());
    let seeds = files(&[
        ("10000__principal.sql", "INSERT INTO principal VALUES (1);"),
        ("10002__activity.sql", "INSERT INTO activity VALUES (1);"),
        ("10003__later.sql", "INSERT INTO later VALUES (1);"),
    ]);

    let first = Migrator::new(
        &driver,
        three_files(),
        seeds.clone(),
        MigratorOptions {
            max_version: Version::from_int(10001),
            ..options()
        },
    );
    let result = first.run().await.unwrap();
    assert_eq!(result.applied_seeds, ["10000__principal.sql"]);

    let second = Migrator::new(&driver, three_files(), seeds.clone(), options());
    let result = second.run().await.unwrap();
    assert_eq!(result.applied_migrations, ["10002__add_activity.sql"]);
    assert_eq!(result.applied_seeds, ["10002__activity.sql"]);

    let reset = Migrator::new(
        &driver,
        three_files(),
        seeds,
        MigratorOptions {
            force_reset_seed: true,
            ..options()
        },
    );
    let result = reset.run().await.unwrap();
    assert!(result.applied_migrations.is_empty());
    assert_eq!(
        result.applied_seeds,
        [
            "10000__principal.sql",
            "10002__activity.sql",
            "10003__later.sql"
        ]
    );
}

#[tokio::test]
async fn test_seed_failure_keeps_migrations() {
    let store = MemoryStore::new();
    store.fail_statements_containing("INSERT");
    let driver = MemoryDriver::new(store.clone(), MemoryOptions::default());
    let seeds = files(&[("10000__principal.sql", "INSERT INTO principal VALUES (1);")]);
    let migrator = Migrator::new(&driver, three_files(), seeds, options());

    let err = migrator.run().await.unwrap_err();

    assert!(matches!(err, MigrationError::Seed { .. }));
    assert_eq!(versions(&store), ["10000", "10001", "10002"]);
}

#[tokio::test]
async fn test_embedded_files_through_registry() {
    let store = MemoryStore::new();
    let registry = Registry::new();
    registry.register(
        EngineType::Memory,
        Arc::new(MemoryFactory::new(store.clone(), MemoryOptions::default())),
    );
    let driver = registry
        .open(
            EngineType::Memory,
            &DriverConfig::default(),
            &ConnectionConfig::default(),
            &ConnectionContext::default(),
        )
        .await
        .unwrap();
    let ledger = require_migration(driver.as_ref()).unwrap();

    let migrator = Migrator::embedded(ledger, options()).unwrap();
    let result = migrator.run().await.unwrap();

    assert_eq!(result.current_version, schemaledger::migrations::SCHEMA_VERSION);
    assert_eq!(result.applied_migrations.len(), 3);
    assert_eq!(result.applied_seeds.len(), 2);
    assert!(result.checksum_mismatches.is_empty());
}

fn shuffled_minors() -> impl Strategy<Value = Vec<u32>> {
    prop::collection::btree_set(1u32..500, 0..12)
        .prop_map(|minors| {
            let mut all: Vec<u32> = minors.into_iter().collect();
            all.push(0);
            all
        })
        .prop_shuffle()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_history_follows_version_order(minors in shuffled_minors()) {
        let entries: Vec<(String, String)> = minors
            .iter()
            .map(|minor| {
                let version = 10_000 + i64::from(*minor);
                (
                    format!("{version}__step_{minor}.sql"),
                    format!("CREATE TABLE t{minor} (id INT);"),
                )
            })
            .collect();
        let set = MigrationSet::parse(entries).unwrap();

        let store = MemoryStore::new();
        let driver = MemoryDriver::new(store.clone(), MemoryOptions::default());
        let migrator = Migrator::new(
            &driver,
            set,
            MigrationSet::default(),
            MigratorOptions {
                max_version: Version::new(1, 9999).unwrap(),
                ..options()
            },
        );
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        runtime.block_on(migrator.run()).unwrap();

        let mut expected: Vec<i64> = minors.iter().map(|m| 10_000 + i64::from(*m)).collect();
        expected.sort_unstable();
        let recorded: Vec<i64> = store
            .history()
            .iter()
            .map(|row| row.version.parse().unwrap())
            .collect();
        prop_assert_eq!(recorded, expected);
    }
}
