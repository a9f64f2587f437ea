use std::fs;
use std::time::Duration;

use elif_migrate::{
    BackendEvent, MemoryBackend, MigrateError, Migrator, MigratorConfig, MigrationSource, NameStrategy,
};

fn write(dir: &std::path::Path, name: &str, contents: &str) {
    fs::write(dir.join(name), contents).unwrap();
}

fn migrator(strategy: NameStrategy) -> Migrator {
    Migrator::with_config(
        MigratorConfig::default()
            .with_lock_timeout(Duration::from_secs(5))
            .with_name_strategy(strategy),
    )
    .unwrap()
}

fn executed_scripts(backend: &MemoryBackend) -> Vec<String> {
    backend
        .events()
        .into_iter()
        .filter_map(|e| match e {
            BackendEvent::Statement { sql, .. } if !sql.contains("pgutil_migration") => Some(sql),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn applies_files_in_name_order() {
    let dir = tempfile::tempdir().unwrap();
    // written out of order on purpose
    write(dir.path(), "010_c.sql", "CREATE TABLE c (id INT);");
    write(dir.path(), "001_a.sql", "CREATE TABLE a (id INT);");
    write(dir.path(), "002_b.sql", "CREATE TABLE b (id INT);");
    fs::create_dir(dir.path().join("000_not_a_migration")).unwrap();

    let backend = MemoryBackend::new();
    let report = migrator(NameStrategy::Directive)
        .migrate_directory(&backend, dir.path())
        .await
        .unwrap();

    assert_eq!(report.applied, vec!["001_a.sql", "002_b.sql", "010_c.sql"]);
    assert_eq!(
        executed_scripts(&backend),
        vec!["CREATE TABLE a (id INT);", "CREATE TABLE b (id INT);", "CREATE TABLE c (id INT);"]
    );
}

#[tokio::test]
async fn directive_overrides_recorded_name() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "001_users.sql", "-- Migration Name: create users\nCREATE TABLE users (id INT);");
    write(dir.path(), "002_posts.sql", "CREATE TABLE posts (id INT);");

    let backend = MemoryBackend::new();
    migrator(NameStrategy::Directive)
        .migrate_directory(&backend, dir.path())
        .await
        .unwrap();

    assert_eq!(
        backend.applied_versions("pgutil_migration"),
        vec!["create users", "002_posts.sql"]
    );
}

#[tokio::test]
async fn file_name_strategy_ignores_directive() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "001_users.sql", "-- migration name: custom_name\nCREATE TABLE users (id INT);");

    let backend = MemoryBackend::new();
    migrator(NameStrategy::FileName)
        .migrate_directory(&backend, dir.path())
        .await
        .unwrap();

    assert_eq!(backend.applied_versions("pgutil_migration"), vec!["001_users.sql"]);
}

#[tokio::test]
async fn rerunning_a_directory_is_a_noop() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "001_a.sql", "CREATE TABLE a (id INT);");
    write(dir.path(), "002_b.sql", "-- migration name: bee\nCREATE TABLE b (id INT);");

    let backend = MemoryBackend::new();
    let migrator = migrator(NameStrategy::Directive);
    migrator.migrate_directory(&backend, dir.path()).await.unwrap();
    let statements = backend.committed_statements();

    let report = migrator.migrate_directory(&backend, dir.path()).await.unwrap();
    assert!(report.is_noop());
    assert_eq!(report.skipped, vec!["001_a.sql", "bee"]);
    assert_eq!(backend.committed_statements(), statements);
    assert_eq!(backend.applied_versions("pgutil_migration").len(), 2);
}

#[tokio::test]
async fn failing_file_is_named_in_the_error() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "001_a.sql", "CREATE TABLE a (id INT);");
    write(dir.path(), "002_broken.sql", "CREATE TABLE broken (");
    write(dir.path(), "003_c.sql", "CREATE TABLE c (id INT);");

    let backend = MemoryBackend::new();
    backend.fail_statement("CREATE TABLE broken");

    let err = migrator(NameStrategy::Directive)
        .migrate_directory(&backend, dir.path())
        .await
        .unwrap_err();

    assert!(matches!(err, MigrateError::Unit { .. }));
    assert!(err.to_string().contains("002_broken.sql"));
    assert_eq!(backend.applied_versions("pgutil_migration"), vec!["001_a.sql"]);
}

#[tokio::test]
async fn missing_directory_fails_before_locking() {
    let dir = tempfile::tempdir().unwrap();
    let backend = MemoryBackend::new();

    let err = migrator(NameStrategy::Directive)
        .migrate_directory(&backend, dir.path().join("nope"))
        .await
        .unwrap_err();

    assert!(matches!(err, MigrateError::Source { .. }));
    assert!(backend.events().is_empty());
}

#[tokio::test]
async fn status_reports_pending_files() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "001_a.sql", "CREATE TABLE a (id INT);");

    let backend = MemoryBackend::new();
    let migrator = migrator(NameStrategy::Directive);
    migrator.migrate_directory(&backend, dir.path()).await.unwrap();

    write(dir.path(), "002_b.sql", "CREATE TABLE b (id INT);");
    let status = migrator
        .status(&backend, &MigrationSource::local(), dir.path())
        .await
        .unwrap();

    let pending: Vec<_> = status.iter().filter(|s| !s.is_applied()).map(|s| s.name.as_str()).collect();
    assert_eq!(pending, vec!["002_b.sql"]);
}
