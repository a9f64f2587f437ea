use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use elif_migrate::{wait, LocalFs, Migrator, PoolConfig, PostgresBackend, WaitConfig};

fn connect(database_url: &str) -> anyhow::Result<PostgresBackend> {
    PostgresBackend::connect(database_url, PoolConfig::default()).context("invalid database URL")
}

async fn wait_for(backend: &PostgresBackend, timeout: Duration) -> anyhow::Result<()> {
    wait(backend, &WaitConfig::default().with_max_elapsed(timeout)).await?;
    Ok(())
}

pub async fn run(
    migrator: &Migrator,
    database_url: &str,
    dir: &Path,
    wait_timeout: Option<Duration>,
) -> anyhow::Result<()> {
    let backend = connect(database_url)?;
    if let Some(timeout) = wait_timeout {
        wait_for(&backend, timeout).await?;
    }

    let report = migrator.migrate_directory(&backend, dir).await?;

    if report.is_noop() {
        println!("Nothing to migrate ({} already applied)", report.skipped.len());
        return Ok(());
    }
    for name in &report.applied {
        println!("Applied: {}", name);
    }
    println!(
        "Applied {} migration(s), {} already applied, in {:.2?}",
        report.applied_count(),
        report.skipped.len(),
        report.elapsed
    );
    Ok(())
}

pub async fn status(migrator: &Migrator, database_url: &str, dir: &Path) -> anyhow::Result<()> {
    let backend = connect(database_url)?;
    let source = migrator.source(LocalFs::default());
    let files = migrator.status(&backend, &source, dir).await?;

    if files.is_empty() {
        println!("No migrations found in {}", dir.display());
        return Ok(());
    }

    let pending = files.iter().filter(|f| !f.is_applied()).count();
    for file in &files {
        match file.migrated_at {
            Some(at) => println!("  applied  {}  {}", at.format("%Y-%m-%d %H:%M:%S"), file.name),
            None => println!("  pending  {:19}  {}", "", file.name),
        }
    }
    println!("{} migration(s), {} pending", files.len(), pending);
    Ok(())
}

pub async fn wait_only(database_url: &str, timeout: Duration) -> anyhow::Result<()> {
    let backend = connect(database_url)?;
    wait_for(&backend, timeout).await?;
    println!("Database is reachable");
    Ok(())
}
