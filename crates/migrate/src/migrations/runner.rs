//! Migration Runner - Executes migration batches against the database
//!
//! A batch runs under the advisory lock. The state table bootstrap goes
//! first, then every unit in its own transaction, strictly in order. The
//! first failure rolls back that unit and stops the batch.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use super::definitions::{Applied, Migration, MigrationRecord, MigrationReport};
use super::source::{LocalFs, MigrationFs, MigrationSource};
use super::state::{EnsureStateTable, StateTracker};
use crate::backends::MigrationBackend;
use crate::config::MigratorConfig;
use crate::error::{MigrateError, MigrateResult, TransactionPhase};
use crate::lock::AdvisoryLock;

/// Applied state of one file in a migration directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStatus {
    pub path: PathBuf,
    /// Name the file is recorded under
    pub name: String,
    /// When it was applied, if it was
    pub migrated_at: Option<DateTime<Utc>>,
}

impl FileStatus {
    pub fn is_applied(&self) -> bool {
        self.migrated_at.is_some()
    }
}

/// Runs migration batches
#[derive(Debug, Clone)]
pub struct Migrator {
    config: MigratorConfig,
    state: StateTracker,
    lock: AdvisoryLock,
}

impl Migrator {
    /// Migrator with the default configuration
    pub fn new() -> Self {
        let config = MigratorConfig::default();
        Self {
            lock: AdvisoryLock::from_config(&config),
            state: StateTracker::default(),
            config,
        }
    }

    /// Migrator with a custom configuration
    pub fn with_config(config: MigratorConfig) -> MigrateResult<Self> {
        config.validate()?;
        Ok(Self {
            state: StateTracker::new(config.table.clone())?,
            lock: AdvisoryLock::from_config(&config),
            config,
        })
    }

    pub fn config(&self) -> &MigratorConfig {
        &self.config
    }

    pub fn state(&self) -> &StateTracker {
        &self.state
    }

    /// A migration source over `fs` using this migrator's name strategy
    pub fn source<F: MigrationFs + 'static>(&self, fs: F) -> MigrationSource {
        MigrationSource::new(fs).with_name_strategy(self.config.name_strategy)
    }

    /// Apply `migrations` in order.
    ///
    /// Already applied units are skipped. On failure nothing after the failing
    /// unit runs and the failing unit leaves no trace. A failed lock release
    /// is reported as [`MigrateError::LockRelease`] even when the batch itself
    /// succeeded.
    pub async fn migrate(
        &self,
        backend: &dyn MigrationBackend,
        migrations: &[Box<dyn Migration>],
    ) -> MigrateResult<MigrationReport> {
        let started = Instant::now();

        let guard = self.lock.acquire(backend).await?;
        info!(
            key = guard.key(),
            table = %self.state.table(),
            count = migrations.len(),
            "running migrations"
        );

        let outcome = self.run_batch(backend, migrations).await;

        if let Err(err) = guard.release().await {
            return Err(match err {
                MigrateError::LockRelease { key, reason, .. } => MigrateError::LockRelease {
                    key,
                    reason,
                    batch: outcome.err().map(Box::new),
                },
                other => other,
            });
        }

        let mut report = outcome?;
        report.elapsed = started.elapsed();
        info!(
            applied = report.applied.len(),
            skipped = report.skipped.len(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "migrations complete"
        );
        Ok(report)
    }

    /// Build a batch from the files of `dir` on the local filesystem and apply it
    pub async fn migrate_directory<P: AsRef<Path>>(
        &self,
        backend: &dyn MigrationBackend,
        dir: P,
    ) -> MigrateResult<MigrationReport> {
        let migrations = self.source(LocalFs::default()).from_directory(dir)?;
        self.migrate(backend, &migrations).await
    }

    /// Every state record, oldest first. Works on a database that was never
    /// migrated and leaves it untouched; no DDL runs outside the lock.
    pub async fn applied(&self, backend: &dyn MigrationBackend) -> MigrateResult<Vec<MigrationRecord>> {
        let mut tx = backend.begin().await?;
        let records = async {
            if !self.state.table_exists(&mut *tx).await? {
                return Ok(Vec::new());
            }
            self.state.applied(&mut *tx).await
        }
        .await;
        tx.rollback().await?;
        records
    }

    /// Applied state of every file `source` finds in `dir`, in application order
    pub async fn status<P: AsRef<Path>>(
        &self,
        backend: &dyn MigrationBackend,
        source: &MigrationSource,
        dir: P,
    ) -> MigrateResult<Vec<FileStatus>> {
        let files = source.files(dir)?;
        let applied: HashMap<String, DateTime<Utc>> = self
            .applied(backend)
            .await?
            .into_iter()
            .map(|r| (r.version, r.migrated_at))
            .collect();

        files
            .iter()
            .map(|file| {
                let name = file.resolve_name()?;
                Ok(FileStatus {
                    path: file.path().to_path_buf(),
                    migrated_at: applied.get(&name).copied(),
                    name,
                })
            })
            .collect()
    }

    async fn run_batch(
        &self,
        backend: &dyn MigrationBackend,
        migrations: &[Box<dyn Migration>],
    ) -> MigrateResult<MigrationReport> {
        let mut report = MigrationReport::default();

        self.run_unit(backend, &EnsureStateTable).await?;

        for migration in migrations {
            match self.run_unit(backend, migration.as_ref()).await? {
                Applied::Ran { name } => {
                    info!(migration = %name, "applied migration");
                    report.record(Applied::Ran { name });
                }
                skipped => {
                    debug!(migration = %skipped.name(), "skipped applied migration");
                    report.record(skipped);
                }
            }
        }

        Ok(report)
    }

    async fn run_unit(&self, backend: &dyn MigrationBackend, migration: &dyn Migration) -> MigrateResult<Applied> {
        let label = migration.label();
        let transaction_error = |phase, source: MigrateError| MigrateError::Transaction {
            migration: label.clone(),
            phase,
            source: source.boxed(),
        };

        let mut tx = backend
            .begin()
            .await
            .map_err(|e| transaction_error(TransactionPhase::Begin, e))?;
        debug!(migration = %label, "began transaction");

        match migration.apply(&mut *tx, &self.state).await {
            Ok(applied) => {
                tx.commit()
                    .await
                    .map_err(|e| transaction_error(TransactionPhase::Commit, e))?;
                debug!(migration = %label, "committed transaction");
                Ok(applied)
            }
            Err(err) => {
                warn!(migration = %label, error = %err, "migration failed, rolling back");
                let rollback = match tx.rollback().await {
                    Ok(()) => None,
                    Err(e) => {
                        error!(migration = %label, error = %e, "rollback failed");
                        Some(transaction_error(TransactionPhase::Rollback, e).boxed())
                    }
                };
                Err(MigrateError::Unit {
                    migration: label.clone(),
                    source: err.boxed(),
                    rollback,
                })
            }
        }
    }
}

impl Default for Migrator {
    fn default() -> Self {
        Self::new()
    }
}
