//! Migration Definitions - Core types for migrations
//!
//! Defines the [`Migration`] unit every batch is made of, the persisted
//! [`MigrationRecord`], the per-unit [`Applied`] outcome and the
//! [`MigrationReport`] returned for a whole batch.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::state::StateTracker;
use crate::backends::MigrationTransaction;
use crate::error::MigrateResult;

/// A single named, idempotent unit of schema change.
///
/// `apply` runs inside a transaction opened by the migrator; returning an
/// error rolls that transaction back and aborts the batch. Units are expected
/// to consult the [`StateTracker`] themselves, which lets a unit decide its
/// own name at apply time (file units read it from the file).
#[async_trait]
pub trait Migration: Send + Sync {
    /// Label used in logs and error messages
    fn label(&self) -> String;

    /// Apply the unit within `tx`
    async fn apply(
        &self,
        tx: &mut dyn MigrationTransaction,
        state: &StateTracker,
    ) -> MigrateResult<Applied>;
}

/// What a unit did when applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    /// The unit did its work and recorded `name`
    Ran { name: String },
    /// `name` was already recorded; nothing was done
    Skipped { name: String },
}

impl Applied {
    pub fn name(&self) -> &str {
        match self {
            Applied::Ran { name } | Applied::Skipped { name } => name,
        }
    }
}

/// In-code migration: a name and the SQL it runs once
#[derive(Debug, Clone)]
pub struct SqlMigration {
    name: String,
    sql: String,
}

impl SqlMigration {
    pub fn new<N: Into<String>, S: Into<String>>(name: N, sql: S) -> Self {
        Self {
            name: name.into(),
            sql: sql.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }
}

#[async_trait]
impl Migration for SqlMigration {
    fn label(&self) -> String {
        self.name.clone()
    }

    async fn apply(
        &self,
        tx: &mut dyn MigrationTransaction,
        state: &StateTracker,
    ) -> MigrateResult<Applied> {
        if state.is_applied(tx, &self.name).await? {
            return Ok(Applied::Skipped {
                name: self.name.clone(),
            });
        }

        tx.execute_script(&self.sql).await?;
        state.mark_applied(tx, &self.name).await?;

        Ok(Applied::Ran {
            name: self.name.clone(),
        })
    }
}

/// Migration status in the database
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    /// Migration name
    pub version: String,
    /// When the migration was applied
    pub migrated_at: DateTime<Utc>,
}

/// Result of running a batch
#[derive(Debug, Clone, Default)]
pub struct MigrationReport {
    /// Names of migrations applied by this run, in order
    pub applied: Vec<String>,
    /// Names of migrations that were already applied
    pub skipped: Vec<String>,
    /// Total time spent, lock wait included
    pub elapsed: Duration,
}

impl MigrationReport {
    pub(crate) fn record(&mut self, applied: Applied) {
        match applied {
            Applied::Ran { name } => self.applied.push(name),
            Applied::Skipped { name } => self.skipped.push(name),
        }
    }

    /// Number of migrations applied by this run
    pub fn applied_count(&self) -> usize {
        self.applied.len()
    }

    /// Whether the run changed nothing
    pub fn is_noop(&self) -> bool {
        self.applied.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{MemoryBackend, MigrationBackend};

    #[test]
    fn test_report_records_outcomes() {
        let mut report = MigrationReport::default();
        report.record(Applied::Ran { name: "a".to_string() });
        report.record(Applied::Skipped { name: "b".to_string() });

        assert_eq!(report.applied, vec!["a"]);
        assert_eq!(report.skipped, vec!["b"]);
        assert_eq!(report.applied_count(), 1);
        assert!(!report.is_noop());
        assert!(MigrationReport::default().is_noop());
    }

    #[tokio::test]
    async fn test_sql_migration_runs_once() {
        let backend = MemoryBackend::new();
        let state = StateTracker::default();
        let migration = SqlMigration::new("create_users", "CREATE TABLE users (id uuid PRIMARY KEY);");

        let mut tx = backend.begin().await.unwrap();
        state.ensure_table(&mut *tx).await.unwrap();
        let first = migration.apply(&mut *tx, &state).await.unwrap();
        let second = migration.apply(&mut *tx, &state).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(first, Applied::Ran { name: "create_users".to_string() });
        assert_eq!(second, Applied::Skipped { name: "create_users".to_string() });
        assert_eq!(second.name(), "create_users");
        assert_eq!(backend.committed_statements().len(), 1);
        assert_eq!(backend.applied_versions("pgutil_migration"), vec!["create_users"]);
    }

    #[test]
    fn test_record_serializes() {
        let record = MigrationRecord {
            version: "001_init.sql".to_string(),
            migrated_at: Utc::now(),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["version"], "001_init.sql");
        let back: MigrationRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }
}
