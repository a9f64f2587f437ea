//! Migration State Tracker - the persisted ledger of applied migrations
//!
//! Every read and write goes through the caller's transaction, so a schema
//! change and the record saying it happened commit or roll back together.

use async_trait::async_trait;
use tracing::debug;

use super::definitions::{Applied, Migration, MigrationRecord};
use crate::backends::{DatabaseValue, MigrationTransaction};
use crate::config::{validate_table_name, DEFAULT_STATE_TABLE};
use crate::error::{MigrateError, MigrateResult};

/// Reads and writes the state table
#[derive(Debug, Clone)]
pub struct StateTracker {
    table: String,
}

impl StateTracker {
    /// Tracker for the given table name
    pub fn new<S: Into<String>>(table: S) -> MigrateResult<Self> {
        let table = table.into();
        validate_table_name(&table)?;
        Ok(Self { table })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// SQL to create the migrations tracking table
    pub fn create_table_sql(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    \
                version TEXT UNIQUE PRIMARY KEY,\n    \
                migrated_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT CURRENT_TIMESTAMP\n\
            );",
            self.table
        )
    }

    /// SQL to check if a migration has been applied
    pub fn check_migration_sql(&self) -> String {
        format!("SELECT COUNT(version) FROM {} WHERE version = $1", self.table)
    }

    /// SQL to record a migration as applied
    pub fn record_migration_sql(&self) -> String {
        format!("INSERT INTO {} (version) VALUES ($1)", self.table)
    }

    /// SQL to get applied migrations
    pub fn applied_migrations_sql(&self) -> String {
        format!(
            "SELECT version, migrated_at FROM {} ORDER BY migrated_at, version",
            self.table
        )
    }

    /// SQL counting the state table in the catalog, 0 or 1. Takes the table
    /// name as `$1`.
    pub fn table_exists_sql(&self) -> String {
        "SELECT COUNT(*) FROM pg_catalog.pg_class WHERE oid = to_regclass($1::text)::oid".to_string()
    }

    /// Whether the state table exists, without creating it
    pub async fn table_exists(&self, tx: &mut dyn MigrationTransaction) -> MigrateResult<bool> {
        let count = tx
            .fetch_scalar_i64(&self.table_exists_sql(), &[DatabaseValue::from(self.table.as_str())])
            .await?;
        Ok(count > 0)
    }

    /// Create the state table unless it exists
    pub async fn ensure_table(&self, tx: &mut dyn MigrationTransaction) -> MigrateResult<()> {
        tx.execute(&self.create_table_sql(), &[]).await?;
        Ok(())
    }

    /// Whether `name` has a state record
    pub async fn is_applied(&self, tx: &mut dyn MigrationTransaction, name: &str) -> MigrateResult<bool> {
        let count = tx
            .fetch_scalar_i64(&self.check_migration_sql(), &[DatabaseValue::from(name)])
            .await
            .map_err(|e| MigrateError::StateCheck {
                name: name.to_string(),
                source: e.boxed(),
            })?;
        Ok(count > 0)
    }

    /// Record `name` as applied.
    ///
    /// Recording a name twice violates the table's primary key and fails, so
    /// callers check [`is_applied`](Self::is_applied) first.
    pub async fn mark_applied(&self, tx: &mut dyn MigrationTransaction, name: &str) -> MigrateResult<()> {
        tx.execute(&self.record_migration_sql(), &[DatabaseValue::from(name)])
            .await
            .map_err(|e| MigrateError::StateWrite {
                name: name.to_string(),
                source: e.boxed(),
            })?;
        debug!(migration = name, table = %self.table, "recorded migration");
        Ok(())
    }

    /// All state records, oldest first
    pub async fn applied(&self, tx: &mut dyn MigrationTransaction) -> MigrateResult<Vec<MigrationRecord>> {
        let rows = tx.fetch_rows(&self.applied_migrations_sql(), &[]).await?;

        rows.into_iter()
            .map(|row| match row.as_slice() {
                [version, migrated_at] => {
                    let version = version
                        .as_str()
                        .ok_or_else(|| MigrateError::Decode(format!("version is not text: {:?}", version)))?;
                    let migrated_at = migrated_at.as_datetime().ok_or_else(|| {
                        MigrateError::Decode(format!("migrated_at is not a timestamp: {:?}", migrated_at))
                    })?;
                    Ok(MigrationRecord {
                        version: version.to_string(),
                        migrated_at,
                    })
                }
                other => Err(MigrateError::Decode(format!(
                    "expected 2 columns, got {}",
                    other.len()
                ))),
            })
            .collect()
    }
}

impl Default for StateTracker {
    fn default() -> Self {
        Self {
            table: DEFAULT_STATE_TABLE.to_string(),
        }
    }
}

/// The implicit first unit of every batch
pub(crate) struct EnsureStateTable;

#[async_trait]
impl Migration for EnsureStateTable {
    fn label(&self) -> String {
        "ensure state table".to_string()
    }

    async fn apply(
        &self,
        tx: &mut dyn MigrationTransaction,
        state: &StateTracker,
    ) -> MigrateResult<Applied> {
        state.ensure_table(tx).await?;
        Ok(Applied::Ran {
            name: state.table().to_string(),
        })
    }
}
