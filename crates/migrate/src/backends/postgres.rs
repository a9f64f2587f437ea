//! PostgreSQL Backend Implementation
//!
//! Implements the backend traits over a sqlx `PgPool`. Advisory locks are
//! taken on a dedicated connection opened with the pool's connect options
//! and held for the whole batch, since PostgreSQL ties session level locks
//! to the server session that took them. The pool itself only serves
//! transactions, so a single-connection pool is enough to migrate.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions, PgRow};
use sqlx::{Column, Connection, PgConnection, Postgres, Row, Transaction, TypeInfo};
use tracing::{debug, warn};

use super::core::*;
use crate::error::{MigrateError, MigrateResult};

/// Connection pool configuration for [`PostgresBackend::connect`]
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 4,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

/// PostgreSQL migration backend
#[derive(Debug, Clone)]
pub struct PostgresBackend {
    pool: PgPool,
}

impl PostgresBackend {
    /// Wrap an existing pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create a lazily connecting pool for the given URL.
    ///
    /// No connection is opened here, so the caller can [`wait`](crate::wait)
    /// for the server before migrating.
    pub fn connect(database_url: &str, config: PoolConfig) -> MigrateResult<Self> {
        validate_database_url(database_url)?;
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect_lazy(database_url)?;
        Ok(Self::new(pool))
    }

    /// Get the underlying pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl From<PgPool> for PostgresBackend {
    fn from(pool: PgPool) -> Self {
        Self::new(pool)
    }
}

/// Reject URLs that are not PostgreSQL URLs before handing them to sqlx
pub fn validate_database_url(url: &str) -> MigrateResult<()> {
    if !url.starts_with("postgresql://") && !url.starts_with("postgres://") {
        return Err(MigrateError::Configuration(
            "database URL must use the postgres:// or postgresql:// scheme".to_string(),
        ));
    }
    Ok(())
}

#[async_trait]
impl MigrationBackend for PostgresBackend {
    async fn begin(&self) -> MigrateResult<Box<dyn MigrationTransaction>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PostgresTransaction { tx }))
    }

    async fn lock_session(&self) -> MigrateResult<Box<dyn LockSession>> {
        let options = self.pool.connect_options();
        let conn = PgConnection::connect_with(&options).await?;
        Ok(Box::new(PostgresLockSession { conn: Some(conn) }))
    }

    async fn ping(&self) -> MigrateResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// A transaction on a PostgreSQL pool
pub struct PostgresTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl MigrationTransaction for PostgresTransaction {
    async fn execute(&mut self, sql: &str, params: &[DatabaseValue]) -> MigrateResult<u64> {
        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_database_value(query, param);
        }
        let result = query.execute(&mut *self.tx).await?;
        Ok(result.rows_affected())
    }

    async fn execute_script(&mut self, sql: &str) -> MigrateResult<()> {
        // A bare &str goes through the simple query protocol, which accepts
        // several statements separated by semicolons.
        sqlx::Executor::execute(&mut *self.tx, sql).await?;
        Ok(())
    }

    async fn fetch_scalar_i64(&mut self, sql: &str, params: &[DatabaseValue]) -> MigrateResult<i64> {
        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_database_value(query, param);
        }
        let row = query.fetch_one(&mut *self.tx).await?;
        Ok(row.try_get::<i64, _>(0)?)
    }

    async fn fetch_rows(&mut self, sql: &str, params: &[DatabaseValue]) -> MigrateResult<Vec<Vec<DatabaseValue>>> {
        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_database_value(query, param);
        }
        let rows = query.fetch_all(&mut *self.tx).await?;
        rows.iter()
            .map(|row| {
                (0..row.len())
                    .map(|i| postgres_value_to_database_value(row, i))
                    .collect::<MigrateResult<Vec<_>>>()
            })
            .collect()
    }

    async fn commit(self: Box<Self>) -> MigrateResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> MigrateResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

/// A connection outside the pool reserved for advisory locking
pub struct PostgresLockSession {
    conn: Option<PgConnection>,
}

impl PostgresLockSession {
    fn conn(&mut self) -> MigrateResult<&mut PgConnection> {
        self.conn
            .as_mut()
            .ok_or_else(|| MigrateError::Configuration("lock session already closed".to_string()))
    }
}

#[async_trait]
impl LockSession for PostgresLockSession {
    async fn try_lock(&mut self, key: i64) -> MigrateResult<bool> {
        let conn = self.conn()?;
        let locked: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(key)
            .fetch_one(&mut *conn)
            .await?;
        Ok(locked)
    }

    async fn unlock(&mut self, key: i64) -> MigrateResult<bool> {
        let conn = self.conn()?;
        let released: bool = sqlx::query_scalar("SELECT pg_advisory_unlock($1)")
            .bind(key)
            .fetch_one(&mut *conn)
            .await?;
        Ok(released)
    }

    async fn close(mut self: Box<Self>) -> MigrateResult<()> {
        if let Some(conn) = self.conn.take() {
            conn.close().await?;
        }
        debug!("lock session closed");
        Ok(())
    }

    fn abandon(mut self: Box<Self>) {
        if let Some(conn) = self.conn.take() {
            // dropping closes the socket; the server ends the session and
            // frees every advisory lock it held
            warn!("closing lock session without explicit unlock");
            drop(conn);
        }
    }
}

fn bind_database_value<'q>(
    query: sqlx::query::Query<'q, Postgres, PgArguments>,
    value: &DatabaseValue,
) -> sqlx::query::Query<'q, Postgres, PgArguments> {
    match value {
        DatabaseValue::Null => query.bind(Option::<String>::None),
        DatabaseValue::Bool(b) => query.bind(*b),
        DatabaseValue::Int32(i) => query.bind(*i),
        DatabaseValue::Int64(i) => query.bind(*i),
        DatabaseValue::Float64(f) => query.bind(*f),
        DatabaseValue::String(s) => query.bind(s.clone()),
        DatabaseValue::DateTime(dt) => query.bind(*dt),
    }
}

/// Convert a PostgreSQL column value to DatabaseValue
fn postgres_value_to_database_value(row: &PgRow, index: usize) -> MigrateResult<DatabaseValue> {
    let type_name = row.columns()[index].type_info().name().to_string();

    let value = match type_name.as_str() {
        "BOOL" => row.try_get::<Option<bool>, _>(index)?.map(DatabaseValue::Bool),
        "INT2" => row
            .try_get::<Option<i16>, _>(index)?
            .map(|v| DatabaseValue::Int32(v as i32)),
        "INT4" => row.try_get::<Option<i32>, _>(index)?.map(DatabaseValue::Int32),
        "INT8" => row.try_get::<Option<i64>, _>(index)?.map(DatabaseValue::Int64),
        "FLOAT8" => row.try_get::<Option<f64>, _>(index)?.map(DatabaseValue::Float64),
        "TIMESTAMPTZ" => row
            .try_get::<Option<DateTime<Utc>>, _>(index)?
            .map(DatabaseValue::DateTime),
        "TIMESTAMP" => row
            .try_get::<Option<NaiveDateTime>, _>(index)?
            .map(|v| DatabaseValue::DateTime(v.and_utc())),
        "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" => {
            row.try_get::<Option<String>, _>(index)?.map(DatabaseValue::String)
        }
        other => {
            return Err(MigrateError::Configuration(format!(
                "unsupported column type {} in column {}",
                other, index
            )))
        }
    };

    Ok(value.unwrap_or(DatabaseValue::Null))
}
