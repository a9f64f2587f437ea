//! Core Database Backend Traits
//!
//! The migration engine talks to the database only through these traits: a
//! backend hands out transactions and a dedicated lock session, and reports
//! reachability. Keeping the seam here lets the engine run against PostgreSQL
//! in production and against an in-memory backend in unit tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::MigrateResult;

/// Abstract migration backend
#[async_trait]
pub trait MigrationBackend: Send + Sync {
    /// Begin a new transaction
    async fn begin(&self) -> MigrateResult<Box<dyn MigrationTransaction>>;

    /// Open a session on which advisory locks can be taken.
    ///
    /// Session level locks belong to one server connection, so the session
    /// must stay on the same connection until it is closed.
    async fn lock_session(&self) -> MigrateResult<Box<dyn LockSession>>;

    /// Check that the database answers
    async fn ping(&self) -> MigrateResult<()>;
}

/// Abstract migration transaction
#[async_trait]
pub trait MigrationTransaction: Send {
    /// Execute a single parameterized statement and return affected rows count
    async fn execute(&mut self, sql: &str, params: &[DatabaseValue]) -> MigrateResult<u64>;

    /// Execute a script of one or more statements verbatim, without
    /// parameters.
    async fn execute_script(&mut self, sql: &str) -> MigrateResult<()>;

    /// Run a query returning a single integer (e.g. `COUNT(*)`)
    async fn fetch_scalar_i64(&mut self, sql: &str, params: &[DatabaseValue]) -> MigrateResult<i64>;

    /// Run a query and return every row as a list of column values
    async fn fetch_rows(&mut self, sql: &str, params: &[DatabaseValue]) -> MigrateResult<Vec<Vec<DatabaseValue>>>;

    /// Commit the transaction
    async fn commit(self: Box<Self>) -> MigrateResult<()>;

    /// Rollback the transaction
    async fn rollback(self: Box<Self>) -> MigrateResult<()>;
}

/// A database session holding advisory locks
#[async_trait]
pub trait LockSession: Send {
    /// Try to take the advisory lock without waiting.
    /// Returns whether the lock is now held by this session.
    async fn try_lock(&mut self, key: i64) -> MigrateResult<bool>;

    /// Release the advisory lock. Returns whether the session held it.
    async fn unlock(&mut self, key: i64) -> MigrateResult<bool>;

    /// Give the session back. Implementations make sure no lock survives it.
    async fn close(self: Box<Self>) -> MigrateResult<()>;

    /// Tear the session down without awaiting. Called when a lock guard is
    /// dropped before release; the server must free the session's locks.
    fn abandon(self: Box<Self>);
}

/// Database value enumeration for type-safe parameter binding
#[derive(Debug, Clone, PartialEq)]
pub enum DatabaseValue {
    Null,
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Float64(f64),
    String(String),
    DateTime(DateTime<Utc>),
}

impl DatabaseValue {
    /// Check if the value is null
    pub fn is_null(&self) -> bool {
        matches!(self, DatabaseValue::Null)
    }

    /// Borrow the string payload, if this is a string value
    pub fn as_str(&self) -> Option<&str> {
        match self {
            DatabaseValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Take the timestamp payload, if this is a timestamp value
    pub fn as_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            DatabaseValue::DateTime(dt) => Some(*dt),
            _ => None,
        }
    }
}

impl From<bool> for DatabaseValue {
    fn from(value: bool) -> Self {
        DatabaseValue::Bool(value)
    }
}

impl From<i32> for DatabaseValue {
    fn from(value: i32) -> Self {
        DatabaseValue::Int32(value)
    }
}

impl From<i64> for DatabaseValue {
    fn from(value: i64) -> Self {
        DatabaseValue::Int64(value)
    }
}

impl From<f64> for DatabaseValue {
    fn from(value: f64) -> Self {
        DatabaseValue::Float64(value)
    }
}

impl From<String> for DatabaseValue {
    fn from(value: String) -> Self {
        DatabaseValue::String(value)
    }
}

impl From<&str> for DatabaseValue {
    fn from(value: &str) -> Self {
        DatabaseValue::String(value.to_string())
    }
}

impl From<DateTime<Utc>> for DatabaseValue {
    fn from(value: DateTime<Utc>) -> Self {
        DatabaseValue::DateTime(value)
    }
}

impl<T: Into<DatabaseValue>> From<Option<T>> for DatabaseValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(DatabaseValue::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_value_conversions() {
        assert_eq!(DatabaseValue::from("v1"), DatabaseValue::String("v1".to_string()));
        assert_eq!(DatabaseValue::from(42i64), DatabaseValue::Int64(42));
        assert_eq!(DatabaseValue::from(None::<i32>), DatabaseValue::Null);
        assert_eq!(DatabaseValue::from(Some(true)), DatabaseValue::Bool(true));
        assert!(DatabaseValue::Null.is_null());
        assert_eq!(DatabaseValue::from("x").as_str(), Some("x"));
        assert_eq!(DatabaseValue::Int32(1).as_str(), None);
    }
}
