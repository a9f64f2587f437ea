//! Error types for the migration engine
//!
//! Every recoverable error carries the unit, file or phase it came from so a
//! failed run can be diagnosed from the error alone. Lock release failures are
//! kept in their own fatal class, see [`MigrateError::is_fatal`].

use std::io;
use std::path::PathBuf;
use std::time::Duration;

/// Result type alias for migration operations
pub type MigrateResult<T> = Result<T, MigrateError>;

/// Transaction phase in which a failure happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionPhase {
    Begin,
    Commit,
    Rollback,
}

impl std::fmt::Display for TransactionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionPhase::Begin => write!(f, "begin"),
            TransactionPhase::Commit => write!(f, "commit"),
            TransactionPhase::Rollback => write!(f, "rollback"),
        }
    }
}

/// Error types for migration operations
#[derive(Debug, thiserror::Error)]
pub enum MigrateError {
    /// The advisory lock was not acquired within the allotted window.
    /// No migration ran.
    #[error("getting migration lock {key} timed out after {timeout:?}")]
    LockTimeout { key: i64, timeout: Duration },

    /// The lock statement itself failed
    #[error("getting migration lock {key} failed: {source}")]
    Lock {
        key: i64,
        #[source]
        source: Box<MigrateError>,
    },

    /// The lock could not be released. Treat as fatal: a stuck advisory lock
    /// blocks every later migration run against the same server.
    #[error("failed to release migration lock {key}: {reason}{}", batch_suffix(.batch))]
    LockRelease {
        key: i64,
        reason: Box<MigrateError>,
        batch: Option<Box<MigrateError>>,
    },

    /// The server reported that this session did not hold the lock on unlock
    #[error("advisory lock {key} was not held by the releasing session")]
    LockNotHeld { key: i64 },

    /// A migration unit failed and its transaction was rolled back
    #[error("migration `{migration}` failed: {source}{}", rollback_suffix(.rollback))]
    Unit {
        migration: String,
        #[source]
        source: Box<MigrateError>,
        rollback: Option<Box<MigrateError>>,
    },

    /// A transaction could not be started or committed
    #[error("migration `{migration}`: could not {phase} transaction: {source}")]
    Transaction {
        migration: String,
        phase: TransactionPhase,
        #[source]
        source: Box<MigrateError>,
    },

    /// Querying the state table failed
    #[error("checking migration state of `{name}`: {source}")]
    StateCheck {
        name: String,
        #[source]
        source: Box<MigrateError>,
    },

    /// Recording a migration as applied failed
    #[error("recording migration `{name}` as applied: {source}")]
    StateWrite {
        name: String,
        #[source]
        source: Box<MigrateError>,
    },

    /// Listing or reading migration files failed
    #[error("reading migration source {}: {source}", .path.display())]
    Source {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A migration file name is not valid UTF-8
    #[error("migration file name is not valid UTF-8: {}", .path.display())]
    InvalidFileName { path: PathBuf },

    /// Executing a migration script failed
    #[error("executing migration script {}: {source}", .path.display())]
    Script {
        path: PathBuf,
        #[source]
        source: Box<MigrateError>,
    },

    /// The database did not become reachable before the deadline
    #[error("database not reachable after {elapsed:?}{}", last_error_suffix(.last_error))]
    WaitTimeout {
        elapsed: Duration,
        last_error: Option<Box<MigrateError>>,
    },

    /// A row read back from the state table had an unexpected shape
    #[error("decoding state record: {0}")]
    Decode(String),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Driver error
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl MigrateError {
    /// Whether this error signals an unrecoverable invariant violation.
    ///
    /// Only a failed lock release is fatal. Callers typically abort the
    /// process on it instead of retrying.
    pub fn is_fatal(&self) -> bool {
        matches!(self, MigrateError::LockRelease { .. })
    }

    /// Whether the batch gave up waiting for the advisory lock
    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, MigrateError::LockTimeout { .. })
    }

    /// Name of the migration unit this error is attributed to, if any
    pub fn migration(&self) -> Option<&str> {
        match self {
            MigrateError::Unit { migration, .. } | MigrateError::Transaction { migration, .. } => {
                Some(migration)
            }
            MigrateError::LockRelease { batch: Some(batch), .. } => batch.migration(),
            _ => None,
        }
    }

    pub(crate) fn boxed(self) -> Box<MigrateError> {
        Box::new(self)
    }
}

fn rollback_suffix(rollback: &Option<Box<MigrateError>>) -> String {
    match rollback {
        Some(err) => format!("; rollback also failed: {}", err),
        None => String::new(),
    }
}

fn batch_suffix(batch: &Option<Box<MigrateError>>) -> String {
    match batch {
        Some(err) => format!(" (batch had already failed: {})", err),
        None => String::new(),
    }
}

fn last_error_suffix(last: &Option<Box<MigrateError>>) -> String {
    match last {
        Some(err) => format!(": {}", err),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver(msg: &str) -> MigrateError {
        MigrateError::Database(sqlx::Error::Protocol(msg.to_string()))
    }

    #[test]
    fn test_unit_error_reports_both_causes() {
        let err = MigrateError::Unit {
            migration: "002_add_column.sql".to_string(),
            source: driver("column already exists").boxed(),
            rollback: Some(driver("connection reset").boxed()),
        };

        let msg = err.to_string();
        assert!(msg.contains("002_add_column.sql"));
        assert!(msg.contains("column already exists"));
        assert!(msg.contains("rollback also failed"));
        assert!(msg.contains("connection reset"));
    }

    #[test]
    fn test_unit_error_without_rollback_failure() {
        let err = MigrateError::Unit {
            migration: "create_users".to_string(),
            source: driver("syntax error").boxed(),
            rollback: None,
        };
        assert!(!err.to_string().contains("rollback"));
        assert_eq!(err.migration(), Some("create_users"));
    }

    #[test]
    fn test_only_lock_release_is_fatal() {
        let release = MigrateError::LockRelease {
            key: 3628,
            reason: driver("connection closed").boxed(),
            batch: None,
        };
        assert!(release.is_fatal());

        let timeout = MigrateError::LockTimeout {
            key: 3628,
            timeout: Duration::from_secs(60),
        };
        assert!(!timeout.is_fatal());
        assert!(timeout.is_lock_timeout());
        assert!(!driver("boom").is_fatal());
    }

    #[test]
    fn test_lock_release_keeps_batch_error() {
        let err = MigrateError::LockRelease {
            key: 7,
            reason: driver("unlock returned false").boxed(),
            batch: Some(
                MigrateError::Unit {
                    migration: "broken".to_string(),
                    source: driver("boom").boxed(),
                    rollback: None,
                }
                .boxed(),
            ),
        };
        let msg = err.to_string();
        assert!(msg.contains("unlock returned false"));
        assert!(msg.contains("batch had already failed"));
        assert_eq!(err.migration(), Some("broken"));
    }

    #[test]
    fn test_source_error_names_the_path() {
        let err = MigrateError::Source {
            path: PathBuf::from("migrations/001_init.sql"),
            source: io::Error::new(io::ErrorKind::NotFound, "missing"),
        };
        assert!(err.to_string().contains("migrations/001_init.sql"));
    }
}
