//! # elif-migrate: Schema Migrations for elif.rs
//!
//! A small, forward-only migration engine for PostgreSQL. A batch of named
//! migration units is applied in order, each in its own transaction, while a
//! session advisory lock keeps other processes from migrating the same
//! server at the same time. Applied names are recorded in a state table in
//! the same transaction as the change they describe.
//!
//! ```no_run
//! use elif_migrate::{Migrator, PostgresBackend, PoolConfig};
//!
//! # async fn run() -> elif_migrate::MigrateResult<()> {
//! let backend = PostgresBackend::connect("postgres://localhost/app", PoolConfig::default())?;
//! let report = Migrator::new().migrate_directory(&backend, "migrations").await?;
//! println!("applied {} migrations", report.applied_count());
//! # Ok(())
//! # }
//! ```

pub mod backends;
pub mod config;
pub mod error;
pub mod lock;
pub mod migrations;
pub mod wait;

pub use backends::{
    BackendEvent, DatabaseValue, LockSession, MemoryBackend, MigrationBackend, MigrationTransaction, PoolConfig,
    PostgresBackend,
};
pub use config::{MigratorConfig, NameStrategy, DEFAULT_LOCK_KEY, DEFAULT_STATE_TABLE};
pub use error::{MigrateError, MigrateResult, TransactionPhase};
pub use lock::{AdvisoryLock, AdvisoryLockGuard};
pub use migrations::*;
pub use wait::{wait, Pinger, WaitConfig};
