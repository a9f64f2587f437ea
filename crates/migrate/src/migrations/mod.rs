//! Migration system
//!
//! - `definitions`: the migration unit trait and result types
//! - `state`: the state table ledger
//! - `source`: migration units built from a directory of SQL files
//! - `runner`: the migrator that applies batches under the advisory lock

pub mod definitions;
pub mod runner;
pub mod source;
pub mod state;

pub use definitions::{Applied, Migration, MigrationRecord, MigrationReport, SqlMigration};
pub use runner::{FileStatus, Migrator};
pub use source::{match_migration_name, DirEntry, FileMigration, LocalFs, MemoryFs, MigrationFs, MigrationSource};
pub use state::StateTracker;
