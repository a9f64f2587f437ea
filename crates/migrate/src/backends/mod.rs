//! Database Backend Abstractions
//!
//! The traits the migration engine needs from a database, the PostgreSQL
//! implementation of them, and an in-memory one for tests.

pub mod core;
pub mod memory;
pub mod postgres;

pub use self::core::*;
pub use memory::{BackendEvent, MemoryBackend};
pub use postgres::{PoolConfig, PostgresBackend};
