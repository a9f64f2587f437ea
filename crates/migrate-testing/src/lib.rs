//! # elif-migrate-testing - Ephemeral Test Databases
//!
//! Gives every test its own freshly created PostgreSQL database on a shared
//! server and drops it afterwards. There is no process-wide state: a
//! [`TestPool`] is built once (usually per test binary) and passed around.
//!
//! ```no_run
//! use elif_migrate_testing::{TestPool, TestPoolConfig};
//!
//! # async fn example() -> elif_migrate_testing::TestResult<()> {
//! let pool = TestPool::new(TestPoolConfig::from_env()?.with_init("CREATE EXTENSION IF NOT EXISTS \"uuid-ossp\";"))?;
//!
//! pool.with_database(|db| async move {
//!     sqlx::query("SELECT 1").execute(&db).await.unwrap();
//! })
//! .await?;
//! # Ok(())
//! # }
//! ```

pub mod database;

pub use database::{
    DatabaseProvisioner, EphemeralDatabase, GlobalHook, PostgresProvisioner, ProvisionedDatabase, TestPool,
    TestPoolConfig,
};

use elif_migrate::MigrateError;

#[derive(thiserror::Error, Debug)]
pub enum TestError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] MigrateError),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Init script {index} failed on database {database}: {source}")]
    Init {
        index: usize,
        database: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("Global database setup failed: {message}")]
    Setup { message: String },
}

pub type TestResult<T> = Result<T, TestError>;

/// Utility functions for testing
pub mod utils {
    use rand::Rng;

    /// Environment variables consulted for the admin connection, in order
    pub const DATABASE_URL_VARS: [&str; 2] = ["TEST_DATABASE_URL", "DATABASE_URL"];

    /// Random database name: 16 lowercase hex digits behind a letter prefix
    pub fn random_database_name() -> String {
        let bytes: [u8; 8] = rand::thread_rng().gen();
        format!("t_{}", hex::encode(bytes))
    }

    /// The admin connection URL from the environment, if any
    pub fn database_url_from_env() -> Option<String> {
        DATABASE_URL_VARS
            .iter()
            .find_map(|var| std::env::var(var).ok().filter(|v| !v.is_empty()))
    }
}
