//! Database testing utilities
//!
//! Provides ephemeral database support:
//! - A provisioner that creates and drops randomly named databases
//! - Init scripts run against every new database
//! - Global databases built once per pool by setup hooks

use std::future::Future;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use elif_migrate::{wait, MigrationReport, Migrator, PostgresBackend, WaitConfig};
use futures::future::{BoxFuture, FutureExt};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{Executor, PgPool};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::utils::{database_url_from_env, random_database_name};
use crate::{TestError, TestResult};

/// A database created by a [`DatabaseProvisioner`]
#[derive(Debug, Clone)]
pub struct ProvisionedDatabase {
    pub name: String,
    pub options: PgConnectOptions,
}

/// Creates and drops throwaway databases
#[async_trait]
pub trait DatabaseProvisioner: Send + Sync {
    /// Create a new, empty database with a fresh name
    async fn create(&self) -> TestResult<ProvisionedDatabase>;

    /// Drop a database created by [`create`](Self::create)
    async fn drop_database(&self, name: &str) -> TestResult<()>;
}

/// Provisioner creating databases on an existing PostgreSQL server
pub struct PostgresProvisioner {
    admin: PgPool,
    options: PgConnectOptions,
}

impl PostgresProvisioner {
    /// `admin_url` must name a role allowed to create databases
    pub fn new(admin_url: &str) -> TestResult<Self> {
        let options = PgConnectOptions::from_str(admin_url)?;
        let admin = PgPoolOptions::new()
            .max_connections(2)
            .connect_lazy_with(options.clone());
        Ok(Self { admin, options })
    }

    pub fn admin_pool(&self) -> &PgPool {
        &self.admin
    }
}

#[async_trait]
impl DatabaseProvisioner for PostgresProvisioner {
    async fn create(&self) -> TestResult<ProvisionedDatabase> {
        let name = random_database_name();
        self.admin
            .execute(format!("CREATE DATABASE \"{}\"", name).as_str())
            .await?;
        info!(database = %name, "created test database");

        Ok(ProvisionedDatabase {
            options: self.options.clone().database(&name),
            name,
        })
    }

    async fn drop_database(&self, name: &str) -> TestResult<()> {
        self.admin
            .execute(format!("DROP DATABASE IF EXISTS \"{}\" WITH (FORCE)", name).as_str())
            .await?;
        debug!(database = %name, "dropped test database");
        Ok(())
    }
}

/// Setup hook run against a global database
pub type GlobalHook = Arc<dyn Fn(PgPool) -> BoxFuture<'static, TestResult<()>> + Send + Sync>;

/// Test pool configuration
#[derive(Clone)]
pub struct TestPoolConfig {
    /// Connection URL of a role allowed to create databases
    pub admin_url: String,
    /// SQL run against every new database, in order
    pub init: Vec<String>,
    /// One global database is created per hook by [`TestPool::setup`]
    pub globals: Vec<GlobalHook>,
    /// How long to wait for a new database to answer
    pub wait: WaitConfig,
    pub max_connections: u32,
}

impl TestPoolConfig {
    pub fn new<S: Into<String>>(admin_url: S) -> Self {
        Self {
            admin_url: admin_url.into(),
            init: Vec::new(),
            globals: Vec::new(),
            wait: WaitConfig::default().with_max_elapsed(Duration::from_secs(5 * 60)),
            max_connections: 5,
        }
    }

    /// Configuration from `TEST_DATABASE_URL`, falling back to `DATABASE_URL`
    pub fn from_env() -> TestResult<Self> {
        database_url_from_env().map(Self::new).ok_or_else(|| {
            TestError::Configuration("set TEST_DATABASE_URL or DATABASE_URL to run database tests".to_string())
        })
    }

    /// Run `sql` on every new database
    pub fn with_init<S: Into<String>>(mut self, sql: S) -> Self {
        self.init.push(sql.into());
        self
    }

    /// Create a global database during setup and hand it to `hook`
    pub fn with_global<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(PgPool) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TestResult<()>> + Send + 'static,
    {
        self.globals.push(Arc::new(move |pool| hook(pool).boxed()));
        self
    }

    pub fn with_wait(mut self, wait: WaitConfig) -> Self {
        self.wait = wait;
        self
    }

    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }
}

impl std::fmt::Debug for TestPoolConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestPoolConfig")
            .field("init", &self.init.len())
            .field("globals", &self.globals.len())
            .field("wait", &self.wait)
            .field("max_connections", &self.max_connections)
            .finish_non_exhaustive()
    }
}

/// Hands out ephemeral databases. Build one per test binary and share it.
pub struct TestPool {
    provisioner: Arc<dyn DatabaseProvisioner>,
    config: TestPoolConfig,
    globals: Mutex<Option<Vec<EphemeralDatabase>>>,
}

impl TestPool {
    /// Pool provisioning on the server behind `config.admin_url`
    pub fn new(config: TestPoolConfig) -> TestResult<Self> {
        let provisioner = PostgresProvisioner::new(&config.admin_url)?;
        Ok(Self::with_provisioner(config, Arc::new(provisioner)))
    }

    pub fn with_provisioner(config: TestPoolConfig, provisioner: Arc<dyn DatabaseProvisioner>) -> Self {
        Self {
            provisioner,
            config,
            globals: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &TestPoolConfig {
        &self.config
    }

    /// A fresh database, reachable and initialized
    pub async fn acquire(&self) -> TestResult<EphemeralDatabase> {
        let provisioned = self.provisioner.create().await?;
        let pool = PgPoolOptions::new()
            .max_connections(self.config.max_connections)
            .connect_lazy_with(provisioned.options);

        let database = EphemeralDatabase {
            name: provisioned.name,
            pool,
            provisioner: self.provisioner.clone(),
            released: false,
        };

        if let Err(err) = self.prepare(&database).await {
            if let Err(cleanup) = database.release().await {
                warn!(error = %cleanup, "dropping half-initialized test database failed");
            }
            return Err(err);
        }
        Ok(database)
    }

    async fn prepare(&self, database: &EphemeralDatabase) -> TestResult<()> {
        wait(database.pool(), &self.config.wait).await?;

        for (index, script) in self.config.init.iter().enumerate() {
            database
                .pool()
                .execute(script.as_str())
                .await
                .map_err(|source| TestError::Init {
                    index,
                    database: database.name.clone(),
                    source,
                })?;
        }
        Ok(())
    }

    /// Run `f` against a fresh database, then drop the database
    pub async fn with_database<F, Fut, T>(&self, f: F) -> TestResult<T>
    where
        F: FnOnce(PgPool) -> Fut,
        Fut: Future<Output = T>,
    {
        let database = self.acquire().await?;
        let output = f(database.pool().clone()).await;
        database.release().await?;
        Ok(output)
    }

    /// Create the global databases and run their hooks, once per pool.
    ///
    /// Returns a pool per global hook, in registration order. Later calls
    /// return the same databases.
    pub async fn setup(&self) -> TestResult<Vec<PgPool>> {
        let mut globals = self.globals.lock().await;
        if let Some(existing) = globals.as_ref() {
            return Ok(existing.iter().map(|db| db.pool().clone()).collect());
        }

        let mut created = Vec::with_capacity(self.config.globals.len());
        for (index, hook) in self.config.globals.iter().enumerate() {
            let outcome = match self.acquire().await {
                Ok(database) => {
                    let result = (**hook)(database.pool().clone()).await;
                    created.push(database);
                    result
                }
                Err(err) => Err(err),
            };

            if let Err(err) = outcome {
                release_all(created).await;
                return Err(TestError::Setup {
                    message: format!("global database {}: {}", index, err),
                });
            }
        }

        info!(count = created.len(), "global test databases ready");
        let pools = created.iter().map(|db| db.pool().clone()).collect();
        *globals = Some(created);
        Ok(pools)
    }

    /// Drop the global databases
    pub async fn close(&self) {
        if let Some(globals) = self.globals.lock().await.take() {
            release_all(globals).await;
        }
    }
}

impl std::fmt::Debug for TestPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestPool").field("config", &self.config).finish_non_exhaustive()
    }
}

async fn release_all(databases: Vec<EphemeralDatabase>) {
    for database in databases {
        let name = database.name.clone();
        if let Err(err) = database.release().await {
            warn!(database = %name, error = %err, "dropping test database failed");
        }
    }
}

/// A throwaway database. Call [`release`](Self::release) when done; a
/// database dropped without it is cleaned up in the background when a
/// runtime is available.
pub struct EphemeralDatabase {
    name: String,
    pool: PgPool,
    provisioner: Arc<dyn DatabaseProvisioner>,
    released: bool,
}

impl EphemeralDatabase {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Migration backend over this database
    pub fn backend(&self) -> PostgresBackend {
        PostgresBackend::from(self.pool.clone())
    }

    /// Apply the migrations in `dir`
    pub async fn migrate<P: AsRef<Path>>(&self, migrator: &Migrator, dir: P) -> TestResult<MigrationReport> {
        Ok(migrator.migrate_directory(&self.backend(), dir).await?)
    }

    /// Close every connection and drop the database
    pub async fn release(mut self) -> TestResult<()> {
        self.released = true;
        self.pool.close().await;
        self.provisioner.drop_database(&self.name).await
    }
}

impl Drop for EphemeralDatabase {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let name = std::mem::take(&mut self.name);
        let pool = self.pool.clone();
        let provisioner = self.provisioner.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    pool.close().await;
                    if let Err(err) = provisioner.drop_database(&name).await {
                        warn!(database = %name, error = %err, "dropping leaked test database failed");
                    }
                });
            }
            Err(_) => warn!(database = %name, "test database leaked, no runtime to drop it"),
        }
    }
}

impl std::fmt::Debug for EphemeralDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralDatabase")
            .field("name", &self.name)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}
