//! Needs a server: set TEST_DATABASE_URL to a role that may create databases.

use elif_migrate::Migrator;
use elif_migrate_testing::{utils, PostgresProvisioner, TestPool, TestPoolConfig};

fn config() -> Option<TestPoolConfig> {
    if utils::database_url_from_env().is_none() {
        eprintln!("TEST_DATABASE_URL not set, skipping");
        return None;
    }
    Some(TestPoolConfig::from_env().unwrap())
}

async fn database_exists(admin_url: &str, name: &str) -> bool {
    let provisioner = PostgresProvisioner::new(admin_url).unwrap();
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pg_database WHERE datname = $1")
        .bind(name)
        .fetch_one(provisioner.admin_pool())
        .await
        .unwrap();
    count > 0
}

#[tokio::test]
async fn can_connect_to_database() {
    let Some(config) = config() else { return };
    let pool = TestPool::new(config).unwrap();

    let version: String = pool
        .with_database(|db| async move {
            sqlx::query_scalar("SELECT version()").fetch_one(&db).await.unwrap()
        })
        .await
        .unwrap();

    assert!(version.to_lowercase().contains("postgresql"));
}

#[tokio::test]
async fn init_scripts_run_on_every_database() {
    let Some(config) = config() else { return };
    let pool = TestPool::new(config.with_init("CREATE EXTENSION IF NOT EXISTS \"uuid-ossp\";")).unwrap();

    for _ in 0..2 {
        pool.with_database(|db| async move {
            sqlx::query("CREATE TABLE test_table (id uuid PRIMARY KEY DEFAULT uuid_generate_v4())")
                .execute(&db)
                .await
                .unwrap();
        })
        .await
        .unwrap();
    }
}

#[tokio::test]
async fn release_drops_the_database() {
    let Some(config) = config() else { return };
    let admin_url = config.admin_url.clone();
    let pool = TestPool::new(config).unwrap();

    let database = pool.acquire().await.unwrap();
    let name = database.name().to_string();
    assert!(database_exists(&admin_url, &name).await);

    database.release().await.unwrap();
    assert!(!database_exists(&admin_url, &name).await);
}

#[tokio::test]
async fn global_databases_are_created_once() {
    let Some(config) = config() else { return };
    let pool = TestPool::new(config.with_global(|db| async move {
        sqlx::query("CREATE TABLE shared (id INT)").execute(&db).await?;
        Ok::<_, elif_migrate_testing::TestError>(())
    }))
    .unwrap();

    let first = pool.setup().await.unwrap();
    let second = pool.setup().await.unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(second.len(), 1);

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM shared")
        .fetch_one(&second[0])
        .await
        .unwrap();
    assert_eq!(count, 0);

    pool.close().await;
}

#[tokio::test]
async fn migrations_apply_to_an_ephemeral_database() {
    let Some(config) = config() else { return };
    let pool = TestPool::new(config).unwrap();

    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("001_users.sql"), "CREATE TABLE users (id SERIAL PRIMARY KEY);").unwrap();
    std::fs::write(
        dir.path().join("002_email.sql"),
        "-- migration name: add email\nALTER TABLE users ADD COLUMN email TEXT;",
    )
    .unwrap();

    let database = pool.acquire().await.unwrap();
    let migrator = Migrator::new();

    let report = database.migrate(&migrator, dir.path()).await.unwrap();
    assert_eq!(report.applied, vec!["001_users.sql", "add email"]);
    assert!(database.migrate(&migrator, dir.path()).await.unwrap().is_noop());

    database.release().await.unwrap();
}
