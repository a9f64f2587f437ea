mod commands;
mod logging;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use elif_migrate::{MigrateError, Migrator, MigratorConfig, NameStrategy};
use logging::{init_logging, LoggingConfig};
use tracing::error;

#[derive(Parser)]
#[command(name = "elif-migrate")]
#[command(about = "Forward-only PostgreSQL schema migrations")]
struct Cli {
    /// Database connection URL
    #[arg(long, env = "DATABASE_URL", global = true, hide_env_values = true)]
    database_url: Option<String>,

    /// State table name (overrides ELIF_MIGRATE_TABLE)
    #[arg(long, global = true)]
    table: Option<String>,

    /// Seconds to wait for the migration lock
    #[arg(long, global = true)]
    lock_timeout: Option<u64>,

    /// How file migrations are named: directive or file-name
    #[arg(long, global = true)]
    name_strategy: Option<NameStrategy>,

    /// Log level used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending migrations from a directory
    Run {
        /// Directory containing migration files
        #[arg(long, default_value = "migrations")]
        dir: PathBuf,

        /// Seconds to wait for the database to come up, 0 to skip
        #[arg(long, default_value = "60")]
        wait: u64,
    },

    /// Show which migrations in a directory are applied
    Status {
        /// Directory containing migration files
        #[arg(long, default_value = "migrations")]
        dir: PathBuf,
    },

    /// Wait until the database accepts connections
    Wait {
        /// Seconds to keep trying
        #[arg(long, default_value = "900")]
        timeout: u64,
    },
}

impl Cli {
    fn migrator_config(&self) -> Result<MigratorConfig, MigrateError> {
        let mut config = MigratorConfig::from_env()?;
        if let Some(table) = &self.table {
            config = config.with_table(table.clone());
        }
        if let Some(secs) = self.lock_timeout {
            config = config.with_lock_timeout(Duration::from_secs(secs));
        }
        if let Some(strategy) = self.name_strategy {
            config = config.with_name_strategy(strategy);
        }
        Ok(config)
    }

    fn database_url(&self) -> anyhow::Result<&str> {
        self.database_url
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("no database URL: pass --database-url or set DATABASE_URL"))
    }
}

async fn execute(cli: Cli) -> anyhow::Result<()> {
    let database_url = cli.database_url()?;

    match &cli.command {
        Commands::Run { dir, wait } => {
            let migrator = Migrator::with_config(cli.migrator_config()?)?;
            let wait = (*wait > 0).then(|| Duration::from_secs(*wait));
            commands::run(&migrator, database_url, dir, wait).await
        }
        Commands::Status { dir } => {
            let migrator = Migrator::with_config(cli.migrator_config()?)?;
            commands::status(&migrator, database_url, dir).await
        }
        Commands::Wait { timeout } => commands::wait_only(database_url, Duration::from_secs(*timeout)).await,
    }
}

/// 2 when the lock may be stuck, 1 for every other failure
fn exit_code(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<MigrateError>() {
        Some(e) if e.is_fatal() => 2,
        _ => 1,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let logging = LoggingConfig {
        level: cli.log_level.clone(),
        json_format: cli.json_logs,
    };
    if let Err(e) = init_logging(&logging) {
        eprintln!("Error: {:#}", e);
        return ExitCode::FAILURE;
    }

    match execute(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let code = exit_code(&e);
            if code == 2 {
                error!(error = %e, "migration lock could not be released, later runs may block");
            }
            eprintln!("Error: {:#}", e);
            ExitCode::from(code)
        }
    }
}
