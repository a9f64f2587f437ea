//! Migrator configuration
//!
//! Defaults match the historical behavior: state table `pgutil_migration`,
//! lock key 3628 and a one minute lock timeout. Everything can be overridden
//! in code or through `ELIF_MIGRATE_*` environment variables.

use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{MigrateError, MigrateResult};

/// Advisory lock key shared by every migrator talking to the same server.
/// Chosen by fair dice roll.
pub const DEFAULT_LOCK_KEY: i64 = 3628;

/// Default state table name
pub const DEFAULT_STATE_TABLE: &str = "pgutil_migration";

/// Default bound on waiting for the advisory lock
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(60);

/// Default delay between lock attempts
pub const DEFAULT_LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub const ENV_TABLE: &str = "ELIF_MIGRATE_TABLE";
pub const ENV_LOCK_KEY: &str = "ELIF_MIGRATE_LOCK_KEY";
pub const ENV_LOCK_TIMEOUT_SECS: &str = "ELIF_MIGRATE_LOCK_TIMEOUT_SECS";
pub const ENV_NAME_STRATEGY: &str = "ELIF_MIGRATE_NAME_STRATEGY";

static TABLE_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)?$").expect("valid table name regex")
});

/// How a file-sourced migration gets the name recorded in the state table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NameStrategy {
    /// Use a `-- migration name: <name>` line when the file has one,
    /// the file name otherwise
    #[default]
    Directive,
    /// Always use the file name
    FileName,
}

impl FromStr for NameStrategy {
    type Err = MigrateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "directive" => Ok(NameStrategy::Directive),
            "file-name" | "filename" | "file_name" => Ok(NameStrategy::FileName),
            other => Err(MigrateError::Configuration(format!(
                "unknown name strategy '{}', expected 'directive' or 'file-name'",
                other
            ))),
        }
    }
}

impl fmt::Display for NameStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NameStrategy::Directive => write!(f, "directive"),
            NameStrategy::FileName => write!(f, "file-name"),
        }
    }
}

/// Configuration for the migration system
#[derive(Debug, Clone)]
pub struct MigratorConfig {
    /// Table name for tracking migrations, optionally schema qualified
    pub table: String,
    /// Advisory lock key guarding a batch
    pub lock_key: i64,
    /// How long to wait for the lock before giving up
    pub lock_timeout: Duration,
    /// Delay between lock attempts while another batch holds it
    pub lock_poll_interval: Duration,
    /// Name resolution for directory sourced migrations
    pub name_strategy: NameStrategy,
}

impl Default for MigratorConfig {
    fn default() -> Self {
        Self {
            table: DEFAULT_STATE_TABLE.to_string(),
            lock_key: DEFAULT_LOCK_KEY,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            lock_poll_interval: DEFAULT_LOCK_POLL_INTERVAL,
            name_strategy: NameStrategy::default(),
        }
    }
}

impl MigratorConfig {
    pub fn with_table<S: Into<String>>(mut self, table: S) -> Self {
        self.table = table.into();
        self
    }

    pub fn with_lock_key(mut self, key: i64) -> Self {
        self.lock_key = key;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_lock_poll_interval(mut self, interval: Duration) -> Self {
        self.lock_poll_interval = interval;
        self
    }

    pub fn with_name_strategy(mut self, strategy: NameStrategy) -> Self {
        self.name_strategy = strategy;
        self
    }

    /// Load configuration from environment variables, falling back to the
    /// defaults for unset ones
    pub fn from_env() -> MigrateResult<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> MigrateResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(table) = lookup(ENV_TABLE) {
            config.table = table;
        }
        if let Some(key) = lookup(ENV_LOCK_KEY) {
            config.lock_key = parse_var(ENV_LOCK_KEY, &key)?;
        }
        if let Some(secs) = lookup(ENV_LOCK_TIMEOUT_SECS) {
            config.lock_timeout = Duration::from_secs(parse_var(ENV_LOCK_TIMEOUT_SECS, &secs)?);
        }
        if let Some(strategy) = lookup(ENV_NAME_STRATEGY) {
            config.name_strategy = strategy.parse()?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> MigrateResult<()> {
        validate_table_name(&self.table)?;
        if self.lock_poll_interval.is_zero() {
            return Err(MigrateError::Configuration(
                "lock poll interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// The state table name ends up in SQL text, so only plain identifiers are
/// accepted.
pub fn validate_table_name(table: &str) -> MigrateResult<()> {
    if !TABLE_NAME.is_match(table) {
        return Err(MigrateError::Configuration(format!(
            "invalid state table name '{}'",
            table
        )));
    }
    Ok(())
}

fn parse_var<T: FromStr>(name: &str, value: &str) -> MigrateResult<T> {
    value.trim().parse().map_err(|_| {
        MigrateError::Configuration(format!("invalid value '{}' for {}", value, name))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = MigratorConfig::default();
        assert_eq!(config.table, "pgutil_migration");
        assert_eq!(config.lock_key, 3628);
        assert_eq!(config.lock_timeout, Duration::from_secs(60));
        assert_eq!(config.name_strategy, NameStrategy::Directive);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = MigratorConfig::from_lookup(lookup(&[
            (ENV_TABLE, "app.schema_migrations"),
            (ENV_LOCK_KEY, "42"),
            (ENV_LOCK_TIMEOUT_SECS, "5"),
            (ENV_NAME_STRATEGY, "file-name"),
        ]))
        .unwrap();

        assert_eq!(config.table, "app.schema_migrations");
        assert_eq!(config.lock_key, 42);
        assert_eq!(config.lock_timeout, Duration::from_secs(5));
        assert_eq!(config.name_strategy, NameStrategy::FileName);
    }

    #[test]
    fn test_from_lookup_rejects_garbage() {
        let err = MigratorConfig::from_lookup(lookup(&[(ENV_LOCK_KEY, "soon")])).unwrap_err();
        assert!(err.to_string().contains(ENV_LOCK_KEY));

        let err = MigratorConfig::from_lookup(lookup(&[(ENV_NAME_STRATEGY, "random")])).unwrap_err();
        assert!(matches!(err, MigrateError::Configuration(_)));
    }

    #[test]
    fn test_table_name_validation() {
        assert!(validate_table_name("pgutil_migration").is_ok());
        assert!(validate_table_name("public.migrations").is_ok());
        assert!(validate_table_name("").is_err());
        assert!(validate_table_name("migrations; DROP TABLE users").is_err());
        assert!(validate_table_name("1migrations").is_err());
        assert!(validate_table_name("a.b.c").is_err());
    }

    #[test]
    fn test_name_strategy_round_trip_through_display() {
        for strategy in [NameStrategy::Directive, NameStrategy::FileName] {
            assert_eq!(strategy.to_string().parse::<NameStrategy>().unwrap(), strategy);
        }
    }

    #[test]
    fn test_zero_poll_interval_is_invalid() {
        let config = MigratorConfig::default().with_lock_poll_interval(Duration::ZERO);
        assert!(config.validate().is_err());
    }
}
