//! In-memory migration backend for development and testing
//!
//! Understands the bookkeeping statements issued by the state tracker
//! (create-if-absent, existence check, count, insert, list) with
//! transactional semantics: nothing a transaction did is visible until it
//! commits. Every other
//! statement is recorded verbatim. Failures can be injected per statement,
//! commit, rollback, unlock and ping.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::core::*;
use crate::error::{MigrateError, MigrateResult};

/// Something that happened on the backend, in order
#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    Begin(u64),
    Statement { tx: u64, sql: String },
    Commit(u64),
    Rollback(u64),
    Locked { session: u64, key: i64 },
    Unlocked { session: u64, key: i64 },
    Abandoned(u64),
}

/// Catalog queried for table existence; `$1` is the table name
const CATALOG_TABLE: &str = "pg_catalog.pg_class";

#[derive(Debug, Clone)]
enum Failure {
    Statement(String),
    Commit,
    Rollback,
    Unlock,
}

#[derive(Default)]
struct MemoryState {
    next_id: u64,
    tables: HashMap<String, Vec<(String, DateTime<Utc>)>>,
    statements: Vec<String>,
    locks: HashMap<i64, u64>,
    events: Vec<BackendEvent>,
    failures: Vec<Failure>,
    ping_failures_left: usize,
    pings: usize,
}

impl MemoryState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn has_failure(&self, wanted: fn(&Failure) -> bool) -> bool {
        self.failures.iter().any(wanted)
    }

    fn statement_failure(&self, sql: &str) -> Option<MigrateError> {
        self.failures.iter().find_map(|f| match f {
            Failure::Statement(pattern) if sql.contains(pattern.as_str()) => Some(injected(pattern)),
            _ => None,
        })
    }
}

fn injected(what: &str) -> MigrateError {
    MigrateError::Database(sqlx::Error::Protocol(format!("injected failure: {}", what)))
}

/// In-memory migration backend. Clones share the same database.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryBackend {
    /// Create an empty database
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every statement or script whose text contains `pattern`
    pub fn fail_statement(&self, pattern: &str) -> &Self {
        self.state.lock().failures.push(Failure::Statement(pattern.to_string()));
        self
    }

    /// Fail every commit
    pub fn fail_commit(&self) -> &Self {
        self.state.lock().failures.push(Failure::Commit);
        self
    }

    /// Fail every rollback
    pub fn fail_rollback(&self) -> &Self {
        self.state.lock().failures.push(Failure::Rollback);
        self
    }

    /// Fail every unlock
    pub fn fail_unlock(&self) -> &Self {
        self.state.lock().failures.push(Failure::Unlock);
        self
    }

    /// Fail the next `count` pings
    pub fn fail_pings(&self, count: usize) -> &Self {
        self.state.lock().ping_failures_left = count;
        self
    }

    /// Remove all injected failures
    pub fn clear_failures(&self) {
        let mut state = self.state.lock();
        state.failures.clear();
        state.ping_failures_left = 0;
    }

    /// Hold `key` from a session outside this process
    pub fn lock_externally(&self, key: i64) -> u64 {
        let mut state = self.state.lock();
        let session = state.next_id();
        state.locks.insert(key, session);
        session
    }

    /// Release a lock taken with [`lock_externally`](Self::lock_externally)
    pub fn unlock_externally(&self, key: i64) {
        self.state.lock().locks.remove(&key);
    }

    /// Session currently holding `key`
    pub fn lock_holder(&self, key: i64) -> Option<u64> {
        self.state.lock().locks.get(&key).copied()
    }

    /// Whether a committed table of that name exists
    pub fn table_exists(&self, table: &str) -> bool {
        self.state.lock().tables.contains_key(table)
    }

    /// Committed versions in a state table, in insertion order
    pub fn applied_versions(&self, table: &str) -> Vec<String> {
        self.state
            .lock()
            .tables
            .get(table)
            .map(|rows| rows.iter().map(|(v, _)| v.clone()).collect())
            .unwrap_or_default()
    }

    /// Committed statements other than bookkeeping, in commit order
    pub fn committed_statements(&self) -> Vec<String> {
        self.state.lock().statements.clone()
    }

    /// Everything that happened so far
    pub fn events(&self) -> Vec<BackendEvent> {
        self.state.lock().events.clone()
    }

    /// Number of pings received
    pub fn ping_count(&self) -> usize {
        self.state.lock().pings
    }
}

#[async_trait]
impl MigrationBackend for MemoryBackend {
    async fn begin(&self) -> MigrateResult<Box<dyn MigrationTransaction>> {
        let mut state = self.state.lock();
        let id = state.next_id();
        state.events.push(BackendEvent::Begin(id));
        Ok(Box::new(MemoryTransaction {
            id,
            state: self.state.clone(),
            created_tables: Vec::new(),
            inserts: Vec::new(),
            statements: Vec::new(),
            finished: false,
        }))
    }

    async fn lock_session(&self) -> MigrateResult<Box<dyn LockSession>> {
        let id = self.state.lock().next_id();
        Ok(Box::new(MemorySession {
            id,
            state: self.state.clone(),
        }))
    }

    async fn ping(&self) -> MigrateResult<()> {
        let mut state = self.state.lock();
        state.pings += 1;
        if state.ping_failures_left > 0 {
            state.ping_failures_left -= 1;
            return Err(MigrateError::Database(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }
}

/// Transaction on a [`MemoryBackend`]
pub struct MemoryTransaction {
    id: u64,
    state: Arc<Mutex<MemoryState>>,
    created_tables: Vec<String>,
    inserts: Vec<(String, String)>,
    statements: Vec<String>,
    finished: bool,
}

impl MemoryTransaction {
    fn table_visible(&self, state: &MemoryState, table: &str) -> bool {
        state.tables.contains_key(table) || self.created_tables.iter().any(|t| t == table)
    }

    fn count_versions(&self, state: &MemoryState, table: &str, version: &str) -> i64 {
        let committed = state
            .tables
            .get(table)
            .map(|rows| rows.iter().filter(|(v, _)| v == version).count())
            .unwrap_or(0);
        let pending = self
            .inserts
            .iter()
            .filter(|(t, v)| t == table && v == version)
            .count();
        (committed + pending) as i64
    }

    fn missing_table(table: &str) -> MigrateError {
        MigrateError::Database(sqlx::Error::Protocol(format!(
            "relation \"{}\" does not exist",
            table
        )))
    }

    fn version_param(params: &[DatabaseValue]) -> MigrateResult<String> {
        params
            .first()
            .and_then(DatabaseValue::as_str)
            .map(str::to_string)
            .ok_or_else(|| MigrateError::Database(sqlx::Error::Protocol("missing $1".to_string())))
    }

    /// Shared prologue: log the statement and apply injected failures
    fn record(&self, sql: &str) -> MigrateResult<()> {
        let mut state = self.state.lock();
        state.events.push(BackendEvent::Statement {
            tx: self.id,
            sql: sql.to_string(),
        });
        match state.statement_failure(sql) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl MigrationTransaction for MemoryTransaction {
    async fn execute(&mut self, sql: &str, params: &[DatabaseValue]) -> MigrateResult<u64> {
        self.record(sql)?;
        let upper = sql.trim_start().to_uppercase();

        if upper.starts_with("CREATE TABLE IF NOT EXISTS") {
            let table = word_after(sql, "EXISTS").unwrap_or_default();
            let state = self.state.lock();
            if !self.table_visible(&state, &table) {
                drop(state);
                self.created_tables.push(table);
            }
            return Ok(0);
        }

        if upper.starts_with("INSERT INTO") {
            let table = word_after(sql, "INTO").unwrap_or_default();
            let version = Self::version_param(params)?;
            let state = self.state.lock();
            if !self.table_visible(&state, &table) {
                return Err(Self::missing_table(&table));
            }
            if self.count_versions(&state, &table, &version) > 0 {
                return Err(MigrateError::Database(sqlx::Error::Protocol(format!(
                    "duplicate key value violates unique constraint \"{}_pkey\"",
                    table
                ))));
            }
            drop(state);
            self.inserts.push((table, version));
            return Ok(1);
        }

        self.statements.push(sql.to_string());
        Ok(0)
    }

    async fn execute_script(&mut self, sql: &str) -> MigrateResult<()> {
        self.record(sql)?;
        self.statements.push(sql.to_string());
        Ok(())
    }

    async fn fetch_scalar_i64(&mut self, sql: &str, params: &[DatabaseValue]) -> MigrateResult<i64> {
        self.record(sql)?;
        let table = word_after(sql, "FROM").unwrap_or_default();
        let version = Self::version_param(params)?;
        let state = self.state.lock();
        if table == CATALOG_TABLE {
            return Ok(i64::from(self.table_visible(&state, &version)));
        }
        if !self.table_visible(&state, &table) {
            return Err(Self::missing_table(&table));
        }
        Ok(self.count_versions(&state, &table, &version))
    }

    async fn fetch_rows(&mut self, sql: &str, _params: &[DatabaseValue]) -> MigrateResult<Vec<Vec<DatabaseValue>>> {
        self.record(sql)?;
        let table = word_after(sql, "FROM").unwrap_or_default();
        let state = self.state.lock();
        if !self.table_visible(&state, &table) {
            return Err(Self::missing_table(&table));
        }
        let mut rows: Vec<Vec<DatabaseValue>> = state
            .tables
            .get(&table)
            .map(|rows| {
                rows.iter()
                    .map(|(v, at)| vec![DatabaseValue::String(v.clone()), DatabaseValue::DateTime(*at)])
                    .collect()
            })
            .unwrap_or_default();
        let now = Utc::now();
        rows.extend(
            self.inserts
                .iter()
                .filter(|(t, _)| *t == table)
                .map(|(_, v)| vec![DatabaseValue::String(v.clone()), DatabaseValue::DateTime(now)]),
        );
        Ok(rows)
    }

    async fn commit(mut self: Box<Self>) -> MigrateResult<()> {
        let mut state = self.state.lock();
        if state.has_failure(|f| matches!(f, Failure::Commit)) {
            state.events.push(BackendEvent::Rollback(self.id));
            drop(state);
            self.finished = true;
            return Err(injected("commit"));
        }

        for table in self.created_tables.drain(..) {
            state.tables.entry(table).or_default();
        }
        let now = Utc::now();
        for (table, version) in self.inserts.drain(..) {
            state.tables.entry(table).or_default().push((version, now));
        }
        state.statements.append(&mut self.statements);
        state.events.push(BackendEvent::Commit(self.id));
        drop(state);

        self.finished = true;
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> MigrateResult<()> {
        let mut state = self.state.lock();
        // the server discards the work either way
        state.events.push(BackendEvent::Rollback(self.id));
        let failed = state.has_failure(|f| matches!(f, Failure::Rollback));
        drop(state);

        self.finished = true;
        if failed {
            return Err(injected("rollback"));
        }
        Ok(())
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if !self.finished {
            self.state.lock().events.push(BackendEvent::Rollback(self.id));
        }
    }
}

/// Lock session on a [`MemoryBackend`]
pub struct MemorySession {
    id: u64,
    state: Arc<Mutex<MemoryState>>,
}

#[async_trait]
impl LockSession for MemorySession {
    async fn try_lock(&mut self, key: i64) -> MigrateResult<bool> {
        let mut state = self.state.lock();
        match state.locks.get(&key) {
            Some(holder) if *holder != self.id => Ok(false),
            _ => {
                state.locks.insert(key, self.id);
                state.events.push(BackendEvent::Locked { session: self.id, key });
                Ok(true)
            }
        }
    }

    async fn unlock(&mut self, key: i64) -> MigrateResult<bool> {
        let mut state = self.state.lock();
        if state.has_failure(|f| matches!(f, Failure::Unlock)) {
            return Err(injected("unlock"));
        }
        if state.locks.get(&key) == Some(&self.id) {
            state.locks.remove(&key);
            state.events.push(BackendEvent::Unlocked { session: self.id, key });
            return Ok(true);
        }
        Ok(false)
    }

    async fn close(self: Box<Self>) -> MigrateResult<()> {
        Ok(())
    }

    fn abandon(self: Box<Self>) {
        let mut state = self.state.lock();
        let id = self.id;
        state.locks.retain(|_, holder| *holder != id);
        state.events.push(BackendEvent::Abandoned(id));
    }
}

/// The identifier following `keyword`, without surrounding punctuation
fn word_after(sql: &str, keyword: &str) -> Option<String> {
    let mut words = sql.split_whitespace();
    words.by_ref().find(|w| w.eq_ignore_ascii_case(keyword))?;
    words.next().map(|w| {
        w.split('(')
            .next()
            .unwrap_or(w)
            .trim_end_matches(';')
            .to_string()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_word_after() {
        assert_eq!(
            word_after("SELECT COUNT(version) FROM app_migration WHERE version=$1", "from"),
            Some("app_migration".to_string())
        );
        assert_eq!(
            word_after("CREATE TABLE IF NOT EXISTS s.t(\n version TEXT)", "EXISTS"),
            Some("s.t".to_string())
        );
        assert_eq!(word_after("SELECT 1", "FROM"), None);
    }

    #[tokio::test]
    async fn test_uncommitted_work_is_invisible() {
        let backend = MemoryBackend::new();

        let mut tx = backend.begin().await.unwrap();
        tx.execute("CREATE TABLE IF NOT EXISTS m (version TEXT)", &[]).await.unwrap();
        tx.execute("INSERT INTO m (version) VALUES ($1)", &["a".into()]).await.unwrap();
        assert_eq!(
            tx.fetch_scalar_i64("SELECT COUNT(version) FROM m WHERE version = $1", &["a".into()])
                .await
                .unwrap(),
            1
        );
        tx.rollback().await.unwrap();

        assert!(!backend.table_exists("m"));
        assert!(backend.applied_versions("m").is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_insert_is_rejected() {
        let backend = MemoryBackend::new();
        let mut tx = backend.begin().await.unwrap();
        tx.execute("CREATE TABLE IF NOT EXISTS m (version TEXT)", &[]).await.unwrap();
        tx.execute("INSERT INTO m (version) VALUES ($1)", &["a".into()]).await.unwrap();
        let err = tx
            .execute("INSERT INTO m (version) VALUES ($1)", &["a".into()])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("duplicate key"));
    }

    #[tokio::test]
    async fn test_dropped_transaction_rolls_back() {
        let backend = MemoryBackend::new();
        {
            let mut tx = backend.begin().await.unwrap();
            tx.execute_script("CREATE TABLE t (id INT);").await.unwrap();
        }
        assert!(backend.committed_statements().is_empty());
        assert!(matches!(backend.events().last(), Some(BackendEvent::Rollback(_))));
    }

    #[tokio::test]
    async fn test_locks_are_exclusive_between_sessions() {
        let backend = MemoryBackend::new();
        let mut first = backend.lock_session().await.unwrap();
        let mut second = backend.lock_session().await.unwrap();

        assert!(first.try_lock(1).await.unwrap());
        assert!(!second.try_lock(1).await.unwrap());
        assert!(!second.unlock(1).await.unwrap());
        assert!(first.unlock(1).await.unwrap());
        assert!(second.try_lock(1).await.unwrap());

        second.abandon();
        assert_eq!(backend.lock_holder(1), None);
    }
}
