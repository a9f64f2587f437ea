//! Migration Source - builds migration units from a directory of SQL files
//!
//! Files are applied in byte-wise order of their names, so a numeric prefix
//! (`001_init.sql`, `002_users.sql`, ...) is the way to control order.
//! Each file is executed verbatim as one script. Its recorded name is the
//! file name, or the value of a `-- migration name: <name>` line when the
//! [`NameStrategy::Directive`] strategy is in use.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info};

use super::definitions::{Applied, Migration};
use super::state::StateTracker;
use crate::backends::MigrationTransaction;
use crate::config::NameStrategy;
use crate::error::{MigrateError, MigrateResult};

// `\w` and `\s` are ASCII only so names match what older runs recorded
static MIGRATION_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^[ \t]*--[ \t]*migration name:(?-u:\s)*((?-u:\w)+(?: *(?-u:\w)+)*)(?-u:\s)*$")
        .expect("valid migration name regex")
});

/// Find a `-- migration name: <name>` directive; the first matching line wins
pub fn match_migration_name(contents: &str) -> Option<&str> {
    contents
        .lines()
        .find_map(|line| MIGRATION_NAME.captures(line))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// One entry of a directory listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: OsString,
    pub is_dir: bool,
}

/// Read-only filesystem the migrations are loaded from
pub trait MigrationFs: Send + Sync {
    /// List the entries of `dir`, not recursing
    fn read_dir(&self, dir: &Path) -> io::Result<Vec<DirEntry>>;

    /// Read a whole file
    fn read_to_string(&self, path: &Path) -> io::Result<String>;
}

/// The local filesystem, with relative paths resolved against `root`
#[derive(Debug, Clone)]
pub struct LocalFs {
    root: PathBuf,
}

impl LocalFs {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Default for LocalFs {
    fn default() -> Self {
        Self::new(".")
    }
}

impl MigrationFs for LocalFs {
    fn read_dir(&self, dir: &Path) -> io::Result<Vec<DirEntry>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(self.root.join(dir))? {
            let entry = entry?;
            entries.push(DirEntry {
                name: entry.file_name(),
                is_dir: entry.file_type()?.is_dir(),
            });
        }
        Ok(entries)
    }

    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        fs::read_to_string(self.root.join(path))
    }
}

/// In-memory filesystem, for migrations compiled into the binary with
/// `include_str!` and for tests
#[derive(Debug, Clone, Default)]
pub struct MemoryFs {
    files: BTreeMap<PathBuf, String>,
}

impl MemoryFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a file, builder style
    pub fn with_file<P: AsRef<Path>, S: Into<String>>(mut self, path: P, contents: S) -> Self {
        self.insert(path, contents);
        self
    }

    /// Add or replace a file
    pub fn insert<P: AsRef<Path>, S: Into<String>>(&mut self, path: P, contents: S) {
        self.files.insert(normalize(path.as_ref()), contents.into());
    }
}

impl MigrationFs for MemoryFs {
    fn read_dir(&self, dir: &Path) -> io::Result<Vec<DirEntry>> {
        let dir = normalize(dir);
        let mut entries: BTreeMap<OsString, bool> = BTreeMap::new();

        for path in self.files.keys() {
            let Ok(rest) = path.strip_prefix(&dir) else {
                continue;
            };
            let mut components = rest.components();
            let Some(first) = components.next() else {
                continue;
            };
            let is_dir = components.next().is_some();
            let seen = entries.entry(first.as_os_str().to_os_string()).or_insert(is_dir);
            *seen |= is_dir;
        }

        if entries.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no such directory: {}", dir.display()),
            ));
        }

        Ok(entries
            .into_iter()
            .map(|(name, is_dir)| DirEntry { name, is_dir })
            .collect())
    }

    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        self.files.get(&normalize(path)).cloned().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no such file: {}", path.display()),
            )
        })
    }
}

/// Drop `.` components so `./migrations/a.sql` and `migrations/a.sql` match
fn normalize(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}

/// A migration read from a file
#[derive(Clone)]
pub struct FileMigration {
    fs: Arc<dyn MigrationFs>,
    path: PathBuf,
    file_name: String,
    name_strategy: NameStrategy,
}

impl FileMigration {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    fn read(&self) -> MigrateResult<String> {
        self.fs
            .read_to_string(&self.path)
            .map_err(|source| MigrateError::Source {
                path: self.path.clone(),
                source,
            })
    }

    fn name_for(&self, contents: &str) -> String {
        match self.name_strategy {
            NameStrategy::Directive => match_migration_name(contents)
                .unwrap_or(&self.file_name)
                .to_string(),
            NameStrategy::FileName => self.file_name.clone(),
        }
    }

    /// The name this migration is recorded under
    pub fn resolve_name(&self) -> MigrateResult<String> {
        let contents = self.read()?;
        Ok(self.name_for(&contents))
    }
}

impl std::fmt::Debug for FileMigration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileMigration")
            .field("path", &self.path)
            .field("name_strategy", &self.name_strategy)
            .finish()
    }
}

#[async_trait]
impl Migration for FileMigration {
    fn label(&self) -> String {
        self.path.display().to_string()
    }

    async fn apply(
        &self,
        tx: &mut dyn MigrationTransaction,
        state: &StateTracker,
    ) -> MigrateResult<Applied> {
        let contents = self.read()?;
        let name = self.name_for(&contents);

        if state.is_applied(tx, &name).await? {
            debug!(migration = %name, path = %self.path.display(), "already applied");
            return Ok(Applied::Skipped { name });
        }

        info!(migration = %name, path = %self.path.display(), "applying migration");
        tx.execute_script(&contents)
            .await
            .map_err(|e| MigrateError::Script {
                path: self.path.clone(),
                source: e.boxed(),
            })?;

        state.mark_applied(tx, &name).await?;
        Ok(Applied::Ran { name })
    }
}

/// Builds migration batches from a filesystem
#[derive(Clone)]
pub struct MigrationSource {
    fs: Arc<dyn MigrationFs>,
    name_strategy: NameStrategy,
}

impl MigrationSource {
    pub fn new<F: MigrationFs + 'static>(fs: F) -> Self {
        Self::from_arc(Arc::new(fs))
    }

    pub fn from_arc(fs: Arc<dyn MigrationFs>) -> Self {
        Self {
            fs,
            name_strategy: NameStrategy::default(),
        }
    }

    /// Source reading from the local filesystem
    pub fn local() -> Self {
        Self::new(LocalFs::default())
    }

    pub fn with_name_strategy(mut self, strategy: NameStrategy) -> Self {
        self.name_strategy = strategy;
        self
    }

    pub fn name_strategy(&self) -> NameStrategy {
        self.name_strategy
    }

    /// The files of `dir` as migrations, in application order.
    /// Subdirectories are ignored.
    pub fn files<P: AsRef<Path>>(&self, dir: P) -> MigrateResult<Vec<FileMigration>> {
        let dir = dir.as_ref();
        let entries = self.fs.read_dir(dir).map_err(|source| MigrateError::Source {
            path: dir.to_path_buf(),
            source,
        })?;

        let mut files = Vec::new();
        for entry in entries.into_iter().filter(|e| !e.is_dir) {
            let file_name = entry
                .name
                .into_string()
                .map_err(|name| MigrateError::InvalidFileName {
                    path: dir.join(name),
                })?;
            files.push(FileMigration {
                fs: self.fs.clone(),
                path: dir.join(&file_name),
                file_name,
                name_strategy: self.name_strategy,
            });
        }

        // byte-wise order is the only ordering mechanism
        files.sort_by(|a, b| a.file_name.as_bytes().cmp(b.file_name.as_bytes()));
        debug!(dir = %dir.display(), count = files.len(), "loaded migration files");
        Ok(files)
    }

    /// The files of `dir` as a batch ready for the migrator
    pub fn from_directory<P: AsRef<Path>>(&self, dir: P) -> MigrateResult<Vec<Box<dyn Migration>>> {
        Ok(self
            .files(dir)?
            .into_iter()
            .map(|m| Box::new(m) as Box<dyn Migration>)
            .collect())
    }
}

impl std::fmt::Debug for MigrationSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationSource")
            .field("name_strategy", &self.name_strategy)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{MemoryBackend, MigrationBackend};

    #[test]
    fn test_match_migration_name() {
        assert_eq!(match_migration_name("-- migration name: custom_name\nSELECT 1;"), Some("custom_name"));
        assert_eq!(match_migration_name("  --\tMIGRATION NAME:   add users  \n"), Some("add users"));
        assert_eq!(
            match_migration_name("CREATE TABLE a ();\n-- Migration Name: later\n-- migration name: second"),
            Some("later")
        );
        assert_eq!(match_migration_name("-- migration: nope\nSELECT 1;"), None);
        assert_eq!(match_migration_name("-- migration name: bad-name"), None);
        assert_eq!(match_migration_name("SELECT 1; -- migration name: inline"), None);
        assert_eq!(match_migration_name("-- migration name: windows\r\nSELECT 1;"), Some("windows"));
    }

    #[test]
    fn test_directive_names_are_ascii_only() {
        assert_eq!(match_migration_name("-- migration name: café"), None);
        assert_eq!(match_migration_name("-- migration name: naïve name"), None);
        assert_eq!(match_migration_name("-- migration name:\u{a0}plain"), None);

        let fs = MemoryFs::new().with_file("m/001_accent.sql", "-- migration name: café\nSELECT 1;");
        let files = MigrationSource::new(fs).files("m").unwrap();
        assert_eq!(files[0].resolve_name().unwrap(), "001_accent.sql");
    }

    #[test]
    fn test_files_sorted_bytewise_and_dirs_skipped() {
        let fs = MemoryFs::new()
            .with_file("migrations/010_c.sql", "SELECT 3;")
            .with_file("migrations/002_b.sql", "SELECT 2;")
            .with_file("migrations/001_a.sql", "SELECT 1;")
            .with_file("migrations/nested/000_ignored.sql", "SELECT 0;")
            .with_file("migrations/B_upper.sql", "SELECT 4;");

        let files = MigrationSource::new(fs).files("migrations").unwrap();
        let names: Vec<_> = files.iter().map(|f| f.file_name()).collect();

        assert_eq!(names, vec!["001_a.sql", "002_b.sql", "010_c.sql", "B_upper.sql"]);
        assert_eq!(files[0].path(), Path::new("migrations/001_a.sql"));
    }

    #[test]
    fn test_local_fs_listing() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("002_b.sql"), "SELECT 2;").unwrap();
        std::fs::write(dir.path().join("001_a.sql"), "SELECT 1;").unwrap();
        std::fs::create_dir(dir.path().join("010_dir")).unwrap();

        let source = MigrationSource::new(LocalFs::new(dir.path()));
        let files = source.files(".").unwrap();
        let names: Vec<_> = files.iter().map(|f| f.file_name()).collect();
        assert_eq!(names, vec!["001_a.sql", "002_b.sql"]);
    }

    #[test]
    fn test_missing_directory_is_source_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let source = MigrationSource::new(LocalFs::new(dir.path()));

        let err = source.files("missing").unwrap_err();
        assert!(matches!(err, MigrateError::Source { ref path, .. } if path == Path::new("missing")));

        let err = MigrationSource::new(MemoryFs::new()).files("migrations").unwrap_err();
        assert!(matches!(err, MigrateError::Source { .. }));
    }

    #[test]
    fn test_name_resolution_strategies() {
        let fs = MemoryFs::new()
            .with_file("m/001_named.sql", "-- migration name: custom_name\nCREATE TABLE a ();")
            .with_file("m/002_plain.sql", "CREATE TABLE b ();");

        let directive = MigrationSource::new(fs.clone()).files("m").unwrap();
        assert_eq!(directive[0].resolve_name().unwrap(), "custom_name");
        assert_eq!(directive[1].resolve_name().unwrap(), "002_plain.sql");

        let by_file = MigrationSource::new(fs)
            .with_name_strategy(NameStrategy::FileName)
            .files("m")
            .unwrap();
        assert_eq!(by_file[0].resolve_name().unwrap(), "001_named.sql");
    }

    #[tokio::test]
    async fn test_file_migration_apply_and_skip() {
        let backend = MemoryBackend::new();
        let state = StateTracker::default();
        let fs = MemoryFs::new().with_file(
            "m/001_users.sql",
            "-- migration name: users\nCREATE TABLE users (id uuid);\nCREATE INDEX users_id ON users (id);",
        );
        let files = MigrationSource::new(fs).files("m").unwrap();

        let mut tx = backend.begin().await.unwrap();
        state.ensure_table(&mut *tx).await.unwrap();
        let first = files[0].apply(&mut *tx, &state).await.unwrap();
        let second = files[0].apply(&mut *tx, &state).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(first, Applied::Ran { name: "users".to_string() });
        assert_eq!(second, Applied::Skipped { name: "users".to_string() });
        // executed as one script
        assert_eq!(backend.committed_statements().len(), 1);
        assert!(backend.committed_statements()[0].contains("CREATE INDEX"));
    }

    #[tokio::test]
    async fn test_script_failure_names_the_file() {
        let backend = MemoryBackend::new();
        backend.fail_statement("BROKEN");
        let state = StateTracker::default();
        let files = MigrationSource::new(MemoryFs::new().with_file("m/001_bad.sql", "BROKEN;"))
            .files("m")
            .unwrap();

        let mut tx = backend.begin().await.unwrap();
        state.ensure_table(&mut *tx).await.unwrap();
        let err = files[0].apply(&mut *tx, &state).await.unwrap_err();

        assert!(matches!(err, MigrateError::Script { ref path, .. } if path == Path::new("m/001_bad.sql")));
        assert!(files[0].label().contains("001_bad.sql"));
    }
}
