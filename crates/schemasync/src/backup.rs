//! Pre-flight backups.
//!
//! SQLite targets are snapshotted with `VACUUM INTO`, which includes
//! changes still in the write-ahead log; Postgres targets are dumped with
//! an external tool. Either way the result lands in one backups directory
//! under a name that encodes its kind, the target id and a sortable
//! timestamp:
//!
//! - `sqlite-<target>-<YYYYMMDD-HHMMSS>.db`
//! - `pg-<target>-<YYYYMMDD-HHMMSS>.sql`
//!
//! Writes go to a sibling temporary file that is renamed into place, so a
//! half-written backup never carries a final name.

use std::path::{Component, Path, PathBuf};
use std::process::Stdio;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::driver::{Driver, PostgresDriver, SqliteDriver};
use crate::error::{MigrateError, Result};

const FILE_PREFIX: &str = "sqlite-";
const FILE_SUFFIX: &str = ".db";
const DUMP_PREFIX: &str = "pg-";
const DUMP_SUFFIX: &str = ".sql";
const TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";
/// Length of `-YYYYMMDD-HHMMSS`.
const TIMESTAMP_TAIL: usize = 16;

/// How a backup was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupKind {
    /// Byte copy of a SQLite database file.
    File,
    /// SQL dump of a Postgres database.
    Dump,
}

impl BackupKind {
    fn affixes(self) -> (&'static str, &'static str) {
        match self {
            Self::File => (FILE_PREFIX, FILE_SUFFIX),
            Self::Dump => (DUMP_PREFIX, DUMP_SUFFIX),
        }
    }

    /// Classifies a file name by its prefix/suffix convention.
    #[must_use]
    pub fn from_file_name(name: &str) -> Option<Self> {
        [Self::File, Self::Dump].into_iter().find(|kind| {
            let (prefix, suffix) = kind.affixes();
            name.len() > prefix.len() + suffix.len()
                && name.starts_with(prefix)
                && name.ends_with(suffix)
        })
    }
}

/// A backup on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupRecord {
    /// How it was produced.
    pub kind: BackupKind,
    /// Full path of the backup file.
    pub path: PathBuf,
    /// File name within the backups directory.
    pub file_name: String,
    /// Target id encoded in the name, when the name follows the convention.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    /// Size in bytes.
    pub size_bytes: u64,
    /// Last modification time.
    pub created_at: DateTime<Utc>,
}

/// Creates, lists and resolves backups in one directory.
#[derive(Debug, Clone)]
pub struct BackupStore {
    dir: PathBuf,
    dump_tool: PathBuf,
}

impl BackupStore {
    /// Creates a store rooted at `dir`, dumping Postgres with `dump_tool`.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, dump_tool: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            dump_tool: dump_tool.into(),
        }
    }

    /// The backups directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Backs up `driver` when `requested`, otherwise does nothing.
    pub async fn backup_if_requested(
        &self,
        target_id: &str,
        driver: &Driver,
        requested: bool,
    ) -> Result<Option<BackupRecord>> {
        if !requested {
            return Ok(None);
        }
        self.backup(target_id, driver).await.map(Some)
    }

    /// Backs up `driver` unconditionally.
    pub async fn backup(&self, target_id: &str, driver: &Driver) -> Result<BackupRecord> {
        let path = match driver {
            Driver::Sqlite(d) => self.copy_sqlite(target_id, d).await?,
            Driver::Postgres(d) => self.dump_postgres(target_id, d).await?,
        };
        let record = self.record(&path).await?.ok_or_else(|| {
            MigrateError::Backup(format!("backup {} vanished after writing", path.display()))
        })?;
        info!(target_id, path = %record.path.display(), bytes = record.size_bytes, "Backup written");
        Ok(record)
    }

    async fn copy_sqlite(&self, target_id: &str, driver: &SqliteDriver) -> Result<PathBuf> {
        let source = driver.path().ok_or_else(|| {
            MigrateError::Backup(format!(
                "connection '{target_id}' is an in-memory database that has never been persisted"
            ))
        })?;
        if !fs::try_exists(source).await.unwrap_or(false) {
            return Err(MigrateError::Backup(format!(
                "database file {} does not exist",
                source.display()
            )));
        }

        let dest = self.prepare(BackupKind::File, target_id).await?;
        let tmp = temp_sibling(&dest);
        remove_quietly(&tmp).await;
        debug!(from = %source.display(), to = %dest.display(), "Snapshotting database file");

        if let Err(e) = driver.snapshot_to(&tmp).await {
            remove_quietly(&tmp).await;
            return Err(MigrateError::Backup(format!(
                "snapshot of {} failed: {e}",
                source.display()
            )));
        }
        if let Err(e) = fs::rename(&tmp, &dest).await {
            remove_quietly(&tmp).await;
            return Err(MigrateError::Backup(format!(
                "could not move snapshot into {}: {e}",
                dest.display()
            )));
        }
        Ok(dest)
    }

    async fn dump_postgres(&self, target_id: &str, driver: &PostgresDriver) -> Result<PathBuf> {
        let config = driver.config();
        let dest = self.prepare(BackupKind::Dump, target_id).await?;
        let tmp = temp_sibling(&dest);
        let tool = self.dump_tool.display().to_string();

        let mut command = Command::new(&self.dump_tool);
        command
            .arg("--no-owner")
            .arg("--no-privileges")
            .arg("--host")
            .arg(&config.host)
            .arg("--port")
            .arg(config.port.to_string())
            .arg("--username")
            .arg(&config.user)
            .arg("--dbname")
            .arg(&config.database)
            .arg("--file")
            .arg(&tmp)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(password) = &config.password {
            command.env("PGPASSWORD", password);
        }

        debug!(tool = %tool, database = %config.database, "Running dump tool");
        let output = command.output().await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                MigrateError::Tooling(format!("{tool} not found; install it or configure its path"))
            } else {
                MigrateError::Tooling(format!("could not run {tool}: {e}"))
            }
        })?;

        if !output.status.success() {
            remove_quietly(&tmp).await;
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(MigrateError::Tooling(format!(
                "{tool} exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        if let Err(e) = fs::rename(&tmp, &dest).await {
            remove_quietly(&tmp).await;
            return Err(MigrateError::Backup(format!(
                "could not move dump into {}: {e}",
                dest.display()
            )));
        }
        Ok(dest)
    }

    /// Creates the backups directory and returns the destination path.
    async fn prepare(&self, kind: BackupKind, target_id: &str) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir).await.map_err(|e| {
            MigrateError::Backup(format!(
                "could not create backups directory {}: {e}",
                self.dir.display()
            ))
        })?;
        Ok(self.dir.join(backup_file_name(kind, target_id, Utc::now())))
    }

    /// Lists backups, newest first by modification time.
    ///
    /// Files that do not follow the naming convention are ignored. A
    /// missing directory lists as empty.
    pub async fn list(&self) -> Result<Vec<BackupRecord>> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(record) = self.record(&entry.path()).await? {
                records.push(record);
            }
        }
        records.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.file_name.cmp(&a.file_name))
        });
        Ok(records)
    }

    async fn record(&self, path: &Path) -> Result<Option<BackupRecord>> {
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            return Ok(None);
        };
        let Some(kind) = BackupKind::from_file_name(file_name) else {
            return Ok(None);
        };
        let metadata = match fs::metadata(path).await {
            Ok(m) if m.is_file() => m,
            Ok(_) => return Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let created_at = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        Ok(Some(BackupRecord {
            kind,
            path: path.to_path_buf(),
            file_name: file_name.to_string(),
            target_id: parse_target_id(kind, file_name),
            size_bytes: metadata.len(),
            created_at,
        }))
    }

    /// Resolves a caller-supplied backup path for restore.
    ///
    /// Relative paths are taken relative to the backups directory. Paths
    /// that leave the directory, lexically or through symlinks, are
    /// rejected before the file system is consulted for existence.
    pub async fn resolve(&self, backup_path: &Path) -> Result<PathBuf> {
        let root = lexical_normalize(&std::path::absolute(&self.dir)?);
        let candidate = lexical_normalize(&root.join(backup_path));
        if candidate == root || !candidate.starts_with(&root) {
            warn!(path = %backup_path.display(), "Rejected backup path outside backups directory");
            return Err(MigrateError::PathTraversal(backup_path.to_path_buf()));
        }

        let real = match fs::canonicalize(&candidate).await {
            Ok(real) => real,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(MigrateError::NotFound(format!(
                    "backup {}",
                    backup_path.display()
                )));
            }
            Err(e) => return Err(e.into()),
        };
        let real_root = fs::canonicalize(&root).await?;
        if !real.starts_with(&real_root) {
            return Err(MigrateError::PathTraversal(backup_path.to_path_buf()));
        }
        if !fs::metadata(&real).await?.is_file() {
            return Err(MigrateError::NotFound(format!(
                "backup {} is not a file",
                backup_path.display()
            )));
        }
        Ok(real)
    }
}

/// Builds `<prefix><target>-<YYYYMMDD-HHMMSS><suffix>`.
#[must_use]
pub fn backup_file_name(kind: BackupKind, target_id: &str, at: DateTime<Utc>) -> String {
    let (prefix, suffix) = kind.affixes();
    format!(
        "{prefix}{}-{}{suffix}",
        sanitize(target_id),
        at.format(TIMESTAMP_FORMAT)
    )
}

fn sanitize(target_id: &str) -> String {
    let cleaned: String = target_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "target".to_string()
    } else {
        cleaned
    }
}

fn parse_target_id(kind: BackupKind, file_name: &str) -> Option<String> {
    let (prefix, suffix) = kind.affixes();
    let stem = file_name.strip_prefix(prefix)?.strip_suffix(suffix)?;
    let split = stem.len().checked_sub(TIMESTAMP_TAIL)?;
    let (id, tail) = stem.split_at_checked(split)?;
    let tail = tail.strip_prefix('-')?;
    chrono::NaiveDateTime::parse_from_str(tail, TIMESTAMP_FORMAT).ok()?;
    (!id.is_empty()).then(|| id.to_string())
}

fn temp_sibling(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    dest.with_file_name(name)
}

/// Removes a scratch file, logging anything but "already gone".
pub(crate) async fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(path = %path.display(), error = %e, "Could not remove scratch file");
    }
}

/// Resolves `.` and `..` without touching the file system.
fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::config::PostgresConfig;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap()
    }

    #[test]
    fn test_backup_file_names() {
        assert_eq!(
            backup_file_name(BackupKind::File, "local", at()),
            "sqlite-local-20240309-140507.db"
        );
        assert_eq!(
            backup_file_name(BackupKind::Dump, "prod db/1", at()),
            "pg-prod_db_1-20240309-140507.sql"
        );
    }

    #[test]
    fn test_classify_and_parse() {
        let name = "sqlite-my-app-20240309-140507.db";
        assert_eq!(BackupKind::from_file_name(name), Some(BackupKind::File));
        assert_eq!(
            parse_target_id(BackupKind::File, name).as_deref(),
            Some("my-app")
        );
        assert_eq!(
            BackupKind::from_file_name("pg-x-20240309-140507.sql"),
            Some(BackupKind::Dump)
        );
        assert_eq!(BackupKind::from_file_name("notes.txt"), None);
        assert_eq!(BackupKind::from_file_name("sqlite-.db"), None);
        assert_eq!(parse_target_id(BackupKind::File, "sqlite-handmade.db"), None);
    }

    #[test]
    fn test_lexical_normalize() {
        assert_eq!(
            lexical_normalize(Path::new("/a/b/../c/./d")),
            PathBuf::from("/a/c/d")
        );
    }

    #[tokio::test]
    async fn test_not_requested_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = BackupStore::new(dir.path().join("backups"), "pg_dump");
        let driver = Driver::Sqlite(SqliteDriver::in_memory().await.unwrap());

        let result = store.backup_if_requested("t", &driver, false).await.unwrap();
        assert!(result.is_none());
        assert!(!dir.path().join("backups").exists());
    }

    #[tokio::test]
    async fn test_sqlite_backup_copies_file() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("live.db");
        let driver = Driver::Sqlite(SqliteDriver::open(&db).await.unwrap());
        driver
            .query("CREATE TABLE saved (id INTEGER)")
            .await
            .unwrap();

        let store = BackupStore::new(dir.path().join("backups"), "pg_dump");
        let record = store.backup("live", &driver).await.unwrap();

        assert_eq!(record.kind, BackupKind::File);
        assert_eq!(record.target_id.as_deref(), Some("live"));
        assert!(record.size_bytes > 0);
        assert!(record.path.starts_with(store.dir()));

        let copy = SqliteDriver::open(&record.path).await.unwrap();
        let tables = copy.list_tables().await.unwrap();
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].name, "saved");
    }

    #[tokio::test]
    async fn test_sqlite_backup_includes_uncheckpointed_commits() {
        let dir = tempfile::tempdir().unwrap();
        let sqlite = SqliteDriver::open(dir.path().join("live.db")).await.unwrap();
        let pool = sqlite.pool().clone();
        let driver = Driver::Sqlite(sqlite);
        driver.query("CREATE TABLE a (id INTEGER)").await.unwrap();

        let mut reader = pool.begin().await.unwrap();
        sqlx::query("SELECT count(*) FROM a")
            .fetch_one(&mut *reader)
            .await
            .unwrap();
        driver.query("CREATE TABLE b (id INTEGER)").await.unwrap();

        let store = BackupStore::new(dir.path().join("backups"), "pg_dump");
        let record = store.backup("live", &driver).await.unwrap();
        reader.rollback().await.unwrap();

        let copy = SqliteDriver::open_existing(&record.path).await.unwrap();
        let names: Vec<String> = copy
            .list_tables()
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(!temp_sibling(&record.path).exists());
    }

    #[tokio::test]
    async fn test_in_memory_backup_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = BackupStore::new(dir.path(), "pg_dump");
        let driver = Driver::Sqlite(SqliteDriver::in_memory().await.unwrap());

        let err = store.backup("mem", &driver).await.unwrap_err();
        assert!(matches!(err, MigrateError::Backup(_)));
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_dump_tool_is_tooling_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = BackupStore::new(dir.path(), dir.path().join("no-such-pg_dump"));
        let driver = Driver::Postgres(PostgresDriver::connect_lazy(PostgresConfig {
            host: "127.0.0.1".into(),
            port: 1,
            user: "app".into(),
            password: Some("secret".into()),
            database: "app".into(),
            schema: "public".into(),
        }));

        let err = store.backup("remote", &driver).await.unwrap_err();
        assert!(matches!(err, MigrateError::Tooling(_)));
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_newest_first_and_ignores_strangers() {
        let dir = tempfile::tempdir().unwrap();
        let store = BackupStore::new(dir.path(), "pg_dump");

        let older = dir.path().join("sqlite-a-20240101-000000.db");
        std::fs::write(&older, b"old").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        let newer = dir.path().join("pg-b-20240102-000000.sql");
        std::fs::write(&newer, b"newer").unwrap();
        std::fs::write(dir.path().join("README.txt"), b"ignore me").unwrap();
        std::fs::create_dir(dir.path().join("sqlite-dir-20240101-000000.db")).unwrap();

        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].path, newer);
        assert_eq!(listed[0].kind, BackupKind::Dump);
        assert_eq!(listed[1].path, older);
        assert_eq!(listed[1].size_bytes, 3);
    }

    #[tokio::test]
    async fn test_list_missing_dir_is_empty() {
        let store = BackupStore::new("/definitely/not/a/backups/dir", "pg_dump");
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_resolve_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let backups = dir.path().join("backups");
        std::fs::create_dir(&backups).unwrap();
        std::fs::write(dir.path().join("secret.db"), b"x").unwrap();
        let store = BackupStore::new(&backups, "pg_dump");

        for path in ["../secret.db", "sub/../../secret.db", "."] {
            assert!(matches!(
                store.resolve(Path::new(path)).await,
                Err(MigrateError::PathTraversal(_))
            ));
        }
        assert!(matches!(
            store.resolve(&dir.path().join("secret.db")).await,
            Err(MigrateError::PathTraversal(_))
        ));
    }

    #[tokio::test]
    async fn test_resolve_existing_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = BackupStore::new(dir.path(), "pg_dump");
        let file = dir.path().join("sqlite-a-20240101-000000.db");
        std::fs::write(&file, b"x").unwrap();

        let resolved = store
            .resolve(Path::new("sqlite-a-20240101-000000.db"))
            .await
            .unwrap();
        assert_eq!(resolved, std::fs::canonicalize(&file).unwrap());

        assert!(matches!(
            store.resolve(Path::new("missing.db")).await,
            Err(MigrateError::NotFound(_))
        ));
    }
}
