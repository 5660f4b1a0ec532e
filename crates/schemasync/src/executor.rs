//! Plan application and backup restore.
//!
//! Both mutate a target, so both run under the [`MigrationLock`] for that
//! target id. Applying always recomputes the plan rather than trusting one
//! handed in by the caller.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{info, warn};

use crate::backup::{BackupKind, BackupStore, remove_quietly};
use crate::config::{ApplyTimeouts, Settings};
use crate::driver::{Driver, SqliteDriver};
use crate::error::{MigrateError, Result};
use crate::lock::MigrationLock;
use crate::plan::{MigrationPlan, PlanBuilder, PlanOptions};
use crate::registry::ConnectionRegistry;

/// Options for applying a plan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyOptions {
    /// Also drop target tables missing on the source.
    #[serde(default)]
    pub fully_sync: bool,
    /// Back up the target before running any statement.
    #[serde(default)]
    pub create_backup: bool,
}

impl ApplyOptions {
    fn plan_options(self) -> PlanOptions {
        PlanOptions {
            fully_sync: self.fully_sync,
        }
    }
}

/// Result of a successful apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyOutcome {
    /// The plan that was applied, with applied steps marked.
    pub steps: MigrationPlan,
    /// Where the pre-flight backup was written, if one was taken.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_path: Option<PathBuf>,
}

/// Plans, applies and restores against registered connections.
#[derive(Debug, Clone)]
pub struct MigrationExecutor {
    registry: ConnectionRegistry,
    lock: MigrationLock,
    backups: BackupStore,
    timeouts: ApplyTimeouts,
}

impl MigrationExecutor {
    /// Creates an executor over `registry`.
    #[must_use]
    pub fn new(registry: ConnectionRegistry, settings: &Settings) -> Self {
        Self {
            registry,
            lock: MigrationLock::new(),
            backups: BackupStore::new(&settings.backups_dir, &settings.dump_tool),
            timeouts: settings.timeouts,
        }
    }

    /// The connection registry.
    #[must_use]
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// The backup store.
    #[must_use]
    pub fn backups(&self) -> &BackupStore {
        &self.backups
    }

    /// The per-target lock.
    #[must_use]
    pub fn lock(&self) -> &MigrationLock {
        &self.lock
    }

    /// Builds a plan. Read-only, so it takes no lock.
    pub async fn plan(
        &self,
        source_id: &str,
        target_id: &str,
        tables: &[String],
        options: PlanOptions,
    ) -> Result<MigrationPlan> {
        let source = self.registry.get(source_id).await?;
        let target = self.registry.get(target_id).await?;
        PlanBuilder::new(&source, &target)
            .options(options)
            .build(tables)
            .await
    }

    /// Recomputes the plan and applies its actionable steps in one transaction.
    pub async fn apply(
        &self,
        source_id: &str,
        target_id: &str,
        tables: &[String],
        options: ApplyOptions,
    ) -> Result<ApplyOutcome> {
        self.lock
            .with_lock(target_id, || {
                self.apply_locked(source_id, target_id, tables, options)
            })
            .await
    }

    async fn apply_locked(
        &self,
        source_id: &str,
        target_id: &str,
        tables: &[String],
        options: ApplyOptions,
    ) -> Result<ApplyOutcome> {
        let mut steps = self
            .plan(source_id, target_id, tables, options.plan_options())
            .await?;

        let statements: Vec<String> = steps
            .iter()
            .filter(|step| step.is_actionable())
            .filter_map(|step| step.statement.as_deref())
            .flat_map(split_statements)
            .collect();

        if statements.is_empty() {
            info!(source_id, target_id, "Nothing to apply");
            return Ok(ApplyOutcome {
                steps,
                backup_path: None,
            });
        }

        let target = self.registry.get(target_id).await?;
        let backup = self
            .backups
            .backup_if_requested(target_id, &target, options.create_backup)
            .await?;

        info!(
            source_id,
            target_id,
            statements = statements.len(),
            "Applying migration"
        );
        target.run_migration(&statements, &self.timeouts).await?;

        for step in steps.iter_mut().filter(|step| step.is_actionable()) {
            step.message = "applied".to_string();
        }
        info!(target_id, "Migration applied successfully");

        Ok(ApplyOutcome {
            steps,
            backup_path: backup.map(|b| b.path),
        })
    }

    /// Replaces a SQLite target's database file with a backup.
    ///
    /// The backup is copied next to the live file and checked before the
    /// target is touched. The previous file is kept aside until the restored
    /// one opens, and is put back if anything after the swap fails.
    pub async fn restore(&self, target_id: &str, backup_path: &Path) -> Result<()> {
        self.lock
            .with_lock(target_id, || self.restore_locked(target_id, backup_path))
            .await
    }

    async fn restore_locked(&self, target_id: &str, backup_path: &Path) -> Result<()> {
        let backup = self.backups.resolve(backup_path).await?;
        let kind = backup
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(BackupKind::from_file_name);
        if kind != Some(BackupKind::File) {
            return Err(MigrateError::Validation(format!(
                "{} is not a SQLite file backup",
                backup.display()
            )));
        }
        if fs::metadata(&backup).await?.len() == 0 {
            return Err(MigrateError::Validation(format!(
                "{} is empty",
                backup.display()
            )));
        }

        let current = self.registry.get(target_id).await?;
        let live = current
            .as_sqlite()
            .ok_or_else(|| {
                MigrateError::NotFound(format!("connection '{target_id}' is not a SQLite database"))
            })?
            .path()
            .map(Path::to_path_buf)
            .ok_or_else(|| {
                MigrateError::NotFound(format!(
                    "connection '{target_id}' is an in-memory database with no file"
                ))
            })?;

        let staged = with_suffix(&live, ".restore.tmp");
        if let Err(e) = stage_backup(&backup, &staged).await {
            remove_quietly(&staged).await;
            return Err(e);
        }

        info!(target_id, backup = %backup.display(), "Restoring backup");
        current.close().await;
        self.registry.remove(target_id).await;
        drop(current);

        let previous = with_suffix(&live, ".restore.bak");
        if let Err(e) = fs::rename(&live, &previous).await {
            remove_quietly(&staged).await;
            self.reopen(target_id, &live).await;
            return Err(e.into());
        }

        match swap_in(&staged, &live).await {
            Ok(driver) => {
                self.registry
                    .register(target_id, Driver::Sqlite(driver))
                    .await;
                remove_quietly(&previous).await;
                info!(target_id, "Backup restored");
                Ok(())
            }
            Err(e) => {
                warn!(target_id, error = %e, "Restore failed, putting the previous file back");
                remove_quietly(&staged).await;
                if let Err(undo) = put_back(&previous, &live).await {
                    warn!(
                        target_id,
                        error = %undo,
                        previous = %previous.display(),
                        "Could not put the previous file back"
                    );
                    return Err(e);
                }
                self.reopen(target_id, &live).await;
                Err(e)
            }
        }
    }

    /// Registers a fresh driver for `live`, logging when that fails.
    async fn reopen(&self, target_id: &str, live: &Path) {
        match SqliteDriver::open_existing(live).await {
            Ok(driver) => {
                self.registry
                    .register(target_id, Driver::Sqlite(driver))
                    .await;
            }
            Err(e) => warn!(target_id, error = %e, "Could not reconnect to the previous file"),
        }
    }
}

/// Copies `backup` to `staged` and checks that the copy is a usable database.
async fn stage_backup(backup: &Path, staged: &Path) -> Result<()> {
    fs::copy(backup, staged).await?;
    SqliteDriver::verify_file(staged).await
}

/// Moves the staged copy over `live` and opens it.
async fn swap_in(staged: &Path, live: &Path) -> Result<SqliteDriver> {
    fs::rename(staged, live).await?;
    remove_sidecars(live).await?;
    SqliteDriver::open_existing(live).await
}

/// Moves `previous` back over `live`.
async fn put_back(previous: &Path, live: &Path) -> Result<()> {
    remove_sidecars(live).await?;
    fs::rename(previous, live).await?;
    Ok(())
}

/// Drops WAL sidecars so they are not replayed into a different file.
async fn remove_sidecars(live: &Path) -> Result<()> {
    for sidecar in ["-wal", "-shm"] {
        match fs::remove_file(with_suffix(live, sidecar)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// Splits SQL into individual statements, each terminated with `;`.
///
/// Semicolons inside quoted strings and identifiers do not split.
#[must_use]
pub fn split_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for c in sql.chars() {
        match (quote, c) {
            (None, ';') => {
                push_statement(&mut statements, &current);
                current.clear();
                continue;
            }
            (None, '\'' | '"') => quote = Some(c),
            (Some(q), _) if c == q => quote = None,
            _ => {}
        }
        current.push(c);
    }
    push_statement(&mut statements, &current);
    statements
}

fn push_statement(statements: &mut Vec<String>, raw: &str) {
    let trimmed = raw.trim();
    if !trimmed.is_empty() {
        statements.push(format!("{trimmed};"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{NO_OP_STATEMENT, StepKind};

    #[test]
    fn test_split_statements() {
        let sql = "ALTER TABLE \"t\" ADD COLUMN \"a\" TEXT;\nALTER TABLE \"t\" ADD COLUMN \"b\" TEXT;";
        assert_eq!(
            split_statements(sql),
            vec![
                "ALTER TABLE \"t\" ADD COLUMN \"a\" TEXT;",
                "ALTER TABLE \"t\" ADD COLUMN \"b\" TEXT;",
            ]
        );
    }

    #[test]
    fn test_split_respects_quotes() {
        let sql = "INSERT INTO t VALUES ('a;b'); CREATE TABLE \"x;y\" (id INTEGER)";
        assert_eq!(
            split_statements(sql),
            vec![
                "INSERT INTO t VALUES ('a;b');",
                "CREATE TABLE \"x;y\" (id INTEGER);",
            ]
        );
    }

    #[test]
    fn test_split_drops_empty_fragments() {
        assert!(split_statements(" ; ;\n").is_empty());
    }

    async fn setup() -> (tempfile::TempDir, MigrationExecutor) {
        let dir = tempfile::tempdir().unwrap();
        let registry = ConnectionRegistry::new();
        let source = Driver::Sqlite(SqliteDriver::in_memory().await.unwrap());
        source
            .query("CREATE TABLE users (id INTEGER, name TEXT, email TEXT)")
            .await
            .unwrap();
        registry.register("src", source).await;

        let target = Driver::Sqlite(SqliteDriver::open(dir.path().join("target.db")).await.unwrap());
        target
            .query("CREATE TABLE users (id INTEGER, name TEXT)")
            .await
            .unwrap();
        target
            .query("CREATE TABLE stale (id INTEGER)")
            .await
            .unwrap();
        registry.register("dst", target).await;

        let settings = Settings::new(dir.path().join("backups"));
        (dir, MigrationExecutor::new(registry, &settings))
    }

    fn tables(names: &[&str]) -> Vec<String> {
        names.iter().map(|t| (*t).to_string()).collect()
    }

    #[tokio::test]
    async fn test_apply_adds_column_and_marks_applied() {
        let (_dir, executor) = setup().await;

        let outcome = executor
            .apply("src", "dst", &tables(&["users"]), ApplyOptions::default())
            .await
            .unwrap();

        assert_eq!(outcome.steps[0].message, "applied");
        assert!(outcome.backup_path.is_none());

        let target = executor.registry().get("dst").await.unwrap();
        let columns = target.get_columns("users").await.unwrap();
        assert_eq!(columns.len(), 3);
        assert_eq!(columns[2].name, "email");
    }

    #[tokio::test]
    async fn test_apply_twice_is_noop_second_time() {
        let (_dir, executor) = setup().await;
        let names = tables(&["users"]);

        executor
            .apply("src", "dst", &names, ApplyOptions::default())
            .await
            .unwrap();
        let second = executor
            .apply(
                "src",
                "dst",
                &names,
                ApplyOptions {
                    create_backup: true,
                    ..ApplyOptions::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(second.steps[0].kind, StepKind::Noop);
        assert_eq!(second.steps[0].statement.as_deref(), Some(NO_OP_STATEMENT));
        assert_eq!(second.steps[0].message, "schema compatible");
        assert!(second.backup_path.is_none());
        assert!(executor.backups().list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_apply_full_sync_drops_stale_table() {
        let (_dir, executor) = setup().await;

        let outcome = executor
            .apply(
                "src",
                "dst",
                &tables(&["users"]),
                ApplyOptions {
                    fully_sync: true,
                    create_backup: true,
                },
            )
            .await
            .unwrap();

        assert_eq!(outcome.steps.len(), 2);
        assert_eq!(outcome.steps[1].kind, StepKind::Drop);
        assert_eq!(outcome.steps[1].message, "applied");
        let backup = outcome.backup_path.unwrap();
        assert!(backup.exists());

        let target = executor.registry().get("dst").await.unwrap();
        let names: Vec<String> = target
            .list_tables()
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(names, vec!["users"]);
    }

    #[tokio::test]
    async fn test_failed_step_does_not_block_other_steps() {
        let (_dir, executor) = setup().await;
        let target = executor.registry().get("dst").await.unwrap();
        target
            .query("CREATE VIEW orders AS SELECT id FROM users")
            .await
            .unwrap();
        let source = executor.registry().get("src").await.unwrap();
        source
            .query("CREATE TABLE orders (id INTEGER)")
            .await
            .unwrap();

        let outcome = executor
            .apply("src", "dst", &tables(&["orders", "users"]), ApplyOptions::default())
            .await
            .unwrap();

        assert_eq!(outcome.steps[0].kind, StepKind::Failed);
        assert!(!outcome.steps[0].success);
        assert_ne!(outcome.steps[0].message, "applied");
        assert_eq!(outcome.steps[1].message, "applied");
        assert_eq!(target.get_columns("users").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_batch_failure_rolls_back_everything() {
        let (_dir, executor) = setup().await;
        let target = executor.registry().get("dst").await.unwrap();

        let err = target
            .run_migration(
                &[
                    "ALTER TABLE \"users\" ADD COLUMN \"email\" TEXT;".to_string(),
                    "ALTER TABLE \"missing\" ADD COLUMN \"x\" TEXT;".to_string(),
                ],
                &ApplyTimeouts::default(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, MigrateError::Transaction { .. }));
        assert_eq!(err.kind(), "transaction");
        assert_eq!(target.get_columns("users").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_backup_failure_aborts_before_any_statement() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ConnectionRegistry::new();
        let source = Driver::Sqlite(SqliteDriver::in_memory().await.unwrap());
        source
            .query("CREATE TABLE users (id INTEGER, email TEXT)")
            .await
            .unwrap();
        registry.register("src", source).await;
        let target = Driver::Sqlite(SqliteDriver::in_memory().await.unwrap());
        target
            .query("CREATE TABLE users (id INTEGER)")
            .await
            .unwrap();
        registry.register("mem", target).await;
        let executor = MigrationExecutor::new(registry, &Settings::new(dir.path()));

        let err = executor
            .apply(
                "src",
                "mem",
                &tables(&["users"]),
                ApplyOptions {
                    create_backup: true,
                    ..ApplyOptions::default()
                },
            )
            .await
            .unwrap_err();

        assert!(err.is_backup_failure());
        let target = executor.registry().get("mem").await.unwrap();
        assert_eq!(target.get_columns("users").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_restore_replaces_file_and_reconnects() {
        let (dir, executor) = setup().await;
        let target = executor.registry().get("dst").await.unwrap();
        let record = executor.backups().backup("dst", &target).await.unwrap();

        target
            .query("CREATE TABLE after_backup (id INTEGER)")
            .await
            .unwrap();
        drop(target);

        executor
            .restore("dst", Path::new(&record.file_name))
            .await
            .unwrap();

        let fresh = executor.registry().get("dst").await.unwrap();
        let names: Vec<String> = fresh
            .list_tables()
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(names, vec!["stale", "users"]);
        assert!(dir.path().join("target.db").exists());
    }

    #[tokio::test]
    async fn test_restore_rejects_non_sqlite_and_traversal() {
        let (dir, executor) = setup().await;
        let target = executor.registry().get("dst").await.unwrap();
        let record = executor.backups().backup("dst", &target).await.unwrap();

        let err = executor
            .restore("src", Path::new(&record.file_name))
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::NotFound(_)));

        let err = executor
            .restore("dst", &dir.path().join("target.db"))
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::PathTraversal(_)));

        let err = executor
            .restore("nobody", Path::new(&record.file_name))
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_restore_rejects_unrecognised_backup_names() {
        let (dir, executor) = setup().await;
        let backups = dir.path().join("backups");
        std::fs::create_dir_all(&backups).unwrap();
        std::fs::write(backups.join("notes.txt"), "not a database").unwrap();
        let before = std::fs::read(dir.path().join("target.db")).unwrap();

        let err = executor
            .restore("dst", Path::new("notes.txt"))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "validation");
        assert_eq!(std::fs::read(dir.path().join("target.db")).unwrap(), before);
        let target = executor.registry().get("dst").await.unwrap();
        assert_eq!(target.get_columns("users").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_restore_of_corrupt_backup_keeps_target() {
        let (dir, executor) = setup().await;
        let backups = dir.path().join("backups");
        std::fs::create_dir_all(&backups).unwrap();
        std::fs::write(
            backups.join("sqlite-dst-20240101-000000.db"),
            "this is not a sqlite database, only some text padded out a little",
        )
        .unwrap();
        std::fs::write(backups.join("sqlite-dst-20240102-000000.db"), "").unwrap();

        let err = executor
            .restore("dst", Path::new("sqlite-dst-20240101-000000.db"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation");

        let err = executor
            .restore("dst", Path::new("sqlite-dst-20240102-000000.db"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation");

        assert!(!dir.path().join("target.db.restore.tmp").exists());
        assert!(!dir.path().join("target.db.restore.bak").exists());
        let target = executor.registry().get("dst").await.unwrap();
        let names: Vec<String> = target
            .list_tables()
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(names, vec!["stale", "users"]);
    }
}
