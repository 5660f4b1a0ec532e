//! SQLite driver.
//!
//! The database lives in a single file (or in memory for scratch use).
//! Mutations are followed by a WAL checkpoint so the file on disk is
//! complete before anyone copies it.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde_json::Value;
use sqlx::query::Query;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteRow,
};
use sqlx::{Column, Row, Sqlite, TypeInfo, ValueRef};
use tracing::{debug, warn};

use super::{classify, is_mutation, returns_rows};
use crate::error::{MigrateError, Result};
use crate::schema::{ColumnSchema, QueryOutput, TableDescriptor, TableKind};

/// A SQLite connection pool plus where its data lives.
#[derive(Debug, Clone)]
pub struct SqliteDriver {
    pool: SqlitePool,
    path: Option<PathBuf>,
}

impl SqliteDriver {
    /// Opens (creating if missing) the database file at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::connect(path.as_ref(), true).await
    }

    /// Opens the database file at `path`, failing if it does not exist.
    ///
    /// Used for configured connections, where a mistyped path must not
    /// silently produce an empty database.
    pub async fn open_existing(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Err(MigrateError::NotFound(format!(
                "database file {}",
                path.display()
            )));
        }
        Self::connect(path, false).await
    }

    async fn connect(path: &Path, create: bool) -> Result<Self> {
        let path = path.to_path_buf();
        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(create)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(classify)?;
        debug!(path = %path.display(), "Opened SQLite database");
        Ok(Self {
            pool,
            path: Some(path),
        })
    }

    /// Opens a private in-memory database. It has no file and cannot be backed up.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(classify)?;
        Ok(Self { pool, path: None })
    }

    /// Path of the database file, `None` for in-memory databases.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Returns the underlying pool.
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub(crate) fn is_connected(&self) -> bool {
        !self.pool.is_closed()
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(MigrateError::Connection("SQLite database is closed".into()))
        }
    }

    pub(crate) async fn list_tables(&self) -> Result<Vec<TableDescriptor>> {
        self.ensure_connected()?;
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT name, type FROM sqlite_master \
             WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%' \
             ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;

        Ok(rows
            .into_iter()
            .map(|(name, kind)| TableDescriptor {
                name,
                kind: if kind == "view" {
                    TableKind::View
                } else {
                    TableKind::Table
                },
            })
            .collect())
    }

    pub(crate) async fn get_columns(&self, table: &str) -> Result<Vec<ColumnSchema>> {
        self.ensure_connected()?;
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT name, type FROM pragma_table_info(?) ORDER BY cid")
                .bind(table)
                .fetch_all(&self.pool)
                .await
                .map_err(classify)?;
        Ok(rows
            .into_iter()
            .map(|(name, declared_type)| ColumnSchema::new(name, declared_type))
            .collect())
    }

    pub(crate) async fn query(&self, sql: &str, params: &[Value]) -> Result<QueryOutput> {
        self.ensure_connected()?;
        debug!(sql = %sql, "Executing SQL");

        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_json(query, param);
        }

        let output = if returns_rows(sql) {
            let rows = query.fetch_all(&self.pool).await?;
            rows_to_output(&rows)
        } else {
            let result = query.execute(&self.pool).await?;
            QueryOutput {
                row_count: result.rows_affected(),
                ..QueryOutput::default()
            }
        };

        if is_mutation(sql) {
            self.flush_after_commit().await;
        }
        Ok(output)
    }

    pub(crate) async fn run_transaction(&self, statements: &[String]) -> Result<()> {
        self.ensure_connected()?;
        if statements.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await.map_err(classify)?;
        for statement in statements {
            debug!(sql = %statement, "Executing SQL in transaction");
            if let Err(source) = sqlx::raw_sql(statement).execute(&mut *tx).await {
                if let Err(rollback) = tx.rollback().await {
                    warn!(error = %rollback, "Rollback failed");
                }
                return Err(MigrateError::Transaction {
                    statement: statement.clone(),
                    source,
                });
            }
        }
        tx.commit()
            .await
            .map_err(|source| MigrateError::Transaction {
                statement: "COMMIT".into(),
                source,
            })?;

        self.flush_after_commit().await;
        Ok(())
    }

    /// Checkpoints the write-ahead log into the main database file.
    ///
    /// A checkpoint blocked by an open reader is logged and left for a
    /// later flush; the committed data is already durable in the log.
    pub(crate) async fn flush(&self) -> Result<()> {
        if self.path.is_none() {
            return Ok(());
        }
        self.ensure_connected()?;
        let (busy, log, checkpointed): (i64, i64, i64) =
            sqlx::query_as("PRAGMA wal_checkpoint(TRUNCATE)")
                .fetch_one(&self.pool)
                .await
                .map_err(classify)?;
        if busy != 0 {
            warn!(log, checkpointed, "WAL checkpoint incomplete, database is busy");
        }
        Ok(())
    }

    /// Flush after a successful commit. The commit stands either way, so a
    /// failure is only logged.
    async fn flush_after_commit(&self) {
        if let Err(e) = self.flush().await {
            warn!(error = %e, "Flush after commit failed");
        }
    }

    /// Writes a consistent copy of the database, including any changes
    /// still in the write-ahead log, to `dest`. `dest` must not exist.
    pub async fn snapshot_to(&self, dest: &Path) -> Result<()> {
        self.ensure_connected()?;
        let dest_str = dest.to_str().ok_or_else(|| {
            MigrateError::Validation(format!("{} is not valid UTF-8", dest.display()))
        })?;
        debug!(dest = %dest.display(), "Writing database snapshot");
        sqlx::query("VACUUM INTO ?")
            .bind(dest_str)
            .execute(&self.pool)
            .await
            .map_err(classify)?;
        Ok(())
    }

    /// Checks that `path` holds an intact SQLite database.
    pub async fn verify_file(path: &Path) -> Result<()> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(false);
        let not_a_database = |detail: String| {
            MigrateError::Validation(format!(
                "{} is not a usable SQLite database: {detail}",
                path.display()
            ))
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| not_a_database(e.to_string()))?;
        let verdict = sqlx::query_scalar::<_, String>("PRAGMA quick_check")
            .fetch_one(&pool)
            .await;
        pool.close().await;

        match verdict {
            Ok(result) if result == "ok" => Ok(()),
            Ok(result) => Err(not_a_database(result)),
            Err(e) => Err(not_a_database(e.to_string())),
        }
    }

    pub(crate) async fn close(&self) {
        self.pool.close().await;
    }
}

fn bind_json<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &Value,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => query.bind(i),
            None => query.bind(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => query.bind(s.clone()),
        other => query.bind(other.to_string()),
    }
}

fn rows_to_output(rows: &[SqliteRow]) -> QueryOutput {
    let columns = rows
        .first()
        .map(|row| row.columns().iter().map(|c| c.name().to_string()).collect())
        .unwrap_or_default();

    let rows: Vec<Vec<Value>> = rows
        .iter()
        .map(|row| (0..row.len()).map(|i| decode_cell(row, i)).collect())
        .collect();

    QueryOutput {
        columns,
        row_count: rows.len() as u64,
        rows,
    }
}

/// Decodes by the value's storage class.
fn decode_cell(row: &SqliteRow, index: usize) -> Value {
    let storage = match row.try_get_raw(index) {
        Ok(raw) if raw.is_null() => return Value::Null,
        Ok(raw) => raw.type_info().name().to_string(),
        Err(_) => return Value::Null,
    };

    match storage.as_str() {
        "INTEGER" => row.try_get::<i64, _>(index).map_or(Value::Null, Value::from),
        "REAL" => row.try_get::<f64, _>(index).map_or(Value::Null, Value::from),
        "BLOB" => row
            .try_get::<Vec<u8>, _>(index)
            .map_or(Value::Null, Value::from),
        _ => row
            .try_get::<String, _>(index)
            .map_or(Value::Null, Value::from),
    }
}
