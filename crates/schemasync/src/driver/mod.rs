//! Relational drivers.
//!
//! Every backing store exposes the same small contract: list tables,
//! introspect columns, run arbitrary SQL and run a batch of statements
//! all-or-nothing. The store kind travels with the handle as an enum variant,
//! so callers dispatch on [`Driver`] instead of inspecting concrete types.

mod postgres;
mod sqlite;

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

pub use postgres::{ADVISORY_LOCK_KEY, PostgresDriver};
pub use sqlite::SqliteDriver;

use crate::config::ApplyTimeouts;
use crate::dialect::Dialect;
use crate::error::{MigrateError, Result};
use crate::schema::{ColumnSchema, QueryOutput, TableDescriptor};

static MUTATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(INSERT|UPDATE|DELETE|CREATE|DROP|ALTER)\b")
        .expect("mutation pattern is valid")
});

static RETURNING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bRETURNING\b").expect("returning pattern is valid"));

/// Whether a statement changes stored state and must be followed by a flush.
#[must_use]
pub fn is_mutation(sql: &str) -> bool {
    MUTATION.is_match(sql)
}

/// Whether a statement should be run for its result set.
pub(crate) fn returns_rows(sql: &str) -> bool {
    !is_mutation(sql) || RETURNING.is_match(sql)
}

/// A live connection to one backing store.
#[derive(Debug)]
pub enum Driver {
    /// File-backed store.
    Sqlite(SqliteDriver),
    /// Client/server store.
    Postgres(PostgresDriver),
}

impl Driver {
    /// Returns the dialect spoken by this driver.
    #[must_use]
    pub fn dialect(&self) -> Dialect {
        match self {
            Self::Sqlite(_) => Dialect::Sqlite,
            Self::Postgres(_) => Dialect::Postgres,
        }
    }

    /// Returns whether the underlying pool is still open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        match self {
            Self::Sqlite(d) => d.is_connected(),
            Self::Postgres(d) => d.is_connected(),
        }
    }

    /// Lists tables and views.
    pub async fn list_tables(&self) -> Result<Vec<TableDescriptor>> {
        match self {
            Self::Sqlite(d) => d.list_tables().await,
            Self::Postgres(d) => d.list_tables().await,
        }
    }

    /// Returns the columns of `table` in ordinal order; empty if it does not exist.
    pub async fn get_columns(&self, table: &str) -> Result<Vec<ColumnSchema>> {
        match self {
            Self::Sqlite(d) => d.get_columns(table).await,
            Self::Postgres(d) => d.get_columns(table).await,
        }
    }

    /// Runs arbitrary SQL.
    pub async fn query(&self, sql: &str) -> Result<QueryOutput> {
        self.query_with_params(sql, &[]).await
    }

    /// Runs SQL with positional parameters bound from JSON scalars.
    pub async fn query_with_params(&self, sql: &str, params: &[Value]) -> Result<QueryOutput> {
        match self {
            Self::Sqlite(d) => d.query(sql, params).await,
            Self::Postgres(d) => d.query(sql, params).await,
        }
    }

    /// Runs all statements in one transaction; any failure rolls back everything.
    pub async fn run_transaction(&self, statements: &[String]) -> Result<()> {
        match self {
            Self::Sqlite(d) => d.run_transaction(statements).await,
            Self::Postgres(d) => d.run_transaction(statements).await,
        }
    }

    /// Runs a migration batch with the store's safety nets.
    ///
    /// Postgres adds an advisory lock and lock/statement timeouts around the
    /// transaction; SQLite runs a plain transaction.
    pub async fn run_migration(
        &self,
        statements: &[String],
        timeouts: &ApplyTimeouts,
    ) -> Result<()> {
        match self {
            Self::Sqlite(d) => d.run_transaction(statements).await,
            Self::Postgres(d) => d.run_guarded_transaction(statements, timeouts).await,
        }
    }

    /// Pushes in-memory state to durable storage.
    pub async fn flush(&self) -> Result<()> {
        match self {
            Self::Sqlite(d) => d.flush().await,
            Self::Postgres(_) => Ok(()),
        }
    }

    /// Closes the pool. Further calls fail with a connection error.
    pub async fn close(&self) {
        match self {
            Self::Sqlite(d) => d.close().await,
            Self::Postgres(d) => d.close().await,
        }
    }

    /// Returns the SQLite driver, if this is one.
    #[must_use]
    pub fn as_sqlite(&self) -> Option<&SqliteDriver> {
        match self {
            Self::Sqlite(d) => Some(d),
            Self::Postgres(_) => None,
        }
    }

    /// Returns the Postgres driver, if this is one.
    #[must_use]
    pub fn as_postgres(&self) -> Option<&PostgresDriver> {
        match self {
            Self::Postgres(d) => Some(d),
            Self::Sqlite(_) => None,
        }
    }
}

/// Maps pool/transport failures to [`MigrateError::Connection`].
pub(crate) fn classify(err: sqlx::Error) -> MigrateError {
    match err {
        sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
            MigrateError::Connection(err.to_string())
        }
        other => MigrateError::Database(other),
    }
}
