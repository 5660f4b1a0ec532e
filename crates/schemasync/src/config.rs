//! Configuration.
//!
//! [`Settings`] carries the host-owned knobs (backups directory, dump tool,
//! Postgres timeouts). Connections come from a [`ConnectionStore`]; the
//! bundled implementation reads a JSON file:
//!
//! ```json
//! {
//!   "connections": {
//!     "local": { "kind": "sqlite", "path": "app.db" },
//!     "prod": { "kind": "postgres", "host": "db", "user": "app", "database": "app" }
//!   }
//! }
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MigrateError, Result};

/// Timeouts applied to a Postgres migration transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyTimeouts {
    /// How long a statement may wait for a lock.
    pub lock_timeout: Duration,
    /// How long a single statement may run.
    pub statement_timeout: Duration,
}

impl Default for ApplyTimeouts {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(5),
            statement_timeout: Duration::from_secs(60),
        }
    }
}

/// Host-owned settings for the migration service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Directory holding backups; created on first backup.
    pub backups_dir: PathBuf,
    /// Executable name or path of the Postgres dump utility.
    pub dump_tool: PathBuf,
    /// Postgres migration timeouts.
    pub timeouts: ApplyTimeouts,
}

impl Settings {
    /// Creates settings with the given backups directory and defaults elsewhere.
    #[must_use]
    pub fn new(backups_dir: impl Into<PathBuf>) -> Self {
        Self {
            backups_dir: backups_dir.into(),
            dump_tool: PathBuf::from("pg_dump"),
            timeouts: ApplyTimeouts::default(),
        }
    }

    /// Overrides the dump utility.
    #[must_use]
    pub fn dump_tool(mut self, tool: impl Into<PathBuf>) -> Self {
        self.dump_tool = tool.into();
        self
    }

    /// Overrides the Postgres timeouts.
    #[must_use]
    pub fn timeouts(mut self, timeouts: ApplyTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }
}

fn default_port() -> u16 {
    5432
}

fn default_schema() -> String {
    "public".to_string()
}

/// Parameters of a Postgres connection.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostgresConfig {
    /// Server host.
    pub host: String,
    /// Server port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Role name.
    pub user: String,
    /// Password, if the server requires one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Database name.
    pub database: String,
    /// Schema whose tables are synchronised.
    #[serde(default = "default_schema")]
    pub schema: String,
}

impl fmt::Debug for PostgresConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("database", &self.database)
            .field("schema", &self.schema)
            .finish()
    }
}

/// How to reach one connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ConnectionConfig {
    /// A SQLite database file.
    Sqlite {
        /// Path of the database file.
        path: PathBuf,
    },
    /// A Postgres server.
    Postgres(PostgresConfig),
}

/// Persistence for connection definitions, owned by the host application.
pub trait ConnectionStore: Send + Sync {
    /// Loads every stored connection, keyed by identifier.
    fn load(&self) -> Result<BTreeMap<String, ConnectionConfig>>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ConnectionFile {
    #[serde(default)]
    connections: BTreeMap<String, ConnectionConfig>,
}

/// A [`ConnectionStore`] backed by a JSON file.
///
/// Relative SQLite paths resolve against the file's directory.
#[derive(Debug, Clone)]
pub struct JsonConnectionStore {
    path: PathBuf,
}

impl JsonConnectionStore {
    /// Creates a store reading `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the JSON file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConnectionStore for JsonConnectionStore {
    fn load(&self) -> Result<BTreeMap<String, ConnectionConfig>> {
        let content = std::fs::read_to_string(&self.path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                MigrateError::NotFound(format!(
                    "connections file {}",
                    self.path.display()
                ))
            } else {
                MigrateError::Io(e)
            }
        })?;
        let file: ConnectionFile = serde_json::from_str(&content)?;

        let base = self.path.parent().unwrap_or_else(|| Path::new(""));
        Ok(file
            .connections
            .into_iter()
            .map(|(id, config)| {
                let config = match config {
                    ConnectionConfig::Sqlite { path } if path.is_relative() => {
                        ConnectionConfig::Sqlite {
                            path: base.join(path),
                        }
                    }
                    other => other,
                };
                (id, config)
            })
            .collect())
    }
}
