//! Error types for schema synchronisation.

use std::path::PathBuf;

/// Errors that can occur while planning, applying or restoring.
#[derive(Debug, thiserror::Error)]
pub enum MigrateError {
    /// The request was structurally invalid (empty ids, empty table list).
    #[error("Invalid request: {0}")]
    Validation(String),

    /// A connection, table or backup could not be found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The driver is not connected.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Taking a pre-flight backup failed.
    #[error("Backup failed: {0}")]
    Backup(String),

    /// A statement failed inside a migration transaction; everything was rolled back.
    #[error("Transaction rolled back, statement failed: {statement}: {source}")]
    Transaction {
        /// The statement that failed.
        statement: String,
        /// The database error raised by that statement.
        #[source]
        source: sqlx::Error,
    },

    /// The external dump utility is missing or exited with an error.
    #[error("Dump tool error: {0}")]
    Tooling(String),

    /// Backup path points outside the backups directory.
    #[error("Backup path escapes the backups directory: {0}")]
    PathTraversal(PathBuf),

    /// Database error outside of a migration transaction.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl MigrateError {
    /// Returns a stable lowercase tag for this error, used in response envelopes.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) | Self::PathTraversal(_) => "validation",
            Self::NotFound(_) => "not_found",
            Self::Connection(_) => "connection",
            Self::Backup(_) => "backup",
            Self::Transaction { .. } => "transaction",
            Self::Tooling(_) => "tooling",
            Self::Database(_) => "database",
            Self::Io(_) => "io",
            Self::Serialization(_) => "serialization",
        }
    }

    /// Whether this error came out of the pre-flight backup stage.
    #[must_use]
    pub fn is_backup_failure(&self) -> bool {
        matches!(self, Self::Backup(_) | Self::Tooling(_))
    }
}

/// Result type for schema synchronisation operations.
pub type Result<T> = std::result::Result<T, MigrateError>;
