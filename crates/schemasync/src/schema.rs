//! Structural metadata read from a live connection.
//!
//! These types are produced fresh by every introspection call and are never
//! cached across plan or apply invocations.

use serde::{Deserialize, Serialize};

/// Kind of a listed relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableKind {
    /// A base table. Only tables take part in schema sync.
    Table,
    /// A view. Listed for information only.
    View,
}

/// A table or view as reported by `list_tables`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDescriptor {
    /// Relation name.
    pub name: String,
    /// Whether it is a table or a view.
    pub kind: TableKind,
}

impl TableDescriptor {
    /// Creates a base table descriptor.
    #[must_use]
    pub fn table(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: TableKind::Table,
        }
    }

    /// Creates a view descriptor.
    #[must_use]
    pub fn view(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: TableKind::View,
        }
    }

    /// Returns whether this relation is a base table.
    #[must_use]
    pub fn is_table(&self) -> bool {
        self.kind == TableKind::Table
    }
}

/// A column, in the store's natural ordinal order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnSchema {
    /// Column name.
    pub name: String,
    /// Type exactly as the store declares it (may be empty on SQLite).
    pub declared_type: String,
}

impl ColumnSchema {
    /// Creates a new column schema.
    #[must_use]
    pub fn new(name: impl Into<String>, declared_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            declared_type: declared_type.into(),
        }
    }
}

/// Result of an arbitrary `query` call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryOutput {
    /// Column names of the result set (empty for statements without rows).
    pub columns: Vec<String>,
    /// Rows, each cell decoded to a JSON scalar.
    pub rows: Vec<Vec<serde_json::Value>>,
    /// Rows returned, or rows affected for statements without a result set.
    pub row_count: u64,
}
