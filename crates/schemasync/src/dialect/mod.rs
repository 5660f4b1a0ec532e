//! SQL dialects.
//!
//! Each dialect knows its type vocabulary and how to render the three kinds
//! of DDL the planner emits: `CREATE TABLE`, `ADD COLUMN` and `DROP TABLE`.

mod typemap;

pub use typemap::{map_type, normalize_type, types_match};

use serde::{Deserialize, Serialize};

use crate::schema::ColumnSchema;

/// The dialect of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// File-backed SQLite.
    Sqlite,
    /// Client/server PostgreSQL.
    Postgres,
}

impl Dialect {
    /// Returns the dialect name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::Postgres => "postgres",
        }
    }

    /// The type unmatched or empty declared types fall back to.
    #[must_use]
    pub fn generic_text_type(&self) -> &'static str {
        "TEXT"
    }

    /// Quote an identifier, doubling any embedded quote characters.
    #[must_use]
    pub fn quote_identifier(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    /// Renders a column definition with its type translated into this dialect.
    #[must_use]
    pub fn column_definition(&self, column: &ColumnSchema) -> String {
        format!(
            "{} {}",
            self.quote_identifier(&column.name),
            map_type(&column.declared_type, *self)
        )
    }

    /// Generates `CREATE TABLE IF NOT EXISTS` for the given columns.
    #[must_use]
    pub fn create_table_sql(&self, table: &str, columns: &[ColumnSchema]) -> String {
        let col_defs: Vec<String> = columns.iter().map(|c| self.column_definition(c)).collect();
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({}\n);",
            self.quote_identifier(table),
            col_defs.join(",\n    ")
        )
    }

    /// Generates `ALTER TABLE ... ADD COLUMN`.
    #[must_use]
    pub fn add_column_sql(&self, table: &str, column: &ColumnSchema) -> String {
        format!(
            "ALTER TABLE {} ADD COLUMN {};",
            self.quote_identifier(table),
            self.column_definition(column)
        )
    }

    /// Generates `DROP TABLE IF EXISTS`.
    #[must_use]
    pub fn drop_table_sql(&self, table: &str) -> String {
        format!("DROP TABLE IF EXISTS {};", self.quote_identifier(table))
    }
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
