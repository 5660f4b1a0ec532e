//! Plan builder.
//!
//! Compares source and target structure table by table and produces one
//! [`MigrationStep`] per requested table, in request order. Whole-table
//! drops (full sync only) are appended after every other step. Building a
//! plan never writes to the target.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::dialect::{Dialect, types_match};
use crate::driver::Driver;
use crate::error::Result;
use crate::schema::{ColumnSchema, TableDescriptor};

/// Statement of a step that has nothing to do.
pub const NO_OP_STATEMENT: &str = "-- no changes";

/// Options for plan building.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanOptions {
    /// Also drop target tables that do not exist on the source.
    #[serde(default)]
    pub fully_sync: bool,
}

impl PlanOptions {
    /// Creates default options (no drops).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables full sync.
    #[must_use]
    pub fn with_full_sync(mut self) -> Self {
        self.fully_sync = true;
        self
    }
}

/// What a step does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// Create a table missing on the target.
    Create,
    /// Add columns missing on the target.
    AddColumns,
    /// Nothing to do.
    Noop,
    /// Drop a target table missing on the source.
    Drop,
    /// The table could not be planned.
    Failed,
}

/// One entry of a migration plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationStep {
    /// Table this step concerns.
    pub table: String,
    /// What the step does.
    pub kind: StepKind,
    /// `false` only for failed steps, which never carry a statement.
    pub success: bool,
    /// SQL to run, or [`NO_OP_STATEMENT`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statement: Option<String>,
    /// Human-readable summary.
    pub message: String,
    /// Non-fatal findings, in discovery order.
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl MigrationStep {
    fn new(table: &str, kind: StepKind, statement: Option<String>, message: &str) -> Self {
        Self {
            table: table.to_string(),
            kind,
            success: kind != StepKind::Failed,
            statement,
            message: message.to_string(),
            warnings: Vec::new(),
        }
    }

    /// A failed step; carries no statement.
    #[must_use]
    pub fn failed(table: &str, message: &str) -> Self {
        Self::new(table, StepKind::Failed, None, message)
    }

    fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        self.warnings = warnings;
        self
    }

    /// Whether applying this step would run SQL.
    #[must_use]
    pub fn is_actionable(&self) -> bool {
        self.success
            && self
                .statement
                .as_deref()
                .is_some_and(|s| s.trim() != NO_OP_STATEMENT)
    }
}

/// An ordered list of steps.
pub type MigrationPlan = Vec<MigrationStep>;

/// Builds migration plans between two drivers.
#[derive(Debug)]
pub struct PlanBuilder<'a> {
    source: &'a Driver,
    target: &'a Driver,
    options: PlanOptions,
}

impl<'a> PlanBuilder<'a> {
    /// Creates a builder comparing `source` against `target`.
    #[must_use]
    pub fn new(source: &'a Driver, target: &'a Driver) -> Self {
        Self {
            source,
            target,
            options: PlanOptions::default(),
        }
    }

    /// Sets plan options.
    #[must_use]
    pub fn options(mut self, options: PlanOptions) -> Self {
        self.options = options;
        self
    }

    /// Builds the plan for `tables`.
    ///
    /// A name listed more than once yields a single step. Per-table problems become failed steps; only driver failures
    /// (closed or unreachable connections) are returned as errors.
    pub async fn build(&self, tables: &[String]) -> Result<MigrationPlan> {
        let dialect = self.target.dialect();
        let source_tables = self.source.list_tables().await?;
        let target_tables = self.target.list_tables().await?;

        let source_by_name: HashMap<&str, &TableDescriptor> =
            source_tables.iter().map(|t| (t.name.as_str(), t)).collect();
        let target_by_name: HashMap<&str, &TableDescriptor> =
            target_tables.iter().map(|t| (t.name.as_str(), t)).collect();

        let mut plan = Vec::with_capacity(tables.len());
        let mut seen = HashSet::with_capacity(tables.len());
        // Repeated names plan once, at their first position.
        for table in tables.iter().filter(|t| seen.insert(t.as_str())) {
            let step = match source_by_name.get(table.as_str()) {
                Some(t) if t.is_table() => {
                    self.plan_table(table, dialect, target_by_name.get(table.as_str()).copied())
                        .await?
                }
                _ => MigrationStep::failed(table, "source table not found"),
            };
            debug!(table = %table, kind = ?step.kind, "Planned table");
            plan.push(step);
        }

        if self.options.fully_sync {
            plan.extend(drop_steps(&source_tables, &target_tables, dialect));
        }

        info!(
            steps = plan.len(),
            actionable = plan.iter().filter(|s| s.is_actionable()).count(),
            "Built migration plan"
        );
        Ok(plan)
    }

    async fn plan_table(
        &self,
        table: &str,
        dialect: Dialect,
        target: Option<&TableDescriptor>,
    ) -> Result<MigrationStep> {
        let source_columns = self.source.get_columns(table).await?;

        let Some(target) = target else {
            return Ok(MigrationStep::new(
                table,
                StepKind::Create,
                Some(dialect.create_table_sql(table, &source_columns)),
                "will create table",
            ));
        };
        if !target.is_table() {
            return Ok(MigrationStep::failed(
                table,
                "target object is a view, not a table",
            ));
        }

        let target_columns = self.target.get_columns(table).await?;
        Ok(diff_columns(table, dialect, &source_columns, &target_columns))
    }
}

/// Compares the columns of a table present on both sides.
///
/// Only missing columns produce SQL. Type differences and target-only
/// columns are reported as warnings and left alone.
#[must_use]
pub fn diff_columns(
    table: &str,
    dialect: Dialect,
    source: &[ColumnSchema],
    target: &[ColumnSchema],
) -> MigrationStep {
    let source_by_name: HashMap<&str, &ColumnSchema> =
        source.iter().map(|c| (c.name.as_str(), c)).collect();
    let target_by_name: HashMap<&str, &ColumnSchema> =
        target.iter().map(|c| (c.name.as_str(), c)).collect();

    let mut statements = Vec::new();
    let mut warnings = Vec::new();

    for column in source {
        match target_by_name.get(column.name.as_str()) {
            None => statements.push(dialect.add_column_sql(table, column)),
            Some(existing) => {
                if !types_match(&column.declared_type, &existing.declared_type, dialect) {
                    warnings.push(format!(
                        "column \"{}\": type mismatch (source {}, target {}), no type changes will be applied",
                        column.name,
                        display_type(&column.declared_type),
                        display_type(&existing.declared_type),
                    ));
                }
            }
        }
    }

    for column in target {
        if !source_by_name.contains_key(column.name.as_str()) {
            warnings.push(format!(
                "column \"{}\" exists only on the target and will not be removed",
                column.name
            ));
        }
    }

    let step = if statements.is_empty() {
        MigrationStep::new(
            table,
            StepKind::Noop,
            Some(NO_OP_STATEMENT.to_string()),
            "schema compatible",
        )
    } else {
        MigrationStep::new(
            table,
            StepKind::AddColumns,
            Some(statements.join("\n")),
            "will add missing columns",
        )
    };
    step.with_warnings(warnings)
}

/// Drop steps for target tables with no source counterpart.
fn drop_steps(
    source: &[TableDescriptor],
    target: &[TableDescriptor],
    dialect: Dialect,
) -> Vec<MigrationStep> {
    let source_names: HashSet<&str> = source.iter().map(|t| t.name.as_str()).collect();
    target
        .iter()
        .filter(|t| t.is_table() && !source_names.contains(t.name.as_str()))
        .map(|t| {
            MigrationStep::new(
                &t.name,
                StepKind::Drop,
                Some(dialect.drop_table_sql(&t.name)),
                "will drop table (not present in source)",
            )
        })
        .collect()
}

fn display_type(declared: &str) -> &str {
    if declared.trim().is_empty() {
        "<untyped>"
    } else {
        declared
    }
}
