//! Request/response surface of the migration engine.
//!
//! Every operation validates its request before touching a lock or any
//! I/O, and every result can be wrapped in a [`Response`] envelope.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::backup::BackupRecord;
use crate::config::{ConnectionStore, Settings};
use crate::error::{MigrateError, Result};
use crate::executor::{ApplyOptions, ApplyOutcome, MigrationExecutor};
use crate::plan::{MigrationStep, PlanOptions};
use crate::registry::ConnectionRegistry;
use crate::schema::TableDescriptor;

/// Input of [`MigrationService::plan_migration`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanRequest {
    pub source_id: String,
    pub target_id: String,
    pub tables: Vec<String>,
    #[serde(default)]
    pub options: PlanOptions,
}

/// Input of [`MigrationService::apply_migration`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyRequest {
    pub source_id: String,
    pub target_id: String,
    pub tables: Vec<String>,
    #[serde(default)]
    pub options: ApplyOptions,
}

/// Input of [`MigrationService::restore_backup`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreRequest {
    pub target_id: String,
    pub backup_path: PathBuf,
}

/// Output of [`MigrationService::plan_migration`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanResponse {
    pub steps: Vec<MigrationStep>,
}

/// Output of [`MigrationService::list_backups`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupList {
    pub entries: Vec<BackupRecord>,
}

/// Uniform envelope: a success flag plus either data or a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response<T> {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
}

impl<T> From<Result<T>> for Response<T> {
    fn from(result: Result<T>) -> Self {
        match result {
            Ok(data) => Self {
                success: true,
                data: Some(data),
                message: None,
                error_kind: None,
            },
            Err(e) => Self {
                success: false,
                data: None,
                message: Some(e.to_string()),
                error_kind: Some(e.kind().to_string()),
            },
        }
    }
}

/// Entry point used by hosts and the CLI.
#[derive(Debug, Clone)]
pub struct MigrationService {
    executor: MigrationExecutor,
}

impl MigrationService {
    /// Creates a service over an already populated registry.
    #[must_use]
    pub fn new(registry: ConnectionRegistry, settings: &Settings) -> Self {
        Self {
            executor: MigrationExecutor::new(registry, settings),
        }
    }

    /// Opens every connection in `store` and creates a service over them.
    pub async fn from_store(store: &dyn ConnectionStore, settings: &Settings) -> Result<Self> {
        let registry = ConnectionRegistry::from_store(store).await?;
        Ok(Self::new(registry, settings))
    }

    /// The underlying executor.
    #[must_use]
    pub fn executor(&self) -> &MigrationExecutor {
        &self.executor
    }

    /// The connection registry.
    #[must_use]
    pub fn registry(&self) -> &ConnectionRegistry {
        self.executor.registry()
    }

    /// Builds a plan. Per-table problems come back as failed steps.
    pub async fn plan_migration(&self, request: &PlanRequest) -> Result<PlanResponse> {
        validate_pair(&request.source_id, &request.target_id)?;
        validate_tables(&request.tables)?;
        debug!(
            source_id = %request.source_id,
            target_id = %request.target_id,
            tables = request.tables.len(),
            "Planning migration"
        );
        let steps = self
            .executor
            .plan(
                &request.source_id,
                &request.target_id,
                &request.tables,
                request.options,
            )
            .await?;
        Ok(PlanResponse { steps })
    }

    /// Applies a freshly computed plan.
    pub async fn apply_migration(&self, request: &ApplyRequest) -> Result<ApplyOutcome> {
        validate_pair(&request.source_id, &request.target_id)?;
        validate_tables(&request.tables)?;
        let outcome = self
            .executor
            .apply(
                &request.source_id,
                &request.target_id,
                &request.tables,
                request.options,
            )
            .await;
        if let Err(e) = &outcome {
            warn!(target_id = %request.target_id, kind = e.kind(), error = %e, "Apply failed");
        }
        outcome
    }

    /// Restores a SQLite target from a file backup.
    pub async fn restore_backup(&self, request: &RestoreRequest) -> Result<()> {
        require("targetId", &request.target_id)?;
        if request.backup_path.as_os_str().is_empty() {
            return Err(MigrateError::Validation("backupPath is required".to_string()));
        }
        self.executor
            .restore(&request.target_id, &request.backup_path)
            .await
    }

    /// Lists backups, newest first.
    pub async fn list_backups(&self) -> Result<BackupList> {
        let entries = self.executor.backups().list().await?;
        Ok(BackupList { entries })
    }

    /// Lists the tables and views of one connection.
    pub async fn list_tables(&self, connection_id: &str) -> Result<Vec<TableDescriptor>> {
        require("connectionId", connection_id)?;
        self.registry().get(connection_id).await?.list_tables().await
    }
}

fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(MigrateError::Validation(format!("{field} is required")));
    }
    Ok(())
}

fn validate_pair(source_id: &str, target_id: &str) -> Result<()> {
    require("sourceId", source_id)?;
    require("targetId", target_id)
}

fn validate_tables(tables: &[String]) -> Result<()> {
    if tables.is_empty() {
        return Err(MigrateError::Validation(
            "at least one table is required".to_string(),
        ));
    }
    if tables.iter().any(|t| t.trim().is_empty()) {
        return Err(MigrateError::Validation(
            "table names must not be empty".to_string(),
        ));
    }
    Ok(())
}
