//! Cross-dialect schema synchronisation for SQLite and PostgreSQL.
//!
//! `schemasync` compares the structure of selected tables between a source
//! and a target connection and brings the target in line:
//! - Missing tables are created, missing columns are added
//! - Type differences and target-only columns are reported, never altered
//! - Optional full sync drops target tables absent from the source
//!
//! # Architecture
//!
//! - **Driver** - Uniform async access to SQLite and PostgreSQL via `sqlx`
//! - **Dialect** - Type mapping, identifier quoting and DDL generation
//! - **Plan** - Per-table diff producing an ordered list of steps
//! - **Lock** - FIFO serialisation of apply/restore per target
//! - **Backup** - File copies for SQLite, `pg_dump` for PostgreSQL
//! - **Executor** - Applies a fresh plan in one transaction, restores backups
//! - **Service** - Validated request/response operations with a JSON envelope
//!
//! # Example
//!
//! ```rust,ignore
//! use schemasync::prelude::*;
//!
//! let registry = ConnectionRegistry::new();
//! registry.register("prod", Driver::Sqlite(SqliteDriver::open("prod.db").await?)).await;
//! registry.register("dev", Driver::Sqlite(SqliteDriver::open("dev.db").await?)).await;
//!
//! let service = MigrationService::new(registry, &Settings::new("backups"));
//! let outcome = service
//!     .apply_migration(&ApplyRequest {
//!         source_id: "dev".into(),
//!         target_id: "prod".into(),
//!         tables: vec!["users".into()],
//!         options: ApplyOptions { fully_sync: false, create_backup: true },
//!     })
//!     .await?;
//! ```
//!
//! # CLI Usage
//!
//! ```bash
//! # Show what would change
//! schemasync plan dev prod users orders
//!
//! # Apply with a pre-flight backup
//! schemasync apply dev prod users orders --backup
//!
//! # Restore a SQLite target
//! schemasync restore prod sqlite-prod-20240309-140507.db
//! ```

pub mod backup;
pub mod config;
pub mod dialect;
pub mod driver;
pub mod error;
pub mod executor;
pub mod lock;
pub mod plan;
pub mod registry;
pub mod schema;
pub mod service;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::backup::{BackupKind, BackupRecord, BackupStore};
    pub use crate::config::{
        ApplyTimeouts, ConnectionConfig, ConnectionStore, JsonConnectionStore, PostgresConfig,
        Settings,
    };
    pub use crate::dialect::{Dialect, map_type, types_match};
    pub use crate::driver::{Driver, PostgresDriver, SqliteDriver};
    pub use crate::error::{MigrateError, Result};
    pub use crate::executor::{ApplyOptions, ApplyOutcome, MigrationExecutor};
    pub use crate::lock::MigrationLock;
    pub use crate::plan::{
        MigrationPlan, MigrationStep, NO_OP_STATEMENT, PlanBuilder, PlanOptions, StepKind,
    };
    pub use crate::registry::ConnectionRegistry;
    pub use crate::schema::{ColumnSchema, QueryOutput, TableDescriptor, TableKind};
    pub use crate::service::{
        ApplyRequest, BackupList, MigrationService, PlanRequest, PlanResponse, Response,
        RestoreRequest,
    };
}
