#![allow(dead_code)]

use std::path::{Path, PathBuf};

use schemasync::prelude::*;
use tempfile::TempDir;

/// A scratch directory holding SQLite databases and a backups directory.
pub struct Workspace {
    pub dir: TempDir,
    pub registry: ConnectionRegistry,
}

impl Workspace {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("create temp dir"),
            registry: ConnectionRegistry::new(),
        }
    }

    pub fn db_path(&self, id: &str) -> PathBuf {
        self.dir.path().join(format!("{id}.db"))
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.dir.path().join("backups")
    }

    /// Opens a file database, runs `ddl` against it and registers it as `id`.
    pub async fn sqlite(&self, id: &str, ddl: &[&str]) {
        let driver = Driver::Sqlite(
            SqliteDriver::open(self.db_path(id))
                .await
                .unwrap_or_else(|e| panic!("open {id}: {e}")),
        );
        for sql in ddl {
            driver
                .query(sql)
                .await
                .unwrap_or_else(|e| panic!("{sql}: {e}"));
        }
        self.registry.register(id, driver).await;
    }

    pub fn service(&self) -> MigrationService {
        self.service_with(Settings::new(self.backups_dir()))
    }

    pub fn service_with(&self, settings: Settings) -> MigrationService {
        MigrationService::new(self.registry.clone(), &settings)
    }
}

pub fn names(tables: &[&str]) -> Vec<String> {
    tables.iter().map(|t| (*t).to_string()).collect()
}

pub async fn table_names(service: &MigrationService, id: &str) -> Vec<String> {
    service
        .list_tables(id)
        .await
        .unwrap_or_else(|e| panic!("list tables of {id}: {e}"))
        .into_iter()
        .map(|t| t.name)
        .collect()
}

pub async fn column_names(service: &MigrationService, id: &str, table: &str) -> Vec<String> {
    service
        .registry()
        .get(id)
        .await
        .expect("registered connection")
        .get_columns(table)
        .await
        .unwrap_or_else(|e| panic!("columns of {table}: {e}"))
        .into_iter()
        .map(|c| c.name)
        .collect()
}

pub fn apply_request(source: &str, target: &str, tables: &[&str], options: ApplyOptions) -> ApplyRequest {
    ApplyRequest {
        source_id: source.to_string(),
        target_id: target.to_string(),
        tables: names(tables),
        options,
    }
}

pub fn file_bytes(path: &Path) -> Vec<u8> {
    std::fs::read(path).unwrap_or_else(|e| panic!("read {}: {e}", path.display()))
}
