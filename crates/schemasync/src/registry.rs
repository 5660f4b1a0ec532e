//! Registry of live drivers keyed by connection identifier.
//!
//! Planning and applying only borrow handles from here. Restore is the one
//! path that swaps an entry for a freshly opened driver.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;

use crate::config::{ConnectionConfig, ConnectionStore};
use crate::driver::{Driver, PostgresDriver, SqliteDriver};
use crate::error::{MigrateError, Result};

/// Shared map of connection id to driver.
#[derive(Debug, Default, Clone)]
pub struct ConnectionRegistry {
    drivers: Arc<RwLock<HashMap<String, Arc<Driver>>>>,
}

impl ConnectionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens every connection in `store` and registers it.
    ///
    /// Postgres pools connect lazily so an unreachable server only fails
    /// the operations that touch it.
    pub async fn from_store(store: &dyn ConnectionStore) -> Result<Self> {
        let registry = Self::new();
        for (id, config) in store.load()? {
            let driver = open(config).await?;
            registry.register(id, driver).await;
        }
        Ok(registry)
    }

    /// Registers (or replaces) a driver, returning the previous one.
    pub async fn register(&self, id: impl Into<String>, driver: Driver) -> Option<Arc<Driver>> {
        let id = id.into();
        info!(connection = %id, dialect = %driver.dialect(), "Registered connection");
        self.drivers.write().await.insert(id, Arc::new(driver))
    }

    /// Removes a driver from the registry without closing it.
    pub async fn remove(&self, id: &str) -> Option<Arc<Driver>> {
        self.drivers.write().await.remove(id)
    }

    /// Looks up a driver.
    pub async fn get(&self, id: &str) -> Result<Arc<Driver>> {
        self.drivers
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| MigrateError::NotFound(format!("connection '{id}'")))
    }

    /// Registered identifiers, sorted.
    pub async fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.drivers.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// Opens a driver for a stored connection definition.
///
/// SQLite files must already exist; a mistyped path is an error rather
/// than a new empty database.
pub async fn open(config: ConnectionConfig) -> Result<Driver> {
    match config {
        ConnectionConfig::Sqlite { path } => {
            Ok(Driver::Sqlite(SqliteDriver::open_existing(path).await?))
        }
        ConnectionConfig::Postgres(pg) => Ok(Driver::Postgres(PostgresDriver::connect_lazy(pg))),
    }
}
