//! PostgreSQL driver.

use serde_json::Value;
use sqlx::postgres::{PgArguments, PgConnectOptions, PgConnection, PgPool, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{Column, Connection, Postgres, Row, TypeInfo, ValueRef};
use tracing::{debug, info, warn};

use super::{classify, returns_rows};
use crate::config::{ApplyTimeouts, PostgresConfig};
use crate::dialect::Dialect;
use crate::error::{MigrateError, Result};
use crate::schema::{ColumnSchema, QueryOutput, TableDescriptor, TableKind};

/// Session advisory lock key shared by every schemasync apply on a database.
pub const ADVISORY_LOCK_KEY: i64 = 0x5343_4845_4d41_5359;

/// A Postgres connection pool plus the parameters it was opened with.
#[derive(Debug, Clone)]
pub struct PostgresDriver {
    pool: PgPool,
    config: PostgresConfig,
}

impl PostgresDriver {
    /// Connects eagerly, failing if the server is unreachable.
    pub async fn connect(config: PostgresConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options(&config))
            .await
            .map_err(classify)?;
        info!(host = %config.host, database = %config.database, "Connected to Postgres");
        Ok(Self { pool, config })
    }

    /// Creates a pool that connects on first use.
    #[must_use]
    pub fn connect_lazy(config: PostgresConfig) -> Self {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_lazy_with(connect_options(&config));
        Self { pool, config }
    }

    /// Connection parameters, used by the dump tool.
    #[must_use]
    pub fn config(&self) -> &PostgresConfig {
        &self.config
    }

    pub(crate) fn is_connected(&self) -> bool {
        !self.pool.is_closed()
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(MigrateError::Connection(format!(
                "Postgres pool for {} is closed",
                self.config.database
            )))
        }
    }

    pub(crate) async fn list_tables(&self) -> Result<Vec<TableDescriptor>> {
        self.ensure_connected()?;
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT table_name::text, table_type::text FROM information_schema.tables \
             WHERE table_schema = $1 ORDER BY table_name",
        )
        .bind(&self.config.schema)
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;

        Ok(rows
            .into_iter()
            .map(|(name, kind)| TableDescriptor {
                name,
                kind: if kind == "VIEW" {
                    TableKind::View
                } else {
                    TableKind::Table
                },
            })
            .collect())
    }

    pub(crate) async fn get_columns(&self, table: &str) -> Result<Vec<ColumnSchema>> {
        self.ensure_connected()?;
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT a.attname::text, format_type(a.atttypid, a.atttypmod) \
             FROM pg_catalog.pg_attribute a \
             JOIN pg_catalog.pg_class c ON c.oid = a.attrelid \
             JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace \
             WHERE n.nspname = $1 AND c.relname = $2 AND a.attnum > 0 AND NOT a.attisdropped \
             ORDER BY a.attnum",
        )
        .bind(&self.config.schema)
        .bind(table)
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;

        Ok(rows
            .into_iter()
            .map(|(name, declared_type)| ColumnSchema::new(name, declared_type))
            .collect())
    }

    pub(crate) async fn query(&self, sql: &str, params: &[Value]) -> Result<QueryOutput> {
        self.ensure_connected()?;
        debug!(sql = %sql, "Executing SQL");

        let mut query = sqlx::query(sql);
        for param in params {
            query = bind_json(query, param);
        }

        if returns_rows(sql) {
            let rows = query.fetch_all(&self.pool).await?;
            Ok(rows_to_output(&rows))
        } else {
            let result = query.execute(&self.pool).await?;
            Ok(QueryOutput {
                row_count: result.rows_affected(),
                ..QueryOutput::default()
            })
        }
    }

    pub(crate) async fn run_transaction(&self, statements: &[String]) -> Result<()> {
        self.ensure_connected()?;
        if statements.is_empty() {
            return Ok(());
        }
        let mut conn = self.pool.acquire().await.map_err(classify)?;
        let settings = transaction_settings(&self.config.schema, None);
        execute_in_transaction(&mut conn, &settings, statements).await
    }

    /// Runs a migration batch under the advisory lock with short timeouts.
    ///
    /// Failing to take the advisory lock is logged and ignored; the
    /// transaction's own isolation still applies.
    pub(crate) async fn run_guarded_transaction(
        &self,
        statements: &[String],
        timeouts: &ApplyTimeouts,
    ) -> Result<()> {
        self.ensure_connected()?;
        if statements.is_empty() {
            return Ok(());
        }
        let mut conn = self.pool.acquire().await.map_err(classify)?;

        let locked = match sqlx::query_scalar::<_, bool>("SELECT pg_try_advisory_lock($1)")
            .bind(ADVISORY_LOCK_KEY)
            .fetch_one(&mut *conn)
            .await
        {
            Ok(true) => true,
            Ok(false) => {
                warn!("Advisory lock is held by another session, continuing without it");
                false
            }
            Err(e) => {
                warn!(error = %e, "Could not take advisory lock, continuing without it");
                false
            }
        };

        let settings = transaction_settings(&self.config.schema, Some(timeouts));
        let result = execute_in_transaction(&mut conn, &settings, statements).await;

        if locked
            && let Err(e) = sqlx::query("SELECT pg_advisory_unlock($1)")
                .bind(ADVISORY_LOCK_KEY)
                .execute(&mut *conn)
                .await
        {
            warn!(error = %e, "Failed to release advisory lock");
        }

        result
    }

    pub(crate) async fn close(&self) {
        self.pool.close().await;
    }
}

fn connect_options(config: &PostgresConfig) -> PgConnectOptions {
    let mut options = PgConnectOptions::new()
        .host(&config.host)
        .port(config.port)
        .username(&config.user)
        .database(&config.database)
        .options([("search_path", search_path(&config.schema))]);
    if let Some(password) = &config.password {
        options = options.password(password);
    }
    options
}

fn search_path(schema: &str) -> String {
    Dialect::Postgres.quote_identifier(schema)
}

/// `SET LOCAL` statements run at the start of every migration transaction.
///
/// The search path pins unqualified DDL to the configured schema, which is
/// the schema introspection reads from.
fn transaction_settings(schema: &str, timeouts: Option<&ApplyTimeouts>) -> Vec<String> {
    let mut settings = vec![format!("SET LOCAL search_path TO {}", search_path(schema))];
    if let Some(t) = timeouts {
        settings.push(format!(
            "SET LOCAL lock_timeout = '{}ms'",
            t.lock_timeout.as_millis()
        ));
        settings.push(format!(
            "SET LOCAL statement_timeout = '{}ms'",
            t.statement_timeout.as_millis()
        ));
    }
    settings
}

async fn execute_in_transaction(
    conn: &mut PgConnection,
    settings: &[String],
    statements: &[String],
) -> Result<()> {
    let mut tx = conn.begin().await.map_err(classify)?;

    for statement in settings.iter().chain(statements) {
        debug!(sql = %statement, "Executing SQL in transaction");
        if let Err(source) = sqlx::raw_sql(statement).execute(&mut *tx).await {
            if let Err(rollback) = tx.rollback().await {
                warn!(error = %rollback, "Rollback failed");
            }
            return Err(MigrateError::Transaction {
                statement: statement.clone(),
                source,
            });
        }
    }

    tx.commit()
        .await
        .map_err(|source| MigrateError::Transaction {
            statement: "COMMIT".into(),
            source,
        })
}

fn bind_json<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &Value,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => query.bind(i),
            None => query.bind(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => query.bind(s.clone()),
        other => query.bind(other.to_string()),
    }
}

fn rows_to_output(rows: &[PgRow]) -> QueryOutput {
    let columns = rows
        .first()
        .map(|row| row.columns().iter().map(|c| c.name().to_string()).collect())
        .unwrap_or_default();

    let rows: Vec<Vec<Value>> = rows
        .iter()
        .map(|row| (0..row.len()).map(|i| decode_cell(row, i)).collect())
        .collect();

    QueryOutput {
        columns,
        row_count: rows.len() as u64,
        rows,
    }
}

/// Decodes the common scalar types; anything else renders as `<type>`.
fn decode_cell(row: &PgRow, index: usize) -> Value {
    let type_name = match row.try_get_raw(index) {
        Ok(raw) if raw.is_null() => return Value::Null,
        Ok(raw) => raw.type_info().name().to_string(),
        Err(_) => return Value::Null,
    };

    let decoded = match type_name.as_str() {
        "BOOL" => row.try_get::<bool, _>(index).map(Value::from).ok(),
        "INT2" => row.try_get::<i16, _>(index).map(Value::from).ok(),
        "INT4" => row.try_get::<i32, _>(index).map(Value::from).ok(),
        "INT8" => row.try_get::<i64, _>(index).map(Value::from).ok(),
        "FLOAT4" => row.try_get::<f32, _>(index).map(Value::from).ok(),
        "FLOAT8" => row.try_get::<f64, _>(index).map(Value::from).ok(),
        "BYTEA" => row.try_get::<Vec<u8>, _>(index).map(Value::from).ok(),
        "TIMESTAMP" => row
            .try_get::<chrono::NaiveDateTime, _>(index)
            .map(|v| Value::from(v.to_string()))
            .ok(),
        "TIMESTAMPTZ" => row
            .try_get::<chrono::DateTime<chrono::Utc>, _>(index)
            .map(|v| Value::from(v.to_rfc3339()))
            .ok(),
        "DATE" => row
            .try_get::<chrono::NaiveDate, _>(index)
            .map(|v| Value::from(v.to_string()))
            .ok(),
        _ => row.try_get::<String, _>(index).map(Value::from).ok(),
    };

    decoded.unwrap_or_else(|| Value::from(format!("<{}>", type_name.to_lowercase())))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> PostgresConfig {
        PostgresConfig {
            host: "127.0.0.1".into(),
            port: 1,
            user: "nobody".into(),
            password: None,
            database: "nothing".into(),
            schema: "public".into(),
        }
    }

    #[tokio::test]
    async fn test_lazy_driver_is_connected_until_closed() {
        let driver = PostgresDriver::connect_lazy(config());
        assert!(driver.is_connected());
        assert_eq!(driver.config().database, "nothing");

        driver.close().await;
        assert!(matches!(
            driver.list_tables().await,
            Err(MigrateError::Connection(_))
        ));
    }

    #[tokio::test]
    async fn test_empty_transaction_needs_no_server() {
        let driver = PostgresDriver::connect_lazy(config());
        driver.run_transaction(&[]).await.unwrap();
        driver
            .run_guarded_transaction(&[], &ApplyTimeouts::default())
            .await
            .unwrap();
    }

    #[test]
    fn test_transactions_pin_the_configured_schema() {
        assert_eq!(
            transaction_settings("tenant_a", None),
            vec!["SET LOCAL search_path TO \"tenant_a\""]
        );

        let timeouts = ApplyTimeouts {
            lock_timeout: std::time::Duration::from_millis(250),
            statement_timeout: std::time::Duration::from_secs(2),
        };
        assert_eq!(
            transaction_settings("Odd\"Name", Some(&timeouts)),
            vec![
                "SET LOCAL search_path TO \"Odd\"\"Name\"",
                "SET LOCAL lock_timeout = '250ms'",
                "SET LOCAL statement_timeout = '2000ms'",
            ]
        );
    }
}
