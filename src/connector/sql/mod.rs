//! SQL connectors over pooled `sqlx` engines.
//!
//! Postgres, MySQL and SQLite share one implementation: build a DB URL from
//! the normalized config, borrow a pooled handle from the engine cache, run
//! the query and wrap all rows into a single envelope item. SQL Server rides
//! its own driver in [`mssql`].

use async_trait::async_trait;
use serde_json::{Number, Value};
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Column, Row as _};
use std::time::Duration;
use tracing::{debug, info};

use crate::cache::{normalized_key, SQL_ENGINES};
use crate::config::{get_bool, get_u64, require_keys, ConfigMap};
use crate::connector::{guard_fetch, Connector};
use crate::envelope::{IngestedItem, IngestionResult, Row};
use crate::errors::{OmnitapError, Result};
use crate::log::redact_url;
use crate::warehouse::dialect::{build_url, Dialect};
use crate::warehouse::engine::install_drivers;

pub mod mssql;

/// Config fields that participate in connection identity (cache keying).
/// Volatile fields like timeouts are deliberately excluded.
const IDENTITY_FIELDS: &[&str] = &["host", "port", "database", "database_path", "user", "password"];

pub fn postgres_factory(config: ConfigMap) -> Result<Box<dyn Connector>> {
    Ok(Box::new(SqlConnector::from_config(Dialect::Postgres, config)?))
}

pub fn mysql_factory(config: ConfigMap) -> Result<Box<dyn Connector>> {
    Ok(Box::new(SqlConnector::from_config(Dialect::Mysql, config)?))
}

pub fn sqlite_factory(config: ConfigMap) -> Result<Box<dyn Connector>> {
    Ok(Box::new(SqlConnector::from_config(Dialect::Sqlite, config)?))
}

/// Rows plus the advanced watermark of one incremental extraction step.
#[derive(Debug)]
pub struct IncrementalBatch {
    pub rows: Vec<Row>,
    pub watermark: Value,
}

#[derive(Debug)]
pub struct SqlConnector {
    dialect: Dialect,
    config: ConfigMap,
    url: String,
    pool: Option<AnyPool>,
    /// True when the pool bypassed the cache and is owned by this instance.
    owns_pool: bool,
}

impl SqlConnector {
    pub fn from_config(dialect: Dialect, config: ConfigMap) -> Result<Self> {
        match dialect {
            Dialect::Sqlite => require_keys(&config, &["database_path"])?,
            _ => require_keys(&config, &["host", "database", "user"])?,
        }
        let url = build_url(dialect, &config)?;
        Ok(Self {
            dialect,
            config,
            url,
            pool: None,
            owns_pool: false,
        })
    }

    fn pool(&self) -> Result<&AnyPool> {
        self.pool.as_ref().ok_or(OmnitapError::NotConnected)
    }

    /// Incremental watermark extraction: strict `>` on `watermark_col`,
    /// ascending order, `batch_size` cap. Returns the rows plus the new
    /// watermark (`max(watermark_col)` over the batch, or the input
    /// watermark when the batch is empty).
    pub async fn fetch_incremental(
        &mut self,
        table: &str,
        watermark_col: &str,
        last_watermark: &Value,
        batch_size: u64,
    ) -> Result<IncrementalBatch> {
        let pool = self.pool()?.clone();
        let sql = self
            .dialect
            .incremental_query(table, watermark_col, batch_size);
        debug!(sql, "incremental fetch");

        let query = sqlx::query(&sql);
        let query = match last_watermark {
            Value::Number(n) if n.is_i64() => query.bind(n.as_i64().unwrap_or_default()),
            Value::Number(n) => query.bind(n.as_f64().unwrap_or_default()),
            Value::String(s) => query.bind(s.clone()),
            other => query.bind(other.to_string()),
        };

        let rows: Vec<Row> = query
            .fetch_all(&pool)
            .await?
            .iter()
            .map(row_to_json)
            .collect();

        // Rows are ordered ASC, so the last row carries the maximum.
        let watermark = rows
            .last()
            .and_then(|row| row.get(watermark_col).cloned())
            .unwrap_or_else(|| last_watermark.clone());

        Ok(IncrementalBatch { rows, watermark })
    }
}

#[async_trait]
impl Connector for SqlConnector {
    fn protocol(&self) -> &str {
        self.dialect.as_str()
    }

    async fn connect(&mut self) -> Result<()> {
        install_drivers();

        let reuse = get_bool(&self.config, "reuse").unwrap_or(true);
        let timeout = get_u64(&self.config, "timeout_secs").unwrap_or(30);
        let pool_size = get_u64(&self.config, "pool_size").unwrap_or(5) as u32;
        let key = normalized_key(self.dialect.as_str(), &self.config, IDENTITY_FIELDS);

        let url = self.url.clone();
        let pool = SQL_ENGINES
            .get_or_try_init(&key, reuse, || async move {
                let pool = AnyPoolOptions::new()
                    .max_connections(pool_size)
                    .acquire_timeout(Duration::from_secs(timeout))
                    .connect(&url)
                    .await?;
                Ok(pool)
            })
            .await?;

        info!(
            protocol = self.dialect.as_str(),
            url = %redact_url(&self.url),
            "sql connector connected"
        );
        self.pool = Some(pool);
        self.owns_pool = !reuse;
        Ok(())
    }

    async fn fetch(&mut self, query: &str) -> Result<IngestionResult> {
        guard_fetch(self.pool.is_some(), query)?;
        let pool = self.pool()?.clone();

        let rows: Vec<Row> = match sqlx::query(query).fetch_all(&pool).await {
            Ok(rows) => rows.iter().map(row_to_json).collect(),
            Err(e) => {
                return Ok(IngestionResult::failure(
                    self.dialect.as_str(),
                    e.to_string(),
                ))
            }
        };

        let count = rows.len();
        Ok(
            IngestionResult::ok(self.dialect.as_str(), vec![IngestedItem::rows(rows)])
                .with_metadata("row_count", Value::from(count)),
        )
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(pool) = self.pool.take() {
            // Cached pools are owned by the engine cache; only a
            // reuse=false pool is closed here.
            if self.owns_pool {
                pool.close().await;
            }
        }
        Ok(())
    }

    async fn health_check(&mut self) -> Result<bool> {
        let pool = self.pool()?.clone();
        match sqlx::query(self.dialect.health_query())
            .fetch_one(&pool)
            .await
        {
            Ok(_) => Ok(true),
            Err(_) => Ok(false),
        }
    }
}

/// Decodes one row into a column-name → scalar mapping.
///
/// `sqlx::Any` exposes a narrow value surface; decoding cascades through the
/// supported kinds and degrades to text.
pub(crate) fn row_to_json(row: &AnyRow) -> Row {
    let mut out = Row::new();
    for (index, column) in row.columns().iter().enumerate() {
        let value = if let Ok(v) = row.try_get::<Option<i64>, _>(index) {
            match v {
                Some(n) => Value::Number(n.into()),
                None => Value::Null,
            }
        } else if let Ok(v) = row.try_get::<Option<f64>, _>(index) {
            match v.and_then(Number::from_f64) {
                Some(n) => Value::Number(n),
                None => Value::Null,
            }
        } else if let Ok(v) = row.try_get::<Option<bool>, _>(index) {
            v.map(Value::Bool).unwrap_or(Value::Null)
        } else if let Ok(v) = row.try_get::<Option<String>, _>(index) {
            v.map(Value::String).unwrap_or(Value::Null)
        } else {
            Value::Null
        };
        out.insert(column.name().to_string(), value);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(pairs: &[(&str, Value)]) -> ConfigMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_missing_connection_fields() {
        let err =
            SqlConnector::from_config(Dialect::Postgres, config(&[("host", json!("h"))]))
                .unwrap_err();
        assert!(err
            .to_string()
            .contains("missing required keys: [database, user]"));
    }

    #[tokio::test]
    async fn test_fetch_before_connect() {
        let mut conn = SqlConnector::from_config(
            Dialect::Sqlite,
            config(&[("database_path", json!(":memory:"))]),
        )
        .unwrap();
        let err = conn.fetch("SELECT 1").await.unwrap_err();
        assert_eq!(err.to_string(), "not connected");
    }

    #[tokio::test]
    async fn test_empty_query_rejected() {
        let tmp = tempfile::TempDir::new().unwrap();
        let db = tmp.path().join("t.db");
        let mut conn = SqlConnector::from_config(
            Dialect::Sqlite,
            config(&[
                ("database_path", json!(db.to_string_lossy())),
                ("reuse", json!(false)),
            ]),
        )
        .unwrap();
        conn.connect().await.unwrap();
        let err = conn.fetch("  ").await.unwrap_err();
        assert_eq!(err.to_string(), "empty query");
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_fetch_rows_and_health() {
        let tmp = tempfile::TempDir::new().unwrap();
        let db = tmp.path().join("t.db");
        let mut conn = SqlConnector::from_config(
            Dialect::Sqlite,
            config(&[
                ("database_path", json!(db.to_string_lossy())),
                ("reuse", json!(false)),
            ]),
        )
        .unwrap();
        conn.connect().await.unwrap();

        let setup = conn
            .fetch("CREATE TABLE users (id INTEGER, name TEXT)")
            .await
            .unwrap();
        assert!(setup.success);
        conn.fetch("INSERT INTO users VALUES (1, 'a'), (2, 'b')")
            .await
            .unwrap();

        let result = conn.fetch("SELECT * FROM users ORDER BY id").await.unwrap();
        assert!(result.success);
        assert_eq!(result.items.len(), 1);
        assert_eq!(result.items[0].row_count(), 2);
        if let crate::envelope::Payload::Rows(rows) = &result.items[0].payload {
            assert_eq!(rows[0]["id"], json!(1));
            assert_eq!(rows[1]["name"], json!("b"));
        } else {
            panic!("expected a row batch payload");
        }

        assert!(conn.health_check().await.unwrap());
        conn.close().await.unwrap();
        // close is idempotent
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_fetch_incremental_is_restartable() {
        let tmp = tempfile::TempDir::new().unwrap();
        let db = tmp.path().join("t.db");
        let mut conn = SqlConnector::from_config(
            Dialect::Sqlite,
            config(&[
                ("database_path", json!(db.to_string_lossy())),
                ("reuse", json!(false)),
            ]),
        )
        .unwrap();
        conn.connect().await.unwrap();
        conn.fetch("CREATE TABLE events (seq INTEGER, label TEXT)")
            .await
            .unwrap();
        conn.fetch("INSERT INTO events VALUES (1, 'a'), (2, 'b'), (3, 'c')")
            .await
            .unwrap();

        let first = conn
            .fetch_incremental("events", "seq", &json!(0), 10)
            .await
            .unwrap();
        assert_eq!(first.rows.len(), 3);
        assert_eq!(first.watermark, json!(3));

        // Quiescent source: re-running from the returned watermark is a no-op.
        let second = conn
            .fetch_incremental("events", "seq", &first.watermark, 10)
            .await
            .unwrap();
        assert!(second.rows.is_empty());
        assert_eq!(second.watermark, json!(3));

        // Batch cap respected, watermark advances to the batch max.
        let capped = conn
            .fetch_incremental("events", "seq", &json!(0), 2)
            .await
            .unwrap();
        assert_eq!(capped.rows.len(), 2);
        assert_eq!(capped.watermark, json!(2));

        conn.close().await.unwrap();
    }
}
