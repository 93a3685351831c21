//! Cassandra/Scylla connector: one driver session per instance, CQL fetch,
//! dynamic row decoding into column-name → scalar maps.

use async_trait::async_trait;
use scylla::frame::response::result::CqlValue;
use scylla::{Session, SessionBuilder};
use serde_json::{Number, Value};
use tracing::{debug, info};

use crate::config::{expect_str, get_str, get_u64, require_keys, ConfigMap};
use crate::connector::{guard_fetch, Connector};
use crate::envelope::{IngestedItem, IngestionResult, Row};
use crate::errors::{OmnitapError, Result};

pub fn factory(config: ConfigMap) -> Result<Box<dyn Connector>> {
    Ok(Box::new(CassandraConnector::from_config(config)?))
}

#[derive(Debug)]
pub struct CassandraConnector {
    config: ConfigMap,
    session: Option<Session>,
}

impl CassandraConnector {
    pub fn from_config(config: ConfigMap) -> Result<Self> {
        require_keys(&config, &["host"])?;
        Ok(Self {
            config,
            session: None,
        })
    }
}

#[async_trait]
impl Connector for CassandraConnector {
    fn protocol(&self) -> &str {
        "cassandra"
    }

    async fn connect(&mut self) -> Result<()> {
        let host = expect_str(&self.config, "host")?;
        let port = get_u64(&self.config, "port").unwrap_or(9042);
        let node = format!("{host}:{port}");

        let mut builder = SessionBuilder::new().known_node(&node);
        if let Some(user) = get_str(&self.config, "user") {
            let password = get_str(&self.config, "password").unwrap_or_default();
            builder = builder.user(user, password);
        }

        let session = builder
            .build()
            .await
            .map_err(|e| OmnitapError::ConnectorError(format!("cassandra connect: {e}")))?;

        if let Some(keyspace) = get_str(&self.config, "keyspace") {
            session
                .use_keyspace(&keyspace, false)
                .await
                .map_err(|e| OmnitapError::ConnectorError(format!("use keyspace: {e}")))?;
        }

        info!(node, "cassandra connector connected");
        self.session = Some(session);
        Ok(())
    }

    async fn fetch(&mut self, query: &str) -> Result<IngestionResult> {
        guard_fetch(self.session.is_some(), query)?;
        let session = self.session.as_ref().ok_or(OmnitapError::NotConnected)?;
        debug!(query, "cassandra fetch");

        let result = match session.query(query.to_string(), &[]).await {
            Ok(result) => result,
            Err(e) => return Ok(IngestionResult::failure("cassandra", e.to_string())),
        };

        let names: Vec<String> = result
            .col_specs
            .iter()
            .map(|spec| spec.name.clone())
            .collect();

        let mut rows: Vec<Row> = Vec::new();
        if let Some(result_rows) = result.rows {
            for row in result_rows {
                let mut out = Row::new();
                for (name, column) in names.iter().zip(row.columns.into_iter()) {
                    out.insert(name.clone(), cql_to_json(column));
                }
                rows.push(out);
            }
        }

        let count = rows.len();
        Ok(
            IngestionResult::ok("cassandra", vec![IngestedItem::rows(rows)])
                .with_metadata("row_count", Value::from(count)),
        )
    }

    async fn close(&mut self) -> Result<()> {
        // Dropping the session closes its connections.
        self.session = None;
        Ok(())
    }

    async fn health_check(&mut self) -> Result<bool> {
        let session = self.session.as_ref().ok_or(OmnitapError::NotConnected)?;
        Ok(session
            .query("SELECT release_version FROM system.local".to_string(), &[])
            .await
            .is_ok())
    }
}

fn cql_to_json(value: Option<CqlValue>) -> Value {
    use base64::Engine as _;
    let Some(value) = value else {
        return Value::Null;
    };
    match value {
        CqlValue::Ascii(s) | CqlValue::Text(s) => Value::String(s),
        CqlValue::Boolean(b) => Value::Bool(b),
        CqlValue::TinyInt(n) => Value::Number((n as i64).into()),
        CqlValue::SmallInt(n) => Value::Number((n as i64).into()),
        CqlValue::Int(n) => Value::Number((n as i64).into()),
        CqlValue::BigInt(n) => Value::Number(n.into()),
        CqlValue::Counter(counter) => Value::Number(counter.0.into()),
        CqlValue::Float(f) => Number::from_f64(f as f64)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        CqlValue::Double(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        // UUID-ish identifiers are stringified for columnar round-tripping.
        CqlValue::Uuid(uuid) => Value::String(uuid.to_string()),
        CqlValue::Timeuuid(uuid) => Value::String(uuid.to_string()),
        CqlValue::Inet(addr) => Value::String(addr.to_string()),
        CqlValue::Blob(bytes) => {
            Value::String(base64::engine::general_purpose::STANDARD.encode(bytes))
        }
        CqlValue::Timestamp(duration) => chrono::DateTime::from_timestamp_millis(
            duration.0,
        )
        .map(|dt| Value::String(dt.to_rfc3339()))
        .unwrap_or(Value::Null),
        CqlValue::List(items) | CqlValue::Set(items) => Value::Array(
            items
                .into_iter()
                .map(|item| cql_to_json(Some(item)))
                .collect(),
        ),
        CqlValue::Empty => Value::Null,
        other => Value::String(format!("{other:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_requires_host() {
        let err = CassandraConnector::from_config(ConfigMap::new()).unwrap_err();
        assert!(err.to_string().contains("missing required keys: [host]"));
    }

    #[tokio::test]
    async fn test_fetch_before_connect() {
        let mut config = ConfigMap::new();
        config.insert("host".to_string(), json!("cass.example"));
        let mut conn = CassandraConnector::from_config(config).unwrap();
        let err = conn.fetch("SELECT * FROM t").await.unwrap_err();
        assert_eq!(err.to_string(), "not connected");
    }

    #[test]
    fn test_cql_value_conversion() {
        assert_eq!(cql_to_json(None), Value::Null);
        assert_eq!(cql_to_json(Some(CqlValue::Int(7))), json!(7));
        assert_eq!(
            cql_to_json(Some(CqlValue::Text("x".to_string()))),
            json!("x")
        );
        assert_eq!(cql_to_json(Some(CqlValue::Boolean(true))), json!(true));
        let uuid = uuid::Uuid::new_v4();
        assert_eq!(
            cql_to_json(Some(CqlValue::Uuid(uuid))),
            json!(uuid.to_string())
        );
    }
}
