//! SQL Server connector over tiberius.
//!
//! Unlike the pooled sqlx engines, a tiberius client is a single session and
//! stays per-instance; the connector owns and closes it.

use async_trait::async_trait;
use serde_json::{Number, Value};
use tiberius::{AuthMethod, Client, ColumnData, Config};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::info;

use crate::config::{expect_str, get_bool, get_str, get_u64, require_keys, ConfigMap};
use crate::connector::{guard_fetch, Connector};
use crate::envelope::{IngestedItem, IngestionResult, Row};
use crate::errors::{OmnitapError, Result};
use crate::warehouse::dialect::{default_port, Dialect};

pub fn factory(config: ConfigMap) -> Result<Box<dyn Connector>> {
    Ok(Box::new(MssqlConnector::from_config(config)?))
}

#[derive(Debug)]
pub struct MssqlConnector {
    config: ConfigMap,
    client: Option<Client<Compat<TcpStream>>>,
}

impl MssqlConnector {
    pub fn from_config(config: ConfigMap) -> Result<Self> {
        require_keys(&config, &["host", "database", "user"])?;
        Ok(Self {
            config,
            client: None,
        })
    }
}

#[async_trait]
impl Connector for MssqlConnector {
    fn protocol(&self) -> &str {
        "mssql"
    }

    async fn connect(&mut self) -> Result<()> {
        let host = expect_str(&self.config, "host")?;
        let port = get_u64(&self.config, "port").unwrap_or(default_port(Dialect::Mssql) as u64) as u16;
        let database = expect_str(&self.config, "database")?;
        let user = expect_str(&self.config, "user")?;
        let password = get_str(&self.config, "password").unwrap_or_default();
        let timeout = get_u64(&self.config, "timeout_secs").unwrap_or(30);

        let mut tds = Config::new();
        tds.host(&host);
        tds.port(port);
        tds.database(&database);
        tds.authentication(AuthMethod::sql_server(&user, &password));
        if get_bool(&self.config, "trust_cert").unwrap_or(true) {
            tds.trust_cert();
        }

        let tcp = tokio::time::timeout(
            std::time::Duration::from_secs(timeout),
            TcpStream::connect((host.as_str(), port)),
        )
        .await
        .map_err(|_| {
            OmnitapError::ConnectorError(format!("mssql connect timeout after {timeout}s"))
        })??;
        tcp.set_nodelay(true)?;

        let client = Client::connect(tds, tcp.compat_write()).await?;
        info!(host, database, "mssql connector connected");
        self.client = Some(client);
        Ok(())
    }

    async fn fetch(&mut self, query: &str) -> Result<IngestionResult> {
        guard_fetch(self.client.is_some(), query)?;
        let client = self.client.as_mut().ok_or(OmnitapError::NotConnected)?;

        let stream = match client.simple_query(query).await {
            Ok(stream) => stream,
            Err(e) => return Ok(IngestionResult::failure("mssql", e.to_string())),
        };
        let result_sets = match stream.into_results().await {
            Ok(sets) => sets,
            Err(e) => return Ok(IngestionResult::failure("mssql", e.to_string())),
        };

        let mut rows: Vec<Row> = Vec::new();
        for set in result_sets {
            for row in set {
                let names: Vec<String> =
                    row.columns().iter().map(|c| c.name().to_string()).collect();
                let mut out = Row::new();
                for (name, data) in names.into_iter().zip(row.into_iter()) {
                    out.insert(name, column_data_to_json(data));
                }
                rows.push(out);
            }
        }

        let count = rows.len();
        Ok(
            IngestionResult::ok("mssql", vec![IngestedItem::rows(rows)])
                .with_metadata("row_count", Value::from(count)),
        )
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(client) = self.client.take() {
            client.close().await?;
        }
        Ok(())
    }

    async fn health_check(&mut self) -> Result<bool> {
        let client = self.client.as_mut().ok_or(OmnitapError::NotConnected)?;
        match client.simple_query("SELECT 1").await {
            Ok(stream) => Ok(stream.into_results().await.is_ok()),
            Err(_) => Ok(false),
        }
    }
}

fn column_data_to_json(data: ColumnData<'_>) -> Value {
    match data {
        ColumnData::U8(v) => v.map(|n| Value::Number(n.into())).unwrap_or(Value::Null),
        ColumnData::I16(v) => v.map(|n| Value::Number(n.into())).unwrap_or(Value::Null),
        ColumnData::I32(v) => v.map(|n| Value::Number(n.into())).unwrap_or(Value::Null),
        ColumnData::I64(v) => v.map(|n| Value::Number(n.into())).unwrap_or(Value::Null),
        ColumnData::F32(v) => v
            .and_then(|f| Number::from_f64(f as f64))
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ColumnData::F64(v) => v
            .and_then(Number::from_f64)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ColumnData::Bit(v) => v.map(Value::Bool).unwrap_or(Value::Null),
        ColumnData::String(v) => v
            .map(|s| Value::String(s.into_owned()))
            .unwrap_or(Value::Null),
        ColumnData::Guid(v) => v
            .map(|g| Value::String(g.to_string()))
            .unwrap_or(Value::Null),
        ColumnData::Binary(v) => {
            use base64::Engine as _;
            v.map(|b| Value::String(base64::engine::general_purpose::STANDARD.encode(b.as_ref())))
                .unwrap_or(Value::Null)
        }
        // Temporal and numeric exotics degrade to their wire debug form;
        // the staging writer stores them as text either way.
        other => Value::String(format!("{other:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_requires_connection_fields() {
        let mut config = ConfigMap::new();
        config.insert("protocol".to_string(), json!("mssql"));
        let err = MssqlConnector::from_config(config).unwrap_err();
        assert!(err
            .to_string()
            .contains("missing required keys: [host, database, user]"));
    }

    #[tokio::test]
    async fn test_fetch_before_connect() {
        let mut config = ConfigMap::new();
        config.insert("host".to_string(), json!("h"));
        config.insert("database".to_string(), json!("d"));
        config.insert("user".to_string(), json!("u"));
        let mut conn = MssqlConnector::from_config(config).unwrap();
        let err = conn.fetch("SELECT 1").await.unwrap_err();
        assert_eq!(err.to_string(), "not connected");
    }

    #[test]
    fn test_column_data_conversion() {
        assert_eq!(column_data_to_json(ColumnData::I64(Some(7))), json!(7));
        assert_eq!(column_data_to_json(ColumnData::I64(None)), Value::Null);
        assert_eq!(
            column_data_to_json(ColumnData::String(Some("x".into()))),
            json!("x")
        );
        assert_eq!(column_data_to_json(ColumnData::Bit(Some(true))), json!(true));
    }
}
