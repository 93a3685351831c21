//! Neo4j connector: bolt driver handle, Cypher dispatch, row deserialization
//! through the driver's serde support.

use async_trait::async_trait;
use neo4rs::{query, Graph};
use serde_json::Value;
use tracing::{debug, info};

use crate::config::{expect_str, get_str, require_keys, ConfigMap};
use crate::connector::{guard_fetch, Connector};
use crate::envelope::{IngestedItem, IngestionResult, Row};
use crate::errors::{OmnitapError, Result};

pub fn factory(config: ConfigMap) -> Result<Box<dyn Connector>> {
    Ok(Box::new(Neo4jConnector::from_config(config)?))
}

pub struct Neo4jConnector {
    config: ConfigMap,
    graph: Option<Graph>,
}

impl std::fmt::Debug for Neo4jConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Neo4jConnector")
            .field("config", &self.config)
            .field("graph", &self.graph.is_some())
            .finish()
    }
}

impl Neo4jConnector {
    pub fn from_config(config: ConfigMap) -> Result<Self> {
        require_keys(&config, &["uri", "user"])?;
        Ok(Self {
            config,
            graph: None,
        })
    }
}

#[async_trait]
impl Connector for Neo4jConnector {
    fn protocol(&self) -> &str {
        "neo4j"
    }

    async fn connect(&mut self) -> Result<()> {
        let uri = expect_str(&self.config, "uri")?;
        let user = expect_str(&self.config, "user")?;
        let password = get_str(&self.config, "password").unwrap_or_default();

        let timeout = crate::config::get_u64(&self.config, "timeout_secs").unwrap_or(30);
        let graph = tokio::time::timeout(
            std::time::Duration::from_secs(timeout),
            Graph::new(&uri, &user, &password),
        )
        .await
        .map_err(|_| {
            OmnitapError::ConnectorError(format!("neo4j connect timeout after {timeout}s"))
        })??;
        info!(uri = %crate::log::redact_url(&uri), "neo4j connector connected");
        self.graph = Some(graph);
        Ok(())
    }

    async fn fetch(&mut self, cypher: &str) -> Result<IngestionResult> {
        guard_fetch(self.graph.is_some(), cypher)?;
        let graph = self.graph.as_ref().ok_or(OmnitapError::NotConnected)?;
        debug!(cypher, "neo4j fetch");

        let mut stream = match graph.execute(query(cypher)).await {
            Ok(stream) => stream,
            Err(e) => return Ok(IngestionResult::failure("neo4j", e.to_string())),
        };

        let mut rows: Vec<Row> = Vec::new();
        loop {
            match stream.next().await {
                Ok(Some(record)) => {
                    let value = record.to::<Value>().map_err(|e| {
                        OmnitapError::ConnectorError(format!("neo4j row decode: {e}"))
                    })?;
                    rows.push(match value {
                        Value::Object(map) => map.into_iter().collect(),
                        scalar => {
                            let mut row = Row::new();
                            row.insert("value".to_string(), scalar);
                            row
                        }
                    });
                }
                Ok(None) => break,
                Err(e) => return Ok(IngestionResult::failure("neo4j", e.to_string())),
            }
        }

        let count = rows.len();
        Ok(
            IngestionResult::ok("neo4j", vec![IngestedItem::rows(rows)])
                .with_metadata("row_count", Value::from(count)),
        )
    }

    async fn close(&mut self) -> Result<()> {
        self.graph = None;
        Ok(())
    }

    async fn health_check(&mut self) -> Result<bool> {
        let graph = self.graph.as_ref().ok_or(OmnitapError::NotConnected)?;
        Ok(graph.run(query("RETURN 1")).await.is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_requires_uri_and_user() {
        let err = Neo4jConnector::from_config(ConfigMap::new()).unwrap_err();
        assert!(err
            .to_string()
            .contains("missing required keys: [uri, user]"));
    }

    #[tokio::test]
    async fn test_fetch_before_connect() {
        let mut config = ConfigMap::new();
        config.insert("uri".to_string(), json!("bolt://graph.example:7687"));
        config.insert("user".to_string(), json!("neo4j"));
        let mut conn = Neo4jConnector::from_config(config).unwrap();
        let err = conn.fetch("MATCH (n) RETURN n").await.unwrap_err();
        assert_eq!(err.to_string(), "not connected");
    }
}
