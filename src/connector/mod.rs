//! Connector contract and protocol registry.
//!
//! Every extraction protocol implements [`Connector`]: `connect()`, any
//! number of `fetch(query)` calls returning an [`IngestionResult`] envelope,
//! then an idempotent `close()`. Implementations are discovered through an
//! explicit process-global registry keyed by the `protocol` string in the
//! supplied config; hosts can add protocols with [`register_connector`].

use async_trait::async_trait;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use tracing::debug;

use crate::config::{expect_str, ConfigMap};
use crate::envelope::IngestionResult;
use crate::errors::{OmnitapError, Result};
use crate::log::redact_config;

pub mod file;
pub mod http;
pub mod nosql;
pub mod soap;
pub mod sql;
pub mod stream;

/// Polymorphic connector lifecycle: `Connected` via [`Connector::connect`],
/// many fetches, terminated via [`Connector::close`].
#[async_trait]
pub trait Connector: Send + std::fmt::Debug {
    /// Protocol tag this connector was registered under.
    fn protocol(&self) -> &str;

    /// Opens the connection/session. Must be called before `fetch`.
    async fn connect(&mut self) -> Result<()>;

    /// Executes one extraction and returns the envelope.
    ///
    /// Fails with *empty query* for an empty query and *not connected*
    /// before `connect()`.
    async fn fetch(&mut self, query: &str) -> Result<IngestionResult>;

    /// Releases per-instance resources. Idempotent; cached handles stay
    /// alive until [`crate::cache::close_all`].
    async fn close(&mut self) -> Result<()>;

    /// Cheap liveness probe. Default: healthy once connected.
    async fn health_check(&mut self) -> Result<bool> {
        Ok(true)
    }
}

/// Shared precondition guard for every `fetch` implementation.
pub(crate) fn guard_fetch(connected: bool, query: &str) -> Result<()> {
    if !connected {
        return Err(OmnitapError::NotConnected);
    }
    if query.trim().is_empty() {
        return Err(OmnitapError::EmptyQuery);
    }
    Ok(())
}

/// Factory signature connectors register with.
pub type ConnectorFactory = fn(ConfigMap) -> Result<Box<dyn Connector>>;

static REGISTRY: Lazy<DashMap<String, ConnectorFactory>> = Lazy::new(|| {
    let registry: DashMap<String, ConnectorFactory> = DashMap::new();

    registry.insert("postgres".to_string(), sql::postgres_factory as ConnectorFactory);
    registry.insert("mysql".to_string(), sql::mysql_factory as ConnectorFactory);
    registry.insert("sqlite".to_string(), sql::sqlite_factory as ConnectorFactory);
    registry.insert("mssql".to_string(), sql::mssql::factory as ConnectorFactory);
    registry.insert("http".to_string(), http::factory as ConnectorFactory);
    registry.insert("soap".to_string(), soap::factory as ConnectorFactory);
    registry.insert("ftp".to_string(), file::ftp::factory as ConnectorFactory);
    registry.insert("sftp".to_string(), file::sftp::factory as ConnectorFactory);
    registry.insert("webdav".to_string(), file::webdav::factory as ConnectorFactory);
    registry.insert("mongodb".to_string(), nosql::mongo::factory as ConnectorFactory);
    registry.insert("cassandra".to_string(), nosql::cassandra::factory as ConnectorFactory);
    registry.insert("neo4j".to_string(), nosql::neo4j::factory as ConnectorFactory);
    registry.insert("kafka".to_string(), stream::kafka::factory as ConnectorFactory);
    registry.insert("amqp".to_string(), stream::amqp::factory as ConnectorFactory);
    registry.insert("nats".to_string(), stream::nats::factory as ConnectorFactory);

    registry
});

/// Registers (or replaces) a connector factory for `protocol`.
pub fn register_connector(protocol: &str, factory: ConnectorFactory) {
    REGISTRY.insert(protocol.to_string(), factory);
}

/// Whether a protocol has a registered factory.
pub fn protocol_is_registered(protocol: &str) -> bool {
    REGISTRY.contains_key(protocol)
}

/// Protocols currently known to the registry.
pub fn registered_protocols() -> Vec<String> {
    let mut protocols: Vec<String> = REGISTRY.iter().map(|e| e.key().clone()).collect();
    protocols.sort();
    protocols
}

/// Instantiates the connector selected by `config["protocol"]`.
pub fn create_connector(config: ConfigMap) -> Result<Box<dyn Connector>> {
    let protocol = expect_str(&config, "protocol")?;
    let factory = REGISTRY
        .get(&protocol)
        .map(|entry| *entry.value())
        .ok_or_else(|| OmnitapError::UnknownProtocol(protocol.clone()))?;

    debug!(protocol, config = ?redact_config(&config), "creating connector");
    factory(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_guard_fetch() {
        assert!(matches!(
            guard_fetch(false, "SELECT 1"),
            Err(OmnitapError::NotConnected)
        ));
        assert!(matches!(guard_fetch(true, ""), Err(OmnitapError::EmptyQuery)));
        assert!(matches!(
            guard_fetch(true, "   "),
            Err(OmnitapError::EmptyQuery)
        ));
        assert!(guard_fetch(true, "SELECT 1").is_ok());
    }

    #[test]
    fn test_unknown_protocol() {
        let mut config = ConfigMap::new();
        config.insert("protocol".to_string(), json!("carrier-pigeon"));
        let err = create_connector(config).unwrap_err();
        assert_eq!(err.to_string(), "unknown protocol: carrier-pigeon");
    }

    #[test]
    fn test_missing_protocol_is_config_error() {
        let err = create_connector(ConfigMap::new()).unwrap_err();
        assert!(err.to_string().contains("missing required keys: [protocol]"));
    }

    #[test]
    fn test_builtin_protocols_registered() {
        let protocols = registered_protocols();
        for expected in [
            "postgres", "mysql", "sqlite", "mssql", "http", "soap", "ftp", "sftp", "webdav",
            "mongodb", "cassandra", "neo4j", "kafka", "amqp", "nats",
        ] {
            assert!(
                protocols.iter().any(|p| p == expected),
                "missing builtin protocol {expected}"
            );
        }
        // oracle deliberately has no driver
        assert!(!protocols.iter().any(|p| p == "oracle"));
    }
}
