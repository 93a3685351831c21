//! NATS micro-batch consumer. Core NATS subscriptions carry no ack; the
//! batch is still staged before the subscription is dropped, but delivery is
//! at-most-once unless the deployment runs JetStream in front.

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::{expect_str, require_keys, ConfigMap};
use crate::connector::stream::{
    batch_result, decode_payload, lake_root, now_ts, StopConditions, StreamRecord,
};
use crate::connector::{guard_fetch, Connector};
use crate::envelope::{IngestionResult, Row};
use crate::errors::{OmnitapError, Result};

pub fn factory(config: ConfigMap) -> Result<Box<dyn Connector>> {
    Ok(Box::new(NatsConnector::from_config(config)?))
}

#[derive(Debug)]
pub struct NatsConnector {
    config: ConfigMap,
    client: Option<async_nats::Client>,
}

impl NatsConnector {
    pub fn from_config(config: ConfigMap) -> Result<Self> {
        require_keys(&config, &["url", "lake_root"])?;
        Ok(Self {
            config,
            client: None,
        })
    }
}

#[async_trait]
impl Connector for NatsConnector {
    fn protocol(&self) -> &str {
        "nats"
    }

    async fn connect(&mut self) -> Result<()> {
        let url = expect_str(&self.config, "url")?;
        let timeout = crate::config::get_u64(&self.config, "timeout_secs").unwrap_or(30);

        let client = tokio::time::timeout(
            std::time::Duration::from_secs(timeout),
            async_nats::connect(url.as_str()),
        )
        .await
        .map_err(|_| {
            OmnitapError::ConnectorError(format!("nats connect timeout after {timeout}s"))
        })?
        .map_err(|e| OmnitapError::ConnectorError(format!("nats connect: {e}")))?;

        info!(url = %crate::log::redact_url(&url), "nats connector connected");
        self.client = Some(client);
        Ok(())
    }

    async fn fetch(&mut self, subject: &str) -> Result<IngestionResult> {
        guard_fetch(self.client.is_some(), subject)?;
        let client = self.client.as_ref().ok_or(OmnitapError::NotConnected)?;
        let stop = StopConditions::from_config(&self.config);
        let root = lake_root(&self.config)?;

        let mut subscriber = client
            .subscribe(subject.to_string())
            .await
            .map_err(|e| OmnitapError::ConnectorError(format!("nats subscribe: {e}")))?;

        let deadline = Instant::now() + stop.max_wait;
        let mut records: Vec<StreamRecord> = Vec::new();

        loop {
            if records.len() >= stop.max_messages {
                break;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            match tokio::time::timeout(remaining, subscriber.next()).await {
                Err(_) => break,
                Ok(None) => break,
                Ok(Some(message)) => {
                    let headers = message.headers.as_ref().map(|h| {
                        let mut out = Row::new();
                        out.insert("raw".to_string(), Value::String(format!("{h:?}")));
                        out
                    });
                    records.push(StreamRecord {
                        topic: message.subject.to_string(),
                        key: None,
                        value: decode_payload(&message.payload),
                        headers,
                        ts: now_ts(),
                    });
                }
            }
        }

        if let Err(e) = subscriber.unsubscribe().await {
            warn!("nats unsubscribe failed: {e}");
        }

        let consumed = records.len();
        let (result, staged) = batch_result("nats", subject, records, &root)?;
        info!(subject, consumed, staged = staged.is_some(), "nats micro-batch done");
        Ok(result)
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(client) = self.client.take() {
            if let Err(e) = client.flush().await {
                warn!("nats flush failed: {e}");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_requires_url_and_lake_root() {
        let err = NatsConnector::from_config(ConfigMap::new()).unwrap_err();
        assert!(err
            .to_string()
            .contains("missing required keys: [url, lake_root]"));
    }

    #[tokio::test]
    async fn test_fetch_before_connect() {
        let mut config = ConfigMap::new();
        config.insert("url".to_string(), json!("nats://mq.example:4222"));
        config.insert("lake_root".to_string(), json!("/tmp/lake"));
        let mut conn = NatsConnector::from_config(config).unwrap();
        let err = conn.fetch("events.orders").await.unwrap_err();
        assert_eq!(err.to_string(), "not connected");
    }
}
