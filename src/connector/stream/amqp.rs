//! AMQP (RabbitMQ) micro-batch consumer over lapin. Deliveries are acked
//! cumulatively after the staged file rename, giving at-least-once.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{BasicAckOptions, BasicConsumeOptions};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{Channel, Connection, ConnectionProperties};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::{expect_str, require_keys, ConfigMap};
use crate::connector::stream::{
    batch_result, decode_payload, lake_root, millis_ts, now_ts, StopConditions, StreamRecord,
};
use crate::connector::{guard_fetch, Connector};
use crate::envelope::{IngestionResult, Row};
use crate::errors::{OmnitapError, Result};

pub fn factory(config: ConfigMap) -> Result<Box<dyn Connector>> {
    Ok(Box::new(AmqpConnector::from_config(config)?))
}

#[derive(Debug)]
pub struct AmqpConnector {
    config: ConfigMap,
    connection: Option<Connection>,
    channel: Option<Channel>,
}

impl AmqpConnector {
    pub fn from_config(config: ConfigMap) -> Result<Self> {
        require_keys(&config, &["uri", "lake_root"])?;
        Ok(Self {
            config,
            connection: None,
            channel: None,
        })
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    fn protocol(&self) -> &str {
        "amqp"
    }

    async fn connect(&mut self) -> Result<()> {
        let uri = expect_str(&self.config, "uri")?;
        let timeout = crate::config::get_u64(&self.config, "timeout_secs").unwrap_or(30);

        let connection = tokio::time::timeout(
            std::time::Duration::from_secs(timeout),
            Connection::connect(&uri, ConnectionProperties::default()),
        )
        .await
        .map_err(|_| {
            OmnitapError::ConnectorError(format!("amqp connect timeout after {timeout}s"))
        })??;
        let channel = connection.create_channel().await?;

        info!(uri = %crate::log::redact_url(&uri), "amqp connector connected");
        self.connection = Some(connection);
        self.channel = Some(channel);
        Ok(())
    }

    async fn fetch(&mut self, queue: &str) -> Result<IngestionResult> {
        guard_fetch(self.channel.is_some(), queue)?;
        let channel = self.channel.as_ref().ok_or(OmnitapError::NotConnected)?;
        let stop = StopConditions::from_config(&self.config);
        let root = lake_root(&self.config)?;

        let mut consumer = channel
            .basic_consume(
                queue,
                "omnitap",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        let deadline = Instant::now() + stop.max_wait;
        let mut records: Vec<StreamRecord> = Vec::new();
        let mut last_delivery_tag: Option<u64> = None;

        loop {
            if records.len() >= stop.max_messages {
                break;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            match tokio::time::timeout(remaining, consumer.next()).await {
                Err(_) => break,
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    warn!("amqp consume error: {e}");
                    break;
                }
                Ok(Some(Ok(delivery))) => {
                    let headers = delivery
                        .properties
                        .headers()
                        .as_ref()
                        .map(field_table_to_row);
                    let ts = delivery
                        .properties
                        .timestamp()
                        .map(|secs| millis_ts(Some(secs as i64 * 1000)))
                        .unwrap_or_else(now_ts);

                    records.push(StreamRecord {
                        topic: queue.to_string(),
                        key: Some(delivery.routing_key.to_string()),
                        value: decode_payload(&delivery.data),
                        headers,
                        ts,
                    });
                    last_delivery_tag = Some(delivery.delivery_tag);
                }
            }
        }

        let consumed = records.len();
        let (result, staged) = batch_result("amqp", queue, records, &root)?;

        // Cumulative ack strictly after the staged file is durable.
        if staged.is_some() {
            if let Some(tag) = last_delivery_tag {
                channel
                    .basic_ack(tag, BasicAckOptions { multiple: true })
                    .await?;
            }
        }

        info!(queue, consumed, staged = staged.is_some(), "amqp micro-batch done");
        Ok(result)
    }

    async fn close(&mut self) -> Result<()> {
        self.channel = None;
        if let Some(connection) = self.connection.take() {
            if let Err(e) = connection.close(320, "shutdown").await {
                warn!("amqp close failed: {e}");
            }
        }
        Ok(())
    }
}

fn field_table_to_row(table: &FieldTable) -> Row {
    table
        .inner()
        .iter()
        .map(|(key, value)| (key.to_string(), amqp_value_to_json(value)))
        .collect()
}

fn amqp_value_to_json(value: &AMQPValue) -> Value {
    match value {
        AMQPValue::Boolean(b) => Value::Bool(*b),
        AMQPValue::ShortShortInt(n) => Value::from(*n),
        AMQPValue::ShortShortUInt(n) => Value::from(*n),
        AMQPValue::ShortInt(n) => Value::from(*n),
        AMQPValue::ShortUInt(n) => Value::from(*n),
        AMQPValue::LongInt(n) => Value::from(*n),
        AMQPValue::LongUInt(n) => Value::from(*n),
        AMQPValue::LongLongInt(n) => Value::from(*n),
        AMQPValue::Float(f) => Value::from(*f as f64),
        AMQPValue::Double(f) => Value::from(*f),
        AMQPValue::ShortString(s) => Value::String(s.to_string()),
        AMQPValue::LongString(s) => Value::String(s.to_string()),
        AMQPValue::Void => Value::Null,
        other => Value::String(format!("{other:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_requires_uri_and_lake_root() {
        let err = AmqpConnector::from_config(ConfigMap::new()).unwrap_err();
        assert!(err
            .to_string()
            .contains("missing required keys: [uri, lake_root]"));
    }

    #[tokio::test]
    async fn test_fetch_before_connect() {
        let mut config = ConfigMap::new();
        config.insert("uri".to_string(), json!("amqp://mq.example:5672"));
        config.insert("lake_root".to_string(), json!("/tmp/lake"));
        let mut conn = AmqpConnector::from_config(config).unwrap();
        let err = conn.fetch("jobs").await.unwrap_err();
        assert_eq!(err.to_string(), "not connected");
    }

    #[test]
    fn test_amqp_value_conversion() {
        assert_eq!(amqp_value_to_json(&AMQPValue::Boolean(true)), json!(true));
        assert_eq!(amqp_value_to_json(&AMQPValue::LongInt(7)), json!(7));
        assert_eq!(
            amqp_value_to_json(&AMQPValue::LongString("x".into())),
            json!("x")
        );
    }
}
