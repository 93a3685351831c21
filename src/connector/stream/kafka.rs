//! Kafka micro-batch consumer. Auto-commit is off; the consumer state is
//! committed synchronously after the staged file has been renamed into
//! place, giving at-least-once delivery into the lake.

use async_trait::async_trait;
use futures::StreamExt;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{Headers, Message};
use rdkafka::ClientConfig;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::{expect_str, get_str, require_keys, ConfigMap};
use crate::connector::stream::{
    batch_result, decode_payload, lake_root, millis_ts, StopConditions, StreamRecord,
};
use crate::connector::{guard_fetch, Connector};
use crate::envelope::{IngestionResult, Row};
use crate::errors::{OmnitapError, Result};

pub fn factory(config: ConfigMap) -> Result<Box<dyn Connector>> {
    Ok(Box::new(KafkaConnector::from_config(config)?))
}

pub struct KafkaConnector {
    config: ConfigMap,
    consumer: Option<StreamConsumer>,
}

impl std::fmt::Debug for KafkaConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaConnector")
            .field("config", &self.config)
            .field("consumer", &self.consumer.is_some())
            .finish()
    }
}

impl KafkaConnector {
    pub fn from_config(config: ConfigMap) -> Result<Self> {
        require_keys(&config, &["brokers", "group_id", "lake_root"])?;
        Ok(Self {
            config,
            consumer: None,
        })
    }
}

#[async_trait]
impl Connector for KafkaConnector {
    fn protocol(&self) -> &str {
        "kafka"
    }

    async fn connect(&mut self) -> Result<()> {
        let brokers = expect_str(&self.config, "brokers")?;
        let group_id = expect_str(&self.config, "group_id")?;
        let offset_reset =
            get_str(&self.config, "auto_offset_reset").unwrap_or_else(|| "earliest".to_string());

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("group.id", &group_id)
            .set("enable.partition.eof", "true")
            .set("session.timeout.ms", "6000")
            .set("auto.offset.reset", &offset_reset)
            // commit happens after the staged file is durable, never before
            .set("enable.auto.commit", "false")
            .create()?;

        info!(brokers, group_id, "kafka consumer created");
        self.consumer = Some(consumer);
        Ok(())
    }

    async fn fetch(&mut self, topic: &str) -> Result<IngestionResult> {
        guard_fetch(self.consumer.is_some(), topic)?;
        let consumer = self.consumer.as_ref().ok_or(OmnitapError::NotConnected)?;
        let stop = StopConditions::from_config(&self.config);
        let root = lake_root(&self.config)?;

        consumer.subscribe(&[topic])?;

        let deadline = Instant::now() + stop.max_wait;
        let mut records: Vec<StreamRecord> = Vec::new();
        {
            let mut stream = consumer.stream();
            loop {
                if records.len() >= stop.max_messages {
                    break;
                }
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }

                match tokio::time::timeout(remaining, stream.next()).await {
                    // max_duration elapsed
                    Err(_) => break,
                    Ok(None) => break,
                    // broker signals end-of-stream for a partition
                    Ok(Some(Err(KafkaError::PartitionEOF(_)))) => break,
                    Ok(Some(Err(e))) => {
                        warn!("kafka consume error: {e}");
                        break;
                    }
                    Ok(Some(Ok(message))) => {
                        let headers = message.headers().map(|hs| {
                            let mut out = Row::new();
                            for header in hs.iter() {
                                let value = header
                                    .value
                                    .map(|v| {
                                        Value::String(String::from_utf8_lossy(v).to_string())
                                    })
                                    .unwrap_or(Value::Null);
                                out.insert(header.key.to_string(), value);
                            }
                            out
                        });

                        records.push(StreamRecord {
                            topic: message.topic().to_string(),
                            key: message
                                .key()
                                .map(|k| String::from_utf8_lossy(k).to_string()),
                            value: message
                                .payload()
                                .map(decode_payload)
                                .unwrap_or(Value::Null),
                            headers,
                            ts: millis_ts(message.timestamp().to_millis()),
                        });
                    }
                }
            }
        }

        let consumed = records.len();
        let (result, staged) = batch_result("kafka", topic, records, &root)?;

        // Offsets advance only once the batch is durable on disk.
        if staged.is_some() {
            consumer.commit_consumer_state(CommitMode::Sync)?;
        }

        info!(topic, consumed, staged = staged.is_some(), "kafka micro-batch done");
        Ok(result)
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(consumer) = self.consumer.take() {
            consumer.unsubscribe();
        }
        Ok(())
    }
}
