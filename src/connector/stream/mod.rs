//! Stream micro-batch consumers (Kafka, AMQP, NATS).
//!
//! A stream fetch pulls messages until a bounded stop condition
//! (`max_messages`, `max_wait_secs`, or broker end-of-stream), writes the
//! whole batch to ONE staged Parquet file under the standard partition
//! scheme, and returns a single pre-staged item. Offsets/acks are committed
//! only after the staged file has been renamed into place (at-least-once).

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use serde_json::Value;

use crate::config::{expect_str, get_u64, ConfigMap};
use crate::envelope::{IngestedItem, IngestionResult, Row};
use crate::errors::Result;
use crate::staging;

pub mod amqp;
pub mod kafka;
pub mod nats;

/// Bounded stop condition for one micro-batch.
#[derive(Debug, Clone, Copy)]
pub struct StopConditions {
    pub max_messages: usize,
    pub max_wait: Duration,
}

impl StopConditions {
    pub fn from_config(config: &ConfigMap) -> Self {
        Self {
            max_messages: get_u64(config, "max_messages").unwrap_or(500) as usize,
            max_wait: Duration::from_secs(get_u64(config, "max_wait_secs").unwrap_or(30)),
        }
    }
}

/// One broker message, normalized to the staged row shape.
#[derive(Debug, Clone)]
pub struct StreamRecord {
    pub topic: String,
    pub key: Option<String>,
    pub value: Value,
    pub headers: Option<Row>,
    pub ts: String,
}

impl StreamRecord {
    /// `{topic, key?, value, headers?, ts}`; nested values get stringified
    /// by the staging writer.
    pub fn into_row(self) -> Row {
        let mut row = Row::new();
        row.insert("topic".to_string(), Value::String(self.topic));
        row.insert(
            "key".to_string(),
            self.key.map(Value::String).unwrap_or(Value::Null),
        );
        row.insert("value".to_string(), self.value);
        row.insert(
            "headers".to_string(),
            self.headers.map(Value::Object).unwrap_or(Value::Null),
        );
        row.insert("ts".to_string(), Value::String(self.ts));
        row
    }
}

/// Current time in the staged row timestamp format.
pub(crate) fn now_ts() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Millisecond epoch → staged row timestamp, falling back to now.
pub(crate) fn millis_ts(millis: Option<i64>) -> String {
    millis
        .and_then(chrono::DateTime::from_timestamp_millis)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Micros, true))
        .unwrap_or_else(now_ts)
}

/// JSON payloads parse to their value; everything else becomes text.
pub(crate) fn decode_payload(bytes: &[u8]) -> Value {
    match serde_json::from_slice::<Value>(bytes) {
        Ok(value) => value,
        Err(_) => Value::String(String::from_utf8_lossy(bytes).to_string()),
    }
}

/// Stages one consumed batch as a single Parquet file and wraps it in the
/// envelope (no in-memory payload travels further).
pub(crate) fn batch_result(
    protocol: &str,
    source: &str,
    records: Vec<StreamRecord>,
    lake_root: &Path,
) -> Result<(IngestionResult, Option<PathBuf>)> {
    if records.is_empty() {
        return Ok((IngestionResult::ok(protocol, Vec::new()), None));
    }

    let count = records.len();
    let rows: Vec<Row> = records.into_iter().map(StreamRecord::into_row).collect();
    let path = staging::write_rows(rows, lake_root, protocol, source)?;

    let mut metadata = Row::new();
    metadata.insert("messages".to_string(), Value::from(count));
    let item = IngestedItem::staged(path.clone()).with_metadata(metadata);

    let result =
        IngestionResult::ok(protocol, vec![item]).with_metadata("messages", Value::from(count));
    Ok((result, Some(path)))
}

/// The lake root a stream connector stages into (required config).
pub(crate) fn lake_root(config: &ConfigMap) -> Result<PathBuf> {
    Ok(PathBuf::from(expect_str(config, "lake_root")?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_stop_conditions_defaults() {
        let stop = StopConditions::from_config(&ConfigMap::new());
        assert_eq!(stop.max_messages, 500);
        assert_eq!(stop.max_wait, Duration::from_secs(30));
    }

    #[test]
    fn test_stop_conditions_from_config() {
        let mut config = ConfigMap::new();
        config.insert("max_messages".to_string(), json!(10));
        config.insert("max_wait_secs".to_string(), json!("5"));
        let stop = StopConditions::from_config(&config);
        assert_eq!(stop.max_messages, 10);
        assert_eq!(stop.max_wait, Duration::from_secs(5));
    }

    #[test]
    fn test_decode_payload() {
        assert_eq!(decode_payload(b"{\"a\": 1}"), json!({"a": 1}));
        assert_eq!(decode_payload(b"plain text"), json!("plain text"));
    }

    #[test]
    fn test_record_row_shape() {
        let record = StreamRecord {
            topic: "orders".to_string(),
            key: Some("k1".to_string()),
            value: json!({"amount": 10}),
            headers: None,
            ts: "2026-01-01T00:00:00Z".to_string(),
        };
        let row = record.into_row();
        assert_eq!(row["topic"], json!("orders"));
        assert_eq!(row["key"], json!("k1"));
        assert_eq!(row["value"], json!({"amount": 10}));
        assert_eq!(row["headers"], Value::Null);
        assert_eq!(row["ts"], json!("2026-01-01T00:00:00Z"));
    }

    #[test]
    fn test_empty_batch_stages_nothing() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (result, path) = batch_result("kafka", "orders", Vec::new(), tmp.path()).unwrap();
        assert!(result.success);
        assert!(result.items.is_empty());
        assert!(path.is_none());
    }

    #[test]
    fn test_batch_stages_single_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let records = vec![
            StreamRecord {
                topic: "orders".to_string(),
                key: None,
                value: json!({"amount": 1}),
                headers: None,
                ts: now_ts(),
            },
            StreamRecord {
                topic: "orders".to_string(),
                key: Some("k".to_string()),
                value: json!({"amount": 2}),
                headers: None,
                ts: now_ts(),
            },
        ];

        let (result, path) = batch_result("kafka", "orders", records, tmp.path()).unwrap();
        let path = path.unwrap();
        assert!(path.exists());
        assert_eq!(result.items.len(), 1);
        assert_eq!(result.items[0].lake_path(), Some(path.as_path()));
        assert_eq!(result.metadata["messages"], json!(2));
    }
}
