//! The data contract between connectors and the staging layer.
//!
//! Every `fetch` returns an [`IngestionResult`] envelope holding zero or more
//! [`IngestedItem`]s. An item's [`Payload`] is a tagged variant covering the
//! four shapes the staging writer handles: a single row, an ordered row
//! batch, a bare scalar, or a pre-staged file on disk (stream and file
//! connectors stage directly).

use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

/// One JSON row: column name → scalar value.
pub type Row = Map<String, Value>;

/// Payload of one ingested item.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// A single mapping; staged as one row.
    Row(Row),
    /// An ordered sequence of mappings; staged as N rows.
    Rows(Vec<Row>),
    /// A scalar or other non-mapping value; staged as one row with a single
    /// synthetic `value` field.
    Scalar(Value),
    /// A file already written under the lake partition scheme.
    Staged(PathBuf),
}

/// One logical unit produced by a fetch.
#[derive(Debug, Clone)]
pub struct IngestedItem {
    pub payload: Payload,
    pub metadata: Option<Row>,
}

impl IngestedItem {
    pub fn row(row: Row) -> Self {
        Self {
            payload: Payload::Row(row),
            metadata: None,
        }
    }

    pub fn rows(rows: Vec<Row>) -> Self {
        Self {
            payload: Payload::Rows(rows),
            metadata: None,
        }
    }

    pub fn scalar(value: Value) -> Self {
        Self {
            payload: Payload::Scalar(value),
            metadata: None,
        }
    }

    pub fn staged(path: impl Into<PathBuf>) -> Self {
        Self {
            payload: Payload::Staged(path.into()),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Row) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// The pre-staged file path, when this item was staged by its connector.
    pub fn lake_path(&self) -> Option<&Path> {
        match &self.payload {
            Payload::Staged(path) => Some(path),
            _ => None,
        }
    }

    /// Number of rows this item materializes to.
    pub fn row_count(&self) -> usize {
        match &self.payload {
            Payload::Row(_) | Payload::Scalar(_) => 1,
            Payload::Rows(rows) => rows.len(),
            Payload::Staged(_) => 0,
        }
    }
}

/// Envelope returned by every connector `fetch`.
#[derive(Debug, Clone)]
pub struct IngestionResult {
    pub protocol: String,
    pub success: bool,
    pub items: Vec<IngestedItem>,
    pub metadata: Row,
}

impl IngestionResult {
    /// A successful envelope.
    pub fn ok(protocol: impl Into<String>, items: Vec<IngestedItem>) -> Self {
        Self {
            protocol: protocol.into(),
            success: true,
            items,
            metadata: Row::new(),
        }
    }

    /// A failed envelope with `metadata.error` describing the cause.
    pub fn failure(protocol: impl Into<String>, error: impl Into<String>) -> Self {
        let mut metadata = Row::new();
        metadata.insert("error".to_string(), Value::String(error.into()));
        Self {
            protocol: protocol.into(),
            success: false,
            items: Vec::new(),
            metadata,
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// The failure cause, when present.
    pub fn error(&self) -> Option<&str> {
        self.metadata.get("error").and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_failure_carries_error_metadata() {
        let result = IngestionResult::failure("http", "boom");
        assert!(!result.success);
        assert!(result.items.is_empty());
        assert_eq!(result.error(), Some("boom"));
    }

    #[test]
    fn test_ok_has_no_error() {
        let result = IngestionResult::ok("postgres", vec![]);
        assert!(result.success);
        assert_eq!(result.error(), None);
    }

    #[test]
    fn test_lake_path_only_for_staged() {
        let staged = IngestedItem::staged("/lake/kafka/t/2026-01-01/x.parquet");
        assert!(staged.lake_path().is_some());

        let row = IngestedItem::row(Row::new());
        assert!(row.lake_path().is_none());
    }

    #[test]
    fn test_row_counts() {
        let mut row = Row::new();
        row.insert("a".into(), json!(1));
        assert_eq!(IngestedItem::row(row.clone()).row_count(), 1);
        assert_eq!(IngestedItem::rows(vec![row.clone(), row]).row_count(), 2);
        assert_eq!(IngestedItem::scalar(json!(42)).row_count(), 1);
    }
}
