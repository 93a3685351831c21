//! Parquet staging layer.
//!
//! Converts ingestion envelopes into immutable columnar files at the
//! deterministic partition path
//! `<root>/<protocol>/<source>/<YYYY-MM-DD>/<safe_source>_<utc_timestamp>.parquet`.
//! Every materialized row carries a synthesized `_ingested_at` column.
//! Writes are atomic: a temporary sibling is renamed into place.

use std::fs::File;
use std::path::{Path, PathBuf};

use arrow::datatypes::{DataType, Field, FieldRef};
use arrow::record_batch::RecordBatch;
use chrono::{SecondsFormat, Utc};
use parquet::arrow::ArrowWriter;
use parquet::file::properties::WriterProperties;
use serde_arrow::schema::{SchemaLike, TracingOptions};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

use crate::envelope::{IngestionResult, Payload, Row};
use crate::errors::{OmnitapError, Result};

/// File extension of every staged artifact.
pub const STAGED_FILE_EXT: &str = "parquet";

/// Column synthesized on every staged row (ISO-8601 UTC).
pub const INGESTED_AT_COLUMN: &str = "_ingested_at";

/// Field name used when a scalar payload is promoted to a row.
pub const SCALAR_FIELD: &str = "value";

/// Replaces path separators and dots with underscores so a source name is a
/// safe filename component.
pub fn safe_source_name(source: &str) -> String {
    source
        .chars()
        .map(|c| match c {
            '/' | '\\' | '.' => '_',
            other => other,
        })
        .collect()
}

/// Partition directory for a protocol/source pair, dated today (UTC).
pub fn partition_dir(lake_root: &Path, protocol: &str, source: &str) -> PathBuf {
    lake_root
        .join(protocol)
        .join(source)
        .join(Utc::now().format("%Y-%m-%d").to_string())
}

/// Picks a collision-free staged file path inside `dir`.
///
/// The timestamp carries microsecond precision; should two writers still
/// collide, random digits are appended to the timestamp digit run, keeping
/// the published `<safe>_<digits>Z.parquet` shape.
fn staged_file_path(dir: &Path, source: &str) -> PathBuf {
    let safe = safe_source_name(source);
    let stamp = Utc::now().format("%Y%m%dT%H%M%S%6f").to_string();
    let mut candidate = dir.join(format!("{safe}_{stamp}Z.{STAGED_FILE_EXT}"));
    while candidate.exists() {
        let suffix = nanoid::nanoid!(3, &['0', '1', '2', '3', '4', '5', '6', '7', '8', '9']);
        candidate = dir.join(format!("{safe}_{stamp}{suffix}Z.{STAGED_FILE_EXT}"));
    }
    candidate
}

/// Materializes a payload to its row sequence (per the data contract).
pub fn rows_from_payload(payload: &Payload) -> Vec<Row> {
    match payload {
        Payload::Row(row) => vec![row.clone()],
        Payload::Rows(rows) => rows.clone(),
        Payload::Scalar(value) => {
            let mut row = Row::new();
            row.insert(SCALAR_FIELD.to_string(), value.clone());
            vec![row]
        }
        Payload::Staged(_) => Vec::new(),
    }
}

/// Writes every item of `result` to the staging layer.
///
/// Failed envelopes and empty item lists yield no files. Pre-staged items
/// pass through unchanged. Returned paths are in creation order.
pub fn write(result: &IngestionResult, lake_root: &Path, source_name: &str) -> Result<Vec<PathBuf>> {
    if !result.success || result.items.is_empty() {
        debug!(
            protocol = %result.protocol,
            success = result.success,
            "nothing to stage"
        );
        return Ok(Vec::new());
    }

    let mut paths = Vec::new();
    for item in &result.items {
        if let Some(pre_staged) = item.lake_path() {
            paths.push(pre_staged.to_path_buf());
            continue;
        }

        let rows = rows_from_payload(&item.payload);
        if rows.is_empty() {
            continue;
        }
        let path = write_rows(rows, lake_root, &result.protocol, source_name)?;
        paths.push(path);
    }

    info!(
        protocol = %result.protocol,
        source = source_name,
        files = paths.len(),
        "staged ingestion result"
    );
    Ok(paths)
}

/// Writes one row batch as a single Parquet file at the partition path,
/// appending the `_ingested_at` column to every row.
pub fn write_rows(
    mut rows: Vec<Row>,
    lake_root: &Path,
    protocol: &str,
    source: &str,
) -> Result<PathBuf> {
    if rows.is_empty() {
        return Err(OmnitapError::StagingError(
            "cannot stage an empty row batch".to_string(),
        ));
    }

    let ingested_at = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
    for row in &mut rows {
        row.insert(
            INGESTED_AT_COLUMN.to_string(),
            Value::String(ingested_at.clone()),
        );
    }

    let batch = rows_to_record_batch(rows)?;

    let dir = partition_dir(lake_root, protocol, source);
    std::fs::create_dir_all(&dir)?;
    let path = staged_file_path(&dir, source);
    write_parquet_atomic(&batch, &path)?;

    debug!(path = %path.display(), rows = batch.num_rows(), "staged file written");
    Ok(path)
}

/// Converts JSON rows to an Arrow record batch.
///
/// Rows are normalized to the union of observed columns (missing keys become
/// nulls) and nested objects/arrays are serialized to JSON text, so column
/// types stay scalar. Columns observed only as null fall back to Utf8.
pub fn rows_to_record_batch(rows: Vec<Row>) -> Result<RecordBatch> {
    let values = normalize_rows(rows);

    let traced: Vec<FieldRef> = Vec::<FieldRef>::from_samples(
        &values,
        TracingOptions::default()
            .allow_null_fields(true)
            .coerce_numbers(true)
            .map_as_struct(true),
    )?;

    // Parquet has no null type; degrade all-null columns to nullable text.
    let fields: Vec<FieldRef> = traced
        .into_iter()
        .map(|field| {
            if field.data_type() == &DataType::Null {
                Arc::new(Field::new(field.name().clone(), DataType::Utf8, true))
            } else {
                field
            }
        })
        .collect();

    let batch = serde_arrow::to_record_batch(&fields, &values)?;
    Ok(batch)
}

/// Union of observed keys, first-seen order; nested values become JSON text.
fn normalize_rows(rows: Vec<Row>) -> Vec<Value> {
    let mut columns: Vec<String> = Vec::new();
    for row in &rows {
        for key in row.keys() {
            if !columns.iter().any(|c| c == key) {
                columns.push(key.clone());
            }
        }
    }

    rows.into_iter()
        .map(|mut row| {
            let mut out = Row::new();
            for column in &columns {
                let value = match row.remove(column) {
                    Some(Value::Object(map)) => {
                        Value::String(Value::Object(map).to_string())
                    }
                    Some(Value::Array(items)) => {
                        Value::String(Value::Array(items).to_string())
                    }
                    Some(scalar) => scalar,
                    None => Value::Null,
                };
                out.insert(column.clone(), value);
            }
            Value::Object(out)
        })
        .collect()
}

/// Parquet write with temp-sibling + rename so readers never observe a
/// partial file and broker offsets can be committed after the rename.
fn write_parquet_atomic(batch: &RecordBatch, path: &Path) -> Result<()> {
    let tmp = path.with_extension(format!("{STAGED_FILE_EXT}.tmp"));

    let file = File::create(&tmp)?;
    let props = WriterProperties::builder().build();
    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))?;
    writer.write(batch)?;
    writer.close()?;

    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::IngestedItem;
    use serde_json::json;

    fn row(pairs: &[(&str, Value)]) -> Row {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_safe_source_name() {
        assert_eq!(safe_source_name("a/b.c\\d"), "a_b_c_d");
        assert_eq!(safe_source_name("users"), "users");
    }

    #[test]
    fn test_failure_envelope_stages_nothing() {
        let tmp = tempfile::TempDir::new().unwrap();
        let result = IngestionResult::failure("http", "boom");
        let paths = write(&result, tmp.path(), "src").unwrap();
        assert!(paths.is_empty());
    }

    #[test]
    fn test_empty_items_stage_nothing() {
        let tmp = tempfile::TempDir::new().unwrap();
        let result = IngestionResult::ok("http", vec![]);
        let paths = write(&result, tmp.path(), "src").unwrap();
        assert!(paths.is_empty());
    }

    #[test]
    fn test_partition_path_shape() {
        let tmp = tempfile::TempDir::new().unwrap();
        let items = vec![IngestedItem::rows(vec![
            row(&[("id", json!(1)), ("name", json!("a"))]),
            row(&[("id", json!(2)), ("name", json!("b"))]),
        ])];
        let result = IngestionResult::ok("postgres", items);

        let paths = write(&result, tmp.path(), "public.users").unwrap();
        assert_eq!(paths.len(), 1);

        let rel = paths[0].strip_prefix(tmp.path()).unwrap();
        let pattern = regex::Regex::new(
            r"^postgres/public\.users/\d{4}-\d{2}-\d{2}/public_users_\d{8}T\d{6}\d+Z\.parquet$",
        )
        .unwrap();
        assert!(
            pattern.is_match(&rel.to_string_lossy()),
            "unexpected staged path: {}",
            rel.display()
        );
    }

    #[test]
    fn test_prestaged_items_pass_through() {
        let tmp = tempfile::TempDir::new().unwrap();
        let pre = tmp.path().join("already.parquet");
        let result = IngestionResult::ok("kafka", vec![IngestedItem::staged(&pre)]);

        let paths = write(&result, tmp.path(), "orders").unwrap();
        assert_eq!(paths, vec![pre]);
    }

    #[test]
    fn test_scalar_payload_becomes_value_row() {
        let rows = rows_from_payload(&Payload::Scalar(json!(42)));
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][SCALAR_FIELD], json!(42));
    }

    #[test]
    fn test_record_batch_unions_columns_and_stringifies_nested() {
        let rows = vec![
            row(&[("a", json!(1))]),
            row(&[("a", json!(2)), ("b", json!({"x": 1}))]),
        ];
        let batch = rows_to_record_batch(rows).unwrap();
        assert_eq!(batch.num_rows(), 2);
        let schema = batch.schema();
        assert!(schema.field_with_name("a").is_ok());
        // Nested object coerced to text.
        assert_eq!(
            schema.field_with_name("b").unwrap().data_type(),
            &DataType::Utf8
        );
    }

    #[test]
    fn test_all_null_column_degrades_to_text() {
        let rows = vec![
            row(&[("a", json!(1)), ("b", Value::Null)]),
            row(&[("a", json!(2)), ("b", Value::Null)]),
        ];
        let batch = rows_to_record_batch(rows).unwrap();
        assert_eq!(
            batch.schema().field_with_name("b").unwrap().data_type(),
            &DataType::Utf8
        );
    }

    #[test]
    fn test_written_file_carries_ingested_at() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = write_rows(
            vec![row(&[("id", json!(7))])],
            tmp.path(),
            "http",
            "events",
        )
        .unwrap();
        assert!(path.exists());

        let file = File::open(&path).unwrap();
        let reader = parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder::try_new(file)
            .unwrap()
            .build()
            .unwrap();
        let batches: Vec<_> = reader.map(|b| b.unwrap()).collect();
        assert_eq!(batches.len(), 1);
        assert!(batches[0]
            .schema()
            .field_with_name(INGESTED_AT_COLUMN)
            .is_ok());
    }

    #[test]
    fn test_no_temp_files_left_behind() {
        let tmp = tempfile::TempDir::new().unwrap();
        write_rows(vec![row(&[("id", json!(1))])], tmp.path(), "http", "s").unwrap();
        let leftovers: Vec<_> = walk(tmp.path())
            .into_iter()
            .filter(|p| p.to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    fn walk(dir: &Path) -> Vec<PathBuf> {
        let mut out = Vec::new();
        if let Ok(entries) = std::fs::read_dir(dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    out.extend(walk(&path));
                } else {
                    out.push(path);
                }
            }
        }
        out
    }
}
