//! Warehouse loader: reads staged Parquet files and appends their rows to
//! the target table with a `_source_file` lineage column, batching the
//! parameterized INSERTs below driver placeholder limits.

use std::fs::File;
use std::path::{Path, PathBuf};

use arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use serde_json::Value;
use sqlx::any::AnyArguments;
use sqlx::query::Query;
use sqlx::Any;
use tracing::{debug, info};

use crate::envelope::Row;
use crate::errors::{OmnitapError, Result};
use crate::warehouse::dialect::ColumnType;
use crate::warehouse::engine::DwEngine;
use crate::warehouse::schema::{columns_from_schema, ensure_table_exists, ColumnDef, SOURCE_FILE_COLUMN};

/// Upper bound on bind parameters per INSERT statement, kept well under the
/// smallest driver limit (sqlite's historical 999).
const MAX_PARAMS_PER_INSERT: usize = 900;

/// Loads every staged file into `table`, in path order.
///
/// Returns the total number of rows inserted. A missing path is an error;
/// an empty staged file is skipped.
pub async fn load(
    engine: &DwEngine,
    paths: &[PathBuf],
    table: &str,
    schema: Option<&str>,
) -> Result<u64> {
    let mut total: u64 = 0;

    for path in paths {
        if !path.exists() {
            return Err(OmnitapError::LoadError(format!(
                "file not found: {}",
                path.display()
            )));
        }

        let (rows, columns) = read_staged_file(path)?;
        if rows.is_empty() {
            debug!(path = %path.display(), "skipping empty staged file");
            continue;
        }

        ensure_table_exists(engine, table, &columns, schema).await?;

        let basename = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        let inserted = insert_rows(engine, table, schema, &columns, &rows, &basename).await?;
        info!(
            path = %path.display(),
            table,
            rows = inserted,
            "loaded staged file"
        );
        total += inserted;
    }

    Ok(total)
}

/// Reads one staged Parquet file back into JSON rows plus the column
/// definitions inferred from its Arrow schema.
pub fn read_staged_file(path: &Path) -> Result<(Vec<Row>, Vec<ColumnDef>)> {
    let file = File::open(path)?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;
    let columns = columns_from_schema(builder.schema());

    let reader = builder.build()?;
    let mut batches: Vec<RecordBatch> = Vec::new();
    for batch in reader {
        batches.push(batch?);
    }

    let mut rows = Vec::new();
    if !batches.is_empty() {
        let refs: Vec<&RecordBatch> = batches.iter().collect();
        let mut writer = arrow::json::LineDelimitedWriter::new(Vec::new());
        writer.write_batches(&refs)?;
        writer.finish()?;
        let buf = writer.into_inner();

        for line in buf.split(|b| *b == b'\n') {
            if line.is_empty() {
                continue;
            }
            let row: Row = serde_json::from_slice(line)?;
            rows.push(row);
        }
    }

    Ok((rows, columns))
}

async fn insert_rows(
    engine: &DwEngine,
    table: &str,
    schema: Option<&str>,
    columns: &[ColumnDef],
    rows: &[Row],
    source_file: &str,
) -> Result<u64> {
    let dialect = engine.dialect();
    let qualified = dialect.qualified_table(table, schema);

    // +1 for the lineage column appended to every row.
    let width = columns.len() + 1;
    let rows_per_chunk = std::cmp::max(1, MAX_PARAMS_PER_INSERT / width);

    let mut column_list: Vec<String> = columns
        .iter()
        .map(|c| dialect.quote_ident(&c.name))
        .collect();
    column_list.push(dialect.quote_ident(SOURCE_FILE_COLUMN));
    let column_list = column_list.join(", ");

    let mut inserted: u64 = 0;
    for chunk in rows.chunks(rows_per_chunk) {
        let mut placeholders: Vec<String> = Vec::with_capacity(chunk.len());
        let mut index = 1usize;
        for _ in chunk {
            let mut row_ph: Vec<String> = Vec::with_capacity(width);
            for column in columns {
                row_ph.push(match column.ty {
                    ColumnType::Timestamp | ColumnType::Date => {
                        dialect.temporal_placeholder(index, column.ty)
                    }
                    _ => dialect.placeholder(index),
                });
                index += 1;
            }
            row_ph.push(dialect.placeholder(index));
            index += 1;
            placeholders.push(format!("({})", row_ph.join(", ")));
        }

        let sql = format!(
            "INSERT INTO {qualified} ({column_list}) VALUES {}",
            placeholders.join(", ")
        );

        let mut query = sqlx::query(&sql);
        for row in chunk {
            for column in columns {
                query = bind_value(query, column.ty, row.get(&column.name));
            }
            query = query.bind(source_file.to_string());
        }

        let result = query.execute(engine.pool()).await?;
        inserted += result.rows_affected();
    }

    Ok(inserted)
}

/// Binds one JSON value with the staged column's type so NULLs stay typed.
fn bind_value<'q>(
    query: Query<'q, Any, AnyArguments<'q>>,
    ty: ColumnType,
    value: Option<&Value>,
) -> Query<'q, Any, AnyArguments<'q>> {
    let value = value.unwrap_or(&Value::Null);
    match ty {
        ColumnType::BigInt => match value.as_i64() {
            Some(n) => query.bind(n),
            None => query.bind(Option::<i64>::None),
        },
        ColumnType::Double => match value.as_f64() {
            Some(f) => query.bind(f),
            None => query.bind(Option::<f64>::None),
        },
        ColumnType::Boolean => match value.as_bool() {
            Some(b) => query.bind(b),
            None => query.bind(Option::<bool>::None),
        },
        ColumnType::Text | ColumnType::Date | ColumnType::Timestamp => match value {
            Value::Null => query.bind(Option::<String>::None),
            Value::String(s) => query.bind(s.clone()),
            other => query.bind(other.to_string()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::staging;
    use serde_json::json;

    #[test]
    fn test_read_staged_file_roundtrip() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut row = Row::new();
        row.insert("id".to_string(), json!(1));
        row.insert("name".to_string(), json!("a"));
        let path = staging::write_rows(vec![row], tmp.path(), "sqlite", "users").unwrap();

        let (rows, columns) = read_staged_file(&path).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], json!(1));
        assert_eq!(rows[0]["name"], json!("a"));
        assert!(columns
            .iter()
            .any(|c| c.name == staging::INGESTED_AT_COLUMN));
    }

    #[test]
    fn test_nulls_survive_the_roundtrip() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut full = Row::new();
        full.insert("id".to_string(), json!(1));
        full.insert("note".to_string(), json!("x"));
        let mut sparse = Row::new();
        sparse.insert("id".to_string(), json!(2));
        let path =
            staging::write_rows(vec![full, sparse], tmp.path(), "sqlite", "notes").unwrap();

        let (rows, _) = read_staged_file(&path).unwrap();
        assert_eq!(rows.len(), 2);
        // The JSON writer omits null cells; a missing key reads as NULL.
        assert!(rows[1].get("note").map_or(true, |v| v.is_null()));
    }
}
