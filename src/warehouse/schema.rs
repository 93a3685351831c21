//! Warehouse schema manager: idempotent table creation and additive
//! evolution driven by the column types observed in staged data.
//!
//! Columns only grow; the manager never drops or retypes a column. All DDL
//! for one `ensure_table_exists` call runs inside a single transaction.

use arrow::datatypes::{DataType, Schema};
use tracing::info;

use crate::errors::Result;
use crate::warehouse::dialect::ColumnType;
use crate::warehouse::engine::DwEngine;

/// Name of the load-time audit column (timestamp-with-timezone, default now).
pub const LOADED_AT_COLUMN: &str = "_loaded_at";

/// Name of the lineage column holding the staged file's basename.
pub const SOURCE_FILE_COLUMN: &str = "_source_file";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub ty: ColumnType,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, ty: ColumnType) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}

/// Maps an Arrow schema to warehouse column definitions.
pub fn columns_from_schema(schema: &Schema) -> Vec<ColumnDef> {
    schema
        .fields()
        .iter()
        .map(|field| ColumnDef::new(field.name().clone(), column_type_for(field.data_type())))
        .collect()
}

fn column_type_for(data_type: &DataType) -> ColumnType {
    match data_type {
        DataType::Utf8 | DataType::LargeUtf8 => ColumnType::Text,
        DataType::Int8
        | DataType::Int16
        | DataType::Int32
        | DataType::Int64
        | DataType::UInt8
        | DataType::UInt16
        | DataType::UInt32
        | DataType::UInt64 => ColumnType::BigInt,
        DataType::Float16 | DataType::Float32 | DataType::Float64 => ColumnType::Double,
        DataType::Boolean => ColumnType::Boolean,
        DataType::Date32 | DataType::Date64 => ColumnType::Date,
        DataType::Timestamp(_, _) => ColumnType::Timestamp,
        // Everything else lands as text, matching the staging writer's
        // nested-value stringification.
        _ => ColumnType::Text,
    }
}

/// Creates the target table when absent, otherwise adds any missing columns.
pub async fn ensure_table_exists(
    engine: &DwEngine,
    table: &str,
    columns: &[ColumnDef],
    schema: Option<&str>,
) -> Result<()> {
    let dialect = engine.dialect();
    let qualified = dialect.qualified_table(table, schema);

    let mut tx = engine.pool().begin().await?;

    if !table_exists(engine, table, schema).await? {
        let mut body: Vec<String> = columns
            .iter()
            .map(|c| format!("{} {}", dialect.quote_ident(&c.name), dialect.sql_type(c.ty)))
            .collect();
        body.push(format!(
            "{} {} NOT NULL DEFAULT CURRENT_TIMESTAMP",
            dialect.quote_ident(LOADED_AT_COLUMN),
            dialect.sql_type(ColumnType::Timestamp)
        ));
        body.push(format!(
            "{} {}",
            dialect.quote_ident(SOURCE_FILE_COLUMN),
            dialect.sql_type(ColumnType::Text)
        ));

        let ddl = dialect.create_table_stmt(&qualified, &body.join(", "));
        sqlx::query(&ddl).execute(&mut *tx).await?;
        info!(table = %qualified, columns = columns.len(), "created target table");
    } else {
        let existing = existing_columns(engine, table, schema).await?;
        let missing: Vec<&ColumnDef> = columns
            .iter()
            .filter(|c| !existing.iter().any(|e| e.eq_ignore_ascii_case(&c.name)))
            .collect();

        for column in &missing {
            let ddl = format!(
                "ALTER TABLE {qualified} ADD COLUMN {} {}",
                dialect.quote_ident(&column.name),
                dialect.sql_type(column.ty)
            );
            sqlx::query(&ddl).execute(&mut *tx).await?;
        }
        if !missing.is_empty() {
            info!(
                table = %qualified,
                added = missing.len(),
                "evolved target table schema"
            );
        }
    }

    tx.commit().await?;
    Ok(())
}

/// Whether `table` exists in the warehouse.
pub async fn table_exists(engine: &DwEngine, table: &str, schema: Option<&str>) -> Result<bool> {
    use crate::warehouse::dialect::Dialect;

    let dialect = engine.dialect();
    let found = match dialect {
        Dialect::Sqlite => {
            sqlx::query("SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?")
                .bind(table)
                .fetch_optional(engine.pool())
                .await?
                .is_some()
        }
        Dialect::Postgres => {
            let schema = schema.unwrap_or("public");
            sqlx::query(
                "SELECT 1 FROM information_schema.tables \
                 WHERE table_schema = $1 AND table_name = $2",
            )
            .bind(schema)
            .bind(table)
            .fetch_optional(engine.pool())
            .await?
            .is_some()
        }
        Dialect::Mysql => sqlx::query(
            "SELECT 1 FROM information_schema.tables \
             WHERE table_schema = DATABASE() AND table_name = ?",
        )
        .bind(table)
        .fetch_optional(engine.pool())
        .await?
        .is_some(),
        Dialect::Mssql => {
            let schema = schema.unwrap_or("dbo");
            sqlx::query(
                "SELECT 1 FROM INFORMATION_SCHEMA.TABLES \
                 WHERE TABLE_SCHEMA = @p1 AND TABLE_NAME = @p2",
            )
            .bind(schema)
            .bind(table)
            .fetch_optional(engine.pool())
            .await?
            .is_some()
        }
    };
    Ok(found)
}

/// Current column names of `table`.
pub async fn existing_columns(
    engine: &DwEngine,
    table: &str,
    schema: Option<&str>,
) -> Result<Vec<String>> {
    use crate::warehouse::dialect::Dialect;
    use sqlx::Row as _;

    let dialect = engine.dialect();
    let rows = match dialect {
        Dialect::Sqlite => {
            sqlx::query("SELECT name FROM pragma_table_info(?)")
                .bind(table)
                .fetch_all(engine.pool())
                .await?
        }
        Dialect::Postgres => {
            let schema = schema.unwrap_or("public");
            sqlx::query(
                "SELECT column_name AS name FROM information_schema.columns \
                 WHERE table_schema = $1 AND table_name = $2",
            )
            .bind(schema)
            .bind(table)
            .fetch_all(engine.pool())
            .await?
        }
        Dialect::Mysql => sqlx::query(
            "SELECT column_name AS name FROM information_schema.columns \
             WHERE table_schema = DATABASE() AND table_name = ?",
        )
        .bind(table)
        .fetch_all(engine.pool())
        .await?,
        Dialect::Mssql => {
            let schema = schema.unwrap_or("dbo");
            sqlx::query(
                "SELECT COLUMN_NAME AS name FROM INFORMATION_SCHEMA.COLUMNS \
                 WHERE TABLE_SCHEMA = @p1 AND TABLE_NAME = @p2",
            )
            .bind(schema)
            .bind(table)
            .fetch_all(engine.pool())
            .await?
        }
    };

    let mut names = Vec::with_capacity(rows.len());
    for row in rows {
        names.push(row.try_get::<String, _>("name")?);
    }
    Ok(names)
}
