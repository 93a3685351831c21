//! Audit store: the published `etl_audit_log` table and the one-row-per-run
//! write. Downstream dashboards read this table; its schema is an interface.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::errors::Result;
use crate::warehouse::dialect::ColumnType;
use crate::warehouse::engine::DwEngine;
use crate::warehouse::schema::table_exists;

/// Name of the audit table.
pub const AUDIT_TABLE: &str = "etl_audit_log";

/// Terminal status of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Failure,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }
}

/// One audit row describing a terminated run.
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub run_id: Uuid,
    pub pipeline_name: String,
    pub source_name: String,
    pub protocol: String,
    pub target_table: String,
    pub status: RunStatus,
    pub rows_loaded: u64,
    pub parquet_files: u64,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Creates `etl_audit_log` if absent, in its own transaction.
pub async fn ensure_audit_table(engine: &DwEngine) -> Result<()> {
    if table_exists(engine, AUDIT_TABLE, None).await? {
        return Ok(());
    }

    let dialect = engine.dialect();
    let q = |name: &str| dialect.quote_ident(name);
    let text = dialect.sql_type(ColumnType::Text);
    let bigint = dialect.sql_type(ColumnType::BigInt);
    let ts = dialect.sql_type(ColumnType::Timestamp);

    let body = format!(
        "{run_id} {text} NOT NULL, \
         {pipeline_name} {text} NOT NULL, \
         {source_name} {text} NOT NULL, \
         {protocol} {text} NOT NULL, \
         {target_table} {text} NOT NULL, \
         {status} {text} NOT NULL, \
         {rows_loaded} {bigint} NOT NULL, \
         {parquet_files} {bigint} NOT NULL, \
         {error_message} {text}, \
         {started_at} {ts} NOT NULL, \
         {finished_at} {ts} NOT NULL",
        run_id = q("run_id"),
        pipeline_name = q("pipeline_name"),
        source_name = q("source_name"),
        protocol = q("protocol"),
        target_table = q("target_table"),
        status = q("status"),
        rows_loaded = q("rows_loaded"),
        parquet_files = q("parquet_files"),
        error_message = q("error_message"),
        started_at = q("started_at"),
        finished_at = q("finished_at"),
    );
    let ddl = dialect.create_table_stmt(&dialect.qualified_table(AUDIT_TABLE, None), &body);

    let mut tx = engine.pool().begin().await?;
    sqlx::query(&ddl).execute(&mut *tx).await?;
    tx.commit().await?;
    Ok(())
}

/// Appends exactly one audit row, in its own transaction.
pub async fn write_audit_record(engine: &DwEngine, record: &AuditRecord) -> Result<()> {
    let dialect = engine.dialect();
    let qualified = dialect.qualified_table(AUDIT_TABLE, None);

    let columns = [
        "run_id",
        "pipeline_name",
        "source_name",
        "protocol",
        "target_table",
        "status",
        "rows_loaded",
        "parquet_files",
        "error_message",
        "started_at",
        "finished_at",
    ];
    let column_list: Vec<String> = columns.iter().map(|c| dialect.quote_ident(c)).collect();

    let mut placeholders: Vec<String> = Vec::with_capacity(columns.len());
    for (i, column) in columns.iter().enumerate() {
        let index = i + 1;
        placeholders.push(match *column {
            "started_at" | "finished_at" => {
                dialect.temporal_placeholder(index, ColumnType::Timestamp)
            }
            _ => dialect.placeholder(index),
        });
    }

    let sql = format!(
        "INSERT INTO {qualified} ({}) VALUES ({})",
        column_list.join(", "),
        placeholders.join(", ")
    );

    let mut tx = engine.pool().begin().await?;
    sqlx::query(&sql)
        .bind(record.run_id.to_string())
        .bind(record.pipeline_name.clone())
        .bind(record.source_name.clone())
        .bind(record.protocol.clone())
        .bind(record.target_table.clone())
        .bind(record.status.as_str())
        .bind(record.rows_loaded as i64)
        .bind(record.parquet_files as i64)
        .bind(record.error_message.clone())
        .bind(record.started_at.to_rfc3339_opts(SecondsFormat::Micros, true))
        .bind(
            record
                .finished_at
                .to_rfc3339_opts(SecondsFormat::Micros, true),
        )
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}
