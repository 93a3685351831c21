//! The orchestrator itself.
//!
//! State machine per run:
//! `Init → Connecting → Fetching → (Staging → Loading → Done_Success) | Done_Failure`.
//! Every terminal state writes exactly one audit row. Failures between
//! connect and load write the failure audit and then propagate; a failure to
//! write the failure audit is logged without masking the original error.

use std::path::PathBuf;

use chrono::Utc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::expect_str;
use crate::connector::create_connector;
use crate::envelope::IngestionResult;
use crate::errors::{OmnitapError, Result};
use crate::pipeline::{RunOutcome, RunParams};
use crate::staging;
use crate::warehouse::{
    ensure_audit_table, loader, write_audit_record, AuditRecord, DwEngine, RunStatus,
};

/// Executes one pipeline run end to end.
pub async fn run(engine: &DwEngine, params: RunParams) -> Result<RunOutcome> {
    let run_id = Uuid::new_v4();
    let started_at = Utc::now();

    // Protocol resolution is a configuration concern: an unknown protocol is
    // fatal before the run starts, so no audit row is written for it.
    let protocol = expect_str(&params.connector_config, "protocol")?;
    if !crate::connector::protocol_is_registered(&protocol) {
        return Err(OmnitapError::UnknownProtocol(protocol));
    }

    info!(
        %run_id,
        pipeline = params.pipeline_name,
        protocol,
        source = params.source_name,
        target = params.target_table,
        "🚀 pipeline run started"
    );

    // A run that cannot even reach the audit table never started.
    ensure_audit_table(engine).await?;

    let staged_and_loaded = execute_stages(engine, &params).await;

    let finished_at = Utc::now();
    let duration_seconds = (finished_at - started_at).num_milliseconds() as f64 / 1000.0;

    let mut record = AuditRecord {
        run_id,
        pipeline_name: params.pipeline_name.clone(),
        source_name: params.source_name.clone(),
        protocol: protocol.clone(),
        target_table: params.target_table.clone(),
        status: RunStatus::Failure,
        rows_loaded: 0,
        parquet_files: 0,
        error_message: None,
        started_at,
        finished_at,
    };

    match staged_and_loaded {
        Ok(StageOutput::Completed { rows, paths }) => {
            record.status = RunStatus::Success;
            record.rows_loaded = rows;
            record.parquet_files = paths.len() as u64;
            // A success that cannot be audited is not a success.
            write_audit_record(engine, &record).await?;

            info!(
                %run_id,
                rows,
                files = paths.len(),
                "✅ pipeline run succeeded"
            );
            Ok(RunOutcome {
                run_id,
                pipeline_name: params.pipeline_name,
                status: RunStatus::Success,
                rows_loaded: rows,
                parquet_files: paths.len() as u64,
                error: None,
                started_at,
                finished_at,
                duration_seconds,
            })
        }
        Ok(StageOutput::FetchFailed { error }) => {
            record.error_message = Some(error.clone());
            write_failure_audit(engine, &record).await;

            warn!(%run_id, error, "❌ pipeline run failed (fetch)");
            Ok(RunOutcome {
                run_id,
                pipeline_name: params.pipeline_name,
                status: RunStatus::Failure,
                rows_loaded: 0,
                parquet_files: 0,
                error: Some(error),
                started_at,
                finished_at,
                duration_seconds,
            })
        }
        Err(e) => {
            record.error_message = Some(e.to_string());
            write_failure_audit(engine, &record).await;

            error!(%run_id, error = %e, "❌ pipeline run failed");
            Err(e)
        }
    }
}

enum StageOutput {
    /// The envelope reported failure; the run terminates without an error.
    FetchFailed { error: String },
    Completed { rows: u64, paths: Vec<PathBuf> },
}

/// Steps 3–6: connect, fetch inside a scoped acquisition, stage, load.
async fn execute_stages(engine: &DwEngine, params: &RunParams) -> Result<StageOutput> {
    let mut connector = create_connector(params.connector_config.clone())?;

    connector.connect().await?;

    // Scoped acquisition: close() runs on every exit path, including a
    // failed fetch, before the fetch error is surfaced.
    let fetched = connector.fetch(&params.query).await;
    let closed = connector.close().await;
    let result: IngestionResult = fetched?;
    closed?;

    if !result.success {
        let error = result
            .error()
            .unwrap_or("fetch failed without error detail")
            .to_string();
        return Ok(StageOutput::FetchFailed { error });
    }

    let paths = staging::write(&result, &params.lake_root, &params.source_name)?;
    let rows = loader::load(
        engine,
        &paths,
        &params.target_table,
        params.schema.as_deref(),
    )
    .await?;

    Ok(StageOutput::Completed { rows, paths })
}

/// Failure-audit write that never masks the original failure.
async fn write_failure_audit(engine: &DwEngine, record: &AuditRecord) {
    if let Err(audit_err) = write_audit_record(engine, record).await {
        warn!(
            run_id = %record.run_id,
            error = %audit_err,
            "failed to write failure audit row"
        );
    }
}
