//! Command-line interface: `run` executes one pipeline, `test-connection`
//! probes the warehouse or a connector config. JSON goes to stdout, the
//! human summary to stderr; exit codes are 0/1.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::info;

use crate::config::load_config_from_path;
use crate::connector::create_connector;
use crate::errors::{OmnitapError, Result};
use crate::pipeline::{self, RunParams};
use crate::warehouse::DwEngine;

/// Command-line interface structure for the omnitap ETL engine.
#[derive(Parser, Debug)]
#[command(
    name = "omnitap",
    version,
    about = "Extract from databases, APIs, files and brokers; stage as Parquet; load to a warehouse.",
    long_about = "Extract from databases, APIs, files and brokers; stage as Parquet; load to a warehouse.\n\n\
Resources:\n  • Connector config: JSON/YAML file with a `protocol` key plus protocol fields\n  • Warehouse: resolved from DW_-prefixed environment (DW_URL, or DW_PROTOCOL + parts)\n  • Staging: partitioned Parquet under the --lake root, one audit row per run"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Emit logs in JSON format.
    #[arg(long = "log-json", global = true)]
    pub log_json: bool,

    /// Set log level (overrides env vars like RUST_LOG).
    #[arg(long = "log-level", global = true)]
    pub log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Execute one pipeline run and print its JSON outcome.
    Run {
        /// Path to the connector config file (JSON or YAML).
        #[arg(long = "config", value_name = "FILE")]
        config: PathBuf,

        /// Query / path / topic handed to the connector's fetch.
        #[arg(long = "query", value_name = "STRING")]
        query: String,

        /// Logical source name (partitions the staging layout).
        #[arg(long = "source", value_name = "STRING")]
        source: String,

        /// Target warehouse table.
        #[arg(long = "table", value_name = "STRING")]
        table: String,

        /// Staging root directory.
        #[arg(long = "lake", value_name = "DIR")]
        lake: PathBuf,

        /// Target schema (dialect default when omitted).
        #[arg(long = "schema", value_name = "NAME")]
        schema: Option<String>,

        /// Pipeline name recorded in the audit row.
        #[arg(long = "pipeline", value_name = "NAME", default_value = "default")]
        pipeline: String,
    },

    /// Probe the warehouse (`--source dw`) or a connector config.
    TestConnection {
        /// `dw` to probe the warehouse destination.
        #[arg(long = "source", value_name = "NAME")]
        source: Option<String>,

        /// Connector config file to probe.
        #[arg(long = "config", value_name = "FILE")]
        config: Option<PathBuf>,
    },
}

/// Runs the CLI to completion, returning the process exit code.
pub async fn run_cli(cli: Cli) -> i32 {
    match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("fatal: {e}");
            1
        }
    }
}

async fn dispatch(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Run {
            config,
            query,
            source,
            table,
            lake,
            schema,
            pipeline,
        } => run_pipeline_cmd(config, query, source, table, lake, schema, pipeline).await,
        Command::TestConnection { source, config } => test_connection_cmd(source, config).await,
    }
}

async fn run_pipeline_cmd(
    config_path: PathBuf,
    query: String,
    source: String,
    table: String,
    lake: PathBuf,
    schema: Option<String>,
    pipeline_name: String,
) -> Result<i32> {
    let connector_config = load_config_from_path(&config_path)?;
    let engine = DwEngine::from_env().await?;

    let params = RunParams {
        connector_config,
        query,
        source_name: source,
        target_table: table,
        lake_root: lake,
        schema,
        pipeline_name,
    };

    match pipeline::run(&engine, params).await {
        Ok(outcome) => {
            println!("{}", serde_json::to_string(&outcome)?);
            if outcome.is_success() {
                eprintln!(
                    "run {} succeeded: {} rows, {} staged file(s) in {:.3}s",
                    outcome.run_id,
                    outcome.rows_loaded,
                    outcome.parquet_files,
                    outcome.duration_seconds
                );
                Ok(0)
            } else {
                eprintln!(
                    "run {} failed: {}",
                    outcome.run_id,
                    outcome.error.as_deref().unwrap_or("unknown error")
                );
                Ok(1)
            }
        }
        Err(e) => {
            // The run propagated an exception after auditing it.
            println!(
                "{}",
                json!({"status": "failure", "error": e.to_string()})
            );
            eprintln!("run failed: {e}");
            Ok(1)
        }
    }
}

async fn test_connection_cmd(source: Option<String>, config: Option<PathBuf>) -> Result<i32> {
    let (ok, detail) = match (source.as_deref(), config) {
        (Some("dw"), None) => match DwEngine::from_env().await {
            Ok(engine) => {
                let healthy = engine.health_check().await?;
                (healthy, format!("warehouse {}", engine.display_url()))
            }
            Err(e) => (false, e.to_string()),
        },
        (None, Some(path)) => probe_connector(&path).await,
        _ => {
            return Err(OmnitapError::ConfigError(
                "pass exactly one of --source dw or --config <path>".to_string(),
            ))
        }
    };

    println!("{}", json!({"ok": ok, "detail": detail}));
    Ok(if ok { 0 } else { 1 })
}

async fn probe_connector(path: &PathBuf) -> (bool, String) {
    let outcome = async {
        let config = load_config_from_path(path)?;
        let mut connector = create_connector(config)?;
        connector.connect().await?;
        let healthy = connector.health_check().await;
        let closed = connector.close().await;
        let healthy = healthy?;
        closed?;
        Ok::<bool, OmnitapError>(healthy)
    }
    .await;

    match outcome {
        Ok(true) => (true, format!("connector config {} ok", path.display())),
        Ok(false) => (false, "health check failed".to_string()),
        Err(e) => (false, e.to_string()),
    }
}

/// Shuts down the process-wide handle caches.
pub async fn shutdown() {
    crate::cache::close_all().await;
    info!("shutdown complete");
}
