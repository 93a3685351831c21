//! # Omnitap
//!
//! Single-node multi-protocol ETL engine.
//!
//! ## Overview
//!
//! Omnitap enables you to:
//! - **Extract** from relational databases, REST/SOAP APIs, file servers,
//!   NoSQL stores and message brokers through one connector contract
//! - **Stage** every payload as partitioned, immutable Parquet files
//! - **Load** into a relational warehouse with additive schema evolution
//!   and a per-run audit trail
//!
//! ## Quick Start
//!
//! ```no_run
//! use clap::Parser;
//! use omnitap::cmd::{run_cli, Cli};
//!
//! #[tokio::main]
//! async fn main() {
//!     let cli = Cli::parse();
//!     std::process::exit(run_cli(cli).await);
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! Connectors → Parquet staging → Schema manager → Warehouse loader → Audit
//! ```
//!
//! - **Connector layer**: protocol registry, layered config, cached handles
//! - **Staging layer**: deterministic partition paths, atomic Parquet writes
//! - **Warehouse layer**: idempotent DDL, batched inserts, `etl_audit_log`
//! - **Orchestrator**: the run-id state machine composing the above
//!
//! ## Features
//!
//! - **15 protocols**: postgres, mysql, sqlite, mssql, http, soap, ftp,
//!   sftp, webdav, mongodb, cassandra, neo4j, kafka, amqp, nats
//! - **At-least-once streams**: broker offsets commit only after the staged
//!   file is durable
//! - **Structured logging**: JSON and human-readable formats, secrets
//!   redacted
//! - **Incremental extraction**: watermark queries with restartable
//!   semantics

// Public API exports
pub use errors::{OmnitapError, Result};

// Public modules
pub mod cache;
pub mod cmd;
pub mod config;
pub mod connector;
pub mod envelope;
pub mod errors;
pub mod log;
pub mod pipeline;
pub mod staging;
pub mod warehouse;
