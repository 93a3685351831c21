//! Pipeline orchestration: the run-id state machine composing
//! extract → stage → load with auditing on every terminal state.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::config::ConfigMap;
use crate::warehouse::RunStatus;

pub mod run;

pub use run::run;

/// Everything one run needs besides the warehouse engine.
#[derive(Debug, Clone)]
pub struct RunParams {
    pub connector_config: ConfigMap,
    pub query: String,
    pub source_name: String,
    pub target_table: String,
    pub lake_root: PathBuf,
    pub schema: Option<String>,
    pub pipeline_name: String,
}

/// Terminal description of a run, serialized as the CLI's JSON output.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub pipeline_name: String,
    pub status: RunStatus,
    pub rows_loaded: u64,
    pub parquet_files: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_seconds: f64,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }
}
