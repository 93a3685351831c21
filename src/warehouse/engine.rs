//! Warehouse connection handle: a pooled `sqlx::AnyPool` plus the dialect
//! derived from the URL scheme.

use std::sync::Once;
use std::time::Duration;

use sqlx::any::AnyPoolOptions;
use sqlx::AnyPool;
use tracing::info;

use crate::cache::{normalized_key, SQL_ENGINES};
use crate::config::{get_str, get_u64, ConfigLoader, ConfigMap};
use crate::errors::{OmnitapError, Result};
use crate::log::redact_url;
use crate::warehouse::dialect::{build_url, Dialect};

static INSTALL_DRIVERS: Once = Once::new();

/// Registers the compiled-in sqlx drivers with the Any driver exactly once.
pub(crate) fn install_drivers() {
    INSTALL_DRIVERS.call_once(sqlx::any::install_default_drivers);
}

/// Opaque warehouse backend: DDL execution, parameterized batch insert and
/// transactions over one pooled connection handle.
#[derive(Clone)]
pub struct DwEngine {
    pool: AnyPool,
    dialect: Dialect,
    display_url: String,
}

impl DwEngine {
    /// Connects (or reuses the cached pool) for the given URL.
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with(url, true, 30).await
    }

    /// Connects with explicit cache-reuse and acquire-timeout control.
    pub async fn connect_with(url: &str, reuse: bool, timeout_secs: u64) -> Result<Self> {
        install_drivers();

        let scheme = url
            .split_once("://")
            .map(|(s, _)| s)
            .or_else(|| url.split_once(':').map(|(s, _)| s))
            .ok_or_else(|| {
                OmnitapError::ConfigError(format!("not a connection URL: {}", redact_url(url)))
            })?;
        let dialect = Dialect::from_scheme(scheme)?;

        let mut identity = ConfigMap::new();
        identity.insert("url".to_string(), serde_json::Value::String(url.to_string()));
        let key = normalized_key("dw", &identity, &["url"]);

        let owned_url = url.to_string();
        let pool = SQL_ENGINES
            .get_or_try_init(&key, reuse, || async move {
                let pool = AnyPoolOptions::new()
                    .max_connections(5)
                    .acquire_timeout(Duration::from_secs(timeout_secs))
                    .connect(&owned_url)
                    .await?;
                Ok(pool)
            })
            .await?;

        let display_url = redact_url(url);
        info!(url = %display_url, dialect = dialect.as_str(), "warehouse engine ready");

        Ok(Self {
            pool,
            dialect,
            display_url,
        })
    }

    /// Resolves the warehouse destination from `DW_`-prefixed environment
    /// variables: either `DW_URL`, or `DW_PROTOCOL` plus host/database/user
    /// parts.
    pub async fn from_env() -> Result<Self> {
        let config = ConfigLoader::new().env_prefix("DW").load()?;
        Self::from_config(&config).await
    }

    /// Builds the engine from a config map (`url` key, or dialect parts).
    pub async fn from_config(config: &ConfigMap) -> Result<Self> {
        let url = match get_str(config, "url") {
            Some(url) => url,
            None => {
                let protocol = get_str(config, "protocol").ok_or_else(|| {
                    OmnitapError::ConfigError(
                        "missing required keys: [url] (or [protocol] plus connection fields)"
                            .to_string(),
                    )
                })?;
                let dialect = Dialect::from_scheme(&protocol)?;
                build_url(dialect, config)?
            }
        };
        let timeout = get_u64(config, "timeout_secs").unwrap_or(30);
        Self::connect_with(&url, true, timeout).await
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Redacted URL, safe for logs and error messages.
    pub fn display_url(&self) -> &str {
        &self.display_url
    }

    /// Dialect health probe (`SELECT 1`).
    pub async fn health_check(&self) -> Result<bool> {
        match sqlx::query(self.dialect.health_query())
            .fetch_one(&self.pool)
            .await
        {
            Ok(_) => Ok(true),
            Err(_) => Ok(false),
        }
    }
}

impl std::fmt::Debug for DwEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DwEngine")
            .field("dialect", &self.dialect)
            .field("url", &self.display_url)
            .finish()
    }
}
