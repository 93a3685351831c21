//! Layered configuration loading.
//!
//! Connector and warehouse configuration is a flat map of string keys to JSON
//! values, merged from up to five layers with strict precedence (low → high):
//! built-in defaults, a JSON/YAML file, `<PREFIX>_`-prefixed environment
//! variables, an explicit caller-supplied map, and explicit overrides.
//! Unknown keys are preserved so each connector can validate its own schema.

use std::path::Path;

use indexmap::IndexMap;
use serde_json::Value;

use crate::errors::{OmnitapError, Result};

/// Flat configuration map with preserved key order.
pub type ConfigMap = IndexMap<String, Value>;

/// Builder for the five-layer configuration merge.
///
/// # Example
///
/// ```no_run
/// use omnitap::config::ConfigLoader;
///
/// let config = ConfigLoader::new()
///     .file("pipelines.yaml")
///     .env_prefix("PG")
///     .required(&["protocol", "host"])
///     .load()
///     .expect("config");
/// ```
#[derive(Debug, Default)]
pub struct ConfigLoader {
    defaults: ConfigMap,
    file_path: Option<String>,
    env_prefix: Option<String>,
    config: ConfigMap,
    overrides: ConfigMap,
    required: Vec<String>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lowest-precedence layer: built-in defaults.
    pub fn defaults(mut self, defaults: ConfigMap) -> Self {
        self.defaults = defaults;
        self
    }

    /// File layer: JSON (`.json`) or YAML (`.yaml`/`.yml`).
    pub fn file(mut self, path: impl Into<String>) -> Self {
        self.file_path = Some(path.into());
        self
    }

    /// Environment layer: `<PREFIX>_<KEY>` becomes config key `<key>` (lowercased).
    pub fn env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = Some(prefix.into());
        self
    }

    /// Explicit caller-supplied mapping (overrides file and env).
    pub fn config(mut self, config: ConfigMap) -> Self {
        self.config = config;
        self
    }

    /// Highest-precedence layer.
    pub fn overrides(mut self, overrides: ConfigMap) -> Self {
        self.overrides = overrides;
        self
    }

    /// Keys that must be present after the merge.
    pub fn required(mut self, keys: &[&str]) -> Self {
        self.required = keys.iter().map(|k| k.to_string()).collect();
        self
    }

    /// Merges all layers and validates required keys.
    pub fn load(self) -> Result<ConfigMap> {
        let mut merged = self.defaults;

        if let Some(path) = &self.file_path {
            for (k, v) in load_config_from_path(path)? {
                merged.insert(k, v);
            }
        }

        if let Some(prefix) = &self.env_prefix {
            for (k, v) in env_layer(prefix) {
                merged.insert(k, v);
            }
        }

        for (k, v) in self.config {
            merged.insert(k, v);
        }
        for (k, v) in self.overrides {
            merged.insert(k, v);
        }

        let required: Vec<&str> = self.required.iter().map(String::as_str).collect();
        require_keys(&merged, &required)?;

        Ok(merged)
    }
}

/// Parses a configuration file by extension: `.json`, `.yaml` or `.yml`.
pub fn load_config_from_path(path: impl AsRef<Path>) -> Result<ConfigMap> {
    let path = path.as_ref();
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    let raw = std::fs::read_to_string(path)?;

    let value: Value = match ext.as_str() {
        "json" => serde_json::from_str(&raw)?,
        "yaml" | "yml" => serde_yaml::from_str(&raw)?,
        other => {
            return Err(OmnitapError::ConfigError(format!(
                "unsupported config format: .{other} ({})",
                path.display()
            )))
        }
    };

    match value {
        Value::Object(map) => Ok(map.into_iter().collect()),
        _ => Err(OmnitapError::ConfigError(format!(
            "config file must contain a top-level mapping: {}",
            path.display()
        ))),
    }
}

/// Collects `<PREFIX>_<KEY>` environment variables into a config layer.
///
/// Values stay strings; type coercion is the connector schema's job.
fn env_layer(prefix: &str) -> ConfigMap {
    let wanted = format!("{}_", prefix.trim_end_matches('_'));
    std::env::vars()
        .filter_map(|(name, value)| {
            name.strip_prefix(&wanted)
                .map(|key| (key.to_lowercase(), Value::String(value)))
        })
        .collect()
}

/// Fails with a precise *missing required keys* error unless every key is present.
pub fn require_keys(config: &ConfigMap, required: &[&str]) -> Result<()> {
    let missing: Vec<&str> = required
        .iter()
        .filter(|k| !config.contains_key(**k))
        .copied()
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(OmnitapError::ConfigError(format!(
            "missing required keys: [{}]",
            missing.join(", ")
        )))
    }
}

/// String accessor; numbers and booleans are rendered, other shapes rejected.
pub fn get_str(config: &ConfigMap, key: &str) -> Option<String> {
    match config.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// String accessor that fails with a configuration error when absent.
pub fn expect_str(config: &ConfigMap, key: &str) -> Result<String> {
    get_str(config, key)
        .ok_or_else(|| OmnitapError::ConfigError(format!("missing required keys: [{key}]")))
}

/// Integer accessor tolerant of numeric strings (env values stay strings).
pub fn get_u64(config: &ConfigMap, key: &str) -> Option<u64> {
    match config.get(key)? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Boolean accessor tolerant of "true"/"false" strings.
pub fn get_bool(config: &ConfigMap, key: &str) -> Option<bool> {
    match config.get(key)? {
        Value::Bool(b) => Some(*b),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(pairs: &[(&str, Value)]) -> ConfigMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_precedence_overrides_win() {
        let tmp = tempfile::TempDir::new().unwrap();
        let file = tmp.path().join("conn.json");
        std::fs::write(&file, r#"{"host": "from-file", "port": 5432}"#).unwrap();

        // Unique env var name so parallel tests cannot collide.
        std::env::set_var("OMNITAP_TEST_P1_HOST", "from-env");

        let config = ConfigLoader::new()
            .defaults(map(&[("host", json!("from-defaults")), ("db", json!("dw"))]))
            .file(file.to_string_lossy().to_string())
            .env_prefix("OMNITAP_TEST_P1")
            .config(map(&[("host", json!("from-config"))]))
            .overrides(map(&[("host", json!("from-overrides"))]))
            .load()
            .unwrap();

        assert_eq!(config["host"], json!("from-overrides"));
        // Lower layers survive where not shadowed.
        assert_eq!(config["port"], json!(5432));
        assert_eq!(config["db"], json!("dw"));
        std::env::remove_var("OMNITAP_TEST_P1_HOST");
    }

    #[test]
    fn test_precedence_without_higher_layers() {
        let config = ConfigLoader::new()
            .defaults(map(&[("host", json!("from-defaults"))]))
            .config(map(&[("host", json!("from-config"))]))
            .load()
            .unwrap();
        assert_eq!(config["host"], json!("from-config"));
    }

    #[test]
    fn test_env_layer_lowercases_keys() {
        std::env::set_var("OMNITAP_TEST_ENVL_BASE_URL", "http://api");
        let config = ConfigLoader::new()
            .env_prefix("OMNITAP_TEST_ENVL")
            .load()
            .unwrap();
        assert_eq!(config["base_url"], json!("http://api"));
        std::env::remove_var("OMNITAP_TEST_ENVL_BASE_URL");
    }

    #[test]
    fn test_missing_required_keys() {
        let err = ConfigLoader::new()
            .config(map(&[("host", json!("h"))]))
            .required(&["host", "user", "database"])
            .load()
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Configuration error: missing required keys: [user, database]"
        );
    }

    #[test]
    fn test_unsupported_format() {
        let tmp = tempfile::TempDir::new().unwrap();
        let file = tmp.path().join("conn.toml");
        std::fs::write(&file, "host = 'x'").unwrap();

        let err = load_config_from_path(&file).unwrap_err();
        assert!(err.to_string().contains("unsupported config format"));
    }

    #[test]
    fn test_yaml_file_layer() {
        let tmp = tempfile::TempDir::new().unwrap();
        let file = tmp.path().join("conn.yaml");
        std::fs::write(&file, "protocol: postgres\nhost: db\nport: 5432\n").unwrap();

        let config = load_config_from_path(&file).unwrap();
        assert_eq!(config["protocol"], json!("postgres"));
        assert_eq!(config["port"], json!(5432));
    }

    #[test]
    fn test_unknown_keys_preserved() {
        let config = ConfigLoader::new()
            .config(map(&[("protocol", json!("http")), ("exotic", json!(1))]))
            .required(&["protocol"])
            .load()
            .unwrap();
        assert!(config.contains_key("exotic"));
    }

    #[test]
    fn test_typed_accessors_coerce_strings() {
        let config = map(&[
            ("port", json!("5432")),
            ("verify", json!("true")),
            ("limit", json!(10)),
        ]);
        assert_eq!(get_u64(&config, "port"), Some(5432));
        assert_eq!(get_bool(&config, "verify"), Some(true));
        assert_eq!(get_u64(&config, "limit"), Some(10));
        assert_eq!(get_str(&config, "port").as_deref(), Some("5432"));
    }
}
