//! REST connector: per-thread cached `reqwest` session, configured base URL,
//! auth headers and timeout. JSON responses map onto envelope items; non-2xx
//! responses become failure envelopes, never panics.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

use crate::cache::{session_key, HTTP_SESSIONS};
use crate::config::{expect_str, get_bool, get_str, get_u64, require_keys, ConfigMap};
use crate::connector::{guard_fetch, Connector};
use crate::envelope::{IngestedItem, IngestionResult};
use crate::errors::{OmnitapError, Result};

pub fn factory(config: ConfigMap) -> Result<Box<dyn Connector>> {
    Ok(Box::new(HttpConnector::from_config(config)?))
}

/// Longest body slice quoted in a failure envelope.
const ERROR_SNIPPET_LEN: usize = 200;

/// Cache identity: session per base URL + credentials (per thread).
const IDENTITY_FIELDS: &[&str] = &["base_url", "auth_token"];

#[derive(Debug)]
pub struct HttpConnector {
    config: ConfigMap,
    base_url: Url,
    client: Option<Client>,
}

impl HttpConnector {
    pub fn from_config(config: ConfigMap) -> Result<Self> {
        require_keys(&config, &["base_url"])?;
        let base_url = Url::parse(&expect_str(&config, "base_url")?)?;
        Ok(Self {
            config,
            base_url,
            client: None,
        })
    }

    fn build_client(&self) -> Result<Client> {
        let timeout = get_u64(&self.config, "timeout_secs").unwrap_or(30);
        let mut headers = HeaderMap::new();

        if let Some(token) = get_str(&self.config, "auth_token") {
            let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(OmnitapError::from)?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        if let Some(Value::Object(extra)) = self.config.get("headers") {
            for (name, value) in extra {
                let name: HeaderName = name.parse()?;
                let value = value.as_str().unwrap_or_default();
                headers.insert(name, HeaderValue::from_str(value)?);
            }
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(timeout))
            .default_headers(headers)
            .build()?;
        Ok(client)
    }

    fn method(&self) -> Result<Method> {
        let name = get_str(&self.config, "method").unwrap_or_else(|| "GET".to_string());
        name.to_ascii_uppercase()
            .parse()
            .map_err(|_| OmnitapError::ConfigError(format!("invalid HTTP method: {name}")))
    }
}

#[async_trait]
impl Connector for HttpConnector {
    fn protocol(&self) -> &str {
        "http"
    }

    async fn connect(&mut self) -> Result<()> {
        let reuse = get_bool(&self.config, "reuse").unwrap_or(true);
        let key = session_key("http", &self.config, IDENTITY_FIELDS);

        let client = HTTP_SESSIONS
            .get_or_try_init(&key, reuse, || async { self.build_client() })
            .await?;

        info!(base_url = %self.base_url, "http connector connected");
        self.client = Some(client);
        Ok(())
    }

    async fn fetch(&mut self, query: &str) -> Result<IngestionResult> {
        guard_fetch(self.client.is_some(), query)?;
        let client = self.client.as_ref().ok_or(OmnitapError::NotConnected)?;

        let url = self.base_url.join(query)?;
        let method = self.method()?;
        debug!(%url, %method, "http fetch");

        let response = match client.request(method, url.clone()).send().await {
            Ok(response) => response,
            Err(e) => return Ok(IngestionResult::failure("http", e.to_string())),
        };

        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            return Ok(IngestionResult::failure(
                "http",
                format_status_error(status, &body),
            ));
        }

        let items = match serde_json::from_str::<Value>(&body) {
            Ok(value) => items_from_json(value),
            Err(_) => vec![IngestedItem::scalar(Value::String(body))],
        };

        let count = items.len();
        Ok(IngestionResult::ok("http", items)
            .with_metadata("url", Value::String(url.to_string()))
            .with_metadata("item_count", Value::from(count)))
    }

    async fn close(&mut self) -> Result<()> {
        // The session cache owns the client; dropping our handle is enough.
        self.client = None;
        Ok(())
    }

    async fn health_check(&mut self) -> Result<bool> {
        let client = self.client.as_ref().ok_or(OmnitapError::NotConnected)?;
        match client.get(self.base_url.clone()).send().await {
            Ok(response) => Ok(!response.status().is_server_error()),
            Err(_) => Ok(false),
        }
    }
}

/// `"<status> <body-snippet>"` as published in failure envelopes.
pub(crate) fn format_status_error(status: StatusCode, body: &str) -> String {
    let snippet: String = body.chars().take(ERROR_SNIPPET_LEN).collect();
    format!("{} {}", status.as_u16(), snippet)
}

/// Maps a JSON response onto envelope items: one per array element, one for
/// an object, one scalar otherwise.
pub(crate) fn items_from_json(value: Value) -> Vec<IngestedItem> {
    match value {
        Value::Array(elements) => elements
            .into_iter()
            .map(|element| match element {
                Value::Object(map) => IngestedItem::row(map),
                scalar => IngestedItem::scalar(scalar),
            })
            .collect(),
        Value::Object(map) => vec![IngestedItem::row(map)],
        scalar => vec![IngestedItem::scalar(scalar)],
    }
}
