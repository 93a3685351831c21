//! WebDAV connector: PROPFIND to enumerate a collection, GET per member,
//! atomic staging like the other file connectors.

use async_trait::async_trait;
use regex::Regex;
use reqwest::{Client, Method, StatusCode};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{expect_str, get_str, get_u64, require_keys, ConfigMap};
use crate::connector::{guard_fetch, Connector};
use crate::envelope::{IngestedItem, IngestionResult};
use crate::errors::{OmnitapError, Result};

pub fn factory(config: ConfigMap) -> Result<Box<dyn Connector>> {
    Ok(Box::new(WebdavConnector::from_config(config)?))
}

#[derive(Debug)]
pub struct WebdavConnector {
    config: ConfigMap,
    base_url: Url,
    client: Option<Client>,
}

impl WebdavConnector {
    pub fn from_config(config: ConfigMap) -> Result<Self> {
        require_keys(&config, &["base_url", "lake_root"])?;
        let base_url = Url::parse(&expect_str(&config, "base_url")?)?;
        Ok(Self {
            config,
            base_url,
            client: None,
        })
    }

    fn credentials(&self) -> Option<(String, String)> {
        let user = get_str(&self.config, "username")?;
        let password = get_str(&self.config, "password").unwrap_or_default();
        Some((user, password))
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.credentials() {
            Some((user, password)) => builder.basic_auth(user, Some(password)),
            None => builder,
        }
    }
}

#[async_trait]
impl Connector for WebdavConnector {
    fn protocol(&self) -> &str {
        "webdav"
    }

    async fn connect(&mut self) -> Result<()> {
        let timeout = get_u64(&self.config, "timeout_secs").unwrap_or(30);
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout))
            .build()?;
        info!(base_url = %self.base_url, "webdav connector connected");
        self.client = Some(client);
        Ok(())
    }

    async fn fetch(&mut self, query: &str) -> Result<IngestionResult> {
        guard_fetch(self.client.is_some(), query)?;
        let client = self.client.as_ref().ok_or(OmnitapError::NotConnected)?;

        let collection = self.base_url.join(query.trim())?;
        let propfind = Method::from_bytes(b"PROPFIND")
            .map_err(|e| OmnitapError::ConnectorError(format!("PROPFIND method: {e}")))?;

        let response = match self
            .authed(client.request(propfind, collection.clone()))
            .header("Depth", "1")
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => return Ok(IngestionResult::failure("webdav", e.to_string())),
        };

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        // 207 Multi-Status is the expected listing answer.
        if !(status.is_success() || status == StatusCode::MULTI_STATUS) {
            return Ok(IngestionResult::failure(
                "webdav",
                super::super::http::format_status_error(status, &body),
            ));
        }

        let hrefs = parse_hrefs(&body)?;
        let dir = super::download_dir(&self.config, "webdav")?;
        let mut items = Vec::new();

        for href in hrefs {
            // Collections end with a slash; the request path itself is listed too.
            if href.ends_with('/') {
                continue;
            }
            if !super::is_parquet_name(&href) {
                // Only Parquet artifacts satisfy the staged-file contract.
                debug!(href, "skipping non-parquet member");
                continue;
            }
            let file_url = match self.base_url.join(&href) {
                Ok(url) => url,
                Err(e) => {
                    warn!(href, "skipping unparseable member: {e}");
                    continue;
                }
            };
            if file_url == collection {
                continue;
            }
            debug!(%file_url, "webdav download");

            let response = match self.authed(client.get(file_url.clone())).send().await {
                Ok(response) => response,
                Err(e) => return Ok(IngestionResult::failure("webdav", e.to_string())),
            };
            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                return Ok(IngestionResult::failure(
                    "webdav",
                    super::super::http::format_status_error(status, &body),
                ));
            }

            let data = match response.bytes().await {
                Ok(bytes) => bytes.to_vec(),
                Err(e) => return Ok(IngestionResult::failure("webdav", e.to_string())),
            };
            let local = super::stage_download(&dir, &href, &data)?;
            items.push(super::downloaded_item(local, &href, data.len()));
        }

        let count = items.len();
        Ok(IngestionResult::ok("webdav", items)
            .with_metadata("file_count", serde_json::Value::from(count)))
    }

    async fn close(&mut self) -> Result<()> {
        self.client = None;
        Ok(())
    }
}

/// Pulls `href` values out of a PROPFIND multistatus body, namespace-prefix
/// agnostic.
fn parse_hrefs(body: &str) -> Result<Vec<String>> {
    let pattern = Regex::new(r"(?i)<(?:[a-z0-9]+:)?href[^>]*>([^<]+)</")?;
    Ok(pattern
        .captures_iter(body)
        .filter_map(|cap| cap.get(1))
        .map(|m| m.as_str().trim().to_string())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_requires_base_url_and_lake_root() {
        let err = WebdavConnector::from_config(ConfigMap::new()).unwrap_err();
        assert!(err
            .to_string()
            .contains("missing required keys: [base_url, lake_root]"));
    }

    #[test]
    fn test_parse_hrefs_handles_namespace_prefixes() {
        let body = r#"<?xml version="1.0"?>
            <D:multistatus xmlns:D="DAV:">
              <D:response><D:href>/dav/in/</D:href></D:response>
              <D:response><D:href>/dav/in/a.csv</D:href></D:response>
              <d:response><d:href>/dav/in/b.csv</d:href></d:response>
            </D:multistatus>"#;
        let hrefs = parse_hrefs(body).unwrap();
        assert_eq!(hrefs, vec!["/dav/in/", "/dav/in/a.csv", "/dav/in/b.csv"]);
    }

    #[tokio::test]
    async fn test_fetch_before_connect() {
        let mut config = ConfigMap::new();
        config.insert("base_url".to_string(), json!("http://dav.example/"));
        config.insert("lake_root".to_string(), json!("/tmp/lake"));
        let mut conn = WebdavConnector::from_config(config).unwrap();
        let err = conn.fetch("in/").await.unwrap_err();
        assert_eq!(err.to_string(), "not connected");
    }
}
