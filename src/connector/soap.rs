//! SOAP connector: binds to a WSDL at connect time, then invokes an
//! operation per fetch by POSTing a SOAP 1.1 envelope. Parameters come from
//! the connector config; basic-auth credentials are supported and redacted.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::{expect_str, get_str, get_u64, require_keys, ConfigMap};
use crate::connector::{guard_fetch, Connector};
use crate::envelope::{IngestedItem, IngestionResult, Row};
use crate::errors::{OmnitapError, Result};

pub fn factory(config: ConfigMap) -> Result<Box<dyn Connector>> {
    Ok(Box::new(SoapConnector::from_config(config)?))
}

const DEFAULT_NAMESPACE: &str = "urn:omnitap";

#[derive(Debug)]
pub struct SoapConnector {
    config: ConfigMap,
    client: Option<Client>,
    wsdl: Option<String>,
}

impl SoapConnector {
    pub fn from_config(config: ConfigMap) -> Result<Self> {
        require_keys(&config, &["wsdl_url"])?;
        Ok(Self {
            config,
            client: None,
            wsdl: None,
        })
    }

    fn credentials(&self) -> Option<(String, String)> {
        let user = get_str(&self.config, "username")?;
        let password = get_str(&self.config, "password").unwrap_or_default();
        Some((user, password))
    }

    /// Service endpoint: explicit config, else the WSDL URL without its query.
    fn endpoint(&self) -> Result<String> {
        if let Some(endpoint) = get_str(&self.config, "endpoint") {
            return Ok(endpoint);
        }
        let wsdl_url = expect_str(&self.config, "wsdl_url")?;
        Ok(wsdl_url
            .split_once('?')
            .map(|(base, _)| base.to_string())
            .unwrap_or(wsdl_url))
    }

    fn build_envelope(&self, operation: &str) -> String {
        let namespace =
            get_str(&self.config, "namespace").unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());

        let mut params = String::new();
        if let Some(Value::Object(map)) = self.config.get("parameters") {
            for (name, value) in map {
                let text = match value {
                    Value::String(s) => xml_escape(s),
                    other => xml_escape(&other.to_string()),
                };
                params.push_str(&format!("<{name}>{text}</{name}>"));
            }
        }

        format!(
            "<soapenv:Envelope xmlns:soapenv=\"http://schemas.xmlsoap.org/soap/envelope/\" \
             xmlns:tns=\"{namespace}\">\
             <soapenv:Header/>\
             <soapenv:Body><tns:{operation}>{params}</tns:{operation}></soapenv:Body>\
             </soapenv:Envelope>"
        )
    }
}

#[async_trait]
impl Connector for SoapConnector {
    fn protocol(&self) -> &str {
        "soap"
    }

    async fn connect(&mut self) -> Result<()> {
        let timeout = get_u64(&self.config, "timeout_secs").unwrap_or(30);
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout))
            .build()?;

        let wsdl_url = expect_str(&self.config, "wsdl_url")?;
        let mut request = client.get(&wsdl_url);
        if let Some((user, password)) = self.credentials() {
            request = request.basic_auth(user, Some(password));
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(OmnitapError::ConnectorError(format!(
                "wsdl fetch failed with status {}",
                response.status().as_u16()
            )));
        }
        let wsdl = response.text().await?;

        info!(wsdl_url, bytes = wsdl.len(), "soap connector bound to wsdl");
        self.wsdl = Some(wsdl);
        self.client = Some(client);
        Ok(())
    }

    async fn fetch(&mut self, query: &str) -> Result<IngestionResult> {
        guard_fetch(self.client.is_some(), query)?;
        let client = self.client.as_ref().ok_or(OmnitapError::NotConnected)?;

        let operation = query.trim();
        let endpoint = self.endpoint()?;
        let envelope = self.build_envelope(operation);
        let action = get_str(&self.config, "soap_action").unwrap_or_else(|| {
            let namespace =
                get_str(&self.config, "namespace").unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());
            format!("{namespace}#{operation}")
        });
        debug!(endpoint, operation, "soap invoke");

        let mut request = client
            .post(&endpoint)
            .header("Content-Type", "text/xml; charset=utf-8")
            .header("SOAPAction", action)
            .body(envelope);
        if let Some((user, password)) = self.credentials() {
            request = request.basic_auth(user, Some(password));
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => return Ok(IngestionResult::failure("soap", e.to_string())),
        };

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Ok(IngestionResult::failure(
                "soap",
                super::http::format_status_error(status, &body),
            ));
        }

        let mut metadata = Row::new();
        metadata.insert("operation".to_string(), Value::String(operation.to_string()));
        let item = IngestedItem::scalar(Value::String(body)).with_metadata(metadata);

        Ok(IngestionResult::ok("soap", vec![item]))
    }

    async fn close(&mut self) -> Result<()> {
        self.client = None;
        self.wsdl = None;
        Ok(())
    }
}

fn xml_escape(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
