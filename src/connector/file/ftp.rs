//! FTP connector over suppaftp's blocking stream, driven through
//! `spawn_blocking` so the async host never stalls on the control channel.

use async_trait::async_trait;
use suppaftp::FtpStream;
use tracing::{debug, info, warn};

use crate::config::{expect_str, get_bool, get_str, get_u64, require_keys, ConfigMap};
use crate::connector::{guard_fetch, Connector};
use crate::envelope::{IngestedItem, IngestionResult};
use crate::errors::{OmnitapError, Result};

pub fn factory(config: ConfigMap) -> Result<Box<dyn Connector>> {
    Ok(Box::new(FtpConnector::from_config(config)?))
}

pub struct FtpConnector {
    config: ConfigMap,
    stream: Option<FtpStream>,
}

impl std::fmt::Debug for FtpConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FtpConnector")
            .field("config", &self.config)
            .field("stream", &self.stream.is_some())
            .finish()
    }
}

impl FtpConnector {
    pub fn from_config(config: ConfigMap) -> Result<Self> {
        require_keys(&config, &["host", "lake_root"])?;
        Ok(Self {
            config,
            stream: None,
        })
    }
}

#[async_trait]
impl Connector for FtpConnector {
    fn protocol(&self) -> &str {
        "ftp"
    }

    async fn connect(&mut self) -> Result<()> {
        let host = expect_str(&self.config, "host")?;
        let port = get_u64(&self.config, "port").unwrap_or(21);
        let user = get_str(&self.config, "user").unwrap_or_else(|| "anonymous".to_string());
        let password = get_str(&self.config, "password").unwrap_or_default();

        let timeout = get_u64(&self.config, "timeout_secs").unwrap_or(30);
        let addr = format!("{host}:{port}");
        let connect = tokio::task::spawn_blocking(move || -> Result<FtpStream> {
            let mut stream = FtpStream::connect(&addr)?;
            stream.login(&user, &password)?;
            Ok(stream)
        });
        let stream = match tokio::time::timeout(std::time::Duration::from_secs(timeout), connect)
            .await
        {
            Ok(joined) => joined??,
            Err(_) => {
                return Err(OmnitapError::ConnectorError(format!(
                    "ftp connect timeout after {timeout}s"
                )))
            }
        };

        info!(host, port, "ftp connector connected");
        self.stream = Some(stream);
        Ok(())
    }

    async fn fetch(&mut self, query: &str) -> Result<IngestionResult> {
        guard_fetch(self.stream.is_some(), query)?;
        let mut stream = self.stream.take().ok_or(OmnitapError::NotConnected)?;

        let remote_path = query.trim().to_string();
        let dir = super::download_dir(&self.config, "ftp")?;
        let recursive = get_bool(&self.config, "recursive").unwrap_or(false);

        let (stream_back, outcome) = tokio::task::spawn_blocking(
            move || -> (FtpStream, Result<Vec<IngestedItem>>) {
                let outcome = download_tree(&mut stream, &remote_path, &dir, recursive, 0);
                (stream, outcome)
            },
        )
        .await?;
        self.stream = Some(stream_back);

        match outcome {
            Ok(items) => {
                let count = items.len();
                Ok(IngestionResult::ok("ftp", items)
                    .with_metadata("file_count", serde_json::Value::from(count)))
            }
            Err(e) => Ok(IngestionResult::failure("ftp", e.to_string())),
        }
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            let quit = tokio::task::spawn_blocking(move || stream.quit()).await?;
            if let Err(e) = quit {
                warn!("ftp quit failed: {e}");
            }
        }
        Ok(())
    }
}

/// Depth guard for `recursive = true` listings.
const MAX_DEPTH: usize = 16;

fn download_tree(
    stream: &mut FtpStream,
    remote_path: &str,
    dir: &std::path::Path,
    recursive: bool,
    depth: usize,
) -> Result<Vec<IngestedItem>> {
    if depth > MAX_DEPTH {
        return Err(OmnitapError::ConnectorError(format!(
            "ftp listing exceeded max depth at {remote_path}"
        )));
    }

    let names = stream.nlst(Some(remote_path))?;
    let mut items = Vec::new();

    for name in names {
        let remote = if name.contains('/') {
            name.clone()
        } else {
            format!("{}/{}", remote_path.trim_end_matches('/'), name)
        };
        // Some servers list a plain file as itself.
        if remote == remote_path {
            continue;
        }

        if super::is_parquet_name(&remote) {
            match stream.retr_as_buffer(&remote) {
                Ok(buffer) => {
                    let data = buffer.into_inner();
                    let local = super::stage_download(dir, &remote, &data)?;
                    items.push(super::downloaded_item(local, &remote, data.len()));
                }
                Err(e) => warn!(remote, "ftp retr skipped: {e}"),
            }
        } else if recursive {
            match download_tree(stream, &remote, dir, recursive, depth + 1) {
                Ok(children) => items.extend(children),
                Err(child_err) => {
                    warn!(remote, "ftp descend failed: {child_err}");
                }
            }
        } else {
            // Directories and non-Parquet artifacts fall outside the
            // staged-file contract.
            debug!(remote, "skipping non-parquet entry");
        }
    }

    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_requires_host_and_lake_root() {
        let err = FtpConnector::from_config(ConfigMap::new()).unwrap_err();
        assert!(err
            .to_string()
            .contains("missing required keys: [host, lake_root]"));
    }

    #[tokio::test]
    async fn test_fetch_before_connect() {
        let mut config = ConfigMap::new();
        config.insert("host".to_string(), json!("ftp.example"));
        config.insert("lake_root".to_string(), json!("/tmp/lake"));
        let mut conn = FtpConnector::from_config(config).unwrap();
        let err = conn.fetch("/incoming").await.unwrap_err();
        assert_eq!(err.to_string(), "not connected");
    }
}
