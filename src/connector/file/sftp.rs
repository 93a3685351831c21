//! SFTP connector over libssh2. The session is blocking; every remote
//! operation runs under `spawn_blocking`.

use std::io::Read;
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use ssh2::{Session, Sftp};
use tracing::{debug, info, warn};

use crate::config::{expect_str, get_bool, get_str, get_u64, require_keys, ConfigMap};
use crate::connector::{guard_fetch, Connector};
use crate::envelope::{IngestedItem, IngestionResult};
use crate::errors::{OmnitapError, Result};

pub fn factory(config: ConfigMap) -> Result<Box<dyn Connector>> {
    Ok(Box::new(SftpConnector::from_config(config)?))
}

pub struct SftpConnector {
    config: ConfigMap,
    session: Option<(Session, Sftp)>,
}

impl std::fmt::Debug for SftpConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SftpConnector")
            .field("config", &self.config)
            .field("session", &self.session.is_some())
            .finish()
    }
}

impl SftpConnector {
    pub fn from_config(config: ConfigMap) -> Result<Self> {
        require_keys(&config, &["host", "user", "lake_root"])?;
        Ok(Self {
            config,
            session: None,
        })
    }
}

#[async_trait]
impl Connector for SftpConnector {
    fn protocol(&self) -> &str {
        "sftp"
    }

    async fn connect(&mut self) -> Result<()> {
        let host = expect_str(&self.config, "host")?;
        let port = get_u64(&self.config, "port").unwrap_or(22);
        let user = expect_str(&self.config, "user")?;
        let password = get_str(&self.config, "password");
        let key_path = get_str(&self.config, "key_path");
        let timeout = get_u64(&self.config, "timeout_secs").unwrap_or(30);

        let pair = tokio::task::spawn_blocking(move || -> Result<(Session, Sftp)> {
            use std::net::ToSocketAddrs;
            let addr = format!("{host}:{port}")
                .to_socket_addrs()?
                .next()
                .ok_or_else(|| {
                    OmnitapError::ConnectorError(format!("cannot resolve sftp host {host}"))
                })?;
            let tcp = TcpStream::connect_timeout(&addr, Duration::from_secs(timeout))?;
            tcp.set_read_timeout(Some(Duration::from_secs(timeout)))?;
            tcp.set_write_timeout(Some(Duration::from_secs(timeout)))?;

            let mut session = Session::new()?;
            session.set_tcp_stream(tcp);
            session.handshake()?;

            match (&password, &key_path) {
                (_, Some(key)) => {
                    session.userauth_pubkey_file(&user, None, Path::new(key), None)?
                }
                (Some(password), None) => session.userauth_password(&user, password)?,
                (None, None) => {
                    return Err(OmnitapError::ConfigError(
                        "missing required keys: [password] (or [key_path])".to_string(),
                    ))
                }
            }

            let sftp = session.sftp()?;
            Ok((session, sftp))
        })
        .await??;

        info!(
            host = %expect_str(&self.config, "host")?,
            "sftp connector connected"
        );
        self.session = Some(pair);
        Ok(())
    }

    async fn fetch(&mut self, query: &str) -> Result<IngestionResult> {
        guard_fetch(self.session.is_some(), query)?;
        let (session, sftp) = self.session.take().ok_or(OmnitapError::NotConnected)?;

        let remote_path = PathBuf::from(query.trim());
        let dir = super::download_dir(&self.config, "sftp")?;
        let recursive = get_bool(&self.config, "recursive").unwrap_or(false);

        let (pair, outcome) = tokio::task::spawn_blocking(
            move || -> ((Session, Sftp), Result<Vec<IngestedItem>>) {
                let outcome = download_tree(&sftp, &remote_path, &dir, recursive, 0);
                ((session, sftp), outcome)
            },
        )
        .await?;
        self.session = Some(pair);

        match outcome {
            Ok(items) => {
                let count = items.len();
                Ok(IngestionResult::ok("sftp", items)
                    .with_metadata("file_count", serde_json::Value::from(count)))
            }
            Err(e) => Ok(IngestionResult::failure("sftp", e.to_string())),
        }
    }

    async fn close(&mut self) -> Result<()> {
        if let Some((session, sftp)) = self.session.take() {
            let shutdown = tokio::task::spawn_blocking(move || {
                drop(sftp);
                session.disconnect(None, "shutdown", None)
            })
            .await?;
            if let Err(e) = shutdown {
                warn!("sftp disconnect failed: {e}");
            }
        }
        Ok(())
    }
}

const MAX_DEPTH: usize = 16;

fn download_tree(
    sftp: &Sftp,
    remote_path: &Path,
    dir: &Path,
    recursive: bool,
    depth: usize,
) -> Result<Vec<IngestedItem>> {
    if depth > MAX_DEPTH {
        return Err(OmnitapError::ConnectorError(format!(
            "sftp listing exceeded max depth at {}",
            remote_path.display()
        )));
    }

    let entries = sftp.readdir(remote_path)?;
    let mut items = Vec::new();

    for (path, stat) in entries {
        if stat.is_dir() {
            if recursive {
                items.extend(download_tree(sftp, &path, dir, recursive, depth + 1)?);
            }
            continue;
        }

        let remote_name = path.to_string_lossy().to_string();
        if !super::is_parquet_name(&remote_name) {
            // Only Parquet artifacts satisfy the staged-file contract.
            debug!(remote = remote_name, "skipping non-parquet entry");
            continue;
        }

        let mut remote_file = sftp.open(&path)?;
        let mut data = Vec::new();
        remote_file.read_to_end(&mut data)?;

        let local = super::stage_download(dir, &remote_name, &data)?;
        items.push(super::downloaded_item(local, &remote_name, data.len()));
    }

    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_requires_host_user_lake_root() {
        let err = SftpConnector::from_config(ConfigMap::new()).unwrap_err();
        assert!(err
            .to_string()
            .contains("missing required keys: [host, user, lake_root]"));
    }

    #[tokio::test]
    async fn test_fetch_before_connect() {
        let mut config = ConfigMap::new();
        config.insert("host".to_string(), json!("sftp.example"));
        config.insert("user".to_string(), json!("etl"));
        config.insert("lake_root".to_string(), json!("/tmp/lake"));
        let mut conn = SftpConnector::from_config(config).unwrap();
        let err = conn.fetch("/incoming").await.unwrap_err();
        assert_eq!(err.to_string(), "not connected");
    }
}
