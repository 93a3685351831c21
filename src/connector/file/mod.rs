//! File-server connectors (FTP, SFTP, WebDAV).
//!
//! All three share one discipline: enumerate a remote path (single level by
//! default), download each file into the local staging partition for the
//! connector's protocol/source, atomically (temp sibling + rename), and
//! return one pre-staged item per downloaded file.
//!
//! Pre-staged items feed the loader directly, so file connectors only ingest
//! remote Parquet artifacts; entries with any other extension are skipped at
//! enumeration time. Local names fold the remote directory path into the
//! filename (same-named files from different remote directories never
//! collide) and take a random suffix when the name is already staged, so
//! staged filenames stay unique within a partition.

use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::config::{expect_str, get_str, ConfigMap};
use crate::envelope::{IngestedItem, Row};
use crate::errors::Result;
use crate::staging;

pub mod ftp;
pub mod sftp;
pub mod webdav;

/// Resolves the staging target directory for a file connector.
///
/// File connectors stage at fetch time, so `lake_root` is part of their
/// config; the partition source defaults to the remote host.
pub(crate) fn download_dir(config: &ConfigMap, protocol: &str) -> Result<PathBuf> {
    let lake_root = expect_str(config, "lake_root")?;
    let source = get_str(config, "source_name")
        .or_else(|| get_str(config, "host"))
        .unwrap_or_else(|| protocol.to_string());
    Ok(staging::partition_dir(
        Path::new(&lake_root),
        protocol,
        &source,
    ))
}

/// Whether a remote entry satisfies the columnar staged-file contract.
pub(crate) fn is_parquet_name(remote: &str) -> bool {
    remote.to_ascii_lowercase().ends_with(".parquet")
}

/// Local staged name for a remote file. The remote directory path is folded
/// into the name so `/a/index.parquet` and `/b/index.parquet` stage to
/// distinct files; the extension survives for the loader.
pub(crate) fn staged_local_name(remote: &str) -> String {
    let trimmed = remote.trim_matches(['/', '\\']);
    match trimmed.rsplit_once(['/', '\\']) {
        Some((dir, base)) if !dir.is_empty() => {
            format!("{}_{base}", staging::safe_source_name(dir))
        }
        _ => base_name(remote),
    }
}

/// Writes downloaded bytes under `dir`, atomically, never clobbering an
/// already-staged file: a taken name gets a random digit suffix before the
/// extension, like the staging writer's collision handling.
pub(crate) fn stage_download(dir: &Path, remote: &str, data: &[u8]) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;

    let name = staged_local_name(remote);
    let mut target = dir.join(&name);
    while target.exists() {
        let suffix = nanoid::nanoid!(3, &['0', '1', '2', '3', '4', '5', '6', '7', '8', '9']);
        let suffixed = match name.rsplit_once('.') {
            Some((stem, ext)) => format!("{stem}_{suffix}.{ext}"),
            None => format!("{name}_{suffix}"),
        };
        target = dir.join(suffixed);
    }

    let file_name = target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| name.clone());
    let tmp = dir.join(format!(".{file_name}.part"));
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, &target)?;
    Ok(target)
}

/// Pre-staged envelope item for one downloaded file.
pub(crate) fn downloaded_item(local: PathBuf, remote: &str, bytes: usize) -> IngestedItem {
    let mut metadata = Row::new();
    metadata.insert("remote_path".to_string(), Value::String(remote.to_string()));
    metadata.insert("size_bytes".to_string(), Value::from(bytes));
    IngestedItem::staged(local).with_metadata(metadata)
}

/// Last path segment of a remote name.
pub(crate) fn base_name(remote: &str) -> String {
    remote
        .rsplit(['/', '\\'])
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or(remote)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_name() {
        assert_eq!(base_name("/data/in/report.csv"), "report.csv");
        assert_eq!(base_name("report.csv"), "report.csv");
        assert_eq!(base_name("dir\\file.bin"), "file.bin");
    }

    #[test]
    fn test_is_parquet_name() {
        assert!(is_parquet_name("/data/in/batch.parquet"));
        assert!(is_parquet_name("BATCH.PARQUET"));
        assert!(!is_parquet_name("/data/in/batch.csv"));
        assert!(!is_parquet_name("/data/in"));
    }

    #[test]
    fn test_staged_local_name_folds_remote_dirs() {
        assert_eq!(staged_local_name("/a/index.parquet"), "a_index.parquet");
        assert_eq!(staged_local_name("/b/index.parquet"), "b_index.parquet");
        assert_eq!(staged_local_name("report.parquet"), "report.parquet");
        assert_eq!(staged_local_name("dir\\file.parquet"), "dir_file.parquet");
        assert_eq!(
            staged_local_name("/dav.v2/in/x.parquet"),
            "dav_v2_in_x.parquet"
        );
    }

    #[test]
    fn test_stage_download_is_atomic() {
        let tmp = tempfile::TempDir::new().unwrap();
        let target = stage_download(tmp.path(), "a.parquet", b"abc").unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"abc");
        // No partial file remains.
        assert!(!tmp.path().join(".a.parquet.part").exists());
    }

    #[test]
    fn test_stage_download_never_clobbers() {
        let tmp = tempfile::TempDir::new().unwrap();

        // Same basename, different remote directories: distinct targets.
        let first = stage_download(tmp.path(), "/a/index.parquet", b"one").unwrap();
        let second = stage_download(tmp.path(), "/b/index.parquet", b"two").unwrap();
        assert_ne!(first, second);

        // Re-downloading the same remote suffixes instead of overwriting.
        let third = stage_download(tmp.path(), "/a/index.parquet", b"three").unwrap();
        assert_ne!(first, third);
        assert_eq!(std::fs::read(&first).unwrap(), b"one");
        assert_eq!(std::fs::read(&second).unwrap(), b"two");
        assert_eq!(std::fs::read(&third).unwrap(), b"three");
        assert!(third
            .file_name()
            .unwrap()
            .to_string_lossy()
            .ends_with(".parquet"));
    }

    #[test]
    fn test_downloaded_item_shape() {
        let item = downloaded_item(
            PathBuf::from("/lake/ftp/h/2026-01-01/in_a.parquet"),
            "/in/a.parquet",
            3,
        );
        assert!(item.lake_path().is_some());
        let metadata = item.metadata.unwrap();
        assert_eq!(
            metadata["remote_path"],
            Value::String("/in/a.parquet".into())
        );
        assert_eq!(metadata["size_bytes"], Value::from(3));
    }
}
