//! Files destined for the guest
//!
//! An [`Asset`] pairs content (an in-memory rendering or a local file) with
//! its destination path, permissions and modification time. Runners consume
//! assets to copy them into the guest; the bootstrapper builds them from
//! rendered configs and cached binaries.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::Result;

/// Timestamp layout understood by `touch -d` on the guest.
pub const MODTIME_LAYOUT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone)]
enum Source {
    Memory(Vec<u8>),
    File(PathBuf),
}

/// A file to be materialized on the guest.
#[derive(Debug, Clone)]
pub struct Asset {
    source: Source,
    target_dir: String,
    target_name: String,
    permissions: String,
    mod_time: Option<DateTime<Utc>>,
    length: u64,
}

impl Asset {
    /// An asset backed by rendered bytes.
    pub fn from_bytes(
        bytes: impl Into<Vec<u8>>,
        target_dir: impl Into<String>,
        target_name: impl Into<String>,
        permissions: impl Into<String>,
    ) -> Asset {
        let bytes = bytes.into();
        Asset {
            length: bytes.len() as u64,
            source: Source::Memory(bytes),
            target_dir: target_dir.into(),
            target_name: target_name.into(),
            permissions: permissions.into(),
            mod_time: None,
        }
    }

    /// An asset backed by a local file; length and modtime come from the
    /// file's metadata.
    pub async fn from_file(
        source: impl Into<PathBuf>,
        target_dir: impl Into<String>,
        target_name: impl Into<String>,
        permissions: impl Into<String>,
    ) -> Result<Asset> {
        let source = source.into();
        let meta = tokio::fs::metadata(&source).await?;
        let mod_time = meta.modified().ok().map(DateTime::<Utc>::from);
        Ok(Asset {
            length: meta.len(),
            source: Source::File(source),
            target_dir: target_dir.into(),
            target_name: target_name.into(),
            permissions: permissions.into(),
            mod_time,
        })
    }

    /// Destination directory on the guest.
    pub fn target_dir(&self) -> &str {
        &self.target_dir
    }

    /// Destination file name on the guest.
    pub fn target_name(&self) -> &str {
        &self.target_name
    }

    /// Full destination path on the guest.
    pub fn target_path(&self) -> String {
        format!(
            "{}/{}",
            self.target_dir.trim_end_matches('/'),
            self.target_name
        )
    }

    /// Octal permission string, e.g. "0640".
    pub fn permissions(&self) -> &str {
        &self.permissions
    }

    /// Content length in bytes.
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Source modification time, when known.
    pub fn mod_time(&self) -> Option<DateTime<Utc>> {
        self.mod_time
    }

    /// Source path for file-backed assets (used by local copies).
    pub fn source_path(&self) -> Option<&Path> {
        match &self.source {
            Source::File(p) => Some(p),
            Source::Memory(_) => None,
        }
    }

    /// Open a streaming reader over the content.
    pub async fn reader(&self) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
        match &self.source {
            Source::Memory(bytes) => Ok(Box::new(std::io::Cursor::new(bytes.clone()))),
            Source::File(path) => {
                let file = tokio::fs::File::open(path).await?;
                Ok(Box::new(file))
            }
        }
    }

    /// Read the full content into memory.
    pub async fn bytes(&self) -> Result<Vec<u8>> {
        match &self.source {
            Source::Memory(bytes) => Ok(bytes.clone()),
            Source::File(path) => Ok(tokio::fs::read(path).await?),
        }
    }

    /// Hex sha256 of the content, streamed so large binaries don't need to
    /// fit in memory twice.
    pub async fn sha256(&self) -> Result<String> {
        let mut reader = self.reader().await?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hex::encode(hasher.finalize()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_path_joins_dir_and_name() {
        let a = Asset::from_bytes(b"x".to_vec(), "/etc/kubernetes/", "admin.conf", "0640");
        assert_eq!(a.target_path(), "/etc/kubernetes/admin.conf");
        assert_eq!(a.length(), 1);
        assert_eq!(a.permissions(), "0640");
    }

    #[tokio::test]
    async fn file_backed_assets_carry_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("kubelet");
        tokio::fs::write(&src, b"binary-bytes").await.unwrap();

        let a = Asset::from_file(&src, "/var/lib/minikube/binaries", "kubelet", "0755")
            .await
            .unwrap();
        assert_eq!(a.length(), 12);
        assert!(a.mod_time().is_some());
        assert_eq!(a.bytes().await.unwrap(), b"binary-bytes");
    }

    #[tokio::test]
    async fn sha256_matches_known_digest() {
        let a = Asset::from_bytes(b"hello".to_vec(), "/tmp", "f", "0644");
        assert_eq!(
            a.sha256().await.unwrap(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }
}
