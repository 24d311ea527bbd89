//! Binary and image cache
//!
//! `start --download-only` (and every cold start) populates
//! `<home>/cache/<os>/<version>/<binary>` with release binaries and
//! `<home>/cache/images/` with image tarballs, without touching any
//! machine. Downloads verify the published sha256 when one is available
//! and are atomic on disk.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::runner::{Command, ExecRunner};
use crate::runner::CommandRunner;
use crate::{constants, Error, Result};

/// Downloads and caches release binaries.
pub struct BinaryCache {
    home: PathBuf,
    client: reqwest::Client,
}

impl BinaryCache {
    /// A cache rooted at the minikube home.
    pub fn new(home: impl Into<PathBuf>) -> BinaryCache {
        BinaryCache {
            home: home.into(),
            client: reqwest::Client::new(),
        }
    }

    /// Ensure `name` for `version` is cached; returns the cached path.
    ///
    /// An existing file short-circuits. Downloads land in a `.download`
    /// temp file and are renamed only after the checksum passes.
    pub async fn cache_binary(
        &self,
        os: &str,
        arch: &str,
        version: &str,
        name: &str,
    ) -> Result<PathBuf> {
        let dest = constants::cached_binary_path(&self.home, os, version, name);
        if dest.exists() {
            debug!(path = %dest.display(), "binary already cached");
            return Ok(dest);
        }
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let url = constants::binary_download_url(os, arch, version, name);
        info!(url = %url, "downloading");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::config(format!("downloading {}: {}", url, e)))?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::config(format!("downloading {}: {}", url, e)))?;

        if let Some(expected) = self.fetch_checksum(&url).await {
            let actual = hex::encode(Sha256::digest(&bytes));
            if actual != expected {
                return Err(Error::config(format!(
                    "checksum mismatch for {}: got {}, want {}",
                    url, actual, expected
                )));
            }
        }

        let tmp = dest.with_extension("download");
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o755)).await?;
        }
        tokio::fs::rename(&tmp, &dest).await?;
        Ok(dest)
    }

    /// The published sha256 for a release URL, when one exists.
    async fn fetch_checksum(&self, url: &str) -> Option<String> {
        let checksum_url = format!("{}.sha256", url);
        let response = self
            .client
            .get(&checksum_url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .ok()?;
        let body = response.text().await.ok()?;
        let sum = body.split_whitespace().next()?.to_string();
        if sum.len() == 64 {
            Some(sum)
        } else {
            warn!(url = %checksum_url, "unparseable checksum, skipping verification");
            None
        }
    }

    /// Ensure all kube binaries for a version are cached.
    pub async fn cache_binaries(&self, os: &str, arch: &str, version: &str) -> Result<Vec<PathBuf>> {
        let mut paths = Vec::new();
        for name in constants::KUBE_BINARIES {
            paths.push(self.cache_binary(os, arch, version, name).await?);
        }
        Ok(paths)
    }
}

/// Export images into the cache through the local docker daemon.
///
/// Each image is pulled then saved as a tarball under `cache/images/` with
/// `:` replaced by `_`; existing tarballs short-circuit.
pub async fn cache_images(home: &Path, images: &[String]) -> Result<Vec<PathBuf>> {
    let local = ExecRunner::new();
    let mut paths = Vec::new();

    for image in images {
        let dest = constants::cached_image_path(home, image);
        if dest.exists() {
            debug!(image = %image, "image already cached");
            paths.push(dest);
            continue;
        }
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        info!(image = %image, "caching image");
        local
            .run_cmd(Command::new(["docker", "pull", image]))
            .await?;

        let tmp = dest.with_extension("download");
        local
            .run_cmd(Command::new([
                "docker".to_string(),
                "save".to_string(),
                "-o".to_string(),
                tmp.display().to_string(),
                image.clone(),
            ]))
            .await?;
        tokio::fs::rename(&tmp, &dest).await?;
        paths.push(dest);
    }
    Ok(paths)
}

/// Load cached image tarballs into the guest's runtime via the runner.
pub async fn load_cached_images(
    runner: &dyn CommandRunner,
    home: &Path,
    images: &[String],
) -> Result<()> {
    for image in images {
        let src = constants::cached_image_path(home, image);
        if !src.exists() {
            debug!(image = %image, "not cached, will be pulled by kubeadm");
            continue;
        }
        let name = format!("{}.tar", image.replace(['/', ':'], "_"));
        let asset = crate::assets::Asset::from_file(&src, "/tmp", name.as_str(), "0644").await?;
        runner.copy_file(&asset).await?;
        runner
            .run_cmd(Command::shell(format!(
                "sudo docker load -i /tmp/{} && sudo rm -f /tmp/{}",
                name, name
            )))
            .await?;
    }
    Ok(())
}
