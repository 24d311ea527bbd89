//! CRI-O runtime driver

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::assets::Asset;
use crate::runner::{Command, CommandRunner};
use crate::Result;

use super::{crictl_list, crictl_verb, find_preload_tarball, ListOptions, Runtime};

/// Default CRI-O socket.
const CRIO_SOCKET: &str = "/var/run/crio/crio.sock";

/// Drives CRI-O inside the guest.
pub struct CriO {
    runner: Arc<dyn CommandRunner>,
    socket: String,
}

impl CriO {
    /// A CRI-O runtime over the given runner.
    pub fn new(runner: Arc<dyn CommandRunner>, socket_override: Option<String>) -> CriO {
        CriO {
            runner,
            socket: socket_override.unwrap_or_else(|| CRIO_SOCKET.to_string()),
        }
    }
}

#[async_trait]
impl Runtime for CriO {
    fn name(&self) -> &'static str {
        "cri-o"
    }

    fn socket_path(&self) -> String {
        self.socket.clone()
    }

    async fn version(&self) -> Result<String> {
        let rr = self.runner.run_cmd(Command::shell("crio --version")).await?;
        // First line reads "crio version x.y.z".
        Ok(rr
            .stdout_str()
            .lines()
            .next()
            .and_then(|l| l.split_whitespace().last())
            .unwrap_or_default()
            .to_string())
    }

    async fn enable(&self) -> Result<()> {
        // Point crio at the overlay storage driver; the stock config on
        // the base image defaults to vfs which is unusably slow.
        self.runner
            .run_cmd(Command::shell(
                "sudo sed -i 's|^storage_driver.*|storage_driver = \"overlay\"|' /etc/crio/crio.conf",
            ))
            .await?;
        self.runner
            .run_cmd(Command::shell(
                "sudo systemctl unmask crio && sudo systemctl enable crio && sudo systemctl restart crio",
            ))
            .await?;
        Ok(())
    }

    async fn disable(&self) -> Result<()> {
        self.runner
            .run_cmd(Command::shell("sudo systemctl stop crio"))
            .await?;
        Ok(())
    }

    async fn list_containers(&self, opts: ListOptions) -> Result<Vec<String>> {
        crictl_list(self.runner.as_ref(), &self.socket, opts).await
    }

    async fn stop_containers(&self, ids: &[String]) -> Result<()> {
        crictl_verb(self.runner.as_ref(), &self.socket, "stop", ids).await
    }

    async fn kill_containers(&self, ids: &[String]) -> Result<()> {
        crictl_verb(self.runner.as_ref(), &self.socket, "rm -f", ids).await
    }

    async fn pause_containers(&self, ids: &[String]) -> Result<()> {
        crictl_verb(self.runner.as_ref(), &self.socket, "pause", ids).await
    }

    async fn unpause_containers(&self, ids: &[String]) -> Result<()> {
        crictl_verb(self.runner.as_ref(), &self.socket, "unpause", ids).await
    }

    async fn preload(&self, cache_home: &Path, k8s_version: &str) -> Result<()> {
        let Some(tarball) = find_preload_tarball(cache_home, k8s_version) else {
            warn!(version = k8s_version, "no preloaded tarball, images will be pulled");
            return Ok(());
        };
        debug!(tarball = %tarball.display(), "extracting preloaded images");

        let name = tarball.file_name().unwrap_or_default().to_string_lossy().to_string();
        let asset = Asset::from_file(&tarball, "/", name.as_str(), "0644").await?;
        self.runner.copy_file(&asset).await?;

        let decompress = if name.ends_with(".lz4") { "-I lz4 " } else { "" };
        self.runner
            .run_cmd(Command::shell(format!(
                "sudo tar {}-C /var -xf /{} && sudo rm -f /{} && sudo systemctl restart crio",
                decompress, name, name
            )))
            .await?;
        Ok(())
    }

    fn kubelet_options(&self) -> BTreeMap<String, String> {
        let mut opts = BTreeMap::new();
        opts.insert("container-runtime".to_string(), "remote".to_string());
        opts.insert(
            "container-runtime-endpoint".to_string(),
            format!("unix://{}", self.socket),
        );
        opts.insert("image-service-endpoint".to_string(), format!("unix://{}", self.socket));
        opts.insert("runtime-request-timeout".to_string(), "15m".to_string());
        opts
    }

    async fn cgroup_driver(&self) -> Result<String> {
        Ok("systemd".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::FakeRunner;

    #[tokio::test]
    async fn version_parses_first_line() {
        let fake = Arc::new(FakeRunner::new());
        fake.stub("crio --version", "crio version 1.17.3\ncommit: abc\n");
        let rt = CriO::new(fake, None);
        assert_eq!(rt.version().await.unwrap(), "1.17.3");
    }

    #[tokio::test]
    async fn cgroup_driver_is_systemd() {
        let rt = CriO::new(Arc::new(FakeRunner::new()), None);
        assert_eq!(rt.cgroup_driver().await.unwrap(), "systemd");
    }
}
