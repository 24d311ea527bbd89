//! containerd runtime driver

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::assets::Asset;
use crate::runner::{Command, CommandRunner};
use crate::Result;

use super::{crictl_list, crictl_verb, find_preload_tarball, ListOptions, Runtime};

/// Default containerd CRI socket.
const CONTAINERD_SOCKET: &str = "/run/containerd/containerd.sock";

/// Daemon configuration enabling the CRI plugin with systemd-friendly
/// defaults.
const CONTAINERD_CONFIG: &str = r#"root = "/var/lib/containerd"
state = "/run/containerd"
oom_score = 0

[grpc]
  address = "/run/containerd/containerd.sock"
  uid = 0
  gid = 0

[plugins."io.containerd.grpc.v1.cri"]
  stream_server_address = ""
  stream_server_port = "10010"
  enable_selinux = false
  sandbox_image = "k8s.gcr.io/pause:3.1"
  restrict_oom_score_adj = false

[plugins."io.containerd.grpc.v1.cri".containerd]
  snapshotter = "overlayfs"
  no_pivot = true
"#;

/// Drives containerd inside the guest.
pub struct Containerd {
    runner: Arc<dyn CommandRunner>,
    socket: String,
}

impl Containerd {
    /// A containerd runtime over the given runner.
    pub fn new(runner: Arc<dyn CommandRunner>, socket_override: Option<String>) -> Containerd {
        Containerd {
            runner,
            socket: socket_override.unwrap_or_else(|| CONTAINERD_SOCKET.to_string()),
        }
    }
}

#[async_trait]
impl Runtime for Containerd {
    fn name(&self) -> &'static str {
        "containerd"
    }

    fn socket_path(&self) -> String {
        self.socket.clone()
    }

    async fn version(&self) -> Result<String> {
        let rr = self
            .runner
            .run_cmd(Command::shell("containerd --version"))
            .await?;
        Ok(rr.stdout_str().trim().to_string())
    }

    async fn enable(&self) -> Result<()> {
        let config = Asset::from_bytes(
            CONTAINERD_CONFIG.as_bytes().to_vec(),
            "/etc/containerd",
            "config.toml",
            "0644",
        );
        self.runner.copy_file(&config).await?;
        self.runner
            .run_cmd(Command::shell(
                "sudo systemctl unmask containerd && sudo systemctl enable containerd && sudo systemctl restart containerd",
            ))
            .await?;
        Ok(())
    }

    async fn disable(&self) -> Result<()> {
        self.runner
            .run_cmd(Command::shell("sudo systemctl stop containerd"))
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
                "sudo tar {}-C /var -xf /{} && sudo rm -f /{} && sudo systemctl restart containerd",
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
        Ok("cgroupfs".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cruntime::ContainerState;
    use crate::runner::FakeRunner;

    #[tokio::test]
    async fn kubelet_options_point_at_the_cri_socket() {
        let rt = Containerd::new(Arc::new(FakeRunner::new()), None);
        let opts = rt.kubelet_options();
        assert_eq!(opts.get("container-runtime").unwrap(), "remote");
        assert_eq!(
            opts.get("container-runtime-endpoint").unwrap(),
            "unix:///run/containerd/containerd.sock"
        );
    }

    #[tokio::test]
    async fn enable_writes_config_and_restarts() {
        let fake = Arc::new(FakeRunner::new());
        let rt = Containerd::new(fake.clone(), None);
        rt.enable().await.unwrap();
        assert!(fake
            .copied_paths()
            .contains(&"/etc/containerd/config.toml".to_string()));
        assert!(fake.ran("systemctl restart containerd"));
    }

    #[tokio::test]
    async fn listing_goes_through_crictl() {
        let fake = Arc::new(FakeRunner::new());
        fake.stub("crictl ps", "id1\n");
        let rt = Containerd::new(fake.clone(), None);
        let ids = rt
            .list_containers(ListOptions {
                state: ContainerState::Running,
                namespaces: vec!["kube-system".into()],
            })
            .await
            .unwrap();
        assert_eq!(ids, vec!["id1"]);
        assert!(fake.ran("io.kubernetes.pod.namespace=kube-system"));
    }
}
