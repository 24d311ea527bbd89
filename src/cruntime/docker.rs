//! Docker runtime driver

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::assets::Asset;
use crate::runner::{Command, CommandRunner};
use crate::util::shell_join;
use crate::Result;

use super::{find_preload_tarball, ContainerState, ListOptions, Runtime, POD_NAMESPACE_LABEL};

/// Dockershim socket the kubelet talks to for the docker runtime.
const DOCKERSHIM_SOCKET: &str = "/var/run/dockershim.sock";

/// Drives the docker daemon inside the guest.
pub struct Docker {
    runner: Arc<dyn CommandRunner>,
    socket: String,
}

impl Docker {
    /// A docker runtime over the given runner.
    pub fn new(runner: Arc<dyn CommandRunner>, socket_override: Option<String>) -> Docker {
        Docker {
            runner,
            socket: socket_override.unwrap_or_else(|| DOCKERSHIM_SOCKET.to_string()),
        }
    }

    async fn docker_ids(&self, args: &str) -> Result<Vec<String>> {
        let rr = self
            .runner
            .run_cmd(Command::shell(format!("docker ps {} --format {{{{.ID}}}}", args)))
            .await?;
        Ok(rr
            .stdout_str()
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }

    async fn each(&self, verb: &str, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let line = format!("docker {} {}", verb, shell_join(ids));
        self.runner.run_cmd(Command::shell(line)).await?;
        Ok(())
    }
}

#[async_trait]
impl Runtime for Docker {
    fn name(&self) -> &'static str {
        "docker"
    }

    fn socket_path(&self) -> String {
        self.socket.clone()
    }

    async fn version(&self) -> Result<String> {
        let rr = self
            .runner
            .run_cmd(Command::shell("docker version --format {{.Server.Version}}"))
            .await?;
        Ok(rr.stdout_str().trim().to_string())
    }

    async fn enable(&self) -> Result<()> {
        self.runner
            .run_cmd(Command::shell(
                "sudo systemctl unmask docker && sudo systemctl enable docker && sudo systemctl start docker",
            ))
            .await?;
        Ok(())
    }

    async fn disable(&self) -> Result<()> {
        self.runner
            .run_cmd(Command::shell("sudo systemctl stop docker docker.socket"))
            .await?;
        Ok(())
    }

    async fn list_containers(&self, opts: ListOptions) -> Result<Vec<String>> {
        let mut filters = String::new();
        match opts.state {
            ContainerState::All => filters.push_str("-a"),
            ContainerState::Running => {}
            ContainerState::Paused => filters.push_str("--filter status=paused"),
        }
        if opts.namespaces.is_empty() {
            let mut args = filters.clone();
            args.push_str(&format!(" --filter label={}", POD_NAMESPACE_LABEL));
            return self.docker_ids(args.trim()).await;
        }

        let mut ids = Vec::new();
        for ns in &opts.namespaces {
            let args = format!(
                "{} --filter label={}={}",
                filters, POD_NAMESPACE_LABEL, ns
            );
            ids.extend(self.docker_ids(args.trim()).await?);
        }
        Ok(ids)
    }

    async fn stop_containers(&self, ids: &[String]) -> Result<()> {
        self.each("stop", ids).await
    }

    async fn kill_containers(&self, ids: &[String]) -> Result<()> {
        self.each("kill", ids).await
    }

    async fn pause_containers(&self, ids: &[String]) -> Result<()> {
        self.each("pause", ids).await
    }

    async fn unpause_containers(&self, ids: &[String]) -> Result<()> {
        self.each("unpause", ids).await
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
                "sudo tar {}-C /var -xf /{} && sudo rm -f /{} && sudo systemctl restart docker",
                decompress, name, name
            )))
            .await?;
        Ok(())
    }

    fn kubelet_options(&self) -> BTreeMap<String, String> {
        let mut opts = BTreeMap::new();
        opts.insert("container-runtime".to_string(), "docker".to_string());
        opts
    }

    async fn cgroup_driver(&self) -> Result<String> {
        let rr = self
            .runner
            .run_cmd(Command::shell("docker info --format {{.CgroupDriver}}"))
            .await?;
        Ok(rr.stdout_str().trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::FakeRunner;

    fn docker_with_fake() -> (Arc<FakeRunner>, Docker) {
        let fake = Arc::new(FakeRunner::new());
        let rt = Docker::new(fake.clone(), None);
        (fake, rt)
    }

    #[tokio::test]
    async fn list_filters_by_pod_namespace_label() {
        let (fake, rt) = docker_with_fake();
        fake.stub("docker ps", "abc123\ndef456\n");

        let ids = rt
            .list_containers(ListOptions {
                state: ContainerState::Running,
                namespaces: vec!["kube-system".to_string()],
            })
            .await
            .unwrap();

        assert_eq!(ids, vec!["abc123", "def456"]);
        assert!(fake.ran("label=io.kubernetes.pod.namespace=kube-system"));
    }

    #[tokio::test]
    async fn stop_is_a_noop_without_ids() {
        let (fake, rt) = docker_with_fake();
        rt.stop_containers(&[]).await.unwrap();
        assert!(fake.commands().is_empty());
    }

    #[tokio::test]
    async fn unpause_names_all_ids() {
        let (fake, rt) = docker_with_fake();
        rt.unpause_containers(&["a1".to_string(), "b2".to_string()])
            .await
            .unwrap();
        assert!(fake.ran("docker unpause a1 b2"));
    }

    #[tokio::test]
    async fn missing_preload_tarball_is_not_fatal() {
        let (fake, rt) = docker_with_fake();
        let dir = tempfile::tempdir().unwrap();
        rt.preload(dir.path(), "v1.18.0").await.unwrap();
        assert!(fake.commands().is_empty());
    }

    #[test]
    fn kubelet_options_pin_the_runtime() {
        let (_, rt) = docker_with_fake();
        assert_eq!(rt.kubelet_options().get("container-runtime").unwrap(), "docker");
    }
}
