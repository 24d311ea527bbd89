//! Container runtime management inside the guest
//!
//! Each [`Runtime`] variant knows how to drive its daemon through the
//! [`CommandRunner`]: starting systemd units, writing daemon config,
//! producing the kubelet flag set, and listing/stopping/pausing the
//! containers Kubernetes created. Pod containers are found by the
//! `io.kubernetes.pod.namespace` label, never by runtime-native
//! namespaces.

mod containerd;
mod crio;
mod docker;

pub use containerd::Containerd;
pub use crio::CriO;
pub use docker::Docker;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::runner::{Command, CommandRunner};
use crate::{constants, Error, Result};

/// Which containers to list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContainerState {
    /// Every container regardless of state.
    All,
    /// Only running containers.
    #[default]
    Running,
    /// Only paused containers.
    Paused,
}

/// Filter for [`Runtime::list_containers`].
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    /// Container state filter.
    pub state: ContainerState,
    /// Kubernetes namespaces to match via the pod-namespace label; empty
    /// matches all.
    pub namespaces: Vec<String>,
}

/// A container runtime inside the guest.
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Runtime tag: "docker", "containerd" or "cri-o".
    fn name(&self) -> &'static str;

    /// CRI socket path handed to the kubelet.
    fn socket_path(&self) -> String;

    /// Runtime daemon version, for diagnostics.
    async fn version(&self) -> Result<String>;

    /// Start and configure the runtime daemon.
    async fn enable(&self) -> Result<()>;

    /// Stop the runtime daemon.
    async fn disable(&self) -> Result<()>;

    /// List container IDs matching the filter.
    async fn list_containers(&self, opts: ListOptions) -> Result<Vec<String>>;

    /// Stop the given containers.
    async fn stop_containers(&self, ids: &[String]) -> Result<()>;

    /// Kill the given containers.
    async fn kill_containers(&self, ids: &[String]) -> Result<()>;

    /// Pause the given containers.
    async fn pause_containers(&self, ids: &[String]) -> Result<()>;

    /// Unpause the given containers.
    async fn unpause_containers(&self, ids: &[String]) -> Result<()>;

    /// Extract the preloaded image tarball into the image store.
    ///
    /// A missing tarball is not fatal; the bootstrapper falls back to
    /// pulling images individually.
    async fn preload(&self, cache_home: &Path, k8s_version: &str) -> Result<()>;

    /// Kubelet flags this runtime requires.
    fn kubelet_options(&self) -> BTreeMap<String, String>;

    /// The cgroup driver the daemon runs with.
    async fn cgroup_driver(&self) -> Result<String>;
}

/// Construct the runtime for a tag.
pub fn new_runtime(
    tag: &str,
    runner: Arc<dyn CommandRunner>,
    socket_override: Option<String>,
) -> Result<Box<dyn Runtime>> {
    match tag {
        "" | "docker" => Ok(Box::new(Docker::new(runner, socket_override))),
        "containerd" => Ok(Box::new(Containerd::new(runner, socket_override))),
        "cri-o" | "crio" => Ok(Box::new(CriO::new(runner, socket_override))),
        other => Err(Error::config(format!(
            "unknown container runtime \"{}\"",
            other
        ))),
    }
}

/// The label Kubernetes stamps on every pod container.
pub(crate) const POD_NAMESPACE_LABEL: &str = "io.kubernetes.pod.namespace";

/// List container IDs through crictl, filtering by the pod-namespace label.
pub(crate) async fn crictl_list(
    runner: &dyn CommandRunner,
    socket: &str,
    opts: ListOptions,
) -> Result<Vec<String>> {
    let state = match opts.state {
        ContainerState::All => "",
        ContainerState::Running => " --state Running",
        ContainerState::Paused => " --state Paused",
    };

    let mut ids = Vec::new();
    let namespaces: Vec<Option<&String>> = if opts.namespaces.is_empty() {
        vec![None]
    } else {
        opts.namespaces.iter().map(Some).collect()
    };
    for ns in namespaces {
        let label = match ns {
            Some(ns) => format!(" --label {}={}", POD_NAMESPACE_LABEL, ns),
            None => format!(" --label {}", POD_NAMESPACE_LABEL),
        };
        let rr = runner
            .run_cmd(Command::shell(format!(
                "sudo crictl -r unix://{} ps -a -q{}{}",
                socket, state, label
            )))
            .await?;
        ids.extend(
            rr.stdout_str()
                .lines()
                .map(|l| l.trim().to_string())
                .filter(|l| !l.is_empty()),
        );
    }
    Ok(ids)
}

/// Run a crictl verb over a set of container IDs.
pub(crate) async fn crictl_verb(
    runner: &dyn CommandRunner,
    socket: &str,
    verb: &str,
    ids: &[String],
) -> Result<()> {
    if ids.is_empty() {
        return Ok(());
    }
    runner
        .run_cmd(Command::shell(format!(
            "sudo crictl -r unix://{} {} {}",
            socket,
            verb,
            crate::util::shell_join(ids)
        )))
        .await?;
    Ok(())
}

/// Resolve the preload tarball, probing `.tar.lz4` then `.tar`.
pub(crate) fn find_preload_tarball(cache_home: &Path, k8s_version: &str) -> Option<std::path::PathBuf> {
    let lz4 = constants::preload_tarball_path(cache_home, k8s_version);
    if lz4.exists() {
        return Some(lz4);
    }
    let tar = lz4.with_extension("");
    if tar.exists() && tar.extension().map(|e| e == "tar").unwrap_or(false) {
        return Some(tar);
    }
    None
}
