//! Kubernetes bootstrapping
//!
//! The [`Bootstrapper`] turns a configured, running machine into a working
//! control plane (or rejoins an existing one) using the kubeadm toolchain
//! inside the guest. [`KubeadmBootstrapper`] is the only real
//! implementation; tests drive it through the scripted fake runner.

mod extraargs;
mod kubeadm;
mod templates;

pub use extraargs::{kubeadm_cli_flags, kubeadm_extra_flags, parse_feature_gates};
pub use kubeadm::KubeadmBootstrapper;
pub use templates::DEFAULT_CNI_CONFIG;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{ClusterConfig, Node};
use crate::driver::MachineState;
use crate::Result;

/// Options for [`Bootstrapper::log_commands`].
#[derive(Debug, Clone, Copy, Default)]
pub struct LogOptions {
    /// Limit output to the last N lines (0 = no limit).
    pub lines: u32,
    /// Follow the log.
    pub follow: bool,
}

/// Installs and manages Kubernetes on provisioned machines.
#[async_trait]
pub trait Bootstrapper: Send + Sync {
    /// Prepare the control-plane guest: extract the preloaded images (or
    /// side-load cached tarballs), then render and install the primary
    /// node's configs and binaries.
    async fn update_cluster(&self, cc: &ClusterConfig) -> Result<()>;

    /// Render and transfer one node's configs and binaries; restart the
    /// kubelet when its configuration changed.
    async fn update_node(&self, cc: &ClusterConfig, node: &Node) -> Result<()>;

    /// Drive the init-or-restart decision and bring components healthy.
    async fn start_cluster(&self, cc: &ClusterConfig) -> Result<()>;

    /// Run the verification gates selected by `cc.verify_components`.
    async fn wait_for_node(&self, cc: &ClusterConfig, node: &Node, timeout: Duration)
        -> Result<()>;

    /// Join a secondary node to the control plane using a join command.
    async fn join_cluster(&self, cc: &ClusterConfig, node: &Node, join_cmd: &str) -> Result<()>;

    /// Generate a cluster join command for secondaries.
    async fn generate_token(&self, cc: &ClusterConfig) -> Result<String>;

    /// Tear Kubernetes down on the guest (`kubeadm reset`).
    async fn delete_cluster(&self, cc: &ClusterConfig) -> Result<()>;

    /// Materialize shared certificates inside the guest.
    async fn setup_certs(&self, cc: &ClusterConfig) -> Result<()>;

    /// Commands a user can run to inspect logs, keyed by log name.
    fn log_commands(&self, opts: &LogOptions) -> BTreeMap<String, String>;

    /// State of the kubelet systemd unit.
    async fn kubelet_status(&self) -> Result<MachineState>;

    /// State of the apiserver at ip:port.
    async fn apiserver_status(&self, ip: &str, port: u16) -> Result<MachineState>;
}
