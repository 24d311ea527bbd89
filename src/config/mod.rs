//! Declarative cluster configuration
//!
//! [`ClusterConfig`] is the root of everything the orchestrator does: it
//! names the driver, the nodes, the Kubernetes version and runtime, which
//! addons are enabled, and which verification gates `start` must pass.
//! Instances are persisted as JSON by the [`crate::store`] and validated on
//! every load and save.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::driver::DriverTag;
use crate::{util, Error, Result};

/// Verification gate names selectable via `verify_components`.
pub mod verify {
    /// Probe for a running kube-apiserver process on the guest.
    pub const APISERVER_PROCESS: &str = "apiserver";
    /// Control-plane pods in kube-system reach phase Running.
    pub const SYSTEM_PODS: &str = "system-pods";
    /// ServiceAccount "default" exists in namespace "default".
    pub const DEFAULT_SA: &str = "default-sa";
    /// All expected apps (apiserver, proxy, etcd, scheduler, controller, dns) run.
    pub const APPS_RUNNING: &str = "apps-running";
    /// No Disk/Memory/PID/Network pressure on the primary node.
    pub const NODE_CONDITIONS: &str = "node-conditions";
    /// Node condition Ready is True.
    pub const NODE_READY: &str = "node-ready";
}

/// A single machine in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Node {
    /// Node name; empty for the primary control plane.
    #[serde(default)]
    pub name: String,
    /// IP of the node, filled in once the machine is up.
    #[serde(default)]
    pub ip: String,
    /// Apiserver port for control-plane nodes.
    #[serde(default)]
    pub port: u16,
    /// Kubernetes version deployed on this node.
    #[serde(default)]
    pub kubernetes_version: String,
    /// Whether this node hosts the control plane.
    #[serde(default)]
    pub control_plane: bool,
    /// Whether this node schedules workloads.
    #[serde(default)]
    pub worker: bool,
}

/// Kubernetes-level configuration shared by all nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct KubernetesConfig {
    /// Version to deploy, e.g. "v1.18.0".
    pub kubernetes_version: String,
    /// Container runtime tag: docker, containerd or cri-o.
    #[serde(default)]
    pub container_runtime: String,
    /// Alternative image repository (empty = k8s.gcr.io).
    #[serde(default)]
    pub image_repository: String,
    /// Service cluster IP range.
    #[serde(default)]
    pub service_cidr: String,
    /// IP the apiserver advertises; filled from the primary node.
    #[serde(default)]
    pub node_ip: String,
    /// Apiserver port.
    #[serde(default)]
    pub node_port: u16,
    /// Name of the primary node.
    #[serde(default)]
    pub node_name: String,
    /// Extra component options as "component.key=value" entries.
    #[serde(default)]
    pub extra_options: Vec<ExtraOption>,
    /// Feature gates passed through to kubeadm and the kubelet.
    #[serde(default)]
    pub feature_gates: String,
    /// Network plugin handed to the kubelet (e.g. "cni").
    #[serde(default)]
    pub network_plugin: String,
    /// Write a default CNI config so kubelet can start pods without one.
    #[serde(default)]
    pub enable_default_cni: bool,
    /// CRI socket path override.
    #[serde(default)]
    pub cri_socket: String,
}

/// One "component.key=value" override from `--extra-config`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtraOption {
    /// Component the option applies to (kubeadm, kubelet, apiserver, ...).
    pub component: String,
    /// Flag name without leading dashes.
    pub key: String,
    /// Flag value.
    pub value: String,
}

impl std::str::FromStr for ExtraOption {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (component, rest) = s
            .split_once('.')
            .ok_or_else(|| Error::usage(format!("invalid extra config \"{}\": expected component.key=value", s)))?;
        let (key, value) = rest
            .split_once('=')
            .ok_or_else(|| Error::usage(format!("invalid extra config \"{}\": expected component.key=value", s)))?;
        Ok(ExtraOption {
            component: component.to_string(),
            key: key.to_string(),
            value: value.to_string(),
        })
    }
}

/// The declarative root of one cluster profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ClusterConfig {
    /// Unique cluster name; also the profile and primary machine name.
    pub name: String,
    /// Driver tag selecting the machine backend.
    pub driver: DriverTag,
    /// Machines making up the cluster; exactly one is the control plane.
    pub nodes: Vec<Node>,
    /// Kubernetes configuration shared by all nodes.
    pub kubernetes_config: KubernetesConfig,
    /// Addon name to enabled flag.
    #[serde(default)]
    pub addons: BTreeMap<String, bool>,
    /// Verification gates `start` must pass, by gate name.
    #[serde(default)]
    pub verify_components: BTreeMap<String, bool>,
    /// Guest memory in MB.
    #[serde(default)]
    pub memory_mb: u32,
    /// Guest vCPU count.
    #[serde(default)]
    pub cpus: u32,
    /// Guest disk size in MB.
    #[serde(default)]
    pub disk_mb: u32,
    /// Host directory mount enabled.
    #[serde(default)]
    pub mount: bool,
    /// Mount specification "src:dst".
    #[serde(default)]
    pub mount_string: String,
    /// HTTP(S)_PROXY / NO_PROXY values propagated into the guest.
    #[serde(default)]
    pub http_proxy_env: Vec<String>,
}

/// Default verification gates: apiserver and system pods, like `start`
/// has always waited for.
pub fn default_verify_components() -> BTreeMap<String, bool> {
    let mut m = BTreeMap::new();
    m.insert(verify::APISERVER_PROCESS.to_string(), true);
    m.insert(verify::SYSTEM_PODS.to_string(), true);
    m.insert(verify::DEFAULT_SA.to_string(), false);
    m.insert(verify::APPS_RUNNING.to_string(), false);
    m.insert(verify::NODE_CONDITIONS.to_string(), true);
    m.insert(verify::NODE_READY.to_string(), false);
    m
}

impl ClusterConfig {
    /// Validate the whole config: name shape, driver, node layout, version
    /// and CIDR syntax.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.name.len() > 60 {
            return Err(Error::config(format!(
                "cluster name \"{}\" must be 1-60 characters",
                self.name
            )));
        }
        if !self
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        {
            return Err(Error::config(format!(
                "cluster name \"{}\" contains invalid characters",
                self.name
            )));
        }

        let control_planes = self.nodes.iter().filter(|n| n.control_plane).count();
        if control_planes != 1 {
            return Err(Error::config(format!(
                "expected exactly one control-plane node, found {}",
                control_planes
            )));
        }

        util::parse_kubernetes_version(&self.kubernetes_config.kubernetes_version)?;

        if !self.kubernetes_config.service_cidr.is_empty() {
            util::validate_cidr(&self.kubernetes_config.service_cidr)?;
        }

        Ok(())
    }

    /// The primary (control-plane) node.
    pub fn primary(&self) -> Result<&Node> {
        self.nodes
            .iter()
            .find(|n| n.control_plane)
            .ok_or_else(|| Error::config("cluster has no control-plane node"))
    }

    /// Mutable access to the primary node.
    pub fn primary_mut(&mut self) -> Result<&mut Node> {
        self.nodes
            .iter_mut()
            .find(|n| n.control_plane)
            .ok_or_else(|| Error::config("cluster has no control-plane node"))
    }

    /// Machine name of a node.
    ///
    /// The primary machine carries the bare cluster name; secondaries are
    /// suffixed with the node name.
    pub fn machine_name(&self, node: &Node) -> String {
        if node.control_plane || node.name.is_empty() {
            self.name.clone()
        } else {
            format!("{}-{}", self.name, node.name)
        }
    }

    /// Whether a verification gate is enabled for this cluster.
    pub fn should_verify(&self, gate: &str) -> bool {
        self.verify_components.get(gate).copied().unwrap_or(false)
    }

    /// Look up a node by name; the empty name resolves to the primary.
    pub fn node(&self, name: &str) -> Result<&Node> {
        if name.is_empty() {
            return self.primary();
        }
        self.nodes
            .iter()
            .find(|n| n.name == name)
            .ok_or_else(|| Error::NotFound {
                kind: "node".to_string(),
                name: name.to_string(),
            })
    }
}
