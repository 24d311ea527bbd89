//! Narrow Kubernetes API capabilities
//!
//! The bootstrapper and verifier both need a handful of API-server facts
//! (pod phases, node conditions, the default service account). Those needs
//! are expressed as the [`ClusterView`] and [`ApiserverProbe`] traits so
//! the two components depend on capabilities rather than on each other,
//! and so tests can substitute mocks.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRoleBinding, RoleRef, Subject};
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::Client;
#[cfg(test)]
use mockall::automock;
use tracing::debug;

use crate::driver::MachineState;
use crate::error::PressureKind;
use crate::{Error, Result};

/// Control-plane components expected to be running for a healthy cluster.
/// Sorted roughly by dependency layer.
pub const APPS_BY_LAYER: [(&str, &str, &str); 6] = [
    ("apiserver", "component", "kube-apiserver"),
    ("proxy", "k8s-app", "kube-proxy"),
    ("etcd", "component", "etcd"),
    ("scheduler", "component", "kube-scheduler"),
    ("controller", "component", "kube-controller-manager"),
    ("dns", "k8s-app", "kube-dns"),
];

/// Probes the apiserver health endpoint.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ApiserverProbe: Send + Sync {
    /// State of the apiserver at `https://<ip>:<port>/healthz`.
    ///
    /// Connection refused means Stopped (not ready yet), a non-200 answer
    /// means Error, 200 means Running.
    async fn apiserver_status(&self, ip: &str, port: u16) -> Result<MachineState>;
}

/// HTTPS healthz probe.
///
/// The serving cert is self-signed against our CA; the probe skips
/// verification because it only cares about process liveness.
#[derive(Debug, Clone, Default)]
pub struct HttpApiserverProbe;

#[async_trait]
impl ApiserverProbe for HttpApiserverProbe {
    async fn apiserver_status(&self, ip: &str, port: u16) -> Result<MachineState> {
        let url = format!("https://{}:{}/healthz", ip, port);
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .connect_timeout(Duration::from_secs(40))
            .build()
            .map_err(|e| Error::config(format!("building http client: {}", e)))?;

        match client.get(&url).send().await {
            // Connection refused, usually.
            Err(e) => {
                debug!(url = %url, error = %e, "healthz unreachable");
                Ok(MachineState::Stopped)
            }
            Ok(resp) if resp.status().is_success() => Ok(MachineState::Running),
            Ok(resp) => {
                debug!(url = %url, status = %resp.status(), "healthz unhealthy");
                Ok(MachineState::Error)
            }
        }
    }
}

/// Read/write operations against a running cluster's API.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterView: Send + Sync {
    /// Whether all pods matching `label=value` in kube-system are Running.
    async fn pods_running(&self, label: &str, value: &str) -> Result<bool>;

    /// Whether the control-plane pods (tier/component selectors) are all
    /// Running.
    async fn system_pods_running(&self) -> Result<bool>;

    /// Whether the "default" ServiceAccount exists in "default".
    async fn default_sa_exists(&self) -> Result<bool>;

    /// Git version reported by the apiserver (e.g. "v1.18.0").
    async fn apiserver_version(&self) -> Result<String>;

    /// Pressure conditions currently True on the node.
    async fn node_pressures(&self, node: &str) -> Result<Vec<PressureKind>>;

    /// Whether the node's Ready condition is True.
    async fn node_ready(&self, node: &str) -> Result<bool>;

    /// Create the cluster-admin binding for kube-system service accounts;
    /// "already exists" is success.
    async fn elevate_rbac(&self) -> Result<()>;

    /// Apply labels to every node, overwriting existing values.
    async fn label_nodes(&self, labels: &BTreeMap<String, String>) -> Result<()>;
}

/// [`ClusterView`] over a real kube client.
pub struct KubeClusterView {
    client: Client,
}

impl KubeClusterView {
    /// A view over an established client.
    pub fn new(client: Client) -> KubeClusterView {
        KubeClusterView { client }
    }
}

fn pod_is_running(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .map(|p| p == "Running")
        .unwrap_or(false)
}

#[async_trait]
impl ClusterView for KubeClusterView {
    async fn pods_running(&self, label: &str, value: &str) -> Result<bool> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), "kube-system");
        let list = pods
            .list(&ListParams::default().labels(&format!("{}={}", label, value)))
            .await?;
        Ok(!list.items.is_empty() && list.items.iter().all(pod_is_running))
    }

    async fn system_pods_running(&self) -> Result<bool> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), "kube-system");

        let tiered = pods
            .list(&ListParams::default().labels("tier=control-plane"))
            .await?;
        let mut found = tiered.items;

        for component in [
            "kube-apiserver",
            "kube-scheduler",
            "kube-controller-manager",
            "etcd",
        ] {
            let list = pods
                .list(&ListParams::default().labels(&format!("component={}", component)))
                .await?;
            found.extend(list.items);
        }

        Ok(!found.is_empty() && found.iter().all(pod_is_running))
    }

    async fn default_sa_exists(&self) -> Result<bool> {
        let sas: Api<ServiceAccount> = Api::namespaced(self.client.clone(), "default");
        match sas.get("default").await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn apiserver_version(&self) -> Result<String> {
        let info = self.client.apiserver_version().await?;
        Ok(info.git_version)
    }

    async fn node_pressures(&self, node: &str) -> Result<Vec<PressureKind>> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let node = nodes.get(node).await?;

        let mut pressures = Vec::new();
        let conditions = node
            .status
            .as_ref()
            .and_then(|s| s.conditions.as_ref())
            .cloned()
            .unwrap_or_default();
        for c in conditions {
            if c.status != "True" {
                continue;
            }
            match c.type_.as_str() {
                "DiskPressure" => pressures.push(PressureKind::Disk),
                "MemoryPressure" => pressures.push(PressureKind::Memory),
                "PIDPressure" => pressures.push(PressureKind::Pid),
                "NetworkUnavailable" => pressures.push(PressureKind::Network),
                _ => {}
            }
        }
        Ok(pressures)
    }

    async fn node_ready(&self, node: &str) -> Result<bool> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let node = nodes.get(node).await?;
        Ok(node
            .status
            .as_ref()
            .and_then(|s| s.conditions.as_ref())
            .map(|cs| cs.iter().any(|c| c.type_ == "Ready" && c.status == "True"))
            .unwrap_or(false))
    }

    async fn elevate_rbac(&self) -> Result<()> {
        let bindings: Api<ClusterRoleBinding> = Api::all(self.client.clone());
        let binding = ClusterRoleBinding {
            metadata: kube::core::ObjectMeta {
                name: Some("minikube-rbac".to_string()),
                ..Default::default()
            },
            role_ref: RoleRef {
                api_group: "rbac.authorization.k8s.io".to_string(),
                kind: "ClusterRole".to_string(),
                name: "cluster-admin".to_string(),
            },
            subjects: Some(vec![Subject {
                kind: "Group".to_string(),
                name: "system:serviceaccounts:kube-system".to_string(),
                api_group: Some("rbac.authorization.k8s.io".to_string()),
                ..Default::default()
            }]),
        };

        match bindings.create(&PostParams::default(), &binding).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn label_nodes(&self, labels: &BTreeMap<String, String>) -> Result<()> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let list = nodes.list(&ListParams::default()).await?;

        let patch = serde_json::json!({ "metadata": { "labels": labels } });
        for node in list.items {
            let name = node.metadata.name.clone().unwrap_or_default();
            nodes
                .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apps_by_layer_covers_the_control_plane() {
        let names: Vec<&str> = APPS_BY_LAYER.iter().map(|(n, _, _)| *n).collect();
        assert_eq!(
            names,
            vec!["apiserver", "proxy", "etcd", "scheduler", "controller", "dns"]
        );
        // DNS is matched by app label, not component.
        assert_eq!(APPS_BY_LAYER[5].1, "k8s-app");
    }

    #[tokio::test]
    async fn mock_cluster_view_supports_expectations() {
        let mut view = MockClusterView::new();
        view.expect_default_sa_exists().returning(|| Ok(true));
        assert!(view.default_sa_exists().await.unwrap());
    }

    #[tokio::test]
    async fn probe_reports_stopped_for_unreachable_endpoints() {
        let probe = HttpApiserverProbe;
        // Nothing listens on this port.
        let state = probe.apiserver_status("127.0.0.1", 1).await.unwrap();
        assert_eq!(state, MachineState::Stopped);
    }
}
