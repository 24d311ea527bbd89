//! Top-level cluster orchestration
//!
//! Composes the store, driver, runtime, bootstrapper and verifier into the
//! start/stop/delete/status pipelines. Per-cluster mutations are totally
//! ordered by the cluster file lock; every step is an idempotent unit, so
//! a failed `start` can simply be rerun and resumes at the first
//! incomplete step.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::bootstrapper::{Bootstrapper, KubeadmBootstrapper};
use crate::config::ClusterConfig;
use crate::constants;
use crate::download::{self, BinaryCache};
use crate::driver::{Driver, DriverTag, MachineConfig, MachineState, Registry};
use crate::lock::FileLock;
use crate::machine;
use crate::runner::Command;
use crate::store::Store;
use crate::util;
use crate::{Error, Result};

/// Default wall-clock budget for a `start`.
pub const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// How long we wait to take the per-cluster mutation lock.
const CLUSTER_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Component states for `status`, marshaled as JSON with `--output json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ClusterStatus {
    /// Cluster name.
    pub name: String,
    /// Machine state.
    pub host: String,
    /// Kubelet unit state.
    pub kubelet: String,
    /// Apiserver health state.
    pub api_server: String,
    /// Whether the written kubeconfig points at this cluster.
    pub kubeconfig: String,
}

impl ClusterStatus {
    fn nonexistent(name: &str) -> ClusterStatus {
        ClusterStatus {
            name: name.to_string(),
            host: MachineState::None.to_string(),
            kubelet: MachineState::None.to_string(),
            api_server: MachineState::None.to_string(),
            kubeconfig: "Nonexistent".to_string(),
        }
    }

    /// Exit code for the status command: 0 running, 2 paused, 7
    /// down or missing.
    pub fn exit_code(&self) -> i32 {
        if self.host == MachineState::Paused.to_string() {
            return 2;
        }
        let running = MachineState::Running.to_string();
        if self.host == running && self.kubelet == running && self.api_server == running {
            return 0;
        }
        7
    }
}

/// Orchestrates cluster lifecycle operations.
pub struct Orchestrator {
    store: Store,
    registry: Registry,
}

impl Orchestrator {
    /// An orchestrator over a store.
    pub fn new(store: Store) -> Orchestrator {
        Orchestrator {
            store,
            registry: Registry::standard(),
        }
    }

    /// The underlying store.
    pub fn store(&self) -> &Store {
        &self.store
    }

    fn machine_config(&self, cc: &ClusterConfig, machine_name: &str, node_ip: &str) -> MachineConfig {
        MachineConfig {
            name: machine_name.to_string(),
            cpus: cc.cpus,
            memory_mb: cc.memory_mb,
            disk_mb: cc.disk_mb,
            apiserver_port: cc.kubernetes_config.node_port,
            oci_binary: if cc.driver == DriverTag::Podman {
                "podman".to_string()
            } else {
                "docker".to_string()
            },
            ssh_user: String::new(),
            ssh_host: node_ip.to_string(),
            ssh_port: 0,
            ssh_key: self
                .store
                .base()
                .join("machines")
                .join(machine_name)
                .join("id_rsa"),
            env: cc.http_proxy_env.clone(),
        }
    }

    fn driver_for(&self, cc: &ClusterConfig, machine_name: &str, node_ip: &str) -> Result<Arc<dyn Driver>> {
        self.registry
            .create(cc.driver, self.machine_config(cc, machine_name, node_ip))
    }

    /// Populate the binary and image caches for a version without
    /// touching any machine.
    pub async fn download_artifacts(&self, cc: &ClusterConfig) -> Result<()> {
        let version = &cc.kubernetes_config.kubernetes_version;
        let cache = BinaryCache::new(self.store.base());
        cache.cache_binaries("linux", "amd64", version).await?;

        let semver = util::parse_kubernetes_version(version)?;
        let images = constants::kubeadm_images(&cc.kubernetes_config.image_repository, &semver);
        if let Err(e) = download::cache_images(self.store.base(), &images).await {
            warn!(error = %e, "image caching failed; pulls will happen in the guest");
        }
        Ok(())
    }

    /// Create or update a cluster to match `cc`, returning the persisted
    /// config with observed node addresses filled in.
    pub async fn start(&self, mut cc: ClusterConfig, timeout: Duration) -> Result<ClusterConfig> {
        cc.validate()?;

        let _lock = FileLock::acquire(
            &self.store.cluster_lock_path(&cc.name),
            CLUSTER_LOCK_TIMEOUT,
        )
        .await?;

        // Cache before any machine exists so a flaky network fails fast.
        self.download_artifacts(&cc).await?;

        let nodes = cc.nodes.clone();
        let mut join_cmd: Option<String> = None;

        for node in &nodes {
            let machine_name = cc.machine_name(node);
            let driver = self.driver_for(&cc, &machine_name, &node.ip)?;

            let host = machine::create_host(&self.store, driver.as_ref(), &cc, &machine_name).await?;

            // Observed address flows into the rendered configs.
            let node_port = cc.kubernetes_config.node_port;
            if let Some(entry) = cc
                .nodes
                .iter_mut()
                .find(|n| n.name == node.name && n.control_plane == node.control_plane)
            {
                entry.ip = host.ip.clone();
                entry.port = node_port;
            }
            if node.control_plane {
                cc.kubernetes_config.node_ip = host.ip.clone();
                cc.kubernetes_config.node_name = machine_name.clone();
            }

            let runner = driver.runner().await?;
            let runtime = crate::cruntime::new_runtime(
                &cc.kubernetes_config.container_runtime,
                runner.clone(),
                None,
            )?;
            runtime.enable().await?;

            let bootstrapper = KubeadmBootstrapper::new(runner.clone(), self.store.clone());
            bootstrapper.setup_certs(&cc).await?;

            if node.control_plane {
                bootstrapper.update_cluster(&cc).await?;
                bootstrapper.start_cluster(&cc).await?;

                let cp = cc.primary()?.clone();
                bootstrapper.wait_for_node(&cc, &cp, timeout).await.map_err(|e| {
                    advise_on_pressure(&e, cc.driver);
                    e
                })?;
            } else {
                bootstrapper.update_node(&cc, node).await?;

                let cp_runner = self.control_plane_runner(&cc).await?;
                let cp_bootstrapper = KubeadmBootstrapper::new(cp_runner, self.store.clone());
                let cmd = match &join_cmd {
                    Some(cmd) => cmd.clone(),
                    None => {
                        let cmd = cp_bootstrapper.generate_token(&cc).await?;
                        join_cmd = Some(cmd.clone());
                        cmd
                    }
                };
                bootstrapper.join_cluster(&cc, node, &cmd).await?;
            }
        }

        // Persist the updated config and a kubeconfig for the user.
        let cp = cc.primary()?.clone();
        let auth = crate::certs::AuthOptions::new(self.store.certs_dir(), cc.machine_name(&cp));
        let url = format!("https://{}:{}", cp.ip, cp.port);
        let profile_dir = self.store.base().join("profiles").join(&cc.name);
        crate::kubeconfig::write(&profile_dir, &cc.name, &url, &auth).await?;

        self.store.save(&cc).await?;
        info!(cluster = %cc.name, "cluster started");
        Ok(cc)
    }

    async fn control_plane_runner(
        &self,
        cc: &ClusterConfig,
    ) -> Result<Arc<dyn crate::runner::CommandRunner>> {
        let cp = cc.primary()?;
        let machine_name = cc.machine_name(cp);
        let driver = self.driver_for(cc, &machine_name, &cp.ip)?;
        driver.runner().await
    }

    /// Stop every machine of a cluster, leaving state on disk.
    pub async fn stop(&self, name: &str) -> Result<()> {
        let cc = self.store.load(name).await?;
        let _lock = FileLock::acquire(
            &self.store.cluster_lock_path(name),
            CLUSTER_LOCK_TIMEOUT,
        )
        .await?;

        for node in cc.nodes.iter().rev() {
            let machine_name = cc.machine_name(node);
            let driver = self.driver_for(&cc, &machine_name, &node.ip)?;

            // Stop the kubelet first so containers terminate cleanly; the
            // driver handles the machine itself.
            if let Ok(runner) = driver.runner().await {
                let _ = runner
                    .run_cmd(Command::shell("sudo systemctl stop kubelet"))
                    .await;
            }
            machine::stop_host(driver.as_ref(), &machine_name).await?;
        }
        info!(cluster = %name, "cluster stopped");
        Ok(())
    }

    /// Delete a cluster: machines, host records and the profile. Returns
    /// whether a profile existed. Idempotent through every partial state.
    pub async fn delete(&self, name: &str) -> Result<bool> {
        let _lock = FileLock::acquire(
            &self.store.cluster_lock_path(name),
            CLUSTER_LOCK_TIMEOUT,
        )
        .await?;

        let existed = match self.store.load(name).await {
            Ok(cc) => {
                for node in cc.nodes.iter().rev() {
                    let machine_name = cc.machine_name(node);
                    match self.driver_for(&cc, &machine_name, &node.ip) {
                        Ok(driver) => {
                            machine::delete_host(&self.store, driver.as_ref(), &machine_name)
                                .await?;
                        }
                        Err(e) => {
                            // An unavailable driver must not make delete
                            // fail; remove what we can.
                            warn!(machine = %machine_name, error = %e, "driver unavailable during delete");
                            self.store.remove_host(&machine_name).await?;
                        }
                    }
                }
                true
            }
            Err(Error::NotFound { .. }) => {
                // No profile; still clear any stray host record.
                self.store.remove_host(name).await?;
                false
            }
            Err(Error::Serialization { .. }) => {
                // Corrupt profile: delete must still succeed.
                self.store.remove_host(name).await?;
                true
            }
            Err(e) => return Err(e),
        };

        self.store.remove(name).await?;
        info!(cluster = %name, existed, "cluster deleted");
        Ok(existed)
    }

    /// Observed status of the cluster's primary node.
    pub async fn status(&self, name: &str) -> Result<ClusterStatus> {
        let cc = self.store.load(name).await?;
        let cp = cc.primary()?.clone();
        let machine_name = cc.machine_name(&cp);

        if !self.store.exists_host(&machine_name).await {
            return Ok(ClusterStatus::nonexistent(name));
        }

        let driver = self.driver_for(&cc, &machine_name, &cp.ip)?;
        let host_state = driver.state().await.unwrap_or(MachineState::Error);

        if host_state != MachineState::Running {
            return Ok(ClusterStatus {
                name: name.to_string(),
                host: host_state.to_string(),
                kubelet: MachineState::Stopped.to_string(),
                api_server: MachineState::Stopped.to_string(),
                kubeconfig: "Stopped".to_string(),
            });
        }

        let runner = driver.runner().await?;
        let bootstrapper = KubeadmBootstrapper::new(runner, self.store.clone());
        let kubelet = bootstrapper
            .kubelet_status()
            .await
            .unwrap_or(MachineState::Error);
        let api_server = bootstrapper
            .apiserver_status(&cp.ip, cp.port)
            .await
            .unwrap_or(MachineState::Error);

        let url = format!("https://{}:{}", cp.ip, cp.port);
        let kubeconfig_path = self
            .store
            .base()
            .join("profiles")
            .join(name)
            .join("kubeconfig");
        let configured = crate::kubeconfig::references_endpoint(&kubeconfig_path, &url).await;

        Ok(ClusterStatus {
            name: name.to_string(),
            host: host_state.to_string(),
            kubelet: kubelet.to_string(),
            api_server: api_server.to_string(),
            kubeconfig: if configured {
                "Configured".to_string()
            } else {
                "Misconfigured".to_string()
            },
        })
    }
}

/// Log driver-specific advice for pressure errors; the error itself still
/// propagates.
fn advise_on_pressure(err: &Error, driver: DriverTag) {
    if let Error::NodePressure { kind, node } = err {
        let advice = crate::kverify::pressure_advice(*kind, driver.is_vm(), driver.is_kic());
        warn!(node = %node, kind = %kind, "{}", advice);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_exit_codes_follow_the_legacy_contract() {
        let mut status = ClusterStatus {
            name: "t1".to_string(),
            host: "Running".to_string(),
            kubelet: "Running".to_string(),
            api_server: "Running".to_string(),
            kubeconfig: "Configured".to_string(),
        };
        assert_eq!(status.exit_code(), 0);

        status.host = "Paused".to_string();
        assert_eq!(status.exit_code(), 2);

        status.host = "Stopped".to_string();
        assert_eq!(status.exit_code(), 7);

        let gone = ClusterStatus::nonexistent("t1");
        assert_eq!(gone.host, "Nonexistent");
        assert_eq!(gone.exit_code(), 7);
    }

    #[test]
    fn status_round_trips_through_json() {
        let status = ClusterStatus {
            name: "t1".to_string(),
            host: "Running".to_string(),
            kubelet: "Running".to_string(),
            api_server: "Running".to_string(),
            kubeconfig: "Configured".to_string(),
        };
        let json = serde_json::to_string(&status).unwrap();
        let back: ClusterStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(status, back);
    }

    /// Story: `delete` of a never-created profile succeeds and reports
    /// that nothing existed.
    #[tokio::test]
    async fn delete_of_missing_profile_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = Orchestrator::new(Store::new(dir.path()));

        let existed = orchestrator.delete("never").await.unwrap();
        assert!(!existed);

        // And it stays idempotent.
        let existed = orchestrator.delete("never").await.unwrap();
        assert!(!existed);
    }

    /// Story: `status` on a deleted cluster reports NotFound so the CLI
    /// can exit 7.
    #[tokio::test]
    async fn status_of_missing_profile_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = Orchestrator::new(Store::new(dir.path()));
        match orchestrator.status("ghost").await {
            Err(Error::NotFound { .. }) => {}
            other => panic!("expected NotFound, got {:?}", other),
        }
    }
}
