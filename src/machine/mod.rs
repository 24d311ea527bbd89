//! Machine lifecycle
//!
//! [`Host`] is the persisted runtime record of one machine. The functions
//! here compose a [`Driver`] with the [`Store`] and certificate bootstrap
//! into the fixed create sequence, which is idempotent on failure: each
//! step either observes it is already satisfied or executes, so a failed
//! `start` resumes where it stopped.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::assets::Asset;
use crate::certs::{self, AuthOptions};
use crate::config::ClusterConfig;
use crate::driver::{Driver, MachineState};
use crate::store::Store;
use crate::{constants, Error, Result};

/// How long `create` waits for the machine to reach Running.
pub const CREATE_TIMEOUT: Duration = Duration::from_secs(600);

/// How long `stop` waits for the machine to reach Stopped.
const STOP_TIMEOUT: Duration = Duration::from_secs(120);

/// Poll interval while waiting on driver state.
const STATE_POLL: Duration = Duration::from_secs(1);

/// Persisted runtime state of one machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Host {
    /// Machine name.
    pub name: String,
    /// Driver tag that owns this machine.
    pub driver_name: String,
    /// Opaque driver-specific state.
    #[serde(default)]
    pub driver_state: serde_json::Value,
    /// Last observed guest IP.
    #[serde(default)]
    pub ip: String,
    /// SSH endpoint host.
    #[serde(default)]
    pub ssh_hostname: String,
    /// SSH endpoint port.
    #[serde(default)]
    pub ssh_port: u16,
    /// SSH user.
    #[serde(default)]
    pub ssh_user: String,
    /// SSH private key path.
    #[serde(default)]
    pub ssh_key_path: PathBuf,
    /// Certs directory used for this machine's server certificate.
    #[serde(default)]
    pub certs_dir: PathBuf,
}

impl Host {
    /// A fresh host record for a machine about to be created.
    pub fn new(name: impl Into<String>, driver_name: impl Into<String>) -> Host {
        Host {
            name: name.into(),
            driver_name: driver_name.into(),
            driver_state: serde_json::Value::Null,
            ip: String::new(),
            ssh_hostname: String::new(),
            ssh_port: 0,
            ssh_user: String::new(),
            ssh_key_path: PathBuf::new(),
            certs_dir: PathBuf::new(),
        }
    }
}

fn step_err(machine: &str, step: &str, e: impl std::fmt::Display) -> Error {
    Error::MachineCreateFailed {
        machine: machine.to_string(),
        message: format!("{}: {}", step, e),
    }
}

/// Create (or re-adopt) a machine and bring it to Running.
///
/// The fixed sequence: cert bootstrap under the exclusive lock, precreate
/// check, host save, machine create, wait for Running, provision. Any
/// failing step aborts with an error naming the step; rerunning resumes.
pub async fn create_host(
    store: &Store,
    driver: &dyn Driver,
    cc: &ClusterConfig,
    machine_name: &str,
) -> Result<Host> {
    let auth = AuthOptions::new(store.certs_dir(), machine_name);

    // The machine has no address yet; the server cert is re-issued with
    // the real IP during provisioning.
    certs::bootstrap(
        &auth,
        &store.machine_client_lock(),
        IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
    )
    .await
    .map_err(|e| step_err(machine_name, "bootstrapping certificates", e))?;

    driver
        .precreate_check()
        .await
        .map_err(|e| step_err(machine_name, "precreate", e))?;

    let mut host = match store.load_host(machine_name).await {
        Ok(host) => {
            debug!(machine = machine_name, "reusing existing host record");
            host
        }
        Err(Error::NotFound { .. }) => {
            let host = Host::new(machine_name, driver.driver_name().to_string());
            store
                .save_host(&host)
                .await
                .map_err(|e| step_err(machine_name, "saving host", e))?;
            host
        }
        Err(e) => return Err(step_err(machine_name, "loading host", e)),
    };

    driver
        .create_machine()
        .await
        .map_err(|e| step_err(machine_name, "creating machine", e))?;

    if driver.state().await? != MachineState::Running {
        driver
            .start_machine()
            .await
            .map_err(|e| step_err(machine_name, "starting machine", e))?;
    }

    wait_for_state(driver, machine_name, MachineState::Running, CREATE_TIMEOUT).await?;

    provision(store, driver, cc, &mut host)
        .await
        .map_err(|e| step_err(machine_name, "provisioning", e))?;

    store
        .save_host(&host)
        .await
        .map_err(|e| step_err(machine_name, "saving host", e))?;

    info!(machine = machine_name, ip = %host.ip, "machine running");
    Ok(host)
}

/// Provision a running machine: re-issue the server certificate for its
/// real IP, materialize certs in the guest, and propagate proxy env.
async fn provision(
    store: &Store,
    driver: &dyn Driver,
    cc: &ClusterConfig,
    host: &mut Host,
) -> Result<()> {
    let ip = driver.ip().await?;
    let auth = AuthOptions::new(store.certs_dir(), &host.name);

    if let Ok(parsed) = ip.parse::<IpAddr>() {
        certs::bootstrap(&auth, &store.machine_client_lock(), parsed).await?;
    }

    host.ip = ip;
    host.ssh_hostname = driver.ssh_hostname().await.unwrap_or_default();
    host.ssh_port = driver.ssh_port().await.unwrap_or(0);
    host.ssh_user = driver.ssh_user();
    host.ssh_key_path = driver.ssh_key_path();
    host.certs_dir = auth.certs_dir.clone();

    let runner = driver.runner().await?;

    for (src, name) in [
        (auth.ca_cert_path(), "ca.crt"),
        (auth.server_cert_path(), "apiserver.crt"),
        (auth.server_key_path(), "apiserver.key"),
    ] {
        let asset = Asset::from_file(&src, constants::GUEST_CERTS_DIR, name, "0644").await?;
        runner.copy_file(&asset).await?;
    }

    if !cc.http_proxy_env.is_empty() {
        let env_file = cc.http_proxy_env.join("\n") + "\n";
        let asset = Asset::from_bytes(
            env_file.into_bytes(),
            "/etc/profile.d",
            "minikube-proxy.sh",
            "0644",
        );
        runner.copy_file(&asset).await?;
    }

    Ok(())
}

/// Poll the driver until it reports `want` or the deadline passes.
pub async fn wait_for_state(
    driver: &dyn Driver,
    machine_name: &str,
    want: MachineState,
    timeout: Duration,
) -> Result<()> {
    let start = Instant::now();
    loop {
        match driver.state().await {
            Ok(state) if state == want => return Ok(()),
            Ok(state) => {
                debug!(machine = machine_name, %state, want = %want, "waiting for machine state");
            }
            Err(e) => {
                warn!(machine = machine_name, error = %e, "state query failed, retrying");
            }
        }
        if start.elapsed() > timeout {
            return Err(Error::MachineStateTimeout {
                machine: machine_name.to_string(),
                want: want.to_string(),
                timeout,
            });
        }
        tokio::time::sleep(STATE_POLL).await;
    }
}

/// Start a stopped machine; a running machine short-circuits.
pub async fn start_host(driver: &dyn Driver, machine_name: &str) -> Result<()> {
    if driver.state().await? == MachineState::Running {
        debug!(machine = machine_name, "already running");
        return Ok(());
    }
    driver.start_machine().await?;
    wait_for_state(driver, machine_name, MachineState::Running, CREATE_TIMEOUT).await
}

/// Stop a machine, leaving its state on disk.
pub async fn stop_host(driver: &dyn Driver, machine_name: &str) -> Result<()> {
    match driver.state().await? {
        MachineState::Stopped | MachineState::None => return Ok(()),
        _ => {}
    }
    driver.stop_machine().await?;
    wait_for_state(driver, machine_name, MachineState::Stopped, STOP_TIMEOUT).await
}

/// Remove a machine and its host record. Idempotent through every
/// intermediate state, including "no host, no machine".
pub async fn delete_host(store: &Store, driver: &dyn Driver, machine_name: &str) -> Result<()> {
    driver.remove_machine().await?;
    store.remove_host(machine_name).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{default_verify_components, KubernetesConfig, Node};
    use crate::driver::{DriverTag, FakeDriver};

    fn sample_cc(name: &str) -> ClusterConfig {
        ClusterConfig {
            name: name.to_string(),
            driver: DriverTag::Docker,
            nodes: vec![Node {
                name: String::new(),
                ip: String::new(),
                port: 8443,
                kubernetes_version: "v1.18.0".to_string(),
                control_plane: true,
                worker: true,
            }],
            kubernetes_config: KubernetesConfig {
                kubernetes_version: "v1.18.0".to_string(),
                container_runtime: "docker".to_string(),
                service_cidr: "10.96.0.0/12".to_string(),
                node_port: 8443,
                ..Default::default()
            },
            addons: Default::default(),
            verify_components: default_verify_components(),
            memory_mb: 2048,
            cpus: 2,
            disk_mb: 20000,
            mount: false,
            mount_string: String::new(),
            http_proxy_env: Vec::new(),
        }
    }

    /// Story: a cold create runs the full sequence and leaves a host
    /// record with the machine's endpoint filled in.
    #[tokio::test]
    async fn create_host_runs_full_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());
        let driver = FakeDriver::new("t1");
        let cc = sample_cc("t1");

        let host = create_host(&store, &driver, &cc, "t1").await.unwrap();
        assert_eq!(host.ip, "192.168.49.2");
        assert!(store.exists_host("t1").await);
        assert_eq!(driver.state().await.unwrap(), MachineState::Running);

        // Certs landed in the guest.
        assert!(driver
            .runner
            .copied_paths()
            .contains(&"/var/lib/minikube/certs/apiserver.crt".to_string()));
    }

    /// Story: rerunning `start` after a successful create is a fast
    /// no-op-ish resume: the host record is reused, not recreated.
    #[tokio::test]
    async fn create_host_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());
        let driver = FakeDriver::new("t1");
        let cc = sample_cc("t1");

        let first = create_host(&store, &driver, &cc, "t1").await.unwrap();
        let second = create_host(&store, &driver, &cc, "t1").await.unwrap();
        assert_eq!(first.ip, second.ip);
    }

    /// Story: a create failure is wrapped with the failing step so the
    /// final message reads as a causal chain.
    #[tokio::test]
    async fn create_failure_names_the_step() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());
        let driver = FakeDriver::new("t1");
        *driver.fail_create.lock().unwrap() = Some("no space left".to_string());
        let cc = sample_cc("t1");

        let err = create_host(&store, &driver, &cc, "t1").await.unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("creating machine"), "got: {}", msg);
        assert!(msg.contains("no space left"), "got: {}", msg);
    }

    /// Story: `delete; delete` both succeed, even when nothing exists.
    #[tokio::test]
    async fn delete_host_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());
        let driver = FakeDriver::new("t1");
        let cc = sample_cc("t1");

        create_host(&store, &driver, &cc, "t1").await.unwrap();
        delete_host(&store, &driver, "t1").await.unwrap();
        delete_host(&store, &driver, "t1").await.unwrap();
        assert!(!store.exists_host("t1").await);
        assert_eq!(driver.state().await.unwrap(), MachineState::None);
    }

    #[tokio::test]
    async fn stop_then_start_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());
        let driver = FakeDriver::new("t1");
        let cc = sample_cc("t1");

        create_host(&store, &driver, &cc, "t1").await.unwrap();
        stop_host(&driver, "t1").await.unwrap();
        assert_eq!(driver.state().await.unwrap(), MachineState::Stopped);

        start_host(&driver, "t1").await.unwrap();
        assert_eq!(driver.state().await.unwrap(), MachineState::Running);
    }

    #[tokio::test]
    async fn host_json_round_trips() {
        let host = Host::new("t1", "docker");
        let json = serde_json::to_string(&host).unwrap();
        let back: Host = serde_json::from_str(&json).unwrap();
        assert_eq!(host, back);
    }
}
