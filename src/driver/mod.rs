//! Machine drivers
//!
//! A [`Driver`] acquires and controls one guest: a container for the KIC
//! family (docker, podman), an existing remote host for ssh, or the local
//! host itself for "none". The closed [`DriverTag`] enumeration keeps the
//! registry listable for CLI help and keeps profile serialization simple.

mod docker;
mod fake;
mod none;
mod serial;
mod ssh;

pub use docker::KicDriver;
pub use fake::FakeDriver;
pub use none::NoneDriver;
pub use serial::SerialDriver;
pub use ssh::SshDriver;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::runner::CommandRunner;
use crate::{Error, Result};

/// Known driver tags. VM hypervisor drivers are registered so the CLI can
/// name them, but are not available in this build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverTag {
    /// VirtualBox VM driver (registered, unavailable).
    Virtualbox,
    /// KVM2 VM driver (registered, unavailable).
    Kvm2,
    /// Hyperkit VM driver (registered, unavailable).
    Hyperkit,
    /// Hyper-V VM driver (registered, unavailable).
    Hyperv,
    /// VMware VM driver (registered, unavailable).
    Vmware,
    /// Kubernetes-in-container via the docker CLI.
    Docker,
    /// Kubernetes-in-container via the podman CLI.
    Podman,
    /// An existing remote host reached over SSH.
    Ssh,
    /// The local host is the machine.
    None,
}

impl DriverTag {
    /// Every known tag, in registry order.
    pub fn all() -> &'static [DriverTag] {
        &[
            DriverTag::Docker,
            DriverTag::Podman,
            DriverTag::None,
            DriverTag::Ssh,
            DriverTag::Virtualbox,
            DriverTag::Kvm2,
            DriverTag::Hyperkit,
            DriverTag::Hyperv,
            DriverTag::Vmware,
        ]
    }

    /// Whether this driver runs the control plane inside a container.
    pub fn is_kic(&self) -> bool {
        matches!(self, DriverTag::Docker | DriverTag::Podman)
    }

    /// Whether this driver manages a virtual machine.
    pub fn is_vm(&self) -> bool {
        matches!(
            self,
            DriverTag::Virtualbox
                | DriverTag::Kvm2
                | DriverTag::Hyperkit
                | DriverTag::Hyperv
                | DriverTag::Vmware
        )
    }

    /// Whether the guest is the host itself (no machine acquisition).
    pub fn bare_metal(&self) -> bool {
        matches!(self, DriverTag::None | DriverTag::Ssh)
    }
}

impl std::fmt::Display for DriverTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DriverTag::Virtualbox => "virtualbox",
            DriverTag::Kvm2 => "kvm2",
            DriverTag::Hyperkit => "hyperkit",
            DriverTag::Hyperv => "hyperv",
            DriverTag::Vmware => "vmware",
            DriverTag::Docker => "docker",
            DriverTag::Podman => "podman",
            DriverTag::Ssh => "ssh",
            DriverTag::None => "none",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for DriverTag {
    type Err = Error;

    fn from_str(s: &str) -> Result<DriverTag> {
        match s {
            "virtualbox" => Ok(DriverTag::Virtualbox),
            "kvm2" => Ok(DriverTag::Kvm2),
            "hyperkit" => Ok(DriverTag::Hyperkit),
            "hyperv" => Ok(DriverTag::Hyperv),
            "vmware" => Ok(DriverTag::Vmware),
            "docker" => Ok(DriverTag::Docker),
            "podman" => Ok(DriverTag::Podman),
            "ssh" => Ok(DriverTag::Ssh),
            "none" => Ok(DriverTag::None),
            other => Err(Error::DriverNotSupported {
                name: other.to_string(),
            }),
        }
    }
}

/// Observed machine state. Derived from the driver, never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineState {
    /// No machine exists.
    None,
    /// Machine exists but is stopped.
    Stopped,
    /// Machine is coming up.
    Starting,
    /// Machine is running.
    Running,
    /// Machine is paused.
    Paused,
    /// Machine is going down.
    Stopping,
    /// Driver fault; terminal until removed.
    Error,
}

impl std::fmt::Display for MachineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MachineState::None => "Nonexistent",
            MachineState::Stopped => "Stopped",
            MachineState::Starting => "Starting",
            MachineState::Running => "Running",
            MachineState::Paused => "Paused",
            MachineState::Stopping => "Stopping",
            MachineState::Error => "Error",
        };
        write!(f, "{}", s)
    }
}

/// Everything a driver needs to acquire and address one machine.
#[derive(Debug, Clone, Default)]
pub struct MachineConfig {
    /// Machine (and container) name.
    pub name: String,
    /// vCPUs for the guest.
    pub cpus: u32,
    /// Guest memory in MB.
    pub memory_mb: u32,
    /// Guest disk in MB (VM drivers only; advisory for KIC).
    pub disk_mb: u32,
    /// Apiserver port to publish.
    pub apiserver_port: u16,
    /// OCI binary for KIC drivers: "docker" or "podman".
    pub oci_binary: String,
    /// SSH user (ssh driver).
    pub ssh_user: String,
    /// SSH host (ssh driver).
    pub ssh_host: String,
    /// SSH port (ssh driver).
    pub ssh_port: u16,
    /// SSH private key path (ssh driver).
    pub ssh_key: PathBuf,
    /// Environment propagated into the guest (HTTP proxies).
    pub env: Vec<String>,
}

/// Acquires and controls a single guest.
#[async_trait]
pub trait Driver: Send + Sync {
    /// The tag this driver implements.
    fn driver_name(&self) -> DriverTag;

    /// Cheap environment validation before anything is created.
    async fn precreate_check(&self) -> Result<()>;

    /// Bring the machine into existence. Must short-circuit when the
    /// machine already exists.
    async fn create_machine(&self) -> Result<()>;

    /// Current machine state.
    async fn state(&self) -> Result<MachineState>;

    /// Start a stopped machine.
    async fn start_machine(&self) -> Result<()>;

    /// Gracefully stop the machine.
    async fn stop_machine(&self) -> Result<()>;

    /// Force-stop the machine.
    async fn kill_machine(&self) -> Result<()>;

    /// Stop then start.
    async fn restart_machine(&self) -> Result<()> {
        self.stop_machine().await?;
        self.start_machine().await
    }

    /// Destroy the machine. Idempotent.
    async fn remove_machine(&self) -> Result<()>;

    /// Reachable IP of the guest.
    async fn ip(&self) -> Result<String>;

    /// SSH hostname for the guest.
    async fn ssh_hostname(&self) -> Result<String> {
        self.ip().await
    }

    /// SSH port for the guest.
    async fn ssh_port(&self) -> Result<u16>;

    /// SSH user for the guest.
    fn ssh_user(&self) -> String;

    /// SSH private key path for the guest.
    fn ssh_key_path(&self) -> PathBuf;

    /// Docker daemon URL inside the guest, when one exists.
    async fn url(&self) -> Result<String> {
        Ok(format!(
            "tcp://{}:{}",
            self.ip().await?,
            crate::constants::DOCKER_DAEMON_PORT
        ))
    }

    /// A command runner for the guest.
    async fn runner(&self) -> Result<Arc<dyn CommandRunner>>;
}

/// One registry entry: metadata plus an optional factory.
pub struct DriverMeta {
    /// The tag.
    pub tag: DriverTag,
    /// Selection priority when choosing a default (higher wins).
    pub priority: u8,
    /// Whether this build can instantiate the driver.
    pub available: bool,
    factory: Option<fn(MachineConfig) -> Arc<dyn Driver>>,
}

/// Maps driver tags to factories and metadata.
pub struct Registry {
    entries: BTreeMap<DriverTag, DriverMeta>,
}

impl Registry {
    /// The standard registry: KIC, none and ssh drivers with factories, VM
    /// tags present but unavailable.
    pub fn standard() -> Registry {
        let mut entries = BTreeMap::new();
        let mut add = |tag, priority, available, factory| {
            entries.insert(
                tag,
                DriverMeta {
                    tag,
                    priority,
                    available,
                    factory,
                },
            );
        };

        add(DriverTag::Docker, 9, true, Some(new_docker as fn(MachineConfig) -> Arc<dyn Driver>));
        add(DriverTag::Podman, 7, true, Some(new_podman));
        add(DriverTag::None, 4, true, Some(new_none));
        add(DriverTag::Ssh, 4, true, Some(new_ssh));
        for vm in [
            DriverTag::Virtualbox,
            DriverTag::Kvm2,
            DriverTag::Hyperkit,
            DriverTag::Hyperv,
            DriverTag::Vmware,
        ] {
            add(vm, 5, false, None);
        }

        Registry { entries }
    }

    /// Instantiate the driver for a tag.
    pub fn create(&self, tag: DriverTag, config: MachineConfig) -> Result<Arc<dyn Driver>> {
        let meta = self.entries.get(&tag).ok_or_else(|| Error::DriverNotSupported {
            name: tag.to_string(),
        })?;
        match (&meta.factory, meta.available) {
            (Some(factory), true) => Ok(factory(config)),
            _ => Err(Error::DriverUnavailable {
                name: tag.to_string(),
                message: "not available in this build".to_string(),
            }),
        }
    }

    /// All registered entries, highest priority first.
    pub fn list(&self) -> Vec<&DriverMeta> {
        let mut metas: Vec<&DriverMeta> = self.entries.values().collect();
        metas.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.tag.cmp(&b.tag)));
        metas
    }

    /// The highest-priority available driver, for defaulting `--driver`.
    pub fn default_tag(&self) -> DriverTag {
        self.list()
            .iter()
            .find(|m| m.available)
            .map(|m| m.tag)
            .unwrap_or(DriverTag::Docker)
    }
}

fn new_docker(config: MachineConfig) -> Arc<dyn Driver> {
    // VirtualBox-style CLI serialization is unnecessary for docker, but
    // podman machine state mutations race, so both KIC drivers are
    // serialized.
    Arc::new(SerialDriver::new(Arc::new(KicDriver::docker(config))))
}

fn new_podman(config: MachineConfig) -> Arc<dyn Driver> {
    Arc::new(SerialDriver::new(Arc::new(KicDriver::podman(config))))
}

fn new_none(config: MachineConfig) -> Arc<dyn Driver> {
    Arc::new(NoneDriver::new(config))
}

fn new_ssh(config: MachineConfig) -> Arc<dyn Driver> {
    Arc::new(SshDriver::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_round_trip_through_serde() {
        for tag in DriverTag::all() {
            let json = serde_json::to_string(tag).unwrap();
            let back: DriverTag = serde_json::from_str(&json).unwrap();
            assert_eq!(*tag, back);
        }
        assert_eq!(serde_json::to_string(&DriverTag::None).unwrap(), "\"none\"");
    }

    /// Story: `--driver=parallels` must fail with DriverNotSupported
    /// naming the tag (exit 85 at the CLI).
    #[test]
    fn unknown_tag_fails_parse() {
        match "parallels".parse::<DriverTag>() {
            Err(Error::DriverNotSupported { name }) => assert_eq!(name, "parallels"),
            other => panic!("expected DriverNotSupported, got {:?}", other),
        }
    }

    /// Story: VM tags are known (so help can list them) but unavailable in
    /// this build.
    #[test]
    fn vm_tags_are_registered_but_unavailable() {
        let registry = Registry::standard();
        let config = MachineConfig::default();
        match registry.create(DriverTag::Virtualbox, config) {
            Err(Error::DriverUnavailable { name, .. }) => assert_eq!(name, "virtualbox"),
            other => panic!("expected DriverUnavailable, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn docker_is_the_default_driver() {
        assert_eq!(Registry::standard().default_tag(), DriverTag::Docker);
    }

    #[test]
    fn kic_and_bare_metal_classification() {
        assert!(DriverTag::Docker.is_kic());
        assert!(DriverTag::Podman.is_kic());
        assert!(!DriverTag::None.is_kic());
        assert!(DriverTag::None.bare_metal());
        assert!(DriverTag::Ssh.bare_metal());
        assert!(DriverTag::Kvm2.is_vm());
    }
}
