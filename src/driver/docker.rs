//! KIC driver: the control plane runs inside a privileged container
//!
//! Both docker and podman share this implementation; only the OCI binary
//! differs. The container is created from a kind-derived base image with
//! systemd as PID 1, SSH published on a dynamic localhost port, and the
//! apiserver port published for host access.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::runner::{Command, CommandRunner, ExecRunner, KicRunner, RunError};
use crate::{Error, Result};

use super::{Driver, DriverTag, MachineConfig, MachineState};

/// Base image used to spin up KIC containers; same lineage as kind.
pub const BASE_IMAGE: &str = "docker.io/afbjorklund/kicbase:v0.0.10-snapshot";

/// SSH user baked into the base image.
const KIC_SSH_USER: &str = "docker";

/// Runs the control plane inside a container via docker or podman.
pub struct KicDriver {
    config: MachineConfig,
    tag: DriverTag,
    oci: String,
    local: ExecRunner,
}

impl KicDriver {
    /// A KIC driver backed by the docker CLI.
    pub fn docker(config: MachineConfig) -> KicDriver {
        KicDriver {
            config,
            tag: DriverTag::Docker,
            oci: "docker".to_string(),
            local: ExecRunner::new(),
        }
    }

    /// A KIC driver backed by the podman CLI.
    pub fn podman(config: MachineConfig) -> KicDriver {
        KicDriver {
            config,
            tag: DriverTag::Podman,
            oci: "podman".to_string(),
            local: ExecRunner::new(),
        }
    }

    fn name(&self) -> &str {
        &self.config.name
    }

    async fn oci_cmd(&self, args: &[&str]) -> Result<String> {
        let mut argv = vec![self.oci.clone()];
        argv.extend(args.iter().map(|s| s.to_string()));
        let rr = self.local.run_cmd(Command::new(argv)).await?;
        Ok(rr.stdout_str().trim().to_string())
    }

    async fn inspect(&self, format: &str) -> Result<String> {
        self.oci_cmd(&["inspect", "-f", format, self.name()]).await
    }

    /// Whether the container exists at all.
    async fn exists(&self) -> bool {
        self.inspect("{{.Name}}").await.is_ok()
    }
}

#[async_trait]
impl Driver for KicDriver {
    fn driver_name(&self) -> DriverTag {
        self.tag
    }

    async fn precreate_check(&self) -> Result<()> {
        self.oci_cmd(&["version", "--format", "{{.Server.Version}}"])
            .await
            .map_err(|e| Error::DriverUnavailable {
                name: self.tag.to_string(),
                message: format!("{} daemon is not reachable: {}", self.oci, e),
            })?;
        Ok(())
    }

    async fn create_machine(&self) -> Result<()> {
        if self.exists().await {
            debug!(machine = self.name(), "container already exists");
            return Ok(());
        }

        info!(machine = self.name(), image = BASE_IMAGE, "creating container");
        let apiserver_port = self.config.apiserver_port.to_string();
        let mut args: Vec<String> = [
            "run",
            "-d",
            "-t",
            "--privileged",
            "--security-opt",
            "seccomp=unconfined",
            "--tmpfs",
            "/tmp",
            "--tmpfs",
            "/run",
            "-v",
            "/lib/modules:/lib/modules:ro",
            "--hostname",
            self.name(),
            "--name",
            self.name(),
            "--label",
            "created_by.minikube.sigs.k8s.io=true",
            "-p",
            "127.0.0.1::22",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        args.push("-p".to_string());
        args.push(format!("127.0.0.1::{}", apiserver_port));
        if self.config.cpus > 0 {
            args.push(format!("--cpus={}", self.config.cpus));
        }
        if self.config.memory_mb > 0 {
            args.push(format!("--memory={}mb", self.config.memory_mb));
        }
        for env in &self.config.env {
            args.push("-e".to_string());
            args.push(env.clone());
        }
        args.push(BASE_IMAGE.to_string());

        let arg_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
        self.oci_cmd(&arg_refs).await.map_err(|e| Error::MachineCreateFailed {
            machine: self.name().to_string(),
            message: e.to_string(),
        })?;
        Ok(())
    }

    async fn state(&self) -> Result<MachineState> {
        let status = match self.inspect("{{.State.Status}}").await {
            Ok(s) => s,
            Err(Error::CommandFailed(RunError::CommandFailed { .. })) => {
                return Ok(MachineState::None)
            }
            Err(e) => return Err(e),
        };
        Ok(match status.as_str() {
            "running" => MachineState::Running,
            "paused" => MachineState::Paused,
            "exited" | "created" | "dead" => MachineState::Stopped,
            "restarting" => MachineState::Starting,
            "removing" => MachineState::Stopping,
            _ => MachineState::Error,
        })
    }

    async fn start_machine(&self) -> Result<()> {
        self.oci_cmd(&["start", self.name()]).await?;
        Ok(())
    }

    async fn stop_machine(&self) -> Result<()> {
        self.oci_cmd(&["stop", "-t", "30", self.name()]).await?;
        Ok(())
    }

    async fn kill_machine(&self) -> Result<()> {
        self.oci_cmd(&["kill", self.name()]).await?;
        Ok(())
    }

    async fn remove_machine(&self) -> Result<()> {
        if !self.exists().await {
            return Ok(());
        }
        self.oci_cmd(&["rm", "-f", "-v", self.name()]).await?;
        Ok(())
    }

    async fn ip(&self) -> Result<String> {
        let ip = self
            .inspect("{{range .NetworkSettings.Networks}}{{.IPAddress}}{{end}}")
            .await?;
        if ip.is_empty() {
            return Err(Error::MachineCreateFailed {
                machine: self.name().to_string(),
                message: "container has no IP address".to_string(),
            });
        }
        Ok(ip)
    }

    async fn ssh_hostname(&self) -> Result<String> {
        // SSH is published on localhost, not the container network.
        Ok("127.0.0.1".to_string())
    }

    async fn ssh_port(&self) -> Result<u16> {
        let out = self.oci_cmd(&["port", self.name(), "22/tcp"]).await?;
        // "127.0.0.1:32772"
        let port = out
            .rsplit(':')
            .next()
            .and_then(|p| p.trim().parse::<u16>().ok())
            .ok_or_else(|| Error::MachineCreateFailed {
                machine: self.name().to_string(),
                message: format!("unparseable port mapping: {}", out),
            })?;
        Ok(port)
    }

    fn ssh_user(&self) -> String {
        KIC_SSH_USER.to_string()
    }

    fn ssh_key_path(&self) -> PathBuf {
        self.config.ssh_key.clone()
    }

    async fn runner(&self) -> Result<Arc<dyn CommandRunner>> {
        Ok(Arc::new(KicRunner::new(self.oci.clone(), self.name())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn docker_and_podman_share_the_implementation() {
        let docker = KicDriver::docker(MachineConfig {
            name: "t1".to_string(),
            ..Default::default()
        });
        assert_eq!(docker.driver_name(), DriverTag::Docker);
        assert_eq!(docker.ssh_user(), "docker");

        let podman = KicDriver::podman(MachineConfig {
            name: "t1".to_string(),
            ..Default::default()
        });
        assert_eq!(podman.driver_name(), DriverTag::Podman);
        assert_eq!(podman.oci, "podman");
    }
}
