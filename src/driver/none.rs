//! "none" driver: the local host is the machine
//!
//! Nothing is acquired or released; create and remove are no-ops, state is
//! always Running, and commands run through the local exec runner.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::runner::{Command, CommandRunner, ExecRunner};
use crate::{Error, Result};

use super::{Driver, DriverTag, MachineConfig, MachineState};

/// Uses the local host directly.
pub struct NoneDriver {
    config: MachineConfig,
    local: Arc<ExecRunner>,
}

impl NoneDriver {
    /// A driver over the local host.
    pub fn new(config: MachineConfig) -> NoneDriver {
        NoneDriver {
            config,
            local: Arc::new(ExecRunner::new()),
        }
    }
}

#[async_trait]
impl Driver for NoneDriver {
    fn driver_name(&self) -> DriverTag {
        DriverTag::None
    }

    async fn precreate_check(&self) -> Result<()> {
        // kubeadm needs root; refuse early rather than failing mid-init.
        let rr = self.local.run_cmd(Command::new(["id", "-u"])).await?;
        if rr.stdout_str().trim() != "0" && std::env::var("CHANGE_MINIKUBE_NONE_USER").is_err() {
            return Err(Error::DriverUnavailable {
                name: "none".to_string(),
                message: "the none driver requires root privileges".to_string(),
            });
        }
        Ok(())
    }

    async fn create_machine(&self) -> Result<()> {
        // The host is the machine.
        Ok(())
    }

    async fn state(&self) -> Result<MachineState> {
        Ok(MachineState::Running)
    }

    async fn start_machine(&self) -> Result<()> {
        Ok(())
    }

    async fn stop_machine(&self) -> Result<()> {
        // Stopping the host is not ours to do; the kubelet is stopped by
        // the node-level stop path.
        Ok(())
    }

    async fn kill_machine(&self) -> Result<()> {
        Ok(())
    }

    async fn remove_machine(&self) -> Result<()> {
        Ok(())
    }

    async fn ip(&self) -> Result<String> {
        let rr = self.local.run_cmd(Command::shell("hostname -I")).await?;
        Ok(rr
            .stdout_str()
            .split_whitespace()
            .next()
            .unwrap_or("127.0.0.1")
            .to_string())
    }

    async fn ssh_port(&self) -> Result<u16> {
        Ok(22)
    }

    fn ssh_user(&self) -> String {
        self.config.ssh_user.clone()
    }

    fn ssh_key_path(&self) -> PathBuf {
        self.config.ssh_key.clone()
    }

    async fn runner(&self) -> Result<Arc<dyn CommandRunner>> {
        Ok(self.local.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn host_is_always_running() {
        let d = NoneDriver::new(MachineConfig::default());
        d.create_machine().await.unwrap();
        assert_eq!(d.state().await.unwrap(), MachineState::Running);
        d.remove_machine().await.unwrap();
        assert_eq!(d.state().await.unwrap(), MachineState::Running);
    }

    #[tokio::test]
    async fn ssh_port_defaults_to_22() {
        let d = NoneDriver::new(MachineConfig::default());
        assert_eq!(d.ssh_port().await.unwrap(), 22);
    }
}
