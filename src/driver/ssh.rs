//! SSH driver: an existing remote host becomes the machine
//!
//! No image acquisition, no machine creation; the driver only verifies key
//! material and reachability, then hands out an SSH runner.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::runner::{Command, CommandRunner, SshRunner};
use crate::{Error, Result};

use super::{Driver, DriverTag, MachineConfig, MachineState};

/// Uses an existing remote host over SSH.
pub struct SshDriver {
    config: MachineConfig,
}

impl SshDriver {
    /// A driver for the configured SSH endpoint.
    pub fn new(config: MachineConfig) -> SshDriver {
        SshDriver { config }
    }

    fn make_runner(&self) -> SshRunner {
        SshRunner::new(
            self.config.ssh_host.clone(),
            if self.config.ssh_port == 0 { 22 } else { self.config.ssh_port },
            if self.config.ssh_user.is_empty() {
                "root".to_string()
            } else {
                self.config.ssh_user.clone()
            },
            self.config.ssh_key.clone(),
        )
    }
}

#[async_trait]
impl Driver for SshDriver {
    fn driver_name(&self) -> DriverTag {
        DriverTag::Ssh
    }

    async fn precreate_check(&self) -> Result<()> {
        if self.config.ssh_host.is_empty() {
            return Err(Error::DriverUnavailable {
                name: "ssh".to_string(),
                message: "no host configured; pass the remote address".to_string(),
            });
        }
        if !self.config.ssh_key.exists() {
            return Err(Error::DriverUnavailable {
                name: "ssh".to_string(),
                message: format!("ssh key {} does not exist", self.config.ssh_key.display()),
            });
        }
        Ok(())
    }

    async fn create_machine(&self) -> Result<()> {
        // The host already exists; verify we can actually run commands and
        // that passwordless sudo works, since everything else depends on it.
        let runner = self.make_runner();
        runner
            .run_cmd(Command::shell("sudo -n true"))
            .await
            .map_err(|e| Error::DriverUnavailable {
                name: "ssh".to_string(),
                message: format!("passwordless sudo check failed: {}", e),
            })?;
        Ok(())
    }

    async fn state(&self) -> Result<MachineState> {
        let runner = self.make_runner();
        match runner.run_cmd(Command::new(["true"])).await {
            Ok(_) => Ok(MachineState::Running),
            Err(_) => Ok(MachineState::Stopped),
        }
    }

    async fn start_machine(&self) -> Result<()> {
        Ok(())
    }

    async fn stop_machine(&self) -> Result<()> {
        Ok(())
    }

    async fn kill_machine(&self) -> Result<()> {
        Ok(())
    }

    async fn remove_machine(&self) -> Result<()> {
        Ok(())
    }

    async fn ip(&self) -> Result<String> {
        Ok(self.config.ssh_host.clone())
    }

    async fn ssh_port(&self) -> Result<u16> {
        Ok(if self.config.ssh_port == 0 { 22 } else { self.config.ssh_port })
    }

    fn ssh_user(&self) -> String {
        if self.config.ssh_user.is_empty() {
            "root".to_string()
        } else {
            self.config.ssh_user.clone()
        }
    }

    fn ssh_key_path(&self) -> PathBuf {
        self.config.ssh_key.clone()
    }

    async fn runner(&self) -> Result<Arc<dyn CommandRunner>> {
        Ok(Arc::new(self.make_runner()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn precreate_requires_host_and_key() {
        let d = SshDriver::new(MachineConfig::default());
        assert!(d.precreate_check().await.is_err());

        let dir = tempfile::tempdir().unwrap();
        let key = dir.path().join("id_rsa");
        std::fs::write(&key, "key").unwrap();

        let d = SshDriver::new(MachineConfig {
            ssh_host: "10.0.0.5".to_string(),
            ssh_key: key,
            ..Default::default()
        });
        assert!(d.precreate_check().await.is_ok());
    }

    #[tokio::test]
    async fn defaults_user_and_port() {
        let d = SshDriver::new(MachineConfig {
            ssh_host: "10.0.0.5".to_string(),
            ..Default::default()
        });
        assert_eq!(d.ssh_user(), "root");
        assert_eq!(d.ssh_port().await.unwrap(), 22);
        assert_eq!(d.ip().await.unwrap(), "10.0.0.5");
    }
}
