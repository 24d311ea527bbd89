//! In-memory driver for tests
//!
//! Implements the full machine state machine over a mutex-held state and
//! exposes the scripted [`FakeRunner`] as its guest transport, so pipeline
//! tests can run without docker or a VM.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::runner::{CommandRunner, FakeRunner};
use crate::{Error, Result};

use super::{Driver, DriverTag, MachineState};

/// A driver whose machine lives in memory.
pub struct FakeDriver {
    name: String,
    state: Mutex<MachineState>,
    /// The scripted runner handed to callers; tests stub and inspect it.
    pub runner: Arc<FakeRunner>,
    /// When set, `create_machine` fails with this message.
    pub fail_create: Mutex<Option<String>>,
}

impl FakeDriver {
    /// A fake machine named `name`, initially nonexistent.
    pub fn new(name: impl Into<String>) -> FakeDriver {
        FakeDriver {
            name: name.into(),
            state: Mutex::new(MachineState::None),
            runner: Arc::new(FakeRunner::new()),
            fail_create: Mutex::new(None),
        }
    }

    /// Force the machine into a state (test setup).
    pub fn set_state(&self, state: MachineState) {
        *self.state.lock().unwrap() = state;
    }
}

#[async_trait]
impl Driver for FakeDriver {
    fn driver_name(&self) -> DriverTag {
        DriverTag::Docker
    }

    async fn precreate_check(&self) -> Result<()> {
        Ok(())
    }

    async fn create_machine(&self) -> Result<()> {
        if let Some(msg) = self.fail_create.lock().unwrap().clone() {
            *self.state.lock().unwrap() = MachineState::Error;
            return Err(Error::MachineCreateFailed {
                machine: self.name.clone(),
                message: msg,
            });
        }
        let mut state = self.state.lock().unwrap();
        if *state == MachineState::None {
            *state = MachineState::Running;
        }
        Ok(())
    }

    async fn state(&self) -> Result<MachineState> {
        Ok(*self.state.lock().unwrap())
    }

    async fn start_machine(&self) -> Result<()> {
        *self.state.lock().unwrap() = MachineState::Running;
        Ok(())
    }

    async fn stop_machine(&self) -> Result<()> {
        *self.state.lock().unwrap() = MachineState::Stopped;
        Ok(())
    }

    async fn kill_machine(&self) -> Result<()> {
        *self.state.lock().unwrap() = MachineState::Stopped;
        Ok(())
    }

    async fn remove_machine(&self) -> Result<()> {
        *self.state.lock().unwrap() = MachineState::None;
        Ok(())
    }

    async fn ip(&self) -> Result<String> {
        Ok("192.168.49.2".to_string())
    }

    async fn ssh_port(&self) -> Result<u16> {
        Ok(22)
    }

    fn ssh_user(&self) -> String {
        "docker".to_string()
    }

    fn ssh_key_path(&self) -> PathBuf {
        PathBuf::from("/dev/null")
    }

    async fn runner(&self) -> Result<Arc<dyn CommandRunner>> {
        Ok(self.runner.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lifecycle_transitions_follow_the_state_machine() {
        let d = FakeDriver::new("t1");
        assert_eq!(d.state().await.unwrap(), MachineState::None);

        d.create_machine().await.unwrap();
        assert_eq!(d.state().await.unwrap(), MachineState::Running);

        d.stop_machine().await.unwrap();
        assert_eq!(d.state().await.unwrap(), MachineState::Stopped);

        d.start_machine().await.unwrap();
        assert_eq!(d.state().await.unwrap(), MachineState::Running);

        d.remove_machine().await.unwrap();
        assert_eq!(d.state().await.unwrap(), MachineState::None);
    }

    #[tokio::test]
    async fn url_points_at_the_guest_docker_daemon() {
        let d = FakeDriver::new("t1");
        assert_eq!(d.url().await.unwrap(), "tcp://192.168.49.2:2376");
    }

    #[tokio::test]
    async fn create_failure_lands_in_error_state() {
        let d = FakeDriver::new("t1");
        *d.fail_create.lock().unwrap() = Some("no space left".to_string());
        assert!(d.create_machine().await.is_err());
        assert_eq!(d.state().await.unwrap(), MachineState::Error);
    }
}
