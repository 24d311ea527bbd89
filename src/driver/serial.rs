//! Serialized driver wrapper
//!
//! Some machine backends cannot tolerate concurrent CLI invocations (the
//! original offender being VirtualBox's own locking). [`SerialDriver`]
//! wraps any driver and funnels every call through one process-wide mutex.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::runner::CommandRunner;
use crate::Result;

use super::{Driver, DriverTag, MachineState};

/// One lock shared by every SerialDriver in the process.
static SERIAL_LOCK: Mutex<()> = Mutex::const_new(());

/// Serializes all calls to the wrapped driver.
pub struct SerialDriver {
    inner: Arc<dyn Driver>,
}

impl SerialDriver {
    /// Wrap a driver so its calls never run concurrently with any other
    /// serialized driver in this process.
    pub fn new(inner: Arc<dyn Driver>) -> SerialDriver {
        SerialDriver { inner }
    }
}

#[async_trait]
impl Driver for SerialDriver {
    fn driver_name(&self) -> DriverTag {
        self.inner.driver_name()
    }

    async fn precreate_check(&self) -> Result<()> {
        let _g = SERIAL_LOCK.lock().await;
        self.inner.precreate_check().await
    }

    async fn create_machine(&self) -> Result<()> {
        let _g = SERIAL_LOCK.lock().await;
        self.inner.create_machine().await
    }

    async fn state(&self) -> Result<MachineState> {
        let _g = SERIAL_LOCK.lock().await;
        self.inner.state().await
    }

    async fn start_machine(&self) -> Result<()> {
        let _g = SERIAL_LOCK.lock().await;
        self.inner.start_machine().await
    }

    async fn stop_machine(&self) -> Result<()> {
        let _g = SERIAL_LOCK.lock().await;
        self.inner.stop_machine().await
    }

    async fn kill_machine(&self) -> Result<()> {
        let _g = SERIAL_LOCK.lock().await;
        self.inner.kill_machine().await
    }

    async fn restart_machine(&self) -> Result<()> {
        // Takes the lock per step; holding it across both would deadlock
        // the default stop-then-start composition.
        self.stop_machine().await?;
        self.start_machine().await
    }

    async fn remove_machine(&self) -> Result<()> {
        let _g = SERIAL_LOCK.lock().await;
        self.inner.remove_machine().await
    }

    async fn ip(&self) -> Result<String> {
        let _g = SERIAL_LOCK.lock().await;
        self.inner.ip().await
    }

    async fn ssh_hostname(&self) -> Result<String> {
        let _g = SERIAL_LOCK.lock().await;
        self.inner.ssh_hostname().await
    }

    async fn ssh_port(&self) -> Result<u16> {
        let _g = SERIAL_LOCK.lock().await;
        self.inner.ssh_port().await
    }

    fn ssh_user(&self) -> String {
        self.inner.ssh_user()
    }

    fn ssh_key_path(&self) -> PathBuf {
        self.inner.ssh_key_path()
    }

    async fn url(&self) -> Result<String> {
        let _g = SERIAL_LOCK.lock().await;
        self.inner.url().await
    }

    async fn runner(&self) -> Result<Arc<dyn CommandRunner>> {
        self.inner.runner().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::FakeDriver;

    /// Story: calls through the wrapper are serialized but still complete;
    /// two concurrent state queries can't interleave inside the driver.
    #[tokio::test]
    async fn serialized_calls_complete() {
        let fake = Arc::new(FakeDriver::new("t1"));
        let serial = SerialDriver::new(fake.clone());

        serial.create_machine().await.unwrap();
        let (a, b) = tokio::join!(serial.state(), serial.state());
        assert_eq!(a.unwrap(), MachineState::Running);
        assert_eq!(b.unwrap(), MachineState::Running);
    }
}
