//! SSH command runner
//!
//! Commands run through a shared SSH control-master session so that
//! re-dialing (with exponential backoff) is separate from command
//! execution: a lost session is re-established, but the logical command is
//! never silently retried — that policy belongs to the caller.
//!
//! File uploads speak the SCP sink protocol against a remote
//! `sudo scp -t`, which is what lets copies land in root-owned directories.

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;
use tracing::debug;

use crate::assets::{Asset, MODTIME_LAYOUT};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::util::shell_join;

use super::{
    claim_busy, parse_stat_line, start_process, Command, CommandRunner, ReadableFile, RunError,
    RunResult, StartedCmd, COPY_HASH_THRESHOLD,
};

/// Exit code the ssh client uses for transport failures.
const SSH_TRANSPORT_EXIT: i32 = 255;

/// Runs commands on a guest over SSH.
pub struct SshRunner {
    hostname: String,
    port: u16,
    user: String,
    key_path: PathBuf,
    control_path: PathBuf,
    session_up: Mutex<bool>,
    busy: Arc<AtomicBool>,
}

impl SshRunner {
    /// A runner for the given SSH endpoint.
    pub fn new(
        hostname: impl Into<String>,
        port: u16,
        user: impl Into<String>,
        key_path: impl Into<PathBuf>,
    ) -> SshRunner {
        let hostname = hostname.into();
        let user = user.into();
        let control_path = std::env::temp_dir().join(format!(
            "minikube-ssh-{}-{}-{}.sock",
            user, hostname, port
        ));
        SshRunner {
            hostname,
            port,
            user,
            key_path: key_path.into(),
            control_path,
            session_up: Mutex::new(false),
            busy: Arc::new(AtomicBool::new(false)),
        }
    }

    fn target(&self) -> String {
        format!("{}@{}", self.user, self.hostname)
    }

    /// Common ssh client options for every invocation.
    fn base_args(&self) -> Vec<String> {
        vec![
            "-o".into(),
            "BatchMode=yes".into(),
            "-o".into(),
            "StrictHostKeyChecking=no".into(),
            "-o".into(),
            "UserKnownHostsFile=/dev/null".into(),
            "-o".into(),
            "LogLevel=ERROR".into(),
            "-o".into(),
            format!("ControlPath={}", self.control_path.display()),
            "-i".into(),
            self.key_path.display().to_string(),
            "-p".into(),
            self.port.to_string(),
        ]
    }

    /// Ensure the control-master session is up, re-dialing with backoff on
    /// connection loss.
    async fn ensure_session(&self) -> Result<(), RunError> {
        let mut up = self.session_up.lock().await;
        if *up && self.check_session().await {
            return Ok(());
        }
        *up = false;

        let config = RetryConfig::ssh_dial();
        retry_with_backoff(&config, "ssh dial", || self.dial_master())
            .await
            .map_err(|e| RunError::Transport {
                message: format!("dialing {}: {}", self.target(), e),
            })?;

        debug!(target = %self.target(), "ssh session established");
        *up = true;
        Ok(())
    }

    async fn check_session(&self) -> bool {
        let mut args = self.base_args();
        args.extend(["-O".into(), "check".into(), self.target()]);
        match start_process("ssh", args.clone(), args, Command::new(["ssh-check"]), None).await {
            Ok(sc) => sc.wait().await.is_ok(),
            Err(_) => false,
        }
    }

    async fn dial_master(&self) -> Result<(), RunError> {
        let mut args = self.base_args();
        args.extend([
            "-o".into(),
            "ControlMaster=yes".into(),
            "-o".into(),
            "ControlPersist=10m".into(),
            "-f".into(),
            "-N".into(),
            self.target(),
        ]);
        let sc = start_process("ssh", args.clone(), args, Command::new(["ssh-dial"]), None).await?;
        sc.wait().await.map(|_| ())
    }

    /// Mark the session lost so the next command re-dials.
    async fn session_lost(&self) {
        *self.session_up.lock().await = false;
    }

    async fn start_remote(&self, cmd: Command) -> Result<StartedCmd, RunError> {
        self.ensure_session().await?;
        let display = cmd.args().to_vec();
        let remote = shell_join(cmd.args());
        let mut args = self.base_args();
        args.extend([self.target(), "--".into(), remote]);
        start_process("ssh", args, display, cmd, Some(SSH_TRANSPORT_EXIT)).await
    }

    /// Local sha256 of the asset compared against the destination's.
    async fn destination_matches(&self, asset: &Asset, dst: &str) -> bool {
        let local = match asset.sha256().await {
            Ok(h) => h,
            Err(_) => return false,
        };
        let check = Command::shell(format!("sudo sha256sum {} 2>/dev/null", dst));
        match self.run_cmd(check).await {
            Ok(rr) => rr
                .stdout_str()
                .split_whitespace()
                .next()
                .map(|h| h == local)
                .unwrap_or(false),
            Err(_) => false,
        }
    }
}

#[async_trait]
impl CommandRunner for SshRunner {
    fn name(&self) -> String {
        format!("ssh://{}:{}", self.hostname, self.port)
    }

    async fn run_cmd(&self, cmd: Command) -> Result<RunResult, RunError> {
        let started = self.start_remote(cmd).await?;
        match started.wait().await {
            Err(e @ RunError::Transport { .. }) => {
                self.session_lost().await;
                Err(e)
            }
            other => other,
        }
    }

    async fn start_cmd(&self, cmd: Command) -> Result<StartedCmd, RunError> {
        claim_busy(&self.busy)?;
        match self.start_remote(cmd).await {
            Ok(mut sc) => {
                sc.busy = Some(self.busy.clone());
                Ok(sc)
            }
            Err(e) => {
                self.busy.store(false, std::sync::atomic::Ordering::SeqCst);
                Err(e)
            }
        }
    }

    async fn copy_file(&self, asset: &Asset) -> Result<(), RunError> {
        let dst = asset.target_path();

        // For small files, don't bother risking being wrong for no
        // performance benefit.
        if asset.length() > COPY_HASH_THRESHOLD && self.destination_matches(asset, &dst).await {
            debug!(dst = %dst, "copy: skipping (exists)");
            return Ok(());
        }

        self.run_cmd(Command::shell(format!(
            "sudo mkdir -p {}",
            asset.target_dir()
        )))
        .await?;

        debug!(dst = %dst, bytes = asset.length(), "scp");

        // SCP sink protocol: C<mode> <length> <name>, content, NUL.
        let header = format!(
            "C{} {} {}\n",
            asset.permissions(),
            asset.length(),
            asset.target_name()
        );
        let content = asset.reader().await.map_err(|e| RunError::InvalidInput {
            message: e.to_string(),
        })?;
        let stream = std::io::Cursor::new(header.into_bytes())
            .chain(content)
            .chain(std::io::Cursor::new(b"\x00".to_vec()));

        let scp = Command::shell(format!("sudo scp -t {}", asset.target_dir()))
            .stdin_reader(Box::new(stream));
        self.run_cmd(scp).await?;

        if let Some(mtime) = asset.mod_time() {
            self.run_cmd(Command::shell(format!(
                "sudo touch -d \"{}\" {}",
                mtime.format(MODTIME_LAYOUT),
                dst
            )))
            .await?;
        }
        Ok(())
    }

    async fn copy_file_from(&self, remote_path: &str, local_path: &Path) -> Result<(), RunError> {
        let mut rf = self.readable_file(remote_path).await?;
        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(local_path).await?;
        tokio::io::copy(&mut rf.reader, &mut file).await?;
        Ok(())
    }

    async fn remove_file(&self, path: &str) -> Result<(), RunError> {
        debug!(path = %path, "rm");
        self.run_cmd(Command::shell(format!("sudo rm -f {}", path)))
            .await
            .map(|_| ())
    }

    async fn readable_file(&self, path: &str) -> Result<ReadableFile, RunError> {
        if !path.starts_with('/') {
            return Err(RunError::InvalidInput {
                message: format!("source path must be absolute, got \"{}\"", path),
            });
        }

        let rr = self
            .run_cmd(Command::shell(format!("sudo stat -c \"%a %s %y\" {}", path)))
            .await?;
        let (permissions, length, mod_time) =
            parse_stat_line(&rr.stdout_str()).ok_or_else(|| RunError::InvalidInput {
                message: format!("unparseable stat output for {}: {}", path, rr.stdout_str()),
            })?;

        self.ensure_session().await?;
        let mut args = self.base_args();
        args.extend([
            self.target(),
            "--".into(),
            format!("sudo cat {}", path),
        ]);
        let mut proc = tokio::process::Command::new("ssh");
        proc.args(&args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);
        let mut child = proc.spawn()?;
        let stdout = child.stdout.take().expect("stdout piped");

        Ok(ReadableFile {
            length,
            permissions,
            mod_time,
            reader: Box::new(stdout),
            _child: Some(child),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_args_pin_key_port_and_control_path() {
        let r = SshRunner::new("192.168.49.2", 32772, "docker", "/home/u/.minikube/machines/t1/id_rsa");
        let args = r.base_args();
        assert!(args.contains(&"-p".to_string()));
        assert!(args.contains(&"32772".to_string()));
        assert!(args.contains(&"/home/u/.minikube/machines/t1/id_rsa".to_string()));
        assert!(args.iter().any(|a| a.starts_with("ControlPath=")));
        assert_eq!(r.target(), "docker@192.168.49.2");
    }

    #[test]
    fn control_path_is_stable_per_endpoint() {
        let a = SshRunner::new("10.0.0.1", 22, "root", "/k");
        let b = SshRunner::new("10.0.0.1", 22, "root", "/k");
        assert_eq!(a.control_path, b.control_path);

        let c = SshRunner::new("10.0.0.2", 22, "root", "/k");
        assert_ne!(a.control_path, c.control_path);
    }
}
