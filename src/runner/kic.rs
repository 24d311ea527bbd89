//! Container-exec command runner for KIC (kubernetes-in-container) guests
//!
//! Commands run through `docker exec` (or `podman exec`); file transfers go
//! through `docker cp`. The docker CLI reserves exit code 125 for daemon
//! failures, which is what distinguishes a broken transport from a failing
//! remote command.

use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::assets::{Asset, MODTIME_LAYOUT};

use super::{
    claim_busy, parse_stat_line, start_process, Command, CommandRunner, ReadableFile, RunError,
    RunResult, StartedCmd, COPY_HASH_THRESHOLD,
};

/// Exit code the docker/podman CLI uses for daemon-side failures.
const OCI_TRANSPORT_EXIT: i32 = 125;

/// Runs commands inside a KIC container via the OCI CLI.
pub struct KicRunner {
    oci_binary: String,
    container: String,
    busy: Arc<AtomicBool>,
}

impl KicRunner {
    /// A runner execing into `container` through `oci_binary` (docker or
    /// podman).
    pub fn new(oci_binary: impl Into<String>, container: impl Into<String>) -> KicRunner {
        KicRunner {
            oci_binary: oci_binary.into(),
            container: container.into(),
            busy: Arc::new(AtomicBool::new(false)),
        }
    }

    fn exec_args(&self, interactive: bool, remote_args: &[String]) -> Vec<String> {
        let mut args = vec!["exec".to_string()];
        if interactive {
            args.push("-i".to_string());
        }
        args.push(self.container.clone());
        args.extend(remote_args.iter().cloned());
        args
    }

    async fn start_in_container(&self, cmd: Command) -> Result<StartedCmd, RunError> {
        let display = cmd.args().to_vec();
        let args = self.exec_args(true, cmd.args());
        start_process(&self.oci_binary, args, display, cmd, Some(OCI_TRANSPORT_EXIT)).await
    }

    async fn destination_matches(&self, asset: &Asset, dst: &str) -> bool {
        let local = match asset.sha256().await {
            Ok(h) => h,
            Err(_) => return false,
        };
        let check = Command::shell(format!("sha256sum {} 2>/dev/null", dst));
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
impl CommandRunner for KicRunner {
    fn name(&self) -> String {
        format!("{}://{}", self.oci_binary, self.container)
    }

    async fn run_cmd(&self, cmd: Command) -> Result<RunResult, RunError> {
        self.start_in_container(cmd).await?.wait().await
    }

    async fn start_cmd(&self, cmd: Command) -> Result<StartedCmd, RunError> {
        claim_busy(&self.busy)?;
        match self.start_in_container(cmd).await {
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

        if asset.length() > COPY_HASH_THRESHOLD && self.destination_matches(asset, &dst).await {
            debug!(dst = %dst, "copy: skipping (exists)");
            return Ok(());
        }

        self.run_cmd(Command::shell(format!(
            "mkdir -p {}",
            asset.target_dir()
        )))
        .await?;

        debug!(dst = %dst, bytes = asset.length(), "cp into container");

        // docker cp needs a local file; memory-backed assets are staged
        // through a temp file first.
        let mut staged: Option<std::path::PathBuf> = None;
        let src_path = match asset.source_path() {
            Some(p) => p.to_path_buf(),
            None => {
                let tmp = std::env::temp_dir().join(format!(
                    "minikube-cp-{}-{}",
                    std::process::id(),
                    asset.target_name()
                ));
                tokio::fs::write(&tmp, asset.bytes().await.map_err(|e| {
                    RunError::InvalidInput {
                        message: e.to_string(),
                    }
                })?)
                .await?;
                staged = Some(tmp.clone());
                tmp
            }
        };

        let cp = Command::new([
            "cp".to_string(),
            src_path.display().to_string(),
            format!("{}:{}", self.container, dst),
        ]);
        let display = cp.args().to_vec();
        let result = start_process(
            &self.oci_binary,
            cp.args().to_vec(),
            display,
            cp,
            Some(OCI_TRANSPORT_EXIT),
        )
        .await?
        .wait()
        .await;

        if let Some(tmp) = staged.as_ref() {
            let _ = tokio::fs::remove_file(tmp).await;
        }
        result?;

        let mut fixup = format!("chmod {} {}", asset.permissions(), dst);
        if let Some(mtime) = asset.mod_time() {
            fixup.push_str(&format!(
                " && touch -d \"{}\" {}",
                mtime.format(MODTIME_LAYOUT),
                dst
            ));
        }
        self.run_cmd(Command::shell(fixup)).await?;
        Ok(())
    }

    async fn copy_file_from(&self, remote_path: &str, local_path: &Path) -> Result<(), RunError> {
        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let cp = Command::new([
            "cp".to_string(),
            format!("{}:{}", self.container, remote_path),
            local_path.display().to_string(),
        ]);
        let display = cp.args().to_vec();
        start_process(
            &self.oci_binary,
            cp.args().to_vec(),
            display,
            cp,
            Some(OCI_TRANSPORT_EXIT),
        )
        .await?
        .wait()
        .await
        .map(|_| ())
    }

    async fn remove_file(&self, path: &str) -> Result<(), RunError> {
        self.run_cmd(Command::shell(format!("rm -f {}", path)))
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
            .run_cmd(Command::shell(format!("stat -c \"%a %s %y\" {}", path)))
            .await?;
        let (permissions, length, mod_time) =
            parse_stat_line(&rr.stdout_str()).ok_or_else(|| RunError::InvalidInput {
                message: format!("unparseable stat output for {}: {}", path, rr.stdout_str()),
            })?;

        let mut proc = tokio::process::Command::new(&self.oci_binary);
        proc.args(["exec", &self.container, "cat", path])
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
