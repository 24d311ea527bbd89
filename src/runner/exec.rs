//! Local command runner for the "none" driver
//!
//! The host is the guest: commands run directly and file copies are plain
//! filesystem operations.

use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::DateTime;

use crate::assets::Asset;

use super::{
    claim_busy, start_process, Command, CommandRunner, ReadableFile, RunError, RunResult,
    StartedCmd,
};

/// Runs commands on the local host.
#[derive(Debug, Default)]
pub struct ExecRunner {
    busy: Arc<AtomicBool>,
}

impl ExecRunner {
    /// A new local runner.
    pub fn new() -> ExecRunner {
        ExecRunner::default()
    }
}

#[async_trait]
impl CommandRunner for ExecRunner {
    fn name(&self) -> String {
        "exec".to_string()
    }

    async fn run_cmd(&self, cmd: Command) -> Result<RunResult, RunError> {
        let args = cmd.args().to_vec();
        if args.is_empty() {
            return Err(RunError::InvalidInput {
                message: "empty command".to_string(),
            });
        }
        let started = start_process(&args[0].clone(), args[1..].to_vec(), args, cmd, None).await?;
        started.wait().await
    }

    async fn start_cmd(&self, cmd: Command) -> Result<StartedCmd, RunError> {
        claim_busy(&self.busy)?;
        let args = cmd.args().to_vec();
        if args.is_empty() {
            self.busy.store(false, std::sync::atomic::Ordering::SeqCst);
            return Err(RunError::InvalidInput {
                message: "empty command".to_string(),
            });
        }
        match start_process(&args[0].clone(), args[1..].to_vec(), args, cmd, None).await {
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
        tokio::fs::create_dir_all(asset.target_dir()).await?;
        let dst = asset.target_path();

        match asset.source_path() {
            Some(src) => {
                tokio::fs::copy(src, &dst).await?;
            }
            None => {
                tokio::fs::write(&dst, asset.bytes().await.map_err(io_err)?).await?;
            }
        }

        if let Ok(mode) = u32::from_str_radix(asset.permissions(), 8) {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&dst, std::fs::Permissions::from_mode(mode)).await?;
        }

        if let Some(mtime) = asset.mod_time() {
            let file = std::fs::OpenOptions::new().write(true).open(&dst)?;
            file.set_modified(std::time::SystemTime::from(mtime))?;
        }
        Ok(())
    }

    async fn copy_file_from(&self, remote_path: &str, local_path: &Path) -> Result<(), RunError> {
        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(remote_path, local_path).await?;
        Ok(())
    }

    async fn remove_file(&self, path: &str) -> Result<(), RunError> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn readable_file(&self, path: &str) -> Result<ReadableFile, RunError> {
        if !path.starts_with('/') {
            return Err(RunError::InvalidInput {
                message: format!("source path must be absolute, got \"{}\"", path),
            });
        }
        let meta = tokio::fs::metadata(path).await?;
        let mod_time = meta.modified().ok().map(DateTime::from);
        let permissions = {
            use std::os::unix::fs::PermissionsExt;
            format!("{:o}", meta.permissions().mode() & 0o7777)
        };
        let file = tokio::fs::File::open(path).await?;
        Ok(ReadableFile {
            length: meta.len(),
            permissions,
            mod_time,
            reader: Box::new(file),
            _child: None,
        })
    }
}

fn io_err(e: crate::Error) -> RunError {
    RunError::InvalidInput {
        message: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn run_cmd_captures_stdout_and_exit_code() {
        let runner = ExecRunner::new();
        let rr = runner
            .run_cmd(Command::new(["echo", "hello"]))
            .await
            .unwrap();
        assert_eq!(rr.exit_code, 0);
        assert_eq!(rr.stdout_str().trim(), "hello");
    }

    /// Story: exit code 0 iff success; the buffers survive failure so the
    /// caller can inspect what the command printed.
    #[tokio::test]
    async fn failing_command_keeps_buffers() {
        let runner = ExecRunner::new();
        let err = runner
            .run_cmd(Command::shell("echo out; echo err >&2; exit 3"))
            .await
            .unwrap_err();
        match err {
            RunError::CommandFailed { result } => {
                assert_eq!(result.exit_code, 3);
                assert_eq!(result.stdout_str().trim(), "out");
                assert_eq!(result.stderr_str().trim(), "err");
            }
            other => panic!("expected CommandFailed, got {other}"),
        }
    }

    #[tokio::test]
    async fn stdin_bytes_reach_the_child() {
        let runner = ExecRunner::new();
        let rr = runner
            .run_cmd(Command::new(["cat"]).stdin_bytes(b"piped".to_vec()))
            .await
            .unwrap();
        assert_eq!(rr.stdout_str(), "piped");
    }

    /// Story: a runner allows one started command at a time; the slot frees
    /// after wait_cmd.
    #[tokio::test]
    async fn second_start_before_wait_is_a_concurrency_violation() {
        let runner = ExecRunner::new();
        let first = runner
            .start_cmd(Command::new(["sleep", "5"]))
            .await
            .unwrap();

        match runner.start_cmd(Command::new(["true"])).await {
            Err(RunError::ConcurrencyViolation) => {}
            other => panic!("expected ConcurrencyViolation, got {:?}", other.map(|_| ())),
        }

        drop(first); // kill_on_drop reaps the sleep
        // Slot is free again after the started command is gone.
        let again = runner.start_cmd(Command::new(["true"])).await.unwrap();
        let rr = runner.wait_cmd(again).await.unwrap();
        assert_eq!(rr.exit_code, 0);
    }

    /// Story: cancellation is cooperative — the child is killed, the
    /// pumps drain, and the caller sees Cancelled.
    #[tokio::test]
    async fn cancellation_kills_the_child() {
        use tokio_util::sync::CancellationToken;

        let runner = std::sync::Arc::new(ExecRunner::new());
        let token = CancellationToken::new();
        let cmd = Command::new(["sleep", "30"]).cancel_token(token.clone());

        let r = runner.clone();
        let handle = tokio::spawn(async move { r.run_cmd(cmd).await });
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        token.cancel();

        match handle.await.unwrap() {
            Err(RunError::Cancelled) => {}
            other => panic!("expected Cancelled, got {:?}", other.map(|r| r.exit_code)),
        }
    }

    #[tokio::test]
    async fn copy_file_writes_content_and_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ExecRunner::new();
        let asset = Asset::from_bytes(
            b"unit file".to_vec(),
            dir.path().join("sub").to_string_lossy().to_string(),
            "kubelet.service",
            "0640",
        );
        runner.copy_file(&asset).await.unwrap();

        let dst = dir.path().join("sub").join("kubelet.service");
        assert_eq!(tokio::fs::read(&dst).await.unwrap(), b"unit file");
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&dst).unwrap().permissions().mode() & 0o7777;
        assert_eq!(mode, 0o640);
    }

    #[tokio::test]
    async fn readable_file_requires_absolute_path() {
        let runner = ExecRunner::new();
        match runner.readable_file("relative/path").await {
            Err(RunError::InvalidInput { .. }) => {}
            other => panic!("expected InvalidInput, got {:?}", other.map(|f| f.length)),
        }
    }

    #[tokio::test]
    async fn readable_file_streams_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        tokio::fs::write(&path, b"stream me").await.unwrap();

        let runner = ExecRunner::new();
        let mut rf = runner
            .readable_file(path.to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(rf.length, 9);

        let mut content = Vec::new();
        rf.reader.read_to_end(&mut content).await.unwrap();
        assert_eq!(content, b"stream me");
    }
}
