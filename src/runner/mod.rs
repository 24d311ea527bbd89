//! Command execution against a guest
//!
//! [`CommandRunner`] abstracts the transport between this process and a
//! guest: local exec for the none driver, ssh for VM-ish guests, and
//! docker/podman exec for container guests. All transports share the same
//! contract: full stdout/stderr capture (with optional tee writers), a
//! non-zero exit surfacing as [`RunError::CommandFailed`] carrying the
//! buffers, and transport failures kept distinct from command failures.

mod exec;
mod fake;
mod kic;
mod ssh;

pub use exec::ExecRunner;
pub use fake::FakeRunner;
pub use kic::KicRunner;
pub use ssh::SshRunner;

use std::borrow::Cow;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::assets::Asset;

/// Streaming reader plus metadata for a file on the guest.
pub struct ReadableFile {
    /// File length in bytes.
    pub length: u64,
    /// Octal permission string as reported by `stat`.
    pub permissions: String,
    /// Modification time, when parseable.
    pub mod_time: Option<DateTime<Utc>>,
    /// Streaming content reader.
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    // Keeps the transport process alive while the reader is consumed.
    pub(crate) _child: Option<tokio::process::Child>,
}

impl std::fmt::Debug for ReadableFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadableFile")
            .field("length", &self.length)
            .field("permissions", &self.permissions)
            .field("mod_time", &self.mod_time)
            .finish()
    }
}

/// Captured outcome of one command.
#[derive(Debug, Clone, Default)]
pub struct RunResult {
    /// The argv that was executed.
    pub args: Vec<String>,
    /// Full captured stdout, even on failure.
    pub stdout: Vec<u8>,
    /// Full captured stderr, even on failure.
    pub stderr: Vec<u8>,
    /// Process exit code; 0 iff the command succeeded.
    pub exit_code: i32,
    /// Wall time from spawn to exit.
    pub duration: Duration,
}

impl RunResult {
    /// Human-readable command line for logs and errors.
    pub fn command(&self) -> String {
        self.args.join(" ")
    }

    /// Stdout as UTF-8 (lossy).
    pub fn stdout_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stdout)
    }

    /// Stderr as UTF-8 (lossy).
    pub fn stderr_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stderr)
    }
}

/// Errors from runner operations.
#[derive(Debug, Error)]
pub enum RunError {
    /// The remote process ran and exited non-zero.
    #[error("command failed: {}: exit status {}\nstdout:\n{}\nstderr:\n{}",
        .result.command(), .result.exit_code, .result.stdout_str(), .result.stderr_str())]
    CommandFailed {
        /// The captured result, buffers included.
        result: RunResult,
    },

    /// The transport itself failed (SSH session reset, docker daemon gone).
    #[error("transport error: {message}")]
    Transport {
        /// Transport failure description.
        message: String,
    },

    /// A second command was started before the first was waited on.
    #[error("another command has been started and is currently running")]
    ConcurrencyViolation,

    /// `wait_cmd` called with nothing started.
    #[error("there is no started command")]
    NoStartedCommand,

    /// The surrounding cancellation token fired.
    #[error("cancelled")]
    Cancelled,

    /// Invalid input, e.g. a relative path where an absolute one is required.
    #[error("{message}")]
    InvalidInput {
        /// What was invalid.
        message: String,
    },

    /// Local I/O failure spawning or talking to the transport process.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A command to execute on a guest.
///
/// Args are an argv list; no shell interpolation happens unless the command
/// is built with [`Command::shell`], which wraps the script in
/// `/bin/bash -c`.
pub struct Command {
    args: Vec<String>,
    stdin: Option<Box<dyn AsyncRead + Send + Unpin>>,
    tee_stdout: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    tee_stderr: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    cancel: Option<CancellationToken>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("args", &self.args)
            .field("stdin", &self.stdin.is_some())
            .finish()
    }
}

impl Command {
    /// A command from an argv list.
    pub fn new<I, S>(args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Command {
            args: args.into_iter().map(Into::into).collect(),
            stdin: None,
            tee_stdout: None,
            tee_stderr: None,
            cancel: None,
        }
    }

    /// A shell script command (`/bin/bash -c <script>`).
    pub fn shell(script: impl Into<String>) -> Command {
        Command::new(["/bin/bash".to_string(), "-c".to_string(), script.into()])
    }

    /// Provide stdin from a byte buffer.
    pub fn stdin_bytes(mut self, bytes: impl Into<Vec<u8>>) -> Command {
        self.stdin = Some(Box::new(std::io::Cursor::new(bytes.into())));
        self
    }

    /// Provide stdin from a streaming reader.
    pub fn stdin_reader(mut self, reader: Box<dyn AsyncRead + Send + Unpin>) -> Command {
        self.stdin = Some(reader);
        self
    }

    /// Tee captured stdout into a writer as it arrives.
    pub fn tee_stdout(mut self, writer: Box<dyn AsyncWrite + Send + Unpin>) -> Command {
        self.tee_stdout = Some(writer);
        self
    }

    /// Tee captured stderr into a writer as it arrives.
    pub fn tee_stderr(mut self, writer: Box<dyn AsyncWrite + Send + Unpin>) -> Command {
        self.tee_stderr = Some(writer);
        self
    }

    /// Cancel the command when the token fires; the remote process is
    /// killed and pumps are drained before the call returns.
    pub fn cancel_token(mut self, token: CancellationToken) -> Command {
        self.cancel = Some(token);
        self
    }

    /// The argv this command will run.
    pub fn args(&self) -> &[String] {
        &self.args
    }
}

/// A long-running command started with `start_cmd`, to be finished with
/// `wait_cmd`.
pub struct StartedCmd {
    args: Vec<String>,
    started: Instant,
    busy: Option<Arc<AtomicBool>>,
    inner: StartedInner,
}

enum StartedInner {
    Process {
        child: tokio::process::Child,
        out_task: JoinHandle<std::io::Result<Vec<u8>>>,
        err_task: JoinHandle<std::io::Result<Vec<u8>>>,
        cancel: Option<CancellationToken>,
        transport_exit: Option<i32>,
    },
    /// Pre-scripted outcome used by the fake runner in tests.
    Scripted {
        outcome: Option<std::result::Result<RunResult, RunError>>,
    },
}

impl std::fmt::Debug for StartedCmd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StartedCmd").field("args", &self.args).finish()
    }
}

impl Drop for StartedCmd {
    fn drop(&mut self) {
        if let Some(busy) = &self.busy {
            busy.store(false, Ordering::SeqCst);
        }
    }
}

impl StartedCmd {
    /// A started command with a pre-scripted outcome (fake runner).
    pub(crate) fn scripted(
        args: Vec<String>,
        outcome: std::result::Result<RunResult, RunError>,
    ) -> StartedCmd {
        StartedCmd {
            args,
            started: Instant::now(),
            busy: None,
            inner: StartedInner::Scripted {
                outcome: Some(outcome),
            },
        }
    }

    /// Wait for the process and both output pumps, producing the final
    /// result. Both pumps are joined before this returns.
    pub async fn wait(mut self) -> std::result::Result<RunResult, RunError> {
        let (mut child, mut out_task, mut err_task, cancel, transport_exit) = match &mut self.inner
        {
            StartedInner::Scripted { outcome } => {
                return outcome.take().ok_or(RunError::NoStartedCommand)?;
            }
            StartedInner::Process {
                child,
                out_task,
                err_task,
                cancel,
                transport_exit,
            } => (child, out_task, err_task, cancel.clone(), *transport_exit),
        };

        let status = if let Some(token) = cancel {
            tokio::select! {
                status = child.wait() => status?,
                _ = token.cancelled() => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    let _ = (&mut out_task).await;
                    let _ = (&mut err_task).await;
                    return Err(RunError::Cancelled);
                }
            }
        } else {
            child.wait().await?
        };

        let stdout = (&mut out_task).await.unwrap_or_else(|_| Ok(Vec::new()))?;
        let stderr = (&mut err_task).await.unwrap_or_else(|_| Ok(Vec::new()))?;

        let result = RunResult {
            args: self.args.clone(),
            stdout,
            stderr,
            exit_code: status.code().unwrap_or(-1),
            duration: self.started.elapsed(),
        };

        if result.duration > Duration::from_secs(1) {
            debug!(cmd = %result.command(), elapsed = ?result.duration, "completed");
        }

        if status.success() {
            Ok(result)
        } else if transport_exit == Some(result.exit_code) {
            Err(RunError::Transport {
                message: format!(
                    "{}: transport exited {}: {}",
                    result.command(),
                    result.exit_code,
                    result.stderr_str().trim()
                ),
            })
        } else {
            Err(RunError::CommandFailed { result })
        }
    }
}

/// Spawn a local process with piped stdio and wire up the output pumps.
///
/// `transport_exit` is the exit code that marks a transport failure for
/// this runner (255 for ssh, 125 for docker) rather than a remote command
/// failure.
pub(crate) async fn start_process(
    program: &str,
    argv: Vec<String>,
    display_args: Vec<String>,
    mut cmd: Command,
    transport_exit: Option<i32>,
) -> std::result::Result<StartedCmd, RunError> {
    let mut proc = tokio::process::Command::new(program);
    proc.args(&argv)
        .stdin(if cmd.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!(cmd = %display_args.join(" "), "run");
    let mut child = proc.spawn()?;

    if let Some(mut stdin_src) = cmd.stdin.take() {
        let mut stdin = child.stdin.take().expect("stdin piped");
        tokio::spawn(async move {
            if let Err(e) = tokio::io::copy(&mut stdin_src, &mut stdin).await {
                warn!(error = %e, "stdin pump failed");
            }
            let _ = stdin.shutdown().await;
        });
    }

    let stdout = child.stdout.take().expect("stdout piped");
    let stderr = child.stderr.take().expect("stderr piped");
    let out_task = tokio::spawn(pump(stdout, cmd.tee_stdout.take()));
    let err_task = tokio::spawn(pump(stderr, cmd.tee_stderr.take()));

    Ok(StartedCmd {
        args: display_args,
        started: Instant::now(),
        busy: None,
        inner: StartedInner::Process {
            child,
            out_task,
            err_task,
            cancel: cmd.cancel.clone(),
            transport_exit,
        },
    })
}

/// Copy a child stream into a buffer, teeing into an optional writer.
/// Returns the full buffer once the stream hits EOF.
async fn pump(
    mut src: impl AsyncRead + Unpin,
    mut tee: Option<Box<dyn AsyncWrite + Send + Unpin>>,
) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        let n = src.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(w) = tee.as_mut() {
            w.write_all(&chunk[..n]).await?;
        }
    }
    if let Some(w) = tee.as_mut() {
        w.flush().await?;
    }
    Ok(buf)
}

/// Guard claiming a runner's single started-command slot.
pub(crate) fn claim_busy(busy: &Arc<AtomicBool>) -> std::result::Result<(), RunError> {
    busy.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .map(|_| ())
        .map_err(|_| RunError::ConcurrencyViolation)
}

/// Transport for executing commands and transferring files on a guest.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Short transport description for logs ("exec", "ssh", "docker").
    fn name(&self) -> String;

    /// Run a command to completion, capturing output.
    ///
    /// Returns only after the process exits or the cancellation token
    /// fires; the buffers in the result (or error) always hold the full
    /// captured output.
    async fn run_cmd(&self, cmd: Command) -> std::result::Result<RunResult, RunError>;

    /// Start a long-running command. At most one started command may be
    /// outstanding per runner.
    async fn start_cmd(&self, cmd: Command) -> std::result::Result<StartedCmd, RunError>;

    /// Wait for a started command; both output pumps are joined first.
    async fn wait_cmd(&self, started: StartedCmd) -> std::result::Result<RunResult, RunError> {
        started.wait().await
    }

    /// Copy an asset onto the guest, creating the target directory.
    ///
    /// Files larger than 2048 bytes are skipped when the destination's
    /// sha256 already matches. Source modtime, when known, is preserved.
    async fn copy_file(&self, asset: &Asset) -> std::result::Result<(), RunError>;

    /// Copy a file from the guest to a local path.
    async fn copy_file_from(
        &self,
        remote_path: &str,
        local_path: &std::path::Path,
    ) -> std::result::Result<(), RunError>;

    /// Remove a file on the guest.
    async fn remove_file(&self, path: &str) -> std::result::Result<(), RunError>;

    /// Open a file on the guest for streaming reads. `path` must be
    /// absolute.
    async fn readable_file(&self, path: &str) -> std::result::Result<ReadableFile, RunError>;
}

/// Threshold above which `copy_file` consults the destination hash.
pub(crate) const COPY_HASH_THRESHOLD: u64 = 2048;

/// Parse `stat -c "%a %s %y"` output into (permissions, length, modtime).
pub(crate) fn parse_stat_line(line: &str) -> Option<(String, u64, Option<DateTime<Utc>>)> {
    let line = line.trim();
    let mut parts = line.splitn(3, ' ');
    let perms = parts.next()?.to_string();
    let length: u64 = parts.next()?.parse().ok()?;
    let mod_time = parts.next().and_then(|rest| {
        let trimmed = rest.get(..19)?;
        chrono::NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S")
            .ok()
            .map(|naive| DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc))
    });
    Some((perms, length, mod_time))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_result_renders_command_line() {
        let rr = RunResult {
            args: vec!["docker".into(), "ps".into()],
            ..Default::default()
        };
        assert_eq!(rr.command(), "docker ps");
    }

    #[test]
    fn shell_commands_wrap_in_bash() {
        let cmd = Command::shell("sudo systemctl start kubelet");
        assert_eq!(cmd.args()[0], "/bin/bash");
        assert_eq!(cmd.args()[1], "-c");
    }

    #[test]
    fn stat_line_parses_all_three_fields() {
        let (perms, len, mtime) =
            parse_stat_line("644 2048 2020-04-01 10:20:30.123456789 +0000").unwrap();
        assert_eq!(perms, "644");
        assert_eq!(len, 2048);
        assert!(mtime.is_some());
    }

    #[test]
    fn stat_line_tolerates_missing_modtime() {
        let (perms, len, mtime) = parse_stat_line("755 10").unwrap();
        assert_eq!(perms, "755");
        assert_eq!(len, 10);
        assert!(mtime.is_none());
    }

    /// Story: a failed command error message carries both buffers so the
    /// CLI can show the tail of stderr.
    #[test]
    fn command_failed_message_includes_buffers() {
        let err = RunError::CommandFailed {
            result: RunResult {
                args: vec!["kubeadm".into(), "init".into()],
                stdout: b"phase output".to_vec(),
                stderr: b"preflight failure".to_vec(),
                exit_code: 1,
                duration: Duration::from_secs(2),
            },
        };
        let msg = err.to_string();
        assert!(msg.contains("kubeadm init"));
        assert!(msg.contains("phase output"));
        assert!(msg.contains("preflight failure"));
    }
}
