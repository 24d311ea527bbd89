//! Scripted command runner for tests
//!
//! The fake records every command and file transfer, and answers commands
//! from substring-matched stubs. Tests use it to assert which commands a
//! component emitted (for example, that an idempotent restart emitted no
//! kubeadm commands at all).

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::assets::Asset;

use super::{Command, CommandRunner, ReadableFile, RunError, RunResult, StartedCmd};

#[derive(Debug, Clone)]
struct Stub {
    pattern: String,
    stdout: String,
    stderr: String,
    exit_code: i32,
}

/// In-memory runner with scripted responses.
#[derive(Debug, Default)]
pub struct FakeRunner {
    stubs: Mutex<Vec<Stub>>,
    commands: Mutex<Vec<String>>,
    files: Mutex<BTreeMap<String, Vec<u8>>>,
    removed: Mutex<Vec<String>>,
}

impl FakeRunner {
    /// A fake where every command succeeds with empty output unless
    /// stubbed otherwise.
    pub fn new() -> FakeRunner {
        FakeRunner::default()
    }

    /// Respond to commands containing `pattern` with `stdout` and exit 0.
    /// Later stubs win over earlier ones.
    pub fn stub(&self, pattern: impl Into<String>, stdout: impl Into<String>) {
        self.stubs.lock().unwrap().push(Stub {
            pattern: pattern.into(),
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: 0,
        });
    }

    /// Respond to commands containing `pattern` with a failure.
    pub fn stub_failure(
        &self,
        pattern: impl Into<String>,
        stderr: impl Into<String>,
        exit_code: i32,
    ) {
        self.stubs.lock().unwrap().push(Stub {
            pattern: pattern.into(),
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code,
        });
    }

    /// All command lines run so far, in order.
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    /// Whether any run command contained `pattern`.
    pub fn ran(&self, pattern: &str) -> bool {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .any(|c| c.contains(pattern))
    }

    /// Target paths of every copied file.
    pub fn copied_paths(&self) -> Vec<String> {
        self.files.lock().unwrap().keys().cloned().collect()
    }

    /// Content of a copied file, if any.
    pub fn copied_content(&self, path: &str) -> Option<Vec<u8>> {
        self.files.lock().unwrap().get(path).cloned()
    }

    /// Paths removed via `remove_file`.
    pub fn removed_paths(&self) -> Vec<String> {
        self.removed.lock().unwrap().clone()
    }

    fn respond(&self, args: &[String]) -> Result<RunResult, RunError> {
        let line = args.join(" ");
        self.commands.lock().unwrap().push(line.clone());

        let stubs = self.stubs.lock().unwrap();
        let stub = stubs.iter().rev().find(|s| line.contains(&s.pattern));

        let result = match stub {
            Some(s) => RunResult {
                args: args.to_vec(),
                stdout: s.stdout.clone().into_bytes(),
                stderr: s.stderr.clone().into_bytes(),
                exit_code: s.exit_code,
                duration: Duration::from_millis(1),
            },
            None => RunResult {
                args: args.to_vec(),
                duration: Duration::from_millis(1),
                ..Default::default()
            },
        };

        if result.exit_code == 0 {
            Ok(result)
        } else {
            Err(RunError::CommandFailed { result })
        }
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    fn name(&self) -> String {
        "fake".to_string()
    }

    async fn run_cmd(&self, cmd: Command) -> Result<RunResult, RunError> {
        self.respond(cmd.args())
    }

    async fn start_cmd(&self, cmd: Command) -> Result<StartedCmd, RunError> {
        let args = cmd.args().to_vec();
        let outcome = self.respond(&args);
        Ok(StartedCmd::scripted(args, outcome))
    }

    async fn copy_file(&self, asset: &Asset) -> Result<(), RunError> {
        let bytes = asset.bytes().await.map_err(|e| RunError::InvalidInput {
            message: e.to_string(),
        })?;
        self.files
            .lock()
            .unwrap()
            .insert(asset.target_path(), bytes);
        Ok(())
    }

    async fn copy_file_from(&self, remote_path: &str, local_path: &Path) -> Result<(), RunError> {
        let content = self
            .files
            .lock()
            .unwrap()
            .get(remote_path)
            .cloned()
            .unwrap_or_default();
        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(local_path, content).await?;
        Ok(())
    }

    async fn remove_file(&self, path: &str) -> Result<(), RunError> {
        self.removed.lock().unwrap().push(path.to_string());
        self.files.lock().unwrap().remove(path);
        Ok(())
    }

    async fn readable_file(&self, path: &str) -> Result<ReadableFile, RunError> {
        if !path.starts_with('/') {
            return Err(RunError::InvalidInput {
                message: format!("source path must be absolute, got \"{}\"", path),
            });
        }
        let content = self
            .files
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| RunError::InvalidInput {
                message: format!("no such fake file: {}", path),
            })?;
        Ok(ReadableFile {
            length: content.len() as u64,
            permissions: "644".to_string(),
            mod_time: None,
            reader: Box::new(std::io::Cursor::new(content)),
            _child: None,
        })
    }
}
