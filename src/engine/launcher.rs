//! Sandbox process launcher
//!
//! Every load gets a brand-new sandbox process, so a reload after an
//! interrupt or crash never inherits state from the previous instance.

use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStderr, Command};
use tracing::{debug, info, warn};

use super::channel::MessageChannel;
use crate::config::SandboxConfig;

/// Starts sandbox instances
#[async_trait]
pub trait SandboxLauncher: Send + Sync {
    /// Start a fresh sandbox and return the channel connected to it
    async fn launch(&self) -> Result<MessageChannel>;
}

/// Runs the interpreter host as a child process in its own process group,
/// speaking the run protocol over stdin/stdout
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: String,
    args: Vec<String>,
    work_dir: Option<PathBuf>,
}

impl ProcessLauncher {
    pub fn new(command: &[String], work_dir: Option<PathBuf>) -> Result<Self> {
        let (program, args) = command
            .split_first()
            .context("Sandbox command must not be empty")?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            work_dir,
        })
    }

    pub fn from_config(config: &SandboxConfig) -> Result<Self> {
        Self::new(&config.command, config.work_dir.clone())
    }

    fn scratch_dir(&self) -> Result<tempfile::TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("sandbox-");
        let dir = match &self.work_dir {
            Some(parent) => {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create work dir: {}", parent.display())
                })?;
                builder.tempdir_in(parent)
            }
            None => builder.tempdir(),
        };
        dir.context("Failed to create sandbox scratch directory")
    }
}

#[async_trait]
impl SandboxLauncher for ProcessLauncher {
    async fn launch(&self) -> Result<MessageChannel> {
        let scratch = self.scratch_dir()?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .current_dir(scratch.path())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn sandbox: {}", self.program))?;

        let stdin = child.stdin.take().context("Sandbox stdin not captured")?;
        let stdout = child.stdout.take().context("Sandbox stdout not captured")?;
        let stderr = child.stderr.take().context("Sandbox stderr not captured")?;
        let pid = child.id();

        info!(
            "Launched sandbox pid={:?} in {}",
            pid,
            scratch.path().display()
        );

        let stderr_task = tokio::spawn(log_stderr(stderr, pid));

        let channel = MessageChannel::from_io(stdout, stdin)
            .with_task(stderr_task)
            .with_terminator(move || {
                if let Some(pid) = pid {
                    // The host may have spawned helpers; take down the whole group
                    if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                        debug!("killpg({}) failed: {}", pid, e);
                    }
                }
                drop(child);
                if let Err(e) = scratch.close() {
                    warn!("Failed to remove sandbox scratch directory: {}", e);
                }
            });

        Ok(channel)
    }
}

async fn log_stderr(stderr: ChildStderr, pid: Option<u32>) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(pid = ?pid, "sandbox stderr: {}", line);
    }
}
