//! Subprocess launching
//!
//! The supervisor never touches `tokio::process` directly: it asks a
//! [`ProcessLauncher`] for a [`LaunchedProcess`] and from then on talks to it
//! through a [`ProcessControl`] (kill request + exit notification). Tests
//! swap in a scripted launcher; production uses [`FfmpegLauncher`].

use super::command::ProcessRole;
use super::pipes::PipeRole;
use anyhow::{Context, Result};
use std::fmt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{oneshot, watch};
use tracing::{debug, warn};

/// How a process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitReport {
    pub code: Option<i32>,
    /// Whether the exit followed a kill request
    pub killed: bool,
    pub description: String,
}

impl ExitReport {
    pub fn from_status(status: std::io::Result<ExitStatus>, killed: bool) -> Self {
        match status {
            Ok(status) => Self {
                code: status.code(),
                killed,
                description: status.to_string(),
            },
            Err(e) => Self {
                code: None,
                killed,
                description: format!("wait failed: {}", e),
            },
        }
    }
}

impl fmt::Display for ExitReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description)
    }
}

/// Supervisor-side handle on a running process.
#[derive(Debug)]
pub struct ProcessControl {
    kill_tx: Option<oneshot::Sender<()>>,
    exit_rx: watch::Receiver<Option<ExitReport>>,
}

/// Runner-side half: receives kill requests, reports the exit.
#[derive(Debug)]
pub struct ProcessMonitor {
    pub kill_rx: oneshot::Receiver<()>,
    pub exit_tx: watch::Sender<Option<ExitReport>>,
}

impl ProcessMonitor {
    pub fn report_exit(self, report: ExitReport) {
        let _ = self.exit_tx.send(Some(report));
    }
}

/// Linked control/monitor pair for one process.
pub fn process_channel() -> (ProcessControl, ProcessMonitor) {
    let (kill_tx, kill_rx) = oneshot::channel();
    let (exit_tx, exit_rx) = watch::channel(None);

    (
        ProcessControl {
            kill_tx: Some(kill_tx),
            exit_rx,
        },
        ProcessMonitor { kill_rx, exit_tx },
    )
}

impl ProcessControl {
    /// Ask the process to die. Does not wait; repeated calls are no-ops.
    pub fn kill(&mut self) {
        if let Some(tx) = self.kill_tx.take() {
            let _ = tx.send(());
        }
    }

    pub fn has_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }

    pub fn exit_watch(&self) -> watch::Receiver<Option<ExitReport>> {
        self.exit_rx.clone()
    }

    /// Wait for the exit report, giving up after `limit`.
    pub async fn wait_exit(&self, limit: Duration) -> Option<ExitReport> {
        wait_for_exit(self.exit_watch(), Some(limit)).await
    }
}

/// Resolve once the process has exited. A monitor that vanished without a
/// report counts as an exit.
pub async fn wait_for_exit(
    mut rx: watch::Receiver<Option<ExitReport>>,
    limit: Option<Duration>,
) -> Option<ExitReport> {
    let wait = async {
        match rx.wait_for(|report| report.is_some()).await {
            Ok(report) => report.clone(),
            Err(_) => Some(ExitReport {
                code: None,
                killed: false,
                description: "process monitor went away".to_string(),
            }),
        }
    };

    match limit {
        Some(limit) => tokio::time::timeout(limit, wait).await.ok().flatten(),
        None => wait.await,
    }
}

pub type ProcessOutput = Box<dyn AsyncRead + Send + Unpin>;

pub struct LaunchedProcess {
    pub pid: Option<u32>,
    /// Standard output, for roles whose output the supervisor consumes
    pub stdout: Option<ProcessOutput>,
    pub control: ProcessControl,
}

pub trait ProcessLauncher: Send + Sync + 'static {
    fn launch(&self, role: ProcessRole, args: Vec<String>) -> Result<LaunchedProcess>;
}

/// Roles whose standard output the supervisor reads.
pub fn captures_stdout(role: ProcessRole) -> bool {
    matches!(
        role,
        ProcessRole::MainCapture
            | ProcessRole::DirectCapture
            | ProcessRole::Downstream(PipeRole::Recognition)
    )
}

/// Spawns real ffmpeg processes.
pub struct FfmpegLauncher {
    program: PathBuf,
}

impl FfmpegLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl ProcessLauncher for FfmpegLauncher {
    fn launch(&self, role: ProcessRole, args: Vec<String>) -> Result<LaunchedProcess> {
        debug!("Launching {}: {} {}", role, self.program.display(), args.join(" "));

        let stdout = if captures_stdout(role) {
            Stdio::piped()
        } else {
            Stdio::null()
        };

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn {} ({})", role, self.program.display()))?;

        let pid = child.id();
        let stdout = child
            .stdout
            .take()
            .map(|out| Box::new(out) as ProcessOutput);

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!("[{}] {}", role, line);
                }
            });
        }

        let (control, monitor) = process_channel();

        tokio::spawn(async move {
            let ProcessMonitor { kill_rx, exit_tx } = monitor;

            // A dropped control counts as a kill request
            let report = tokio::select! {
                status = child.wait() => ExitReport::from_status(status, false),
                _ = kill_rx => {
                    if let Err(e) = child.start_kill() {
                        debug!("Kill of {} failed: {}", role, e);
                    }
                    ExitReport::from_status(child.wait().await, true)
                }
            };

            debug!("{} exited: {}", role, report);
            let _ = exit_tx.send(Some(report));
        });

        Ok(LaunchedProcess {
            pid,
            stdout,
            control,
        })
    }
}
