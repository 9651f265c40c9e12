//! Capture side of the relay
//!
//! One device read feeds several independent consumers. The main capture
//! process writes identical PCM to its stdout (the live broadcast) and, via
//! a tee, to one named pipe per downstream role. The supervisor owns the
//! lifecycle of all of them.

mod command;
mod pipes;
mod process;
mod state;
mod supervisor;

pub use command::{
    direct_capture_args, lossless_record_args, lossy_encode_args, main_capture_args,
    publish_url, recognition_args, CommandSet, ProcessRole,
};
pub use pipes::{is_fifo, PipeRole, PipeTopology};
pub use process::{
    captures_stdout, process_channel, wait_for_exit, ExitReport, FfmpegLauncher,
    LaunchedProcess, ProcessControl, ProcessLauncher, ProcessMonitor, ProcessOutput,
};
pub use state::{RestartDecision, RestartTracker, SessionState, Transition, TransitionError};
pub use supervisor::{CaptureSupervisor, RoleSnapshot, SessionSnapshot, SupervisorOptions};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CaptureError {
    #[error("capture on {device} is already {state}")]
    AlreadyActive { device: String, state: String },

    #[error("no active capture session on {device}")]
    NotActive { device: String },

    #[error("failed to launch {role}: {reason}")]
    SpawnFailed { role: String, reason: String },

    #[error("pipe setup failed: {0}")]
    Pipe(String),

    #[error("capture supervisor is not running")]
    SupervisorGone,
}
