pub mod backoff;
pub mod broadcast;
pub mod capture;
pub mod config;
pub mod http;
pub mod playback;
pub mod status;

pub use backoff::{Backoff, BackoffPolicy};
pub use broadcast::{Broadcaster, ConnectedClient, OutboundMessage, StatusMessage};
pub use capture::{
    CaptureError, CaptureSupervisor, CommandSet, FfmpegLauncher, PipeRole, PipeTopology,
    ProcessLauncher, ProcessRole, SessionSnapshot, SessionState, SupervisorOptions,
};
pub use config::{AudioConfig, Config, PlaybackConfig, StreamingConfig};
pub use http::{create_router, AppState};
pub use playback::{Listener, ListenerHandle, ListenerState, ListenerStatus, PlaybackScheduler};
pub use status::{EventBus, StatusEvent};
