//! Status events for the external UI.
//!
//! Lifecycle and listener notifications are fire-and-forget: they go out on a
//! bounded broadcast channel and nobody waits for them to be consumed.

use crate::capture::PipeRole;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StatusEvent {
    SessionStarting { device: String },
    SessionStarted { device: String, started_at: DateTime<Utc> },
    SessionStopped { device: String },
    SessionCrashed { device: String, reason: String, attempt: usize },
    SessionFailed { device: String, reason: String },
    RoleCrashed { device: String, role: PipeRole, reason: String, restarts: usize },
    RoleRestarted { device: String, role: PipeRole, pid: Option<u32> },
    RoleFailed { device: String, role: PipeRole, reason: String },
    ListenerCount { count: usize },
    RelayLatency { latency_ms: u64 },
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<StatusEvent>,
}

impl EventBus {
    /// Create a new event bus with a bounded broadcast channel.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(64);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.sender.subscribe()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, event: StatusEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
