use crate::broadcast::Broadcaster;
use crate::capture::CaptureSupervisor;
use crate::config::AudioConfig;
use crate::status::EventBus;

/// Shared application state for HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub supervisor: CaptureSupervisor,
    pub broadcaster: Broadcaster,
    pub events: EventBus,
    /// Device settings used when a start request does not override them
    pub default_audio: AudioConfig,
}

impl AppState {
    pub fn new(
        supervisor: CaptureSupervisor,
        broadcaster: Broadcaster,
        events: EventBus,
        default_audio: AudioConfig,
    ) -> Self {
        Self {
            supervisor,
            broadcaster,
            events,
            default_audio,
        }
    }
}
