//! Client playback
//!
//! Receives raw PCM chunks from a relay and schedules them gap-free on an
//! audio clock, reconnecting with backoff when the connection drops.

mod clock;
mod decode;
mod listener;
mod output;
mod scheduler;
mod transport;

pub use clock::{AudioClock, ManualClock, SystemClock};
pub use decode::{AudioSegment, DecodeError, PcmDecoder};
pub use listener::{Listener, ListenerHandle, ListenerState, ListenerStatus};
pub use output::{
    AudioOutput, CommandRelayPlayer, MemoryOutput, OutputEvent, PacedWriterOutput, RelayPlayer,
};
pub use scheduler::{GoLive, PlaybackScheduler, ScheduledSegment};
pub use transport::{
    parse_control, ListenerMessage, ListenerStream, ListenerTransport, WebSocketTransport,
};
