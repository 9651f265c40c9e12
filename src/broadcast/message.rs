use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Periodic relay status pushed to every listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusMessage {
    pub streaming: bool,
    pub client_count: usize,
    /// Age of the most recent audio chunk when this status was produced
    pub measured_latency_ms: u64,
}

/// Text frames on the push connection. Audio never goes through here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlFrame {
    Status(StatusMessage),
}

/// One item on a listener's outbound queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundMessage {
    /// Raw s16le PCM, forwarded unmodified
    Audio(Bytes),
    Status(StatusMessage),
}

impl OutboundMessage {
    /// Audio bytes carried; status frames count as zero.
    pub fn payload_len(&self) -> usize {
        match self {
            OutboundMessage::Audio(bytes) => bytes.len(),
            OutboundMessage::Status(_) => 0,
        }
    }

    pub fn is_audio(&self) -> bool {
        matches!(self, OutboundMessage::Audio(_))
    }
}
