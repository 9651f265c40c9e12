use super::message::OutboundMessage;
use super::{Broadcaster, Shared};
use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub type ClientId = Uuid;

/// Per-listener counters, updated by the listener's own delivery loop.
#[derive(Debug, Default)]
pub struct ClientStats {
    bytes_sent: AtomicU64,
    messages_dropped: AtomicU64,
    /// Unix millis of the last completed send, 0 before the first one
    last_flush_ms: AtomicI64,
}

impl ClientStats {
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn messages_dropped(&self) -> u64 {
        self.messages_dropped.load(Ordering::Relaxed)
    }

    pub fn last_flush(&self) -> Option<DateTime<Utc>> {
        match self.last_flush_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Utc.timestamp_millis_opt(ms).single(),
        }
    }

    fn record_flush(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.last_flush_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    fn record_dropped(&self, count: u64) {
        self.messages_dropped.fetch_add(count, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientSnapshot {
    pub id: ClientId,
    pub joined_at: DateTime<Utc>,
    pub bytes_sent: u64,
    pub messages_dropped: u64,
    pub last_flush: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    #[error("listener fell behind {0} times and was dropped")]
    Stalled(u32),
}

/// A registered listener.
///
/// Owns its bounded outbound queue (the broadcast receiver). When the queue
/// overflows the oldest unsent messages are lost, never the newest. Dropping
/// the client deregisters it. A client does not keep the broadcaster alive.
pub struct ConnectedClient {
    id: ClientId,
    joined_at: DateTime<Utc>,
    rx: broadcast::Receiver<OutboundMessage>,
    stats: Arc<ClientStats>,
    lag_strikes: u32,
    max_lag_strikes: u32,
    send_timeout: Duration,
    shared: Weak<Shared>,
}

impl ConnectedClient {
    pub(super) fn new(
        id: ClientId,
        joined_at: DateTime<Utc>,
        rx: broadcast::Receiver<OutboundMessage>,
        stats: Arc<ClientStats>,
        shared: &Arc<Shared>,
    ) -> Self {
        let config = &shared.config;
        Self {
            id,
            joined_at,
            rx,
            stats,
            lag_strikes: 0,
            max_lag_strikes: config.max_lag_strikes,
            send_timeout: Duration::from_millis(config.send_timeout_ms),
            shared: Arc::downgrade(shared),
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn joined_at(&self) -> DateTime<Utc> {
        self.joined_at
    }

    pub fn stats(&self) -> &ClientStats {
        &self.stats
    }

    /// Next message for this listener. `Ok(None)` once the broadcaster is gone.
    pub async fn recv(&mut self) -> Result<Option<OutboundMessage>, ClientError> {
        loop {
            match self.rx.recv().await {
                Ok(message) => return Ok(Some(message)),
                Err(RecvError::Lagged(skipped)) => {
                    self.stats.record_dropped(skipped);
                    self.lag_strikes += 1;
                    debug!(
                        "Listener {} overflowed, dropped {} oldest messages (strike {})",
                        self.id, skipped, self.lag_strikes
                    );
                    if self.lag_strikes > self.max_lag_strikes {
                        return Err(ClientError::Stalled(self.lag_strikes));
                    }
                }
                Err(RecvError::Closed) => return Ok(None),
            }
        }
    }
}

impl Drop for ConnectedClient {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            Broadcaster { shared }.leave(self.id);
        }
    }
}

/// The writing half of a listener's push connection.
#[async_trait::async_trait]
pub trait ClientSink: Send {
    async fn send(&mut self, message: &OutboundMessage) -> Result<()>;
}

/// Why a delivery loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryEnd {
    /// Every broadcaster handle was dropped
    Closed,
    /// The listener kept overflowing its queue
    Stalled,
    /// A single send did not complete in time
    TimedOut,
    /// The connection reported an error
    SinkFailed(String),
}

/// Pump a listener's queue into its connection until something gives.
///
/// Whatever happens here only ever affects this one listener; the client is
/// deregistered when the loop ends.
pub async fn deliver<S: ClientSink + ?Sized>(mut client: ConnectedClient, sink: &mut S) -> DeliveryEnd {
    let end = loop {
        let message = match client.recv().await {
            Ok(Some(message)) => message,
            Ok(None) => break DeliveryEnd::Closed,
            Err(e) => {
                warn!("Dropping listener {}: {}", client.id, e);
                break DeliveryEnd::Stalled;
            }
        };

        match timeout(client.send_timeout, sink.send(&message)).await {
            Ok(Ok(())) => client.stats.record_flush(message.payload_len()),
            Ok(Err(e)) => break DeliveryEnd::SinkFailed(e.to_string()),
            Err(_) => {
                warn!(
                    "Dropping listener {}: send blocked for more than {:?}",
                    client.id, client.send_timeout
                );
                break DeliveryEnd::TimedOut;
            }
        }
    };

    info!(
        "Listener {} delivery ended ({:?}), {} bytes sent, {} messages dropped",
        client.id,
        end,
        client.stats.bytes_sent(),
        client.stats.messages_dropped()
    );

    end
}
