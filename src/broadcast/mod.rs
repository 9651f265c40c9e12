//! Live PCM fan-out to remote listeners
//!
//! Every chunk read from the capture process goes into one bounded broadcast
//! channel. Each listener owns a receiver on that channel and runs its own
//! delivery loop, so a listener that stops draining only loses its own
//! oldest messages and is eventually dropped; the others never wait on it.
//!
//! - join: subscribe at the live point (no replay of earlier audio)
//! - leave: deregister, idempotent
//! - broadcast: O(1) regardless of how many listeners are slow
//! - status: `{streaming, clientCount, measuredLatencyMs}` on a fixed cadence

mod client;
mod message;

pub use client::{
    deliver, ClientError, ClientId, ClientSink, ClientSnapshot, ClientStats, ConnectedClient,
    DeliveryEnd,
};
pub use message::{ControlFrame, OutboundMessage, StatusMessage};

use crate::config::BroadcastConfig;
use crate::status::{EventBus, StatusEvent};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::info;
use uuid::Uuid;

struct ClientEntry {
    joined_at: DateTime<Utc>,
    stats: Arc<ClientStats>,
}

struct Shared {
    config: BroadcastConfig,
    tx: broadcast::Sender<OutboundMessage>,
    clients: RwLock<HashMap<ClientId, ClientEntry>>,
    streaming: AtomicBool,
    last_chunk_at: Mutex<Option<Instant>>,
    chunks_broadcast: AtomicU64,
    events: EventBus,
}

#[derive(Clone)]
pub struct Broadcaster {
    shared: Arc<Shared>,
}

impl Broadcaster {
    pub fn new(config: BroadcastConfig, events: EventBus) -> Self {
        let (tx, _) = broadcast::channel(config.client_queue_capacity.max(1));

        Self {
            shared: Arc::new(Shared {
                config,
                tx,
                clients: RwLock::new(HashMap::new()),
                streaming: AtomicBool::new(false),
                last_chunk_at: Mutex::new(None),
                chunks_broadcast: AtomicU64::new(0),
                events,
            }),
        }
    }

    /// Register a listener. It receives only what is broadcast from now on.
    pub fn join(&self) -> ConnectedClient {
        let rx = self.shared.tx.subscribe();
        let id = Uuid::new_v4();
        let joined_at = Utc::now();
        let stats = Arc::new(ClientStats::default());

        let count = {
            let mut clients = self.shared.clients.write().unwrap_or_else(|e| e.into_inner());
            clients.insert(
                id,
                ClientEntry {
                    joined_at,
                    stats: Arc::clone(&stats),
                },
            );
            clients.len()
        };

        info!("Listener {} joined ({} connected)", id, count);
        self.shared.events.emit(StatusEvent::ListenerCount { count });

        ConnectedClient::new(id, joined_at, rx, stats, &self.shared)
    }

    /// Deregister a listener. Returns false if it was already gone.
    pub fn leave(&self, id: ClientId) -> bool {
        let (removed, count) = {
            let mut clients = self.shared.clients.write().unwrap_or_else(|e| e.into_inner());
            let removed = clients.remove(&id).is_some();
            (removed, clients.len())
        };

        if removed {
            info!("Listener {} left ({} connected)", id, count);
            self.shared.events.emit(StatusEvent::ListenerCount { count });
        }

        removed
    }

    /// Queue a PCM chunk for every listener. Returns how many queues took it.
    pub fn broadcast(&self, chunk: Bytes) -> usize {
        *self.shared.last_chunk_at.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
        self.shared.chunks_broadcast.fetch_add(1, Ordering::Relaxed);

        // No receivers is not an error: nobody is listening yet
        self.shared.tx.send(OutboundMessage::Audio(chunk)).unwrap_or(0)
    }

    pub fn set_streaming(&self, streaming: bool) {
        self.shared.streaming.store(streaming, Ordering::Relaxed);
    }

    pub fn client_count(&self) -> usize {
        self.shared.clients.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn chunks_broadcast(&self) -> u64 {
        self.shared.chunks_broadcast.load(Ordering::Relaxed)
    }

    pub fn clients(&self) -> Vec<ClientSnapshot> {
        let clients = self.shared.clients.read().unwrap_or_else(|e| e.into_inner());
        let mut snapshots: Vec<ClientSnapshot> = clients
            .iter()
            .map(|(id, entry)| ClientSnapshot {
                id: *id,
                joined_at: entry.joined_at,
                bytes_sent: entry.stats.bytes_sent(),
                messages_dropped: entry.stats.messages_dropped(),
                last_flush: entry.stats.last_flush(),
            })
            .collect();
        snapshots.sort_by_key(|s| s.joined_at);
        snapshots
    }

    pub fn status_message(&self) -> StatusMessage {
        let measured_latency_ms = self
            .shared
            .last_chunk_at
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .map(|at| at.elapsed().as_millis() as u64)
            .unwrap_or(0);

        StatusMessage {
            streaming: self.shared.streaming.load(Ordering::Relaxed),
            client_count: self.client_count(),
            measured_latency_ms,
        }
    }

    /// Push a status message to every listener.
    pub fn publish_status(&self) -> StatusMessage {
        let status = self.status_message();
        let _ = self.shared.tx.send(OutboundMessage::Status(status));
        if status.streaming {
            self.shared.events.emit(StatusEvent::RelayLatency {
                latency_ms: status.measured_latency_ms,
            });
        }
        status
    }

    /// Publish status on the configured cadence, independent of audio
    /// arrival. Ends once every `Broadcaster` handle is dropped.
    pub fn spawn_status_ticker(&self) -> JoinHandle<()> {
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        let period = Duration::from_millis(self.shared.config.status_interval_ms.max(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                Broadcaster { shared }.publish_status();
            }
        })
    }
}
