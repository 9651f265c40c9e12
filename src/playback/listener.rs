//! Listener runtime
//!
//! Turns the best-effort chunk stream from a relay into continuous audio.
//! The runner task is the only owner of the scheduler and decoder; the
//! outside world talks to it through [`ListenerHandle`] commands and reads
//! its state from a watch channel.
//!
//! Disconnected -> Connecting -> Buffering -> Playing (<-> Buffering on
//! underrun) -> Reconnecting on transport error -> Connecting -> ... ->
//! Disconnected on stop or once the reconnect budget is spent.

use super::clock::AudioClock;
use super::decode::PcmDecoder;
use super::output::{AudioOutput, RelayPlayer};
use super::scheduler::PlaybackScheduler;
use super::transport::{ListenerMessage, ListenerStream, ListenerTransport};
use crate::backoff::{Backoff, BackoffPolicy};
use crate::broadcast::StatusMessage;
use crate::config::PlaybackConfig;
use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenerState {
    Disconnected,
    Connecting,
    Buffering,
    Playing,
    Reconnecting,
    /// Playing the compressed relay stream instead of raw PCM
    FallbackRelay,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ListenerStatus {
    pub state: ListenerState,
    pub latency_ms: u64,
    pub reconnect_attempt: u32,
    pub underruns: u64,
    /// Latency is above the configured ceiling
    pub behind_live: bool,
    /// Jumps back to the live point, manual or automatic
    pub go_lives: u64,
    /// Last status message pushed by the relay
    pub server_status: Option<StatusMessage>,
    /// Set once the listener has given up
    pub error: Option<String>,
}

impl Default for ListenerStatus {
    fn default() -> Self {
        Self {
            state: ListenerState::Disconnected,
            latency_ms: 0,
            reconnect_attempt: 0,
            underruns: 0,
            behind_live: false,
            go_lives: 0,
            server_status: None,
            error: None,
        }
    }
}

#[derive(Debug)]
enum Command {
    Stop,
    GoLive,
    SetVolume(f32),
}

/// Control surface of a running listener.
pub struct ListenerHandle {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<ListenerStatus>,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    /// Stop playback, release the connection and wait for the runner to end.
    pub async fn stop(self) {
        let _ = self.commands.send(Command::Stop).await;
        let _ = self.task.await;
    }

    /// Jump back to the live point, discarding queued audio.
    pub async fn go_live(&self) {
        let _ = self.commands.send(Command::GoLive).await;
    }

    pub async fn set_volume(&self, gain: f32) {
        let _ = self.commands.send(Command::SetVolume(gain)).await;
    }

    pub fn status(&self) -> ListenerStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<ListenerStatus> {
        self.status.clone()
    }

    /// Wait for the runner to end on its own.
    pub async fn finished(self) {
        let _ = self.task.await;
    }
}

struct Fallback {
    url: String,
    player: Box<dyn RelayPlayer>,
}

enum StreamEnd {
    Stopped,
    Failed(String),
}

pub struct Listener {
    config: PlaybackConfig,
    transport: Arc<dyn ListenerTransport>,
    output: Box<dyn AudioOutput>,
    scheduler: PlaybackScheduler,
    decoder: PcmDecoder,
    fallback: Option<Fallback>,
    status: watch::Sender<ListenerStatus>,
    overflow_reported: bool,
}

impl Listener {
    pub fn new(
        config: PlaybackConfig,
        transport: Arc<dyn ListenerTransport>,
        output: Box<dyn AudioOutput>,
        clock: Arc<dyn AudioClock>,
    ) -> Self {
        let scheduler = PlaybackScheduler::from_config(clock, &config);
        let decoder = PcmDecoder::new(
            config.sample_rate,
            config.channels,
            config.min_decode_bytes,
            config.max_decode_failures,
        );
        let (status, _) = watch::channel(ListenerStatus::default());

        Self {
            config,
            transport,
            output,
            scheduler,
            decoder,
            fallback: None,
            status,
            overflow_reported: false,
        }
    }

    /// Play `url` through `player` if the raw transport cannot be
    /// established within the reconnect budget.
    pub fn with_fallback(mut self, url: impl Into<String>, player: Box<dyn RelayPlayer>) -> Self {
        self.fallback = Some(Fallback {
            url: url.into(),
            player,
        });
        self
    }

    pub fn spawn(self) -> ListenerHandle {
        let (commands, rx) = mpsc::channel(16);
        let status = self.status.subscribe();
        let task = tokio::spawn(self.run(rx));

        ListenerHandle {
            commands,
            status,
            task,
        }
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let mut backoff = Backoff::new(BackoffPolicy::from(&self.config.reconnect));

        loop {
            self.set_state(ListenerState::Connecting);

            let Some(connected) = self.connect(&mut commands).await else {
                break;
            };

            let reason = match connected {
                Ok(stream) => {
                    info!("Connected to relay");
                    backoff.reset();
                    self.start_fresh();

                    match self.stream(stream, &mut commands).await {
                        StreamEnd::Stopped => break,
                        StreamEnd::Failed(reason) => reason,
                    }
                }
                Err(e) => format!("{:#}", e),
            };

            self.output.cancel_pending();

            let Some(delay) = backoff.next_delay() else {
                let message = format!(
                    "giving up after {} reconnect attempts: {}",
                    backoff.attempt() - 1,
                    reason
                );
                if self.fallback.is_some() {
                    warn!("Raw transport unavailable ({}), falling back to relay stream", reason);
                    self.run_fallback(&mut commands).await;
                } else {
                    error!("Listener {}", message);
                    self.status.send_modify(|s| s.error = Some(message));
                }
                break;
            };

            warn!(
                "Relay connection lost ({}); reconnecting in {:?} (attempt {})",
                reason,
                delay,
                backoff.attempt()
            );
            self.status.send_modify(|s| {
                s.state = ListenerState::Reconnecting;
                s.reconnect_attempt = backoff.attempt();
            });

            if !self.wait_reconnect(delay, &mut commands).await {
                break;
            }
        }

        self.output.cancel_pending();
        self.decoder.reset();
        self.status.send_modify(|s| {
            s.state = ListenerState::Disconnected;
            s.latency_ms = 0;
        });
        info!("Listener stopped");
    }

    /// Attempt one connection while staying responsive to commands.
    /// Returns `None` if asked to stop first.
    async fn connect(
        &mut self,
        commands: &mut mpsc::Receiver<Command>,
    ) -> Option<anyhow::Result<Box<dyn ListenerStream>>> {
        let transport = self.transport.clone();
        let connect = transport.connect();
        tokio::pin!(connect);

        loop {
            tokio::select! {
                result = &mut connect => return Some(result),
                command = commands.recv() => match command {
                    Some(Command::SetVolume(gain)) => self.output.set_gain(gain),
                    Some(Command::GoLive) => {}
                    Some(Command::Stop) | None => return None,
                },
            }
        }
    }

    /// Sleep out a backoff delay. Returns false if asked to stop meanwhile.
    async fn wait_reconnect(&mut self, delay: Duration, commands: &mut mpsc::Receiver<Command>) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return true,
                command = commands.recv() => match command {
                    Some(Command::SetVolume(gain)) => self.output.set_gain(gain),
                    Some(Command::GoLive) => {}
                    Some(Command::Stop) | None => return false,
                },
            }
        }
    }

    /// A new connection shares nothing with the previous one.
    fn start_fresh(&mut self) {
        self.output.cancel_pending();
        self.scheduler.reset();
        self.decoder.reset();
        self.overflow_reported = false;
        self.status.send_modify(|s| {
            s.state = ListenerState::Buffering;
            s.reconnect_attempt = 0;
            s.latency_ms = 0;
            s.error = None;
        });
    }

    async fn stream(
        &mut self,
        mut stream: Box<dyn ListenerStream>,
        commands: &mut mpsc::Receiver<Command>,
    ) -> StreamEnd {
        let receive_timeout = Duration::from_millis(self.config.receive_timeout_ms);
        let mut poll = tokio::time::interval(Duration::from_millis(self.config.latency_poll_ms.max(1)));
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut deadline = Instant::now() + receive_timeout;

        let end = loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::GoLive) => self.go_live(),
                    Some(Command::SetVolume(gain)) => self.output.set_gain(gain),
                    Some(Command::Stop) | None => break StreamEnd::Stopped,
                },
                message = stream.next_message() => {
                    deadline = Instant::now() + receive_timeout;
                    match message {
                        Ok(Some(ListenerMessage::Audio(chunk))) => {
                            if let Err(reason) = self.on_audio(chunk) {
                                break StreamEnd::Failed(reason);
                            }
                        }
                        Ok(Some(ListenerMessage::Status(status))) => {
                            self.status.send_modify(|s| s.server_status = Some(status));
                        }
                        Ok(None) => break StreamEnd::Failed("connection closed by relay".to_string()),
                        Err(e) => break StreamEnd::Failed(format!("{:#}", e)),
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    break StreamEnd::Failed(format!("no data for {:?}", receive_timeout));
                }
                _ = poll.tick() => self.poll_latency(),
            }
        };

        stream.close().await;
        end
    }

    fn on_audio(&mut self, chunk: Bytes) -> Result<(), String> {
        let segment = match self.decoder.push(&chunk) {
            Ok(Some(segment)) => segment,
            Ok(None) => return Ok(()),
            Err(e) => {
                debug!("Discarding chunk: {}", e);
                if self.decoder.failures_exceeded() {
                    return Err(format!("too many consecutive decode failures ({})", e));
                }
                return Ok(());
            }
        };

        let slot = self.scheduler.schedule(segment.duration());
        if let Err(e) = self.output.schedule(segment, slot.start) {
            return Err(format!("{:#}", e));
        }

        let latency_ms = self.scheduler.latency().as_millis() as u64;
        self.status.send_modify(|s| {
            s.latency_ms = latency_ms;
            if s.state == ListenerState::Buffering {
                s.state = ListenerState::Playing;
            }
        });
        self.check_overflow();
        Ok(())
    }

    fn poll_latency(&mut self) {
        let latency_ms = self.scheduler.latency().as_millis() as u64;
        let starved = self.scheduler.is_starved();
        let playing = self.status.borrow().state == ListenerState::Playing;

        if playing && starved {
            let underruns = self.scheduler.record_underrun();
            debug!("Playback underrun ({} so far)", underruns);
            self.status.send_modify(|s| {
                s.state = ListenerState::Buffering;
                s.underruns = underruns;
            });
        }

        self.status.send_modify(|s| s.latency_ms = latency_ms);
        self.check_overflow();
    }

    fn check_overflow(&mut self) {
        let overflowing = self.scheduler.is_overflowing();
        self.status.send_if_modified(|s| {
            let changed = s.behind_live != overflowing;
            s.behind_live = overflowing;
            changed
        });
        if !overflowing {
            self.overflow_reported = false;
            return;
        }

        if self.config.auto_go_live {
            self.go_live();
        } else if !self.overflow_reported {
            self.overflow_reported = true;
            warn!(
                "Listener is {:?} behind live, above the {}ms ceiling",
                self.scheduler.latency(),
                self.config.max_latency_ms
            );
        }
    }

    fn go_live(&mut self) {
        let info = self.scheduler.go_live();
        self.output.cancel_pending();
        self.decoder.reset();
        self.overflow_reported = false;

        info!(
            "Went live: cursor {:?} -> {:?}, {} queued segments discarded",
            info.previous_cursor, info.cursor, info.discarded
        );
        let latency_ms = self.scheduler.latency().as_millis() as u64;
        self.status.send_modify(|s| {
            s.latency_ms = latency_ms;
            s.behind_live = false;
            s.go_lives += 1;
            if s.state == ListenerState::Playing {
                s.state = ListenerState::Buffering;
            }
        });
    }

    async fn run_fallback(&mut self, commands: &mut mpsc::Receiver<Command>) {
        let Some(fallback) = self.fallback.as_mut() else {
            return;
        };

        if let Err(e) = fallback.player.play(&fallback.url) {
            let message = format!("relay fallback failed: {:#}", e);
            error!("{}", message);
            self.status.send_modify(|s| s.error = Some(message));
            return;
        }
        self.status.send_modify(|s| {
            s.state = ListenerState::FallbackRelay;
            s.latency_ms = 0;
        });

        loop {
            match commands.recv().await {
                Some(Command::Stop) | None => break,
                Some(Command::GoLive) | Some(Command::SetVolume(_)) => {
                    debug!("Ignoring command while playing the relay stream");
                }
            }
        }

        if let Some(fallback) = self.fallback.as_mut() {
            fallback.player.stop();
        }
    }

    fn set_state(&self, state: ListenerState) {
        self.status.send_modify(|s| s.state = state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playback::clock::SystemClock;
    use crate::playback::output::MemoryOutput;
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RefusingTransport {
        attempts: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ListenerTransport for RefusingTransport {
        async fn connect(&self) -> Result<Box<dyn ListenerStream>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(anyhow!("connection refused"))
        }
    }

    fn config() -> PlaybackConfig {
        let mut config = PlaybackConfig::default();
        config.reconnect.base_delay_ms = 100;
        config.reconnect.max_delay_ms = 400;
        config.reconnect.max_attempts = 3;
        config
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_reconnects_end_disconnected() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let listener = Listener::new(
            config(),
            Arc::new(RefusingTransport {
                attempts: attempts.clone(),
            }),
            Box::new(MemoryOutput::new()),
            Arc::new(SystemClock::new()),
        );

        let handle = listener.spawn();
        let status = handle.watch_status();
        handle.finished().await;

        let status = status.borrow().clone();
        assert_eq!(status.state, ListenerState::Disconnected);
        assert!(status.error.unwrap().contains("connection refused"));
        // First try plus three retries, nothing after
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_while_reconnecting() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let mut cfg = config();
        cfg.reconnect.base_delay_ms = 60_000;
        cfg.reconnect.max_delay_ms = 60_000;

        let handle = Listener::new(
            cfg,
            Arc::new(RefusingTransport {
                attempts: attempts.clone(),
            }),
            Box::new(MemoryOutput::new()),
            Arc::new(SystemClock::new()),
        )
        .spawn();

        let mut status = handle.watch_status();
        status
            .wait_for(|s| s.state == ListenerState::Reconnecting)
            .await
            .unwrap();

        handle.stop().await;
        assert_eq!(status.borrow().state, ListenerState::Disconnected);
        assert!(status.borrow().error.is_none());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
