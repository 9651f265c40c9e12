//! Where scheduled audio goes.
//!
//! The scheduler decides *when*; an [`AudioOutput`] only has to honour the
//! start time it is given. Gain is applied at render time and never feeds
//! back into scheduling.

use super::clock::AudioClock;
use super::decode::AudioSegment;
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub trait AudioOutput: Send {
    /// Queue `segment` to start at `start` on the audio clock.
    fn schedule(&mut self, segment: AudioSegment, start: Duration) -> Result<()>;

    /// Drop everything queued that has not started playing.
    fn cancel_pending(&mut self);

    /// Linear gain, 1.0 is unity.
    fn set_gain(&mut self, gain: f32);
}

/// Plays the compressed relay stream. Used only when the raw PCM transport
/// cannot be established; never mixed with [`AudioOutput`] playback.
pub trait RelayPlayer: Send {
    fn play(&mut self, url: &str) -> Result<()>;
    fn stop(&mut self);
}

struct Queued {
    generation: u64,
    start: Duration,
    segment: AudioSegment,
}

/// Renders scheduled segments as s16le PCM on a writer, sleeping until each
/// segment's start time.
pub struct PacedWriterOutput {
    tx: mpsc::UnboundedSender<Queued>,
    generation: Arc<AtomicU64>,
    gain: Arc<AtomicU32>,
}

impl PacedWriterOutput {
    pub fn new<W>(writer: W, clock: Arc<dyn AudioClock>) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let generation = Arc::new(AtomicU64::new(0));
        let gain = Arc::new(AtomicU32::new(1.0f32.to_bits()));

        tokio::spawn(render(writer, clock, rx, generation.clone(), gain.clone()));

        Self {
            tx,
            generation,
            gain,
        }
    }

    pub fn stdout(clock: Arc<dyn AudioClock>) -> Self {
        Self::new(tokio::io::stdout(), clock)
    }
}

impl AudioOutput for PacedWriterOutput {
    fn schedule(&mut self, segment: AudioSegment, start: Duration) -> Result<()> {
        self.tx
            .send(Queued {
                generation: self.generation.load(Ordering::SeqCst),
                start,
                segment,
            })
            .map_err(|_| anyhow::anyhow!("Audio writer has stopped"))
    }

    fn cancel_pending(&mut self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    fn set_gain(&mut self, gain: f32) {
        self.gain.store(gain.max(0.0).to_bits(), Ordering::Relaxed);
    }
}

async fn render<W>(
    mut writer: W,
    clock: Arc<dyn AudioClock>,
    mut rx: mpsc::UnboundedReceiver<Queued>,
    generation: Arc<AtomicU64>,
    gain: Arc<AtomicU32>,
) where
    W: AsyncWrite + Send + Unpin,
{
    while let Some(item) = rx.recv().await {
        if item.generation != generation.load(Ordering::SeqCst) {
            continue;
        }

        let wait = item.start.saturating_sub(clock.now());
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
        // Cancelled while waiting for its slot
        if item.generation != generation.load(Ordering::SeqCst) {
            continue;
        }

        let gain = f32::from_bits(gain.load(Ordering::Relaxed));
        let mut bytes = Vec::with_capacity(item.segment.samples.len() * 2);
        for sample in &item.segment.samples {
            let value = (sample * gain * 32768.0).clamp(i16::MIN as f32, i16::MAX as f32) as i16;
            bytes.extend_from_slice(&value.to_le_bytes());
        }

        if let Err(e) = writer.write_all(&bytes).await {
            warn!("Audio output closed: {}", e);
            break;
        }
        let _ = writer.flush().await;
    }
    debug!("Audio writer finished");
}

/// Record of one call made on a [`MemoryOutput`].
#[derive(Debug, Clone, PartialEq)]
pub enum OutputEvent {
    Scheduled { start: Duration, duration: Duration },
    Cancelled,
    Gain(f32),
}

/// Output that remembers what it was asked to do. Cloning shares the log.
#[derive(Debug, Clone, Default)]
pub struct MemoryOutput {
    events: Arc<Mutex<Vec<OutputEvent>>>,
}

impl MemoryOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<OutputEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Scheduled `(start, duration)` pairs in call order.
    pub fn scheduled(&self) -> Vec<(Duration, Duration)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                OutputEvent::Scheduled { start, duration } => Some((start, duration)),
                _ => None,
            })
            .collect()
    }

    fn push(&self, event: OutputEvent) {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).push(event);
    }
}

impl AudioOutput for MemoryOutput {
    fn schedule(&mut self, segment: AudioSegment, start: Duration) -> Result<()> {
        self.push(OutputEvent::Scheduled {
            start,
            duration: segment.duration(),
        });
        Ok(())
    }

    fn cancel_pending(&mut self) {
        self.push(OutputEvent::Cancelled);
    }

    fn set_gain(&mut self, gain: f32) {
        self.push(OutputEvent::Gain(gain));
    }
}

/// Plays the relay stream with an external player (ffplay by default).
pub struct CommandRelayPlayer {
    program: PathBuf,
    child: Option<Child>,
}

impl CommandRelayPlayer {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            child: None,
        }
    }
}

impl RelayPlayer for CommandRelayPlayer {
    fn play(&mut self, url: &str) -> Result<()> {
        self.stop();

        let child = Command::new(&self.program)
            .args(["-nodisp", "-loglevel", "error", "-autoexit", url])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to start relay player {}", self.program.display()))?;

        info!("Playing relay stream {} (pid {:?})", url, child.id());
        self.child = Some(child);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.start_kill() {
                debug!("Relay player already gone: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playback::clock::SystemClock;

    fn segment(samples: Vec<f32>) -> AudioSegment {
        AudioSegment {
            samples,
            sample_rate: 48000,
            channels: 1,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_paced_writer_applies_gain() {
        let (writer, mut reader) = tokio::io::duplex(64);
        let clock: Arc<dyn AudioClock> = Arc::new(SystemClock::new());
        let mut output = PacedWriterOutput::new(writer, clock);

        output.set_gain(0.5);
        output
            .schedule(segment(vec![0.5, -0.5]), Duration::from_millis(10))
            .unwrap();

        let mut buf = [0u8; 4];
        tokio::io::AsyncReadExt::read_exact(&mut reader, &mut buf).await.unwrap();
        assert_eq!(i16::from_le_bytes([buf[0], buf[1]]), 8192);
        assert_eq!(i16::from_le_bytes([buf[2], buf[3]]), -8192);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_segments_are_not_rendered() {
        let (writer, mut reader) = tokio::io::duplex(64);
        let clock: Arc<dyn AudioClock> = Arc::new(SystemClock::new());
        let mut output = PacedWriterOutput::new(writer, clock);

        output
            .schedule(segment(vec![0.25]), Duration::from_millis(500))
            .unwrap();
        output.cancel_pending();
        output
            .schedule(segment(vec![-0.25]), Duration::from_millis(600))
            .unwrap();

        let mut buf = [0u8; 2];
        tokio::io::AsyncReadExt::read_exact(&mut reader, &mut buf).await.unwrap();
        assert_eq!(i16::from_le_bytes(buf), -8192);
    }
}
