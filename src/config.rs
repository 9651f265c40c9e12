use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub service: ServiceConfig,
    pub audio: AudioConfig,
    pub streaming: StreamingConfig,
    pub capture: CaptureConfig,
    pub supervisor: SupervisorConfig,
    pub broadcast: BroadcastConfig,
    pub playback: PlaybackConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub http: HttpConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8470,
        }
    }
}

/// The physical input. Immutable once a capture session starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Device identifier as understood by the input format (e.g. `hw:1,0`)
    pub device: String,
    /// ffmpeg input format used to open the device (`alsa`, `pulse`, ...)
    pub input_format: String,
    pub sample_rate: u32,
    pub channels: u16,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            device: "hw:1,0".to_string(),
            input_format: "alsa".to_string(),
            sample_rate: 48000,
            channels: 2,
        }
    }
}

impl AudioConfig {
    /// Bytes in one interleaved s16le frame
    pub fn bytes_per_frame(&self) -> usize {
        self.channels as usize * 2
    }
}

/// Relay publish settings, used only by the lossy-encode role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Mount path on the relay, with or without a leading slash
    pub mount: String,
    pub bitrate_kbps: u32,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8000,
            username: "source".to_string(),
            password: "hackme".to_string(),
            mount: "/live.mp3".to_string(),
            bitrate_kbps: 192,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub ffmpeg_path: PathBuf,
    /// Directory the session FIFOs are created in
    pub pipe_dir: PathBuf,
    /// Directory lossless recordings are written to
    pub recordings_dir: PathBuf,
    /// When false only the direct-capture role runs (no FIFOs, no downstream roles)
    pub fan_out: bool,
    /// Frames per chunk read from the capture process stdout
    pub chunk_frames: usize,
    /// How long the capture process must survive after spawn to count as running
    pub startup_grace_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            pipe_dir: std::env::temp_dir().join("analog-relay"),
            recordings_dir: PathBuf::from("recordings"),
            fan_out: true,
            chunk_frames: 960,
            startup_grace_ms: 500,
        }
    }
}

impl CaptureConfig {
    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Restarts allowed per role (or per session for the capture process) inside the window
    pub max_restarts: usize,
    pub restart_window_secs: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// How long a stop waits for each process to exit before moving on
    pub stop_timeout_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_restarts: 3,
            restart_window_secs: 60,
            backoff_base_ms: 500,
            backoff_max_ms: 8000,
            stop_timeout_ms: 3000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    /// Messages a single listener may fall behind before its oldest ones are dropped
    pub client_queue_capacity: usize,
    pub status_interval_ms: u64,
    /// A send that does not complete within this window drops the listener
    pub send_timeout_ms: u64,
    /// Overflow events tolerated before a listener is considered stalled
    pub max_lag_strikes: u32,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            client_queue_capacity: 32,
            status_interval_ms: 1000,
            send_timeout_ms: 2000,
            max_lag_strikes: 8,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub min_decode_bytes: usize,
    pub target_initial_delay_ms: u64,
    /// Latency ceiling past which the listener counts as drifted behind live
    pub max_latency_ms: u64,
    pub latency_poll_ms: u64,
    pub receive_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub max_decode_failures: u32,
    pub auto_go_live: bool,
    pub reconnect: ReconnectConfig,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            channels: 2,
            min_decode_bytes: 3840, // 20ms of 48kHz stereo
            target_initial_delay_ms: 250,
            max_latency_ms: 3000,
            latency_poll_ms: 250,
            receive_timeout_ms: 5000,
            connect_timeout_ms: 5000,
            max_decode_failures: 10,
            auto_go_live: false,
            reconnect: ReconnectConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            multiplier: 2.0,
            max_delay_ms: 10_000,
            max_attempts: 8,
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix("ANALOG_RELAY").separator("__"))
            .build()?;

        let cfg: Self = settings.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.audio.device.trim().is_empty() {
            bail!("audio.device must not be empty");
        }
        if self.audio.sample_rate == 0 || self.playback.sample_rate == 0 {
            bail!("sample rate must be greater than zero");
        }
        if self.audio.channels == 0 || self.playback.channels == 0 {
            bail!("channel count must be greater than zero");
        }
        if self.capture.chunk_frames == 0 {
            bail!("capture.chunk_frames must be greater than zero");
        }
        if self.broadcast.client_queue_capacity == 0 {
            bail!("broadcast.client_queue_capacity must be greater than zero");
        }
        if self.playback.target_initial_delay_ms == 0 {
            bail!("playback.target_initial_delay_ms must be greater than zero");
        }
        if self.playback.reconnect.multiplier < 1.0 {
            bail!("playback.reconnect.multiplier must be at least 1.0");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_rejects_zero_channels() {
        let mut cfg = Config::default();
        cfg.audio.channels = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_queue_capacity() {
        let mut cfg = Config::default();
        cfg.broadcast.client_queue_capacity = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("relay.toml");
        std::fs::write(
            &path,
            "[audio]\ndevice = \"hw:2,0\"\nsample_rate = 44100\n\n[broadcast]\nclient_queue_capacity = 4\n",
        )
        .unwrap();

        let cfg = Config::load(path.with_extension("").to_str().unwrap()).unwrap();
        assert_eq!(cfg.audio.device, "hw:2,0");
        assert_eq!(cfg.audio.sample_rate, 44100);
        assert_eq!(cfg.audio.channels, 2);
        assert_eq!(cfg.broadcast.client_queue_capacity, 4);
        assert_eq!(cfg.service.http.port, 8470);
    }
}
