use analog_relay::capture::{CommandSet, FfmpegLauncher, PipeRole, PipeTopology, ProcessRole};
use analog_relay::playback::{
    AudioClock, CommandRelayPlayer, Listener, ListenerState, PacedWriterOutput, SystemClock,
    WebSocketTransport,
};
use analog_relay::{
    create_router, AppState, Broadcaster, CaptureSupervisor, Config, EventBus, SupervisorOptions,
};
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "analog-relay")]
#[command(about = "Capture an analog input once and fan it out to a relay, an archive and live listeners")]
struct Args {
    /// Configuration file (any format the config crate understands)
    #[arg(short, long, default_value = "config/analog-relay")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the capture supervisor and the HTTP/WebSocket server
    Serve {
        /// Start capturing the configured device immediately
        #[arg(long)]
        start: bool,
    },
    /// Connect to a relay and write paced s16le PCM to stdout
    Listen {
        /// Relay push endpoint, e.g. ws://host:8470/listen
        #[arg(long)]
        url: String,

        /// Compressed relay stream to play if the raw transport is unavailable
        #[arg(long)]
        fallback_url: Option<String>,

        /// Player used for the fallback stream
        #[arg(long, default_value = "ffplay")]
        fallback_player: PathBuf,

        /// Linear output gain
        #[arg(long, default_value = "1.0")]
        volume: f32,
    },
    /// Print the ffmpeg argument vectors for the configured device
    Commands,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr so `listen` can own stdout
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cfg = Config::load(&args.config)?;

    match args.command {
        Command::Serve { start } => serve(cfg, start).await,
        Command::Listen {
            url,
            fallback_url,
            fallback_player,
            volume,
        } => listen(cfg, url, fallback_url, fallback_player, volume).await,
        Command::Commands => {
            print_commands(&cfg);
            Ok(())
        }
    }
}

async fn serve(cfg: Config, start: bool) -> Result<()> {
    info!("Analog Relay v{}", env!("CARGO_PKG_VERSION"));
    info!("Capture device: {} ({})", cfg.audio.device, cfg.audio.input_format);
    info!(
        "Relay publish target: {}:{}{}",
        cfg.streaming.host, cfg.streaming.port, cfg.streaming.mount
    );

    let events = EventBus::new();
    let broadcaster = Broadcaster::new(cfg.broadcast.clone(), events.clone());
    let _ticker = broadcaster.spawn_status_ticker();

    let supervisor = CaptureSupervisor::spawn(
        SupervisorOptions {
            capture: cfg.capture.clone(),
            supervisor: cfg.supervisor.clone(),
            streaming: cfg.streaming.clone(),
        },
        Arc::new(FfmpegLauncher::new(&cfg.capture.ffmpeg_path)),
        broadcaster.clone(),
        events.clone(),
    );

    if start {
        supervisor
            .start(cfg.audio.clone())
            .await
            .with_context(|| format!("Failed to start capture on {}", cfg.audio.device))?;
    }

    let state = AppState::new(supervisor.clone(), broadcaster, events, cfg.audio.clone());
    let app = create_router(state);

    let addr = format!("{}:{}", cfg.service.http.bind, cfg.service.http.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("HTTP server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
        })
        .await
        .context("HTTP server failed")?;

    for session in supervisor.sessions().await {
        if session.state.is_active() {
            if let Err(e) = supervisor.stop(&session.device).await {
                warn!("Failed to stop capture on {}: {}", session.device, e);
            }
        }
    }

    Ok(())
}

async fn listen(
    cfg: Config,
    url: String,
    fallback_url: Option<String>,
    fallback_player: PathBuf,
    volume: f32,
) -> Result<()> {
    let playback = cfg.playback;
    let clock: Arc<dyn AudioClock> = Arc::new(SystemClock::new());
    let transport = WebSocketTransport::new(
        url.clone(),
        Duration::from_millis(playback.connect_timeout_ms),
    );

    let mut listener = Listener::new(
        playback,
        Arc::new(transport),
        Box::new(PacedWriterOutput::stdout(clock.clone())),
        clock,
    );
    if let Some(fallback_url) = fallback_url {
        listener = listener.with_fallback(fallback_url, Box::new(CommandRelayPlayer::new(fallback_player)));
    }

    info!("Listening to {}", url);
    let handle = listener.spawn();
    handle.set_volume(volume).await;

    let mut status = handle.watch_status();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Stopping listener");
            handle.stop().await;
        }
        _ = status.wait_for(|s| s.state == ListenerState::Disconnected && s.error.is_some()) => {}
    }

    let last = status.borrow().clone();
    if let Some(e) = last.error {
        error!("Listener failed: {}", e);
        bail!(e);
    }
    Ok(())
}

fn print_commands(cfg: &Config) {
    let topology = PipeTopology::new(&cfg.capture.pipe_dir, &cfg.audio.device);
    let recording_path = cfg.capture.recordings_dir.join("example.flac");
    let commands = CommandSet {
        audio: &cfg.audio,
        streaming: &cfg.streaming,
        topology: &topology,
        recording_path: &recording_path,
    };

    let roles = [ProcessRole::MainCapture, ProcessRole::DirectCapture]
        .into_iter()
        .chain(PipeRole::ALL.into_iter().map(ProcessRole::Downstream));

    for role in roles {
        println!("# {}", role);
        println!("{} {}", cfg.capture.ffmpeg_path.display(), commands.args(role).join(" "));
    }
}
