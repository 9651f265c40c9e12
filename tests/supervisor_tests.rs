// Integration tests for the capture supervisor
//
// Processes are simulated by a scripted launcher: each "process" stays
// alive until the supervisor kills it or the test crashes it. FIFOs are
// real and live in a temporary directory.

use analog_relay::broadcast::{Broadcaster, OutboundMessage};
use analog_relay::capture::{
    captures_stdout, process_channel, CaptureError, CaptureSupervisor, ExitReport,
    LaunchedProcess, PipeRole, PipeTopology, ProcessLauncher, ProcessMonitor, ProcessRole,
    SessionSnapshot, SupervisorOptions,
};
use analog_relay::config::{AudioConfig, BroadcastConfig, CaptureConfig, StreamingConfig, SupervisorConfig};
use analog_relay::status::{EventBus, StatusEvent};
use anyhow::{bail, Result};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::{broadcast, oneshot};

const DEVICE: &str = "hw:1,0";

struct Launch {
    role: ProcessRole,
    args: Vec<String>,
    crash: Option<oneshot::Sender<()>>,
    writer: Option<DuplexStream>,
    killed: Arc<AtomicBool>,
}

#[derive(Default)]
struct Script {
    launches: Vec<Launch>,
    failing: HashSet<ProcessRole>,
    next_pid: u32,
}

#[derive(Clone, Default)]
struct ScriptedLauncher {
    script: Arc<Mutex<Script>>,
}

impl ScriptedLauncher {
    fn fail(&self, role: ProcessRole) {
        self.script.lock().unwrap().failing.insert(role);
    }

    fn launches(&self, role: ProcessRole) -> usize {
        self.script
            .lock()
            .unwrap()
            .launches
            .iter()
            .filter(|l| l.role == role)
            .count()
    }

    fn args(&self, role: ProcessRole) -> Vec<Vec<String>> {
        self.script
            .lock()
            .unwrap()
            .launches
            .iter()
            .filter(|l| l.role == role)
            .map(|l| l.args.clone())
            .collect()
    }

    fn all_killed(&self) -> bool {
        self.script
            .lock()
            .unwrap()
            .launches
            .iter()
            .filter(|l| l.crash.is_some())
            .all(|l| l.killed.load(Ordering::SeqCst))
    }

    /// Make the newest instance of `role` exit on its own.
    fn crash(&self, role: ProcessRole) {
        let mut script = self.script.lock().unwrap();
        let launch = script
            .launches
            .iter_mut()
            .rev()
            .find(|l| l.role == role)
            .expect("role was never launched");
        let crash = launch.crash.take().expect("already crashed");
        let _ = crash.send(());
    }

    fn take_writer(&self, role: ProcessRole) -> DuplexStream {
        let mut script = self.script.lock().unwrap();
        script
            .launches
            .iter_mut()
            .rev()
            .find(|l| l.role == role)
            .and_then(|l| l.writer.take())
            .expect("no stdout for role")
    }
}

impl ProcessLauncher for ScriptedLauncher {
    fn launch(&self, role: ProcessRole, args: Vec<String>) -> Result<LaunchedProcess> {
        let mut script = self.script.lock().unwrap();
        if script.failing.contains(&role) {
            bail!("Device or resource busy");
        }

        script.next_pid += 1;
        let pid = 1000 + script.next_pid;
        let (control, monitor) = process_channel();
        let (crash_tx, crash_rx) = oneshot::channel::<()>();
        let killed = Arc::new(AtomicBool::new(false));

        let flag = killed.clone();
        tokio::spawn(async move {
            let ProcessMonitor { kill_rx, exit_tx } = monitor;
            let report = tokio::select! {
                _ = kill_rx => {
                    flag.store(true, Ordering::SeqCst);
                    ExitReport { code: None, killed: true, description: "signal: 9 (SIGKILL)".to_string() }
                }
                _ = crash_rx => ExitReport { code: Some(1), killed: false, description: "exit status: 1".to_string() },
            };
            let _ = exit_tx.send(Some(report));
        });

        let (writer, stdout) = if captures_stdout(role) {
            let (writer, reader) = tokio::io::duplex(1 << 16);
            (Some(writer), Some(Box::new(reader) as analog_relay::capture::ProcessOutput))
        } else {
            (None, None)
        };

        script.launches.push(Launch {
            role,
            args,
            crash: Some(crash_tx),
            writer,
            killed,
        });

        Ok(LaunchedProcess {
            pid: Some(pid),
            stdout,
            control,
        })
    }
}

struct Harness {
    _dir: TempDir,
    capture: CaptureConfig,
    launcher: ScriptedLauncher,
    broadcaster: Broadcaster,
    supervisor: CaptureSupervisor,
    events: broadcast::Receiver<StatusEvent>,
}

fn harness(fan_out: bool) -> Result<Harness> {
    let dir = TempDir::new()?;
    let capture = CaptureConfig {
        pipe_dir: dir.path().join("pipes"),
        recordings_dir: dir.path().join("recordings"),
        fan_out,
        chunk_frames: 4,
        startup_grace_ms: 100,
        ..Default::default()
    };
    let options = SupervisorOptions {
        capture: capture.clone(),
        supervisor: SupervisorConfig {
            max_restarts: 2,
            restart_window_secs: 60,
            backoff_base_ms: 100,
            backoff_max_ms: 400,
            stop_timeout_ms: 500,
        },
        streaming: StreamingConfig::default(),
    };

    let bus = EventBus::new();
    let events = bus.subscribe();
    let broadcaster = Broadcaster::new(BroadcastConfig::default(), bus.clone());
    let launcher = ScriptedLauncher::default();
    let supervisor = CaptureSupervisor::spawn(
        options,
        Arc::new(launcher.clone()),
        broadcaster.clone(),
        bus,
    );

    Ok(Harness {
        _dir: dir,
        capture,
        launcher,
        broadcaster,
        supervisor,
        events,
    })
}

fn audio() -> AudioConfig {
    AudioConfig {
        device: DEVICE.to_string(),
        input_format: "alsa".to_string(),
        sample_rate: 48000,
        channels: 2,
    }
}

async fn wait_for_state(supervisor: &CaptureSupervisor, state: &str) -> SessionSnapshot {
    wait_for_device_state(supervisor, DEVICE, state).await
}

async fn wait_for_device_state(
    supervisor: &CaptureSupervisor,
    device: &str,
    state: &str,
) -> SessionSnapshot {
    for _ in 0..2000 {
        if let Some(session) = supervisor.session(device).await {
            if session.state.name() == state {
                return session;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("session never reached {}", state);
}

async fn wait_until(check: impl Fn() -> bool) {
    for _ in 0..2000 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition never became true");
}

fn drain(events: &mut broadcast::Receiver<StatusEvent>) -> Vec<StatusEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

const LOSSY: ProcessRole = ProcessRole::Downstream(PipeRole::LossyEncode);
const LOSSLESS: ProcessRole = ProcessRole::Downstream(PipeRole::LosslessRecord);

#[tokio::test(start_paused = true)]
async fn test_second_start_is_rejected() -> Result<()> {
    let h = harness(true)?;

    let first = h.supervisor.start(audio()).await?;
    assert_eq!(first.state.name(), "starting");

    let second = h.supervisor.start(audio()).await;
    assert!(matches!(second, Err(CaptureError::AlreadyActive { .. })));

    wait_for_state(&h.supervisor, "running").await;
    assert!(matches!(
        h.supervisor.start(audio()).await,
        Err(CaptureError::AlreadyActive { .. })
    ));

    assert_eq!(h.launcher.launches(ProcessRole::MainCapture), 1);
    assert_eq!(h.supervisor.sessions().await.len(), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_session_lifecycle_with_pipes() -> Result<()> {
    let mut h = harness(true)?;
    let topology = PipeTopology::new(&h.capture.pipe_dir, DEVICE);
    assert!(topology.none_exist());

    h.supervisor.start(audio()).await?;
    let running = wait_for_state(&h.supervisor, "running").await;

    // Every downstream role was launched against its own pipe
    assert!(topology.all_exist());
    assert!(running.capture_pid.is_some());
    assert_eq!(running.roles.len(), 3);
    for role in PipeRole::ALL {
        let args = h.launcher.args(ProcessRole::Downstream(role));
        assert_eq!(args.len(), 1);
        assert!(args[0].join(" ").contains(&topology.path(role).display().to_string()));
    }
    assert!(running.roles.iter().all(|r| r.pid.is_some() && !r.failed));

    let stopped = h.supervisor.stop(DEVICE).await?;
    assert_eq!(stopped.state.name(), "idle");
    assert!(topology.none_exist());
    assert!(h.launcher.all_killed());

    let events = drain(&mut h.events);
    assert!(matches!(events.first(), Some(StatusEvent::SessionStarting { .. })));
    assert!(events.iter().any(|e| matches!(e, StatusEvent::SessionStarted { .. })));
    assert!(matches!(events.last(), Some(StatusEvent::SessionStopped { .. })));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_downstream_crash_restarts_only_that_role() -> Result<()> {
    let mut h = harness(true)?;
    h.supervisor.start(audio()).await?;
    let before = wait_for_state(&h.supervisor, "running").await;
    drain(&mut h.events);

    h.launcher.crash(LOSSY);
    wait_until(|| h.launcher.launches(LOSSY) == 2).await;

    let after = wait_for_state(&h.supervisor, "running").await;
    assert_eq!(after.capture_pid, before.capture_pid);
    assert_eq!(after.started_at, before.started_at);
    assert_eq!(h.launcher.launches(ProcessRole::MainCapture), 1);
    assert_eq!(h.launcher.launches(ProcessRole::Downstream(PipeRole::Recognition)), 1);

    let events = drain(&mut h.events);
    assert!(events.iter().any(|e| matches!(
        e,
        StatusEvent::RoleCrashed { role: PipeRole::LossyEncode, .. }
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        StatusEvent::RoleRestarted { role: PipeRole::LossyEncode, pid: Some(_), .. }
    )));
    assert!(!events.iter().any(|e| matches!(
        e,
        StatusEvent::SessionCrashed { .. } | StatusEvent::SessionStopped { .. }
    )));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_downstream_role_fails_after_budget() -> Result<()> {
    let mut h = harness(true)?;
    h.supervisor.start(audio()).await?;
    wait_for_state(&h.supervisor, "running").await;

    for launched in 1..=2 {
        h.launcher.crash(LOSSY);
        wait_until(|| h.launcher.launches(LOSSY) == launched + 1).await;
    }
    h.launcher.crash(LOSSY);

    let mut failed = false;
    for _ in 0..200 {
        let session = wait_for_state(&h.supervisor, "running").await;
        if session
            .roles
            .iter()
            .any(|r| r.role == PipeRole::LossyEncode && r.failed)
        {
            failed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(failed, "lossy-encode was never marked failed");
    assert_eq!(h.launcher.launches(LOSSY), 3);

    let events = drain(&mut h.events);
    assert!(events.iter().any(|e| matches!(
        e,
        StatusEvent::RoleFailed { role: PipeRole::LossyEncode, .. }
    )));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_capture_crash_budget_ends_idle() -> Result<()> {
    let mut h = harness(true)?;
    let topology = PipeTopology::new(&h.capture.pipe_dir, DEVICE);
    h.supervisor.start(audio()).await?;
    wait_for_state(&h.supervisor, "running").await;

    // Two restarts are allowed
    for launched in 1..=2 {
        h.launcher.crash(ProcessRole::MainCapture);
        wait_until(|| h.launcher.launches(ProcessRole::MainCapture) == launched + 1).await;
        wait_for_state(&h.supervisor, "running").await;
    }

    h.launcher.crash(ProcessRole::MainCapture);
    let idle = wait_for_state(&h.supervisor, "idle").await;

    assert!(idle.capture_pid.is_none());
    assert!(topology.none_exist());
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(h.launcher.launches(ProcessRole::MainCapture), 3);

    let events = drain(&mut h.events);
    let crashes = events
        .iter()
        .filter(|e| matches!(e, StatusEvent::SessionCrashed { .. }))
        .count();
    assert_eq!(crashes, 3);
    assert!(matches!(events.last(), Some(StatusEvent::SessionFailed { .. })));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_unavailable_device_fails_start() -> Result<()> {
    let mut h = harness(true)?;
    h.launcher.fail(ProcessRole::MainCapture);

    let result = h.supervisor.start(audio()).await;
    assert!(matches!(result, Err(CaptureError::SpawnFailed { .. })));

    let session = h.supervisor.session(DEVICE).await.unwrap();
    assert_eq!(session.state.name(), "idle");
    assert!(PipeTopology::new(&h.capture.pipe_dir, DEVICE).none_exist());

    let events = drain(&mut h.events);
    assert!(matches!(events.last(), Some(StatusEvent::SessionFailed { .. })));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_direct_capture_without_fan_out() -> Result<()> {
    let h = harness(false)?;
    h.supervisor.start(audio()).await?;
    let running = wait_for_state(&h.supervisor, "running").await;

    assert_eq!(h.launcher.launches(ProcessRole::DirectCapture), 1);
    assert_eq!(h.launcher.launches(ProcessRole::MainCapture), 0);
    assert!(running.roles.is_empty());
    assert!(!h.capture.pipe_dir.exists() || PipeTopology::new(&h.capture.pipe_dir, DEVICE).none_exist());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_capture_output_reaches_listeners() -> Result<()> {
    let h = harness(true)?;
    let mut client = h.broadcaster.join();

    h.supervisor.start(audio()).await?;
    wait_for_state(&h.supervisor, "running").await;
    assert!(h.broadcaster.status_message().streaming);

    // chunk_frames = 4 stereo s16le frames
    let mut stdout = h.launcher.take_writer(ProcessRole::MainCapture);
    stdout.write_all(&[7u8; 16]).await?;

    let message = client.recv().await?.unwrap();
    assert_eq!(message, OutboundMessage::Audio(bytes::Bytes::from(vec![7u8; 16])));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_stop_while_crashed_cancels_restart() -> Result<()> {
    let h = harness(true)?;
    h.supervisor.start(audio()).await?;
    wait_for_state(&h.supervisor, "running").await;

    h.launcher.crash(ProcessRole::MainCapture);
    wait_for_state(&h.supervisor, "crashed").await;

    let stopped = h.supervisor.stop(DEVICE).await?;
    assert_eq!(stopped.state.name(), "idle");

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(h.launcher.launches(ProcessRole::MainCapture), 1);
    assert!(matches!(
        h.supervisor.stop(DEVICE).await,
        Err(CaptureError::NotActive { .. })
    ));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_session_restart_records_to_a_new_file() -> Result<()> {
    let h = harness(true)?;
    h.supervisor.start(audio()).await?;
    wait_for_state(&h.supervisor, "running").await;

    h.launcher.crash(ProcessRole::MainCapture);
    wait_until(|| h.launcher.launches(LOSSLESS) == 2).await;
    wait_for_state(&h.supervisor, "running").await;

    let outputs: Vec<String> = h
        .launcher
        .args(LOSSLESS)
        .into_iter()
        .map(|args| args.last().cloned().unwrap_or_default())
        .collect();
    assert_eq!(outputs.len(), 2);
    assert_ne!(outputs[0], outputs[1]);
    for output in &outputs {
        assert!(output.starts_with(&h.capture.recordings_dir.display().to_string()));
        assert!(output.ends_with(".flac"), "{}", output);
    }
    assert!(outputs[1].contains("-s01-"), "{}", outputs[1]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_role_restart_records_to_a_new_file() -> Result<()> {
    let h = harness(true)?;
    h.supervisor.start(audio()).await?;
    wait_for_state(&h.supervisor, "running").await;

    h.launcher.crash(LOSSLESS);
    wait_until(|| h.launcher.launches(LOSSLESS) == 2).await;

    let outputs: HashSet<String> = h
        .launcher
        .args(LOSSLESS)
        .into_iter()
        .filter_map(|args| args.last().cloned())
        .collect();
    assert_eq!(outputs.len(), 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_only_one_device_feeds_the_relay() -> Result<()> {
    let h = harness(true)?;
    let other = AudioConfig {
        device: "hw:2,0".to_string(),
        ..audio()
    };

    h.supervisor.start(audio()).await?;
    wait_for_state(&h.supervisor, "running").await;
    assert!(h.broadcaster.status_message().streaming);

    match h.supervisor.start(other.clone()).await {
        Err(CaptureError::AlreadyActive { device, state }) => {
            assert_eq!(device, DEVICE);
            assert_eq!(state, "running");
        }
        result => panic!("second device was not rejected: {:?}", result.map(|s| s.device)),
    }
    assert!(h.supervisor.session("hw:2,0").await.is_none());
    assert!(matches!(
        h.supervisor.stop("hw:2,0").await,
        Err(CaptureError::NotActive { .. })
    ));

    // The rejected device never touched the live session
    let running = wait_for_state(&h.supervisor, "running").await;
    assert!(running.capture_pid.is_some());
    assert!(h.broadcaster.status_message().streaming);
    assert_eq!(h.launcher.launches(ProcessRole::MainCapture), 1);

    h.supervisor.stop(DEVICE).await?;
    assert!(!h.broadcaster.status_message().streaming);

    h.supervisor.start(other).await?;
    wait_for_device_state(&h.supervisor, "hw:2,0", "running").await;
    assert!(h.broadcaster.status_message().streaming);
    assert_eq!(h.launcher.launches(ProcessRole::MainCapture), 2);
    Ok(())
}
