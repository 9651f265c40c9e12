//! Capture supervisor
//!
//! One actor task owns every capture session. Requests from handles and
//! notifications from process watchers, pumps and timers all arrive as
//! messages, so the actor never blocks on any single subprocess.
//!
//! Across devices only one session may be live at a time, since they all
//! feed the same relay. Per device:
//! - at most one session is active; a second start is rejected, not queued
//! - a downstream role dying restarts only that role
//! - the capture process dying crashes the session and triggers a bounded,
//!   backing-off restart of the whole session, then Idle once the budget is spent

use super::command::{CommandSet, ProcessRole};
use super::pipes::{device_slug, PipeRole, PipeTopology};
use super::process::{captures_stdout, wait_for_exit, ExitReport, LaunchedProcess, ProcessControl, ProcessLauncher, ProcessOutput};
use super::state::{RestartDecision, RestartTracker, SessionState, Transition};
use super::CaptureError;
use crate::backoff::BackoffPolicy;
use crate::broadcast::Broadcaster;
use crate::config::{AudioConfig, CaptureConfig, StreamingConfig, SupervisorConfig};
use crate::status::{EventBus, StatusEvent};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Everything the supervisor needs besides the per-session audio config.
#[derive(Debug, Clone, Default)]
pub struct SupervisorOptions {
    pub capture: CaptureConfig,
    pub supervisor: SupervisorConfig,
    pub streaming: StreamingConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoleSnapshot {
    pub role: PipeRole,
    pub pid: Option<u32>,
    pub restarts: usize,
    pub failed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub device: String,
    pub state: SessionState,
    pub started_at: Option<DateTime<Utc>>,
    pub capture_pid: Option<u32>,
    pub session_restarts: usize,
    pub roles: Vec<RoleSnapshot>,
}

type Reply = oneshot::Sender<Result<SessionSnapshot, CaptureError>>;

enum Request {
    Start { audio: AudioConfig, reply: Reply },
    Stop { device: String, reply: Reply },
    Snapshot { reply: oneshot::Sender<Vec<SessionSnapshot>> },
}

enum Notice {
    Exited { device: String, generation: u64, report: ExitReport },
    ReadyCheck { device: String, epoch: u64 },
    RestartCapture { device: String, epoch: u64 },
    RestartRole { device: String, epoch: u64, role: PipeRole },
    StopComplete { device: String, epoch: u64, reply: Reply },
}

/// Handle to the supervisor actor. Cheap to clone; the actor shuts every
/// session down once the last handle is dropped.
#[derive(Clone)]
pub struct CaptureSupervisor {
    requests: mpsc::Sender<Request>,
    recognition: broadcast::Sender<Bytes>,
}

impl CaptureSupervisor {
    pub fn spawn(
        options: SupervisorOptions,
        launcher: Arc<dyn ProcessLauncher>,
        broadcaster: Broadcaster,
        events: EventBus,
    ) -> Self {
        let (requests, request_rx) = mpsc::channel(32);
        let (notices, notice_rx) = mpsc::unbounded_channel();
        let (recognition, _) = broadcast::channel(64);

        let actor = Supervisor {
            backoff: BackoffPolicy::from(&options.supervisor),
            options,
            launcher,
            broadcaster,
            events,
            recognition: recognition.clone(),
            notices,
            sessions: HashMap::new(),
            next_generation: 0,
            recordings: AtomicU64::new(0),
        };

        tokio::spawn(actor.run(request_rx, notice_rx));

        Self {
            requests,
            recognition,
        }
    }

    /// Start capturing `audio.device`. Fails with
    /// [`CaptureError::AlreadyActive`] if a session for that device is
    /// already starting or running, or if any other device still has a
    /// session that is not idle.
    pub async fn start(&self, audio: AudioConfig) -> Result<SessionSnapshot, CaptureError> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(Request::Start { audio, reply })
            .await
            .map_err(|_| CaptureError::SupervisorGone)?;
        rx.await.map_err(|_| CaptureError::SupervisorGone)?
    }

    /// Stop the session for `device`, terminating readers before the writer
    /// and removing its pipes.
    pub async fn stop(&self, device: &str) -> Result<SessionSnapshot, CaptureError> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(Request::Stop {
                device: device.to_string(),
                reply,
            })
            .await
            .map_err(|_| CaptureError::SupervisorGone)?;
        rx.await.map_err(|_| CaptureError::SupervisorGone)?
    }

    pub async fn sessions(&self) -> Vec<SessionSnapshot> {
        let (reply, rx) = oneshot::channel();
        if self.requests.send(Request::Snapshot { reply }).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn session(&self, device: &str) -> Option<SessionSnapshot> {
        self.sessions()
            .await
            .into_iter()
            .find(|s| s.device == device)
    }

    /// Raw PCM re-emitted by the recognition-passthrough role, for a sampler.
    pub fn recognition_feed(&self) -> broadcast::Receiver<Bytes> {
        self.recognition.subscribe()
    }
}

struct Supervised {
    generation: u64,
    pid: Option<u32>,
    control: ProcessControl,
}

struct RoleSlot {
    process: Option<Supervised>,
    tracker: RestartTracker,
    restarts: usize,
    failed: bool,
}

struct DeviceSession {
    audio: AudioConfig,
    state: SessionState,
    /// Bumped on every launch and stop; timers from an older epoch are ignored
    epoch: u64,
    started_at: Option<DateTime<Utc>>,
    topology: Option<PipeTopology>,
    capture: Option<Supervised>,
    roles: BTreeMap<PipeRole, RoleSlot>,
    crash_tracker: RestartTracker,
    session_restarts: usize,
}

impl DeviceSession {
    fn new(audio: AudioConfig, cfg: &SupervisorConfig) -> Self {
        Self {
            audio,
            state: SessionState::Idle,
            epoch: 0,
            started_at: None,
            topology: None,
            capture: None,
            roles: BTreeMap::new(),
            crash_tracker: RestartTracker::new(
                cfg.max_restarts,
                Duration::from_secs(cfg.restart_window_secs),
            ),
            session_restarts: 0,
        }
    }

    fn transition(&mut self, transition: Transition) {
        let current = std::mem::replace(&mut self.state, SessionState::Idle);
        match current.clone().apply(transition) {
            Ok(next) => {
                debug!("{}: {} -> {}", self.audio.device, current.name(), next.name());
                self.state = next;
            }
            Err(e) => {
                error!("{}: {}", self.audio.device, e);
                self.state = current;
            }
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            device: self.audio.device.clone(),
            state: self.state.clone(),
            started_at: self.started_at,
            capture_pid: self.capture.as_ref().and_then(|p| p.pid),
            session_restarts: self.session_restarts,
            roles: self
                .roles
                .iter()
                .map(|(role, slot)| RoleSnapshot {
                    role: *role,
                    pid: slot.process.as_ref().and_then(|p| p.pid),
                    restarts: slot.restarts,
                    failed: slot.failed,
                })
                .collect(),
        }
    }

    fn take_processes(&mut self) -> (Vec<Supervised>, Option<Supervised>) {
        let readers = self
            .roles
            .values_mut()
            .filter_map(|slot| slot.process.take())
            .collect();
        (readers, self.capture.take())
    }
}

struct Supervisor {
    options: SupervisorOptions,
    backoff: BackoffPolicy,
    launcher: Arc<dyn ProcessLauncher>,
    broadcaster: Broadcaster,
    events: EventBus,
    recognition: broadcast::Sender<Bytes>,
    notices: mpsc::UnboundedSender<Notice>,
    sessions: HashMap<String, DeviceSession>,
    next_generation: u64,
    /// Lossless launches so far; never reset while the actor lives
    recordings: AtomicU64,
}

impl Supervisor {
    async fn run(
        mut self,
        mut requests: mpsc::Receiver<Request>,
        mut notices: mpsc::UnboundedReceiver<Notice>,
    ) {
        info!("Capture supervisor started");

        loop {
            tokio::select! {
                request = requests.recv() => match request {
                    Some(request) => self.handle_request(request),
                    None => break,
                },
                Some(notice) = notices.recv() => self.handle_notice(notice),
            }
        }

        self.shutdown();
        info!("Capture supervisor stopped");
    }

    fn handle_request(&mut self, request: Request) {
        match request {
            Request::Start { audio, reply } => {
                let _ = reply.send(self.start(audio));
            }
            Request::Stop { device, reply } => self.stop(&device, reply),
            Request::Snapshot { reply } => {
                let mut sessions: Vec<_> = self.sessions.values().map(|s| s.snapshot()).collect();
                sessions.sort_by(|a, b| a.device.cmp(&b.device));
                let _ = reply.send(sessions);
            }
        }
    }

    fn handle_notice(&mut self, notice: Notice) {
        match notice {
            Notice::Exited {
                device,
                generation,
                report,
            } => self.on_exit(&device, generation, report),
            Notice::ReadyCheck { device, epoch } => self.on_ready_check(&device, epoch),
            Notice::RestartCapture { device, epoch } => self.on_restart_capture(&device, epoch),
            Notice::RestartRole {
                device,
                epoch,
                role,
            } => self.on_restart_role(&device, epoch, role),
            Notice::StopComplete {
                device,
                epoch,
                reply,
            } => self.on_stop_complete(&device, epoch, reply),
        }
    }

    fn start(&mut self, audio: AudioConfig) -> Result<SessionSnapshot, CaptureError> {
        let device = audio.device.clone();

        // Listeners share one relay, so only one device may feed it
        if let Some((other, session)) = self
            .sessions
            .iter()
            .find(|(name, s)| **name != device && s.state != SessionState::Idle)
        {
            warn!(
                "Start requested for {} while {} is {}; ignoring",
                device,
                other,
                session.state.name()
            );
            return Err(CaptureError::AlreadyActive {
                device: other.clone(),
                state: session.state.name().to_string(),
            });
        }

        let session = self
            .sessions
            .entry(device.clone())
            .or_insert_with(|| DeviceSession::new(audio.clone(), &self.options.supervisor));

        if session.state.is_active() || session.state == SessionState::Stopping {
            warn!(
                "Start requested for {} while {}; ignoring",
                device,
                session.state.name()
            );
            return Err(CaptureError::AlreadyActive {
                device,
                state: session.state.name().to_string(),
            });
        }

        // Config is only fixed for the lifetime of one session
        session.audio = audio;
        session.transition(Transition::Start);
        session.session_restarts = 0;
        session.crash_tracker = RestartTracker::new(
            self.options.supervisor.max_restarts,
            Duration::from_secs(self.options.supervisor.restart_window_secs),
        );
        self.events.emit(StatusEvent::SessionStarting {
            device: device.clone(),
        });

        if let Err(e) = self.launch_session(&device) {
            error!("Failed to start capture on {}: {}", device, e);
            if let Some(session) = self.sessions.get_mut(&device) {
                session.transition(Transition::CaptureExited {
                    reason: e.to_string(),
                    attempt: 0,
                });
                session.transition(Transition::GiveUp);
            }
            self.events.emit(StatusEvent::SessionFailed {
                device,
                reason: e.to_string(),
            });
            return Err(e);
        }

        Ok(self.snapshot_of(&device))
    }

    /// Create the pipes and launch every process for a session that has
    /// just entered Starting.
    fn launch_session(&mut self, device: &str) -> Result<(), CaptureError> {
        let fan_out = self.options.capture.fan_out;
        let grace = self.options.capture.startup_grace();

        let Some(session) = self.sessions.get_mut(device) else {
            return Err(CaptureError::NotActive {
                device: device.to_string(),
            });
        };
        session.epoch += 1;
        let epoch = session.epoch;

        let topology = if fan_out {
            let topology = PipeTopology::new(&self.options.capture.pipe_dir, device);
            topology
                .create()
                .map_err(|e| CaptureError::Pipe(format!("{:#}", e)))?;
            Some(topology)
        } else {
            None
        };
        session.topology = topology;

        let capture_role = if fan_out {
            ProcessRole::MainCapture
        } else {
            ProcessRole::DirectCapture
        };

        let launched = match self.launch(device, capture_role) {
            Ok(launched) => launched,
            Err(e) => {
                if let Some(topology) = self
                    .sessions
                    .get_mut(device)
                    .and_then(|s| s.topology.take())
                {
                    topology.remove();
                }
                return Err(e);
            }
        };

        let capture = self.supervise(device, capture_role, launched);
        info!(
            "{} launched for {} (pid {:?})",
            capture_role, device, capture.pid
        );

        let tracker = RestartTracker::new(
            self.options.supervisor.max_restarts,
            Duration::from_secs(self.options.supervisor.restart_window_secs),
        );
        if let Some(session) = self.sessions.get_mut(device) {
            session.capture = Some(capture);
            session.roles.clear();
            if fan_out {
                for role in PipeRole::ALL {
                    session.roles.insert(
                        role,
                        RoleSlot {
                            process: None,
                            tracker: tracker.clone(),
                            restarts: 0,
                            failed: false,
                        },
                    );
                }
            }
        }

        if fan_out {
            for role in PipeRole::ALL {
                if let Err(e) = self.launch_role(device, role) {
                    warn!("{} on {} did not start: {}", role, device, e);
                }
            }
        }

        self.schedule(
            grace,
            Notice::ReadyCheck {
                device: device.to_string(),
                epoch,
            },
        );
        Ok(())
    }

    /// Launch one downstream role into its slot. A failed spawn is handled
    /// like a crash of that role.
    fn launch_role(&mut self, device: &str, role: PipeRole) -> Result<Option<u32>, CaptureError> {
        let launched = match self.launch(device, ProcessRole::Downstream(role)) {
            Ok(launched) => launched,
            Err(e) => {
                self.on_role_failure(device, role, e.to_string());
                return Err(e);
            }
        };

        let process = self.supervise(device, ProcessRole::Downstream(role), launched);
        let pid = process.pid;
        debug!("{} launched for {} (pid {:?})", role, device, pid);
        if let Some(slot) = self
            .sessions
            .get_mut(device)
            .and_then(|s| s.roles.get_mut(&role))
        {
            slot.process = Some(process);
        }
        Ok(pid)
    }

    fn launch(&self, device: &str, role: ProcessRole) -> Result<LaunchedProcess, CaptureError> {
        let session = self.sessions.get(device).ok_or_else(|| CaptureError::NotActive {
            device: device.to_string(),
        })?;

        let args = match (role, &session.topology) {
            (ProcessRole::DirectCapture, _) => super::command::direct_capture_args(&session.audio),
            (_, Some(topology)) => {
                let recording_path = if role == ProcessRole::Downstream(PipeRole::LosslessRecord) {
                    if let Err(e) = std::fs::create_dir_all(&self.options.capture.recordings_dir) {
                        return Err(CaptureError::SpawnFailed {
                            role: role.to_string(),
                            reason: format!("cannot create recordings directory: {}", e),
                        });
                    }
                    self.next_recording_path(device, session)
                } else {
                    PathBuf::new()
                };
                CommandSet {
                    audio: &session.audio,
                    streaming: &self.options.streaming,
                    topology,
                    recording_path: &recording_path,
                }
                .args(role)
            }
            (_, None) => {
                return Err(CaptureError::Pipe(format!(
                    "no pipe topology for {} on {}",
                    role, device
                )))
            }
        };

        self.launcher
            .launch(role, args)
            .map_err(|e| CaptureError::SpawnFailed {
                role: role.to_string(),
                reason: format!("{:#}", e),
            })
    }

    /// Each lossless launch gets its own file for as long as the supervisor
    /// runs, across role and session restarts alike.
    fn next_recording_path(&self, device: &str, session: &DeviceSession) -> PathBuf {
        let sequence = self.recordings.fetch_add(1, Ordering::Relaxed) + 1;

        self.options.capture.recordings_dir.join(format!(
            "{}-{}-s{:02}-{:04}.flac",
            device_slug(device),
            Utc::now().format("%Y%m%d-%H%M%S"),
            session.session_restarts,
            sequence
        ))
    }

    /// Wire up exit notification and output pumping for a fresh process.
    fn supervise(&mut self, device: &str, role: ProcessRole, launched: LaunchedProcess) -> Supervised {
        self.next_generation += 1;
        let generation = self.next_generation;

        let LaunchedProcess {
            pid,
            stdout,
            control,
        } = launched;

        let exit_rx = control.exit_watch();
        let notices = self.notices.clone();
        let device_name = device.to_string();
        tokio::spawn(async move {
            if let Some(report) = wait_for_exit(exit_rx, None).await {
                let _ = notices.send(Notice::Exited {
                    device: device_name,
                    generation,
                    report,
                });
            }
        });

        if let Some(stdout) = stdout.filter(|_| captures_stdout(role)) {
            let chunk_bytes = self.sessions.get(device).map_or(3840, |s| {
                s.audio.bytes_per_frame() * self.options.capture.chunk_frames
            });

            if role.is_capture() {
                let broadcaster = self.broadcaster.clone();
                tokio::spawn(pump(stdout, chunk_bytes, role, move |chunk| {
                    broadcaster.broadcast(chunk);
                }));
            } else {
                let recognition = self.recognition.clone();
                tokio::spawn(pump(stdout, chunk_bytes, role, move |chunk| {
                    let _ = recognition.send(chunk);
                }));
            }
        }

        Supervised {
            generation,
            pid,
            control,
        }
    }

    fn on_exit(&mut self, device: &str, generation: u64, report: ExitReport) {
        let Some(session) = self.sessions.get_mut(device) else {
            return;
        };

        if session
            .capture
            .as_ref()
            .is_some_and(|p| p.generation == generation)
        {
            session.capture = None;
            if session.state.is_active() {
                warn!("Capture process for {} exited unexpectedly: {}", device, report);
                self.on_capture_failure(device, report.to_string());
            }
            return;
        }

        let role = session.roles.iter_mut().find_map(|(role, slot)| {
            if slot.process.as_ref().is_some_and(|p| p.generation == generation) {
                slot.process = None;
                Some(*role)
            } else {
                None
            }
        });

        match role {
            Some(role) if session.state.is_active() => {
                warn!("{} for {} exited: {}", role, device, report);
                self.on_role_failure(device, role, report.to_string());
            }
            Some(_) => {}
            None => debug!("Ignoring exit of retired process {} on {}", generation, device),
        }
    }

    /// The capture process is gone: tear the session down and decide whether
    /// to relaunch it.
    fn on_capture_failure(&mut self, device: &str, reason: String) {
        let Some(session) = self.sessions.get_mut(device) else {
            return;
        };

        let (readers, capture) = session.take_processes();
        for mut process in readers.into_iter().chain(capture) {
            process.control.kill();
        }
        if let Some(topology) = session.topology.take() {
            topology.remove();
        }
        self.broadcaster.set_streaming(false);

        match session.crash_tracker.record(Instant::now()) {
            RestartDecision::Retry { attempt } => {
                session.transition(Transition::CaptureExited {
                    reason: reason.clone(),
                    attempt,
                });
                let delay = self.backoff.delay_for(attempt as u32);
                warn!(
                    "Capture session on {} crashed ({}); restart {} in {:?}",
                    device, reason, attempt, delay
                );
                let epoch = session.epoch;
                self.events.emit(StatusEvent::SessionCrashed {
                    device: device.to_string(),
                    reason,
                    attempt,
                });
                self.schedule(
                    delay,
                    Notice::RestartCapture {
                        device: device.to_string(),
                        epoch,
                    },
                );
            }
            RestartDecision::Exhausted => {
                let attempt = session.crash_tracker.restarts_in_window();
                session.transition(Transition::CaptureExited {
                    reason: reason.clone(),
                    attempt,
                });
                session.transition(Transition::GiveUp);
                session.started_at = None;
                error!(
                    "Capture session on {} failed after {} restarts: {}",
                    device, attempt, reason
                );
                self.events.emit(StatusEvent::SessionCrashed {
                    device: device.to_string(),
                    reason: reason.clone(),
                    attempt,
                });
                self.events.emit(StatusEvent::SessionFailed {
                    device: device.to_string(),
                    reason,
                });
            }
        }
    }

    fn on_role_failure(&mut self, device: &str, role: PipeRole, reason: String) {
        let Some(session) = self.sessions.get_mut(device) else {
            return;
        };
        let epoch = session.epoch;
        let Some(slot) = session.roles.get_mut(&role) else {
            return;
        };

        match slot.tracker.record(Instant::now()) {
            RestartDecision::Retry { attempt } => {
                slot.restarts += 1;
                let delay = self.backoff.delay_for(attempt as u32);
                info!("Restarting {} on {} in {:?} (attempt {})", role, device, delay, attempt);
                self.events.emit(StatusEvent::RoleCrashed {
                    device: device.to_string(),
                    role,
                    reason,
                    restarts: slot.restarts,
                });
                self.schedule(
                    delay,
                    Notice::RestartRole {
                        device: device.to_string(),
                        epoch,
                        role,
                    },
                );
            }
            RestartDecision::Exhausted => {
                slot.failed = true;
                error!(
                    "{} on {} failed permanently for this session: {}",
                    role, device, reason
                );
                self.events.emit(StatusEvent::RoleFailed {
                    device: device.to_string(),
                    role,
                    reason,
                });
            }
        }
    }

    fn on_ready_check(&mut self, device: &str, epoch: u64) {
        let Some(session) = self.sessions.get_mut(device) else {
            return;
        };
        if session.epoch != epoch || !matches!(session.state, SessionState::Starting { .. }) {
            return;
        }

        let alive = session
            .capture
            .as_ref()
            .is_some_and(|p| !p.control.has_exited());
        if !alive {
            return;
        }

        let now = Utc::now();
        session.transition(Transition::Ready { at: now });
        session.started_at = Some(now);
        self.broadcaster.set_streaming(true);
        info!("Capture session on {} is running", device);
        self.events.emit(StatusEvent::SessionStarted {
            device: device.to_string(),
            started_at: now,
        });
    }

    fn on_restart_capture(&mut self, device: &str, epoch: u64) {
        let Some(session) = self.sessions.get_mut(device) else {
            return;
        };
        if session.epoch != epoch || !matches!(session.state, SessionState::Crashed { .. }) {
            return;
        }

        session.transition(Transition::Restart);
        session.session_restarts += 1;
        info!("Restarting capture session on {}", device);
        self.events.emit(StatusEvent::SessionStarting {
            device: device.to_string(),
        });

        if let Err(e) = self.launch_session(device) {
            warn!("Relaunch of {} failed: {}", device, e);
            self.on_capture_failure(device, e.to_string());
        }
    }

    fn on_restart_role(&mut self, device: &str, epoch: u64, role: PipeRole) {
        let Some(session) = self.sessions.get(device) else {
            return;
        };
        if session.epoch != epoch || !session.state.is_active() {
            return;
        }
        let runnable = session
            .roles
            .get(&role)
            .is_some_and(|slot| slot.process.is_none() && !slot.failed);
        if !runnable {
            return;
        }

        if let Ok(pid) = self.launch_role(device, role) {
            info!("{} on {} restarted (pid {:?})", role, device, pid);
            self.events.emit(StatusEvent::RoleRestarted {
                device: device.to_string(),
                role,
                pid,
            });
        }
    }

    fn stop(&mut self, device: &str, reply: Reply) {
        let stop_timeout = Duration::from_millis(self.options.supervisor.stop_timeout_ms);

        let Some(session) = self.sessions.get_mut(device) else {
            let _ = reply.send(Err(CaptureError::NotActive {
                device: device.to_string(),
            }));
            return;
        };

        match session.state {
            SessionState::Idle | SessionState::Stopping => {
                let _ = reply.send(Err(CaptureError::NotActive {
                    device: device.to_string(),
                }));
            }
            SessionState::Crashed { .. } => {
                // Processes and pipes are already gone; just cancel the restart
                session.epoch += 1;
                session.transition(Transition::Stop);
                session.started_at = None;
                info!("Cancelled pending restart of {}", device);
                self.events.emit(StatusEvent::SessionStopped {
                    device: device.to_string(),
                });
                let _ = reply.send(Ok(session.snapshot()));
            }
            SessionState::Starting { .. } | SessionState::Running { .. } => {
                session.epoch += 1;
                session.transition(Transition::Stop);
                info!("Stopping capture session on {}", device);

                let epoch = session.epoch;
                let (mut readers, capture) = session.take_processes();
                let notices = self.notices.clone();
                let device = device.to_string();

                // Readers first so the writer never sees a broken pipe
                tokio::spawn(async move {
                    for process in readers.iter_mut() {
                        process.control.kill();
                    }
                    for process in &readers {
                        if process.control.wait_exit(stop_timeout).await.is_none() {
                            warn!("Reader pid {:?} did not exit in {:?}", process.pid, stop_timeout);
                        }
                    }
                    if let Some(mut capture) = capture {
                        capture.control.kill();
                        if capture.control.wait_exit(stop_timeout).await.is_none() {
                            warn!("Capture pid {:?} did not exit in {:?}", capture.pid, stop_timeout);
                        }
                    }
                    let _ = notices.send(Notice::StopComplete {
                        device,
                        epoch,
                        reply,
                    });
                });
            }
        }
    }

    fn on_stop_complete(&mut self, device: &str, epoch: u64, reply: Reply) {
        let Some(session) = self.sessions.get_mut(device) else {
            let _ = reply.send(Err(CaptureError::NotActive {
                device: device.to_string(),
            }));
            return;
        };

        if session.epoch == epoch && session.state == SessionState::Stopping {
            session.transition(Transition::Stopped);
        }
        if let Some(topology) = session.topology.take() {
            topology.remove();
        }
        session.started_at = None;
        session.roles.clear();
        self.broadcaster.set_streaming(false);

        info!("Capture session on {} stopped", device);
        self.events.emit(StatusEvent::SessionStopped {
            device: device.to_string(),
        });
        let _ = reply.send(Ok(session.snapshot()));
    }

    fn snapshot_of(&self, device: &str) -> SessionSnapshot {
        self.sessions
            .get(device)
            .map(|s| s.snapshot())
            .unwrap_or_else(|| SessionSnapshot {
                device: device.to_string(),
                state: SessionState::Idle,
                started_at: None,
                capture_pid: None,
                session_restarts: 0,
                roles: Vec::new(),
            })
    }

    fn schedule(&self, delay: Duration, notice: Notice) {
        let notices = self.notices.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = notices.send(notice);
        });
    }

    fn shutdown(&mut self) {
        for (device, session) in self.sessions.iter_mut() {
            let (readers, capture) = session.take_processes();
            for mut process in readers.into_iter().chain(capture) {
                process.control.kill();
            }
            if let Some(topology) = session.topology.take() {
                topology.remove();
            }
            if session.state != SessionState::Idle {
                info!("Shut down capture session on {}", device);
            }
        }
        self.broadcaster.set_streaming(false);
    }
}

/// Read fixed-size chunks from a process's stdout until EOF.
async fn pump<F>(mut output: ProcessOutput, chunk_bytes: usize, role: ProcessRole, mut forward: F)
where
    F: FnMut(Bytes) + Send + 'static,
{
    let mut buf = vec![0u8; chunk_bytes.max(1)];
    loop {
        match output.read_exact(&mut buf).await {
            Ok(_) => forward(Bytes::copy_from_slice(&buf)),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => {
                warn!("Reading {} output failed: {}", role, e);
                break;
            }
        }
    }
    debug!("{} output closed", role);
}
