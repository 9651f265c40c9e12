//! Capture session state machine.
//!
//! Idle -> Starting -> Running -> Stopping -> Idle, with Running/Starting ->
//! Crashed when the capture process dies and Crashed -> Starting (restart) or
//! Crashed -> Idle (budget exhausted). Every move goes through
//! [`SessionState::apply`]; anything not listed there is rejected.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Starting { attempt: usize },
    Running { since: DateTime<Utc> },
    Stopping,
    Crashed { reason: String, attempt: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Explicit start request
    Start,
    /// Capture process survived its startup grace period
    Ready { at: DateTime<Utc> },
    /// Explicit stop request
    Stop,
    /// Every process is gone and the pipes are removed
    Stopped,
    /// Capture process exited without being asked to
    CaptureExited { reason: String, attempt: usize },
    /// Backoff elapsed after a crash
    Restart,
    /// Restart budget spent
    GiveUp,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("session is already active ({0:?})")]
    AlreadyActive(SessionState),

    #[error("invalid transition {transition:?} from {from:?}")]
    Invalid {
        from: SessionState,
        transition: Transition,
    },
}

impl SessionState {
    /// Starting or Running: the device is held.
    pub fn is_active(&self) -> bool {
        matches!(self, SessionState::Starting { .. } | SessionState::Running { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Starting { .. } => "starting",
            SessionState::Running { .. } => "running",
            SessionState::Stopping => "stopping",
            SessionState::Crashed { .. } => "crashed",
        }
    }

    pub fn apply(self, transition: Transition) -> Result<SessionState, TransitionError> {
        use SessionState as S;
        use Transition as T;

        match (self, transition) {
            (S::Idle, T::Start) => Ok(S::Starting { attempt: 0 }),
            (S::Crashed { .. }, T::Start) => Ok(S::Starting { attempt: 0 }),
            (s @ S::Starting { .. }, T::Start)
            | (s @ S::Running { .. }, T::Start)
            | (s @ S::Stopping, T::Start) => Err(TransitionError::AlreadyActive(s)),

            (S::Starting { .. }, T::Ready { at }) => Ok(S::Running { since: at }),

            (S::Starting { .. }, T::Stop) | (S::Running { .. }, T::Stop) => Ok(S::Stopping),
            (S::Crashed { .. }, T::Stop) => Ok(S::Idle),
            (S::Stopping, T::Stopped) => Ok(S::Idle),

            (S::Starting { .. }, T::CaptureExited { reason, attempt })
            | (S::Running { .. }, T::CaptureExited { reason, attempt }) => {
                Ok(S::Crashed { reason, attempt })
            }

            (S::Crashed { attempt, .. }, T::Restart) => Ok(S::Starting { attempt }),
            (S::Crashed { .. }, T::GiveUp) => Ok(S::Idle),

            (from, transition) => Err(TransitionError::Invalid { from, transition }),
        }
    }
}

/// What to do after a process died.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    Retry { attempt: usize },
    Exhausted,
}

/// Counts restarts inside a sliding time window.
#[derive(Debug, Clone)]
pub struct RestartTracker {
    window: Duration,
    max_restarts: usize,
    history: VecDeque<Instant>,
}

impl RestartTracker {
    pub fn new(max_restarts: usize, window: Duration) -> Self {
        Self {
            window,
            max_restarts,
            history: VecDeque::new(),
        }
    }

    /// Record a failure at `now` and decide whether another restart fits in
    /// the window.
    pub fn record(&mut self, now: Instant) -> RestartDecision {
        while let Some(oldest) = self.history.front() {
            if now.duration_since(*oldest) > self.window {
                self.history.pop_front();
            } else {
                break;
            }
        }

        if self.history.len() >= self.max_restarts {
            return RestartDecision::Exhausted;
        }

        self.history.push_back(now);
        RestartDecision::Retry {
            attempt: self.history.len(),
        }
    }

    pub fn restarts_in_window(&self) -> usize {
        self.history.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let state = SessionState::Idle
            .apply(Transition::Start)
            .and_then(|s| s.apply(Transition::Ready { at: Utc::now() }))
            .and_then(|s| s.apply(Transition::Stop))
            .and_then(|s| s.apply(Transition::Stopped))
            .unwrap();

        assert_eq!(state, SessionState::Idle);
    }

    #[test]
    fn test_second_start_is_rejected() {
        let running = SessionState::Running { since: Utc::now() };
        let err = running.clone().apply(Transition::Start).unwrap_err();
        assert_eq!(err, TransitionError::AlreadyActive(running));

        let starting = SessionState::Starting { attempt: 0 };
        assert!(matches!(
            starting.apply(Transition::Start),
            Err(TransitionError::AlreadyActive(_))
        ));
    }

    #[test]
    fn test_crash_then_restart_keeps_attempt() {
        let crashed = SessionState::Running { since: Utc::now() }
            .apply(Transition::CaptureExited {
                reason: "exit status 1".to_string(),
                attempt: 2,
            })
            .unwrap();

        assert_eq!(crashed.name(), "crashed");
        assert_eq!(
            crashed.apply(Transition::Restart).unwrap(),
            SessionState::Starting { attempt: 2 }
        );
    }

    #[test]
    fn test_crashed_never_sticks() {
        let crashed = SessionState::Crashed {
            reason: "gone".to_string(),
            attempt: 3,
        };
        assert_eq!(crashed.apply(Transition::GiveUp).unwrap(), SessionState::Idle);
    }

    #[test]
    fn test_idle_rejects_ready() {
        assert!(matches!(
            SessionState::Idle.apply(Transition::Ready { at: Utc::now() }),
            Err(TransitionError::Invalid { .. })
        ));
    }

    #[test]
    fn test_restart_window_slides() {
        let start = Instant::now();
        let mut tracker = RestartTracker::new(2, Duration::from_secs(10));

        assert_eq!(tracker.record(start), RestartDecision::Retry { attempt: 1 });
        assert_eq!(
            tracker.record(start + Duration::from_secs(1)),
            RestartDecision::Retry { attempt: 2 }
        );
        assert_eq!(
            tracker.record(start + Duration::from_secs(2)),
            RestartDecision::Exhausted
        );

        // The first failure has left the window
        assert_eq!(
            tracker.record(start + Duration::from_secs(11)),
            RestartDecision::Retry { attempt: 2 }
        );
    }
}
