//! Gap-free scheduling of decoded segments on the audio clock.
//!
//! A single cursor marks where the next segment starts. Each segment is
//! placed at `max(now, cursor)` and the cursor advances by its duration, so
//! bursty delivery never produces overlaps or backward jumps and nothing is
//! ever scheduled in the past.

use super::clock::AudioClock;
use crate::config::PlaybackConfig;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledSegment {
    pub start: Duration,
    pub duration: Duration,
}

impl ScheduledSegment {
    pub fn end(&self) -> Duration {
        self.start + self.duration
    }
}

/// Outcome of an explicit jump back to the live point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GoLive {
    /// Audio clock reading when the jump happened
    pub at: Duration,
    pub previous_cursor: Duration,
    pub cursor: Duration,
    /// Segments that were scheduled but had not started playing
    pub discarded: usize,
}

pub struct PlaybackScheduler {
    clock: Arc<dyn AudioClock>,
    initial_delay: Duration,
    max_latency: Duration,
    cursor: Duration,
    queued: VecDeque<ScheduledSegment>,
    underruns: u64,
}

impl PlaybackScheduler {
    pub fn new(clock: Arc<dyn AudioClock>, initial_delay: Duration, max_latency: Duration) -> Self {
        let cursor = clock.now() + initial_delay;
        Self {
            clock,
            initial_delay,
            max_latency,
            cursor,
            queued: VecDeque::new(),
            underruns: 0,
        }
    }

    pub fn from_config(clock: Arc<dyn AudioClock>, config: &PlaybackConfig) -> Self {
        Self::new(
            clock,
            Duration::from_millis(config.target_initial_delay_ms),
            Duration::from_millis(config.max_latency_ms),
        )
    }

    pub fn now(&self) -> Duration {
        self.clock.now()
    }

    /// Where the next segment will start, unless the clock has passed it.
    pub fn cursor(&self) -> Duration {
        self.cursor
    }

    /// Place a segment of `duration` on the timeline.
    pub fn schedule(&mut self, duration: Duration) -> ScheduledSegment {
        let now = self.clock.now();
        self.prune(now);

        let start = now.max(self.cursor);
        let slot = ScheduledSegment { start, duration };
        self.cursor = slot.end();
        self.queued.push_back(slot);
        slot
    }

    /// Amount of audio scheduled ahead of the clock.
    pub fn latency(&self) -> Duration {
        self.cursor.saturating_sub(self.clock.now())
    }

    /// Listener has drifted further behind live than the configured ceiling.
    pub fn is_overflowing(&self) -> bool {
        self.latency() > self.max_latency
    }

    /// Nothing left to play: everything scheduled has already ended.
    pub fn is_starved(&self) -> bool {
        self.cursor <= self.clock.now()
    }

    /// Count an underrun. Called by the owner when playback runs dry.
    pub fn record_underrun(&mut self) -> u64 {
        self.underruns += 1;
        self.underruns
    }

    pub fn underruns(&self) -> u64 {
        self.underruns
    }

    /// Segments scheduled but not yet started.
    pub fn pending(&mut self) -> usize {
        let now = self.clock.now();
        self.prune(now);
        self.queued.iter().filter(|s| s.start > now).count()
    }

    /// Jump to the live point: drop everything not yet playing and restart
    /// the cursor one initial delay ahead of now.
    pub fn go_live(&mut self) -> GoLive {
        let at = self.clock.now();
        let discarded = self.queued.iter().filter(|s| s.start > at).count();
        let previous_cursor = self.cursor;

        self.queued.clear();
        self.cursor = at + self.initial_delay;

        GoLive {
            at,
            previous_cursor,
            cursor: self.cursor,
            discarded,
        }
    }

    /// Forget all timeline state, as for a fresh connection.
    pub fn reset(&mut self) {
        self.queued.clear();
        self.cursor = self.clock.now() + self.initial_delay;
    }

    fn prune(&mut self, now: Duration) {
        while self.queued.front().is_some_and(|s| s.end() <= now) {
            self.queued.pop_front();
        }
    }
}
