//! Tick sources and the clock run-state gate.
//!
//! Ticks are the only driver of time accounting. A [`Clock`] decides whether
//! an incoming tick is delivered; tick streams produce them, either from a
//! tokio interval or on demand.

use std::time::Duration;

use futures::stream::{self, BoxStream, StreamExt};
use tokio::time::{self, Instant, MissedTickBehavior};

/// One clock event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// An ordinary one-second tick.
    Second,
    /// A tick that arrived after a wall-clock gap (suspended tab, sleep).
    /// Counts as one second; the gap itself is never credited.
    Drift { gap_secs: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockState {
    Idle,
    Running,
    Paused,
    Stopped,
}

/// Run-state gate in front of the tick source.
#[derive(Debug, Clone)]
pub struct Clock {
    state: ClockState,
    delivered: u64,
    dropped: u64,
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock {
    pub fn new() -> Self {
        Self {
            state: ClockState::Idle,
            delivered: 0,
            dropped: 0,
        }
    }

    pub fn state(&self) -> ClockState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == ClockState::Running
    }

    /// Starts an idle clock. Has no effect once stopped.
    pub fn start(&mut self) {
        if self.state == ClockState::Idle {
            self.state = ClockState::Running;
        }
    }

    /// Idempotent.
    pub fn pause(&mut self) {
        if self.state == ClockState::Running {
            self.state = ClockState::Paused;
        }
    }

    pub fn resume(&mut self) {
        if self.state == ClockState::Paused {
            self.state = ClockState::Running;
        }
    }

    /// Final. A stopped clock never delivers another tick.
    pub fn stop(&mut self) {
        self.state = ClockState::Stopped;
    }

    /// Returns `true` if the tick should be delivered; ticks arriving while
    /// not running are dropped.
    pub fn admit(&mut self) -> bool {
        if self.is_running() {
            self.delivered += 1;
            true
        } else {
            self.dropped += 1;
            false
        }
    }

    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// A tokio-interval backed tick stream.
///
/// A gap between consecutive ticks larger than `drift_threshold` yields
/// [`Tick::Drift`] instead of [`Tick::Second`]. Missed interval ticks are
/// skipped, not replayed.
pub fn interval_ticks(period: Duration, drift_threshold: Duration) -> BoxStream<'static, Tick> {
    let mut interval = time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    stream::unfold(
        (interval, None::<Instant>),
        move |(mut interval, last)| async move {
            interval.tick().await;
            let now = Instant::now();
            let tick = match last {
                Some(prev) if now.duration_since(prev) > drift_threshold => Tick::Drift {
                    gap_secs: now.duration_since(prev).as_secs(),
                },
                _ => Tick::Second,
            };
            Some((tick, (interval, Some(now))))
        },
    )
    .boxed()
}

/// A finite stream of `count` ordinary ticks, for tests and scripted replay.
pub fn manual_ticks(count: usize) -> BoxStream<'static, Tick> {
    stream::iter(std::iter::repeat(Tick::Second).take(count)).boxed()
}
