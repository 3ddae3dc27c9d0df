//! Per-section countdown.

/// What a timer reports after a tick or a start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerSignal {
    Running,
    /// The countdown reached zero. Reported exactly once per timer.
    Expired,
    /// The tick was not counted (timer paused, stopped, or already expired).
    Ignored,
}

/// One section's remaining-time countdown.
///
/// Remaining time is always `duration - used`, floored at zero; `used` only
/// grows through [`SectionTimer::tick`].
#[derive(Debug, Clone)]
pub struct SectionTimer {
    duration_seconds: u64,
    used_seconds: u64,
    running: bool,
    stopped: bool,
    expired_fired: bool,
}

impl SectionTimer {
    /// `already_used_seconds` is the section's summed question time, so a
    /// resumed section picks up where it left off.
    pub fn new(duration_seconds: u64, already_used_seconds: u64) -> Self {
        Self {
            duration_seconds,
            used_seconds: already_used_seconds,
            running: false,
            stopped: false,
            expired_fired: false,
        }
    }

    pub fn duration_seconds(&self) -> u64 {
        self.duration_seconds
    }

    pub fn used_seconds(&self) -> u64 {
        self.used_seconds
    }

    pub fn remaining_seconds(&self) -> u64 {
        self.duration_seconds.saturating_sub(self.used_seconds)
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Starts the countdown. A timer with nothing left expires immediately.
    pub fn start(&mut self) -> TimerSignal {
        if self.stopped || self.expired_fired {
            return TimerSignal::Ignored;
        }
        self.running = true;
        self.check_expiry()
    }

    pub fn pause(&mut self) {
        self.running = false;
    }

    pub fn resume(&mut self) {
        if !self.stopped && !self.expired_fired {
            self.running = true;
        }
    }

    /// Flips running/paused. Returns the new running state.
    pub fn toggle(&mut self) -> bool {
        if self.running {
            self.pause();
        } else {
            self.resume();
        }
        self.running
    }

    pub fn stop(&mut self) {
        self.running = false;
        self.stopped = true;
    }

    /// Count one second against the section.
    pub fn tick(&mut self) -> TimerSignal {
        if !self.running || self.expired_fired {
            return TimerSignal::Ignored;
        }
        self.used_seconds += 1;
        self.check_expiry()
    }

    /// Re-derive `used` from the section's question times after clock drift.
    pub fn reconcile(&mut self, used_seconds: u64) {
        self.used_seconds = used_seconds;
    }

    fn check_expiry(&mut self) -> TimerSignal {
        if self.remaining_seconds() == 0 && !self.expired_fired {
            self.expired_fired = true;
            self.running = false;
            TimerSignal::Expired
        } else if self.expired_fired {
            TimerSignal::Ignored
        } else {
            TimerSignal::Running
        }
    }
}
