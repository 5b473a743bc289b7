//! Tick phase bookkeeping for the control loop.
//!
//! The loop runs on a fast fixed tick and derives its slower cadences
//! (1 s, 6 s, 1 min) from accumulated milliseconds. The hour transition
//! is re-derived from the wall clock instead of counted, so the hourly
//! profile never drifts.

use chrono::{Local, Timelike};

pub const TICK_MS: u64 = 20;

/// What is due on this tick.
#[derive(Clone, Copy, Debug, Default)]
pub struct Phases {
    pub now_ms: i64,
    pub one_s: bool,
    pub six_s: bool,
    pub one_min: bool,
    pub hour_changed: bool,
    pub hour: u32,
}

pub struct TickContext {
    acc_1s_ms: i64,
    acc_6s_ms: i64,
    acc_1min_ms: i64,
    last_hour: Option<u32>,
}

impl TickContext {
    pub fn new() -> Self {
        Self {
            acc_1s_ms: 0,
            acc_6s_ms: 0,
            acc_1min_ms: 0,
            last_hour: None,
        }
    }

    pub fn advance(&mut self, dt_ms: i64) -> Phases {
        let now = Local::now();
        self.advance_at(dt_ms, now.timestamp_millis(), now.hour())
    }

    /// `dt_ms` since the previous call; `hour` is the wall-clock hour.
    pub fn advance_at(&mut self, dt_ms: i64, now_ms: i64, hour: u32) -> Phases {
        self.acc_1s_ms += dt_ms;
        self.acc_6s_ms += dt_ms;
        self.acc_1min_ms += dt_ms;

        let mut phases = Phases {
            now_ms,
            hour,
            ..Default::default()
        };

        if self.acc_1s_ms >= 1000 {
            self.acc_1s_ms -= 1000;
            phases.one_s = true;
        }
        if self.acc_6s_ms >= 6000 {
            self.acc_6s_ms -= 6000;
            phases.six_s = true;
        }
        if self.acc_1min_ms >= 60_000 {
            self.acc_1min_ms -= 60_000;
            phases.one_min = true;
        }

        // first call reports the hour as changed so the profile entry is
        // selected before any control step runs
        if self.last_hour != Some(hour) {
            self.last_hour = Some(hour);
            phases.hour_changed = true;
        }

        phases
    }
}

impl Default for TickContext {
    fn default() -> Self {
        Self::new()
    }
}
