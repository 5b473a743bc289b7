//! Charge control strategies.
//!
//! A [`Controller`] wraps one strategy variant behind a common policy
//! layer: grid sample bookkeeping, hourly profile clamps, discharge
//! blocking and setpoint deduplication. Strategies only compute a raw
//! target power; everything that makes the target safe to send lives
//! here.

pub mod pid_ctrl;
pub mod simple;
pub mod winter;

use crate::config;
use crate::prelude::*;
use crate::series::TimeSeries;

use pid_ctrl::PidStrategy;
use simple::SimpleStrategy;
use winter::WinterStrategy;

/// What the device orchestrator should do after a control step.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ControlAction {
    /// Command a new charge (positive) or discharge (negative) power.
    SetPower(f64),
    /// Fall back to the idle-safe setpoint.
    Idle,
}

/// Device readings a strategy may consult. Refreshed by the orchestrator
/// on its telemetry cadence; `None` until first successfully read.
#[derive(Clone, Copy, Debug, Default)]
pub struct DeviceSnapshot {
    pub charge_power_w: f64,
    pub temperature_c: Option<f64>,
    pub capacity_pc: Option<f64>,
}

// hourly profile {{{
#[derive(Clone, Copy, Debug)]
pub struct ProfileEntry {
    pub max_charge_w: f64,
    pub max_discharge_w: f64,
    pub grid_offset_w: f64,
}

/// 24 entries selected by wall-clock hour. An empty config profile
/// yields a flat schedule from the global power envelope.
#[derive(Clone, Debug)]
pub struct HourlyProfile {
    entries: Vec<ProfileEntry>,
}

impl HourlyProfile {
    pub fn from_config(cfg: &config::Control) -> Self {
        let entries = if cfg.profile.is_empty() {
            vec![
                ProfileEntry {
                    max_charge_w: cfg.max_charge_power_w,
                    max_discharge_w: cfg.max_discharge_power_w,
                    grid_offset_w: 0.0,
                };
                24
            ]
        } else {
            cfg.profile
                .iter()
                .map(|row| ProfileEntry {
                    max_charge_w: row.max_charge_w,
                    max_discharge_w: row.max_discharge_w,
                    grid_offset_w: row.grid_offset_w,
                })
                .collect()
        };
        Self { entries }
    }

    pub fn entry(&self, hour: u32) -> ProfileEntry {
        self.entries[hour as usize % 24]
    }
}
// }}}

// common policy state {{{
pub struct ControlCommon {
    enabled: bool,
    grid: TimeSeries,
    average_window_ms: i64,
    last_sample_ms: Option<i64>,
    grid_timeout_ms: i64,
    stale_handled: bool,
    profile: HourlyProfile,
    hour: u32,
    block_start: u32,
    block_stop: u32,
    block_tmo_ms: i64,
    last_charge_cmd_ms: Option<i64>,
    tolerance_w: f64,
    last_target_w: Option<f64>,
    max_charge_power_w: f64,
    max_discharge_power_w: f64,
}

impl ControlCommon {
    pub fn from_config(cfg: &config::Control) -> Self {
        Self {
            enabled: cfg.enabled,
            grid: TimeSeries::new(cfg.average_window_ms * 4, 4096),
            average_window_ms: cfg.average_window_ms,
            last_sample_ms: None,
            grid_timeout_ms: cfg.grid_timeout_s * 1000,
            stale_handled: false,
            profile: HourlyProfile::from_config(cfg),
            hour: 0,
            block_start: cfg.discharge_block_start,
            block_stop: cfg.discharge_block_stop,
            block_tmo_ms: cfg.discharge_block_tmo_s * 1000,
            last_charge_cmd_ms: None,
            tolerance_w: cfg.tolerance_w,
            last_target_w: None,
            max_charge_power_w: cfg.max_charge_power_w,
            max_discharge_power_w: cfg.max_discharge_power_w,
        }
    }

    pub fn record_sample(&mut self, now_ms: i64, watts: f64) {
        self.grid.push_at(now_ms, watts);
        self.last_sample_ms = Some(now_ms);
        self.stale_handled = false;
    }

    pub fn grid_average(&self, now_ms: i64) -> f64 {
        self.grid.average_at(now_ms, self.average_window_ms, 0.0)
    }

    fn grid_stale(&self, now_ms: i64) -> bool {
        match self.last_sample_ms {
            Some(ts) => now_ms - ts > self.grid_timeout_ms,
            None => false,
        }
    }

    pub fn set_hour(&mut self, hour: u32) {
        self.hour = hour % 24;
    }

    pub fn profile_entry(&self) -> ProfileEntry {
        self.profile.entry(self.hour)
    }

    /// Discharge block interval is half-open [start, stop) and may wrap
    /// around midnight. Equal bounds disable the window.
    fn hour_blocked(&self) -> bool {
        if self.block_start == self.block_stop {
            false
        } else if self.block_start < self.block_stop {
            self.hour >= self.block_start && self.hour < self.block_stop
        } else {
            self.hour >= self.block_start || self.hour < self.block_stop
        }
    }

    /// Suppress discharge inside the block interval or within the
    /// cooldown after the last charging command; record charging
    /// commands for that cooldown.
    pub fn apply_blocking(&mut self, now_ms: i64, power_w: f64) -> f64 {
        if power_w > 0.0 {
            self.last_charge_cmd_ms = Some(now_ms);
            return power_w;
        }
        if power_w < 0.0 {
            if self.hour_blocked() {
                debug!("discharge blocked by hour schedule ({} W)", power_w);
                return 0.0;
            }
            if let Some(ts) = self.last_charge_cmd_ms {
                if now_ms - ts < self.block_tmo_ms {
                    debug!("discharge blocked by charge cooldown ({} W)", power_w);
                    return 0.0;
                }
            }
        }
        power_w
    }

    /// Clamp to the global envelope and the active hourly profile.
    pub fn clamp_power(&self, power_w: f64) -> f64 {
        let entry = self.profile_entry();
        power_w
            .clamp(self.max_discharge_power_w, self.max_charge_power_w)
            .clamp(entry.max_discharge_w, entry.max_charge_w)
    }

    /// Drop targets within the tolerance band of the last published one.
    pub fn dedupe(&mut self, target_w: f64) -> Option<f64> {
        if let Some(last) = self.last_target_w {
            if (target_w - last).abs() <= self.tolerance_w {
                return None;
            }
        }
        self.last_target_w = Some(target_w);
        Some(target_w)
    }

    pub fn forget_target(&mut self) {
        self.last_target_w = None;
    }
}
// }}}

enum StrategyKind {
    Disabled,
    Simple(SimpleStrategy),
    Pid(PidStrategy),
    Winter(WinterStrategy),
}

pub struct Controller {
    common: ControlCommon,
    kind: StrategyKind,
}

impl Controller {
    pub fn from_config(cfg: &config::Control) -> Result<Self> {
        let kind = match cfg.strategy.as_str() {
            "disabled" => StrategyKind::Disabled,
            "simple" => StrategyKind::Simple(SimpleStrategy::from_config(cfg)),
            "pid" => StrategyKind::Pid(PidStrategy::from_config(cfg)),
            "winter" => StrategyKind::Winter(WinterStrategy::from_config(cfg)),
            other => bail!("unknown control strategy '{}'", other),
        };
        Ok(Self {
            common: ControlCommon::from_config(cfg),
            kind,
        })
    }

    pub fn name(&self) -> &'static str {
        match self.kind {
            StrategyKind::Disabled => "disabled",
            StrategyKind::Simple(_) => "simple",
            StrategyKind::Pid(_) => "pid",
            StrategyKind::Winter(_) => "winter",
        }
    }

    pub fn enabled(&self) -> bool {
        self.common.enabled && !matches!(self.kind, StrategyKind::Disabled)
    }

    /// Disabling always clears strategy state, so a later re-enable
    /// starts from scratch instead of stale history.
    pub fn set_enabled(&mut self, on: bool) {
        self.common.enabled = on;
        self.common.forget_target();
        match &mut self.kind {
            StrategyKind::Pid(pid) => pid.reset(),
            StrategyKind::Winter(win) => win.reset(),
            _ => {}
        }
    }

    /// The last emitted target never reached the device; clear the
    /// dedupe state so the next computation re-sends it.
    pub fn forget_target(&mut self) {
        self.common.forget_target();
    }

    /// New grid-power sample. Always recorded; recomputes the target
    /// when the strategy is sample-driven and enabled.
    pub fn on_grid_sample(
        &mut self,
        now_ms: i64,
        watts: f64,
        snapshot: &DeviceSnapshot,
    ) -> Option<ControlAction> {
        self.common.record_sample(now_ms, watts);
        if !self.enabled() {
            return None;
        }

        let raw = match &mut self.kind {
            StrategyKind::Simple(s) => s.compute(&self.common, now_ms, snapshot),
            StrategyKind::Pid(p) => p.compute(&self.common, now_ms, snapshot),
            _ => return None,
        }?;

        let clamped = self.common.clamp_power(raw);
        let blocked = self.common.apply_blocking(now_ms, clamped);
        self.common.dedupe(blocked).map(ControlAction::SetPower)
    }

    /// Periodic step, expected at 1 Hz. Handles grid staleness for the
    /// sample-driven strategies and drives the winter state machine.
    pub fn on_tick(&mut self, now_ms: i64, snapshot: &DeviceSnapshot) -> Option<ControlAction> {
        if !self.enabled() {
            return None;
        }

        if let StrategyKind::Winter(win) = &mut self.kind {
            let raw = win.step(now_ms, snapshot)?;
            let clamped = self.common.clamp_power(raw);
            let blocked = self.common.apply_blocking(now_ms, clamped);
            return self.common.dedupe(blocked).map(ControlAction::SetPower);
        }

        if self.common.grid_stale(now_ms) && !self.common.stale_handled {
            warn!(
                "no grid power sample for {} s, going idle",
                self.common.grid_timeout_ms / 1000
            );
            self.common.stale_handled = true;
            self.common.forget_target();
            if let StrategyKind::Pid(pid) = &mut self.kind {
                pid.reset();
            }
            return Some(ControlAction::Idle);
        }
        None
    }

    /// Hour transition: re-select the profile entry and re-parameterize
    /// the active strategy atomically.
    pub fn on_hour(&mut self, hour: u32) {
        self.common.set_hour(hour);
        let entry = self.common.profile_entry();
        if let StrategyKind::Pid(pid) = &mut self.kind {
            pid.reparameterize(&entry);
        }
    }

    pub fn grid_average(&self, now_ms: i64) -> f64 {
        self.common.grid_average(now_ms)
    }
}
