//! Capacity-preservation state machine for the cold season: keep the
//! battery inside a configured state-of-charge band at low fixed power,
//! ignoring the grid feed entirely.

use crate::config;
use crate::control::DeviceSnapshot;
use crate::prelude::*;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WinterState {
    Init,
    CheckDelay,
    Charge,
    Discharge,
    Stopped,
}

pub struct WinterStrategy {
    tuning: config::WinterTuning,
    state: WinterState,
    wait_until_ms: i64,
}

impl WinterStrategy {
    pub fn from_config(cfg: &config::Control) -> Self {
        Self {
            tuning: cfg.winter,
            state: WinterState::Init,
            wait_until_ms: 0,
        }
    }

    pub fn reset(&mut self) {
        self.state = WinterState::Init;
        self.wait_until_ms = 0;
    }

    pub fn state(&self) -> WinterState {
        self.state
    }

    fn enter(&mut self, now_ms: i64, state: WinterState, delay_s: i64) {
        debug!("winter: {:?} -> {:?}", self.state, state);
        self.state = state;
        self.wait_until_ms = now_ms + delay_s * 1000;
    }

    /// One step at tick cadence. Emits a power command on state change
    /// only; `None` means keep whatever was commanded before.
    pub fn step(&mut self, now_ms: i64, snapshot: &DeviceSnapshot) -> Option<f64> {
        let t = self.tuning;

        match self.state {
            WinterState::Init => {
                self.enter(now_ms, WinterState::CheckDelay, t.settle_s);
                Some(0.0)
            }

            WinterState::CheckDelay | WinterState::Stopped => {
                if now_ms < self.wait_until_ms {
                    return None;
                }

                // both readings must be present before acting
                let temp = snapshot.temperature_c?;
                let cap = snapshot.capacity_pc?;

                if temp < t.temp_min_c {
                    info!(
                        "winter: battery too cold ({:.1} C), retry in {} s",
                        temp, t.cold_retry_s
                    );
                    self.enter(now_ms, WinterState::CheckDelay, t.cold_retry_s);
                    return Some(0.0);
                }

                if cap < t.capacity_min_pc {
                    info!("winter: capacity {:.0}% below band, charging", cap);
                    self.enter(now_ms, WinterState::Charge, t.settle_s);
                    Some(t.charge_power_w)
                } else if cap > t.capacity_max_pc {
                    info!("winter: capacity {:.0}% above band, discharging", cap);
                    self.enter(now_ms, WinterState::Discharge, t.settle_s);
                    Some(t.discharge_power_w)
                } else {
                    self.enter(now_ms, WinterState::Stopped, t.recheck_s);
                    Some(0.0)
                }
            }

            WinterState::Charge => {
                if now_ms < self.wait_until_ms {
                    return None;
                }
                let cap = snapshot.capacity_pc?;
                // hysteresis: overshoot the lower bound before stopping
                if cap >= t.capacity_min_pc + t.hysteresis_pc {
                    info!("winter: capacity {:.0}% recovered, stopping charge", cap);
                    self.enter(now_ms, WinterState::CheckDelay, t.settle_s);
                    return Some(0.0);
                }
                None
            }

            WinterState::Discharge => {
                if now_ms < self.wait_until_ms {
                    return None;
                }
                let cap = snapshot.capacity_pc?;
                if cap <= t.capacity_max_pc - t.hysteresis_pc {
                    info!("winter: capacity {:.0}% bled off, stopping discharge", cap);
                    self.enter(now_ms, WinterState::CheckDelay, t.settle_s);
                    return Some(0.0);
                }
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strategy(yaml: &str) -> WinterStrategy {
        let cfg: config::Control = serde_yaml::from_str(yaml).unwrap();
        WinterStrategy::from_config(&cfg)
    }

    fn snap(temp: f64, cap: f64) -> DeviceSnapshot {
        DeviceSnapshot {
            charge_power_w: 0.0,
            temperature_c: Some(temp),
            capacity_pc: Some(cap),
        }
    }

    const CFG: &str = "{strategy: winter, enabled: true, winter: {\
        capacity_min_pc: 30, capacity_max_pc: 50, hysteresis_pc: 10, \
        charge_power_w: 300, discharge_power_w: -300, temp_min_c: 5, \
        settle_s: 60, recheck_s: 3600, cold_retry_s: 3600}}";

    #[test]
    fn over_band_discharges_until_hysteresis() {
        let mut w = strategy(CFG);
        let s = snap(15.0, 60.0);

        assert_eq!(w.step(0, &s), Some(0.0)); // Init -> CheckDelay
        assert_eq!(w.state(), WinterState::CheckDelay);
        assert_eq!(w.step(30_000, &s), None); // settle delay pending

        assert_eq!(w.step(61_000, &s), Some(-300.0));
        assert_eq!(w.state(), WinterState::Discharge);

        // 55% is still above max - hysteresis = 40
        assert_eq!(w.step(200_000, &snap(15.0, 55.0)), None);

        assert_eq!(w.step(400_000, &snap(15.0, 40.0)), Some(0.0));
        assert_eq!(w.state(), WinterState::CheckDelay);
    }

    #[test]
    fn under_band_charges_until_hysteresis() {
        let mut w = strategy(CFG);
        w.step(0, &snap(15.0, 20.0));
        assert_eq!(w.step(61_000, &snap(15.0, 20.0)), Some(300.0));
        assert_eq!(w.state(), WinterState::Charge);

        // 35% is below min + hysteresis = 40
        assert_eq!(w.step(200_000, &snap(15.0, 35.0)), None);

        assert_eq!(w.step(400_000, &snap(15.0, 40.0)), Some(0.0));
        assert_eq!(w.state(), WinterState::CheckDelay);
    }

    #[test]
    fn within_band_stops_and_rechecks_later() {
        let mut w = strategy(CFG);
        w.step(0, &snap(15.0, 40.0));
        assert_eq!(w.step(61_000, &snap(15.0, 40.0)), Some(0.0));
        assert_eq!(w.state(), WinterState::Stopped);

        // nothing until the recheck period passes
        assert_eq!(w.step(1_000_000, &snap(15.0, 60.0)), None);
        assert_eq!(w.step(61_000 + 3_600_000, &snap(15.0, 60.0)), Some(-300.0));
        assert_eq!(w.state(), WinterState::Discharge);
    }

    #[test]
    fn too_cold_aborts_and_rearms() {
        let mut w = strategy(CFG);
        w.step(0, &snap(2.0, 60.0));
        assert_eq!(w.step(61_000, &snap(2.0, 60.0)), Some(0.0));
        assert_eq!(w.state(), WinterState::CheckDelay);

        // still cold after the retry delay, re-arms again
        assert_eq!(w.step(61_000 + 3_600_000, &snap(2.0, 60.0)), Some(0.0));
        assert_eq!(w.state(), WinterState::CheckDelay);

        // warmed up: the cycle proceeds
        assert_eq!(
            w.step(61_000 + 2 * 3_600_000, &snap(15.0, 60.0)),
            Some(-300.0)
        );
    }

    #[test]
    fn missing_telemetry_holds_the_machine() {
        let mut w = strategy(CFG);
        w.step(0, &snap(15.0, 60.0));
        let blind = DeviceSnapshot::default();
        assert_eq!(w.step(61_000, &blind), None);
        assert_eq!(w.state(), WinterState::CheckDelay);
    }
}
