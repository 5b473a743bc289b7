//! PID strategy: regulate the smoothed grid power to the profile offset.

use crate::config;
use crate::control::{ControlCommon, DeviceSnapshot, ProfileEntry};
use crate::pid::Pid;
use crate::prelude::*;

pub struct PidStrategy {
    pid: Pid,
    reversal_threshold_w: f64,
    max_delta_w: f64,
    grid_positive: Option<bool>,
}

impl PidStrategy {
    pub fn from_config(cfg: &config::Control) -> Self {
        let t = &cfg.pid;
        let mut pid = Pid::new(
            t.step_s,
            0.0,
            cfg.max_discharge_power_w,
            cfg.max_charge_power_w,
            t.kp,
            t.ki,
            t.kd,
        );
        pid.set_windup_frac(t.windup_frac);
        Self {
            pid,
            reversal_threshold_w: t.reversal_threshold_w,
            max_delta_w: t.max_delta_w,
            grid_positive: None,
        }
    }

    pub fn reset(&mut self) {
        self.pid.reset();
        self.grid_positive = None;
    }

    /// Profile change re-targets the regulator without clearing its
    /// accumulated state.
    pub fn reparameterize(&mut self, entry: &ProfileEntry) {
        self.pid.set_offset(entry.grid_offset_w);
        self.pid.set_limits(entry.max_discharge_w, entry.max_charge_w);
    }

    pub fn compute(
        &mut self,
        common: &ControlCommon,
        now_ms: i64,
        snapshot: &DeviceSnapshot,
    ) -> Option<f64> {
        let avg = common.grid_average(now_ms);

        // A high-magnitude sign flip (a big load switching on or off)
        // invalidates the accumulated history; start over instead of
        // winding the integral back down.
        if avg != 0.0 {
            let positive = avg > 0.0;
            if let Some(prev) = self.grid_positive {
                if prev != positive && avg.abs() >= self.reversal_threshold_w {
                    info!("grid power sign reversal at {:.0} W, regulator reset", avg);
                    self.pid.reset();
                }
            }
            self.grid_positive = Some(positive);
        }

        let out = self.pid.step_at(now_ms, avg);

        // Keep the command within reach of what the battery is actually
        // doing right now.
        let target = out.clamp(
            snapshot.charge_power_w - self.max_delta_w,
            snapshot.charge_power_w + self.max_delta_w,
        );
        Some(target)
    }
}

#[cfg(test)]
mod tests {
    use crate::config;
    use crate::control::{ControlAction, Controller, DeviceSnapshot};

    fn controller(yaml: &str) -> Controller {
        let cfg: config::Control = serde_yaml::from_str(yaml).unwrap();
        Controller::from_config(&cfg).unwrap()
    }

    #[test]
    fn proportional_action_counteracts_import() {
        let mut ctl = controller(
            "{strategy: pid, enabled: true, average_window_ms: 1000, tolerance_w: 0, \
              pid: {kp: 0.5, ki: 0, kd: 0, step_s: 1}}",
        );
        let snap = DeviceSnapshot::default();
        let a = ctl.on_grid_sample(0, 500.0, &snap);
        assert_eq!(a, Some(ControlAction::SetPower(-250.0)));
    }

    #[test]
    fn output_stays_within_delta_of_measured_power() {
        let mut ctl = controller(
            "{strategy: pid, enabled: true, average_window_ms: 1000, tolerance_w: 0, \
              pid: {kp: 4.0, ki: 0, kd: 0, step_s: 1, max_delta_w: 500}}",
        );
        let snap = DeviceSnapshot {
            charge_power_w: -100.0,
            ..Default::default()
        };
        // raw output would be -2000, clamp to measured-500
        let a = ctl.on_grid_sample(0, 500.0, &snap);
        assert_eq!(a, Some(ControlAction::SetPower(-600.0)));
    }

    #[test]
    fn high_magnitude_sign_flip_resets_regulator() {
        let mut ctl = controller(
            "{strategy: pid, enabled: true, average_window_ms: 1000, tolerance_w: 0, \
              pid: {kp: 0.1, ki: 0.2, kd: 0, step_s: 1, reversal_threshold_w: 500}}",
        );
        let snap = DeviceSnapshot::default();
        // build up integral on sustained import
        ctl.on_grid_sample(0, 800.0, &snap);
        ctl.on_grid_sample(1000, 800.0, &snap);
        ctl.on_grid_sample(2000, 800.0, &snap);

        // big export flip: integral history must not bleed through
        let a = ctl.on_grid_sample(3000, -800.0, &snap);
        // fresh regulator: P = 0.1*800 = 80, I = 0.2*800*1 = 160
        assert_eq!(a, Some(ControlAction::SetPower(240.0)));
    }

    #[test]
    fn low_magnitude_sign_flip_keeps_state() {
        let mut ctl = controller(
            "{strategy: pid, enabled: true, average_window_ms: 1000, tolerance_w: 0, \
              pid: {kp: 0.5, ki: 0.2, kd: 0, step_s: 1, reversal_threshold_w: 500}}",
        );
        let snap = DeviceSnapshot::default();
        ctl.on_grid_sample(0, 100.0, &snap);
        // -50 flip is below the threshold, integral keeps accumulating
        let a = ctl.on_grid_sample(1000, -50.0, &snap);
        // err(-50 sample): avg window only sees newest sample = -50
        // P = 0.5*50 = 25, I = 0.2*(-100*1 + 50*1) = -10
        assert_eq!(a, Some(ControlAction::SetPower(15.0)));
    }
}
