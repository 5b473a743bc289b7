//! Proportional gain strategy: drive the smoothed grid power toward the
//! profile offset by shifting the present charge power.

use crate::config;
use crate::control::{ControlCommon, DeviceSnapshot};

pub struct SimpleStrategy {
    gain: f64,
}

impl SimpleStrategy {
    pub fn from_config(cfg: &config::Control) -> Self {
        Self { gain: cfg.gain }
    }

    /// new = measured − gain × (grid_avg − offset), rounded to 10 W.
    /// Positive grid power is import, so importing pushes the battery
    /// toward discharge and exporting toward charge.
    pub fn compute(
        &self,
        common: &ControlCommon,
        now_ms: i64,
        snapshot: &DeviceSnapshot,
    ) -> Option<f64> {
        let avg = common.grid_average(now_ms);
        let offset = common.profile_entry().grid_offset_w;
        let target = snapshot.charge_power_w - self.gain * (avg - offset);
        Some((target / 10.0).round() * 10.0)
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
    fn import_commands_discharge_then_export_flips_to_charge() {
        // +500 W import at 1 Hz with gain 0.5 and charge power 0 must
        // first command -250 W, then +150 W once the feed turns to
        // -300 W export and the old samples age out of the window.
        let mut ctl = controller(
            "{strategy: simple, enabled: true, gain: 0.5, \
              average_window_ms: 1000, tolerance_w: 25}",
        );
        let snap = DeviceSnapshot::default();

        let a0 = ctl.on_grid_sample(0, 500.0, &snap);
        let a1 = ctl.on_grid_sample(1000, 500.0, &snap);
        assert_eq!(a0, Some(ControlAction::SetPower(-250.0)));
        assert_eq!(a1, None); // unchanged, within tolerance

        let a2 = ctl.on_grid_sample(2000, -300.0, &snap);
        assert_eq!(a2, Some(ControlAction::SetPower(150.0)));
        assert_eq!(ctl.on_grid_sample(3000, -300.0, &snap), None);
    }

    #[test]
    fn output_is_rounded_to_ten_watts() {
        let mut ctl = controller(
            "{strategy: simple, enabled: true, gain: 0.5, \
              average_window_ms: 1000, tolerance_w: 0}",
        );
        let snap = DeviceSnapshot::default();
        let a = ctl.on_grid_sample(0, 123.0, &snap);
        // -61.5 rounds to -60
        assert_eq!(a, Some(ControlAction::SetPower(-60.0)));
    }

    #[test]
    fn target_clamped_to_envelope() {
        let mut ctl = controller(
            "{strategy: simple, enabled: true, gain: 1.0, \
              average_window_ms: 1000, tolerance_w: 0, \
              max_charge_power_w: 400, max_discharge_power_w: -400}",
        );
        let snap = DeviceSnapshot::default();
        let a = ctl.on_grid_sample(0, 5000.0, &snap);
        assert_eq!(a, Some(ControlAction::SetPower(-400.0)));
    }

    #[test]
    fn profile_offset_shifts_the_setpoint() {
        // aiming for 100 W import instead of 0
        let mut profile = String::from("[");
        for _ in 0..24 {
            profile.push_str("{max_charge_w: 2200, max_discharge_w: -2200, grid_offset_w: 100},");
        }
        profile.push(']');
        let yaml = format!(
            "{{strategy: simple, enabled: true, gain: 0.5, \
              average_window_ms: 1000, tolerance_w: 0, profile: {}}}",
            profile
        );
        let mut ctl = controller(&yaml);
        let snap = DeviceSnapshot::default();
        // grid already on target, nothing to move
        let a = ctl.on_grid_sample(0, 100.0, &snap);
        assert_eq!(a, Some(ControlAction::SetPower(0.0)));
    }

    #[test]
    fn blocked_discharge_goes_to_zero() {
        let mut ctl = controller(
            "{strategy: simple, enabled: true, gain: 0.5, \
              average_window_ms: 1000, tolerance_w: 0, \
              discharge_block_start: 0, discharge_block_stop: 23}",
        );
        ctl.on_hour(12);
        let snap = DeviceSnapshot::default();
        let a = ctl.on_grid_sample(0, 500.0, &snap);
        assert_eq!(a, Some(ControlAction::SetPower(0.0)));
    }
}
