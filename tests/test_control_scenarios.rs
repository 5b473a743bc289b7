mod common;
use common::*;

use bic2mqtt::control::{ControlAction, Controller, DeviceSnapshot};
use bic2mqtt::prelude::*;

#[test]
fn simple_strategy_tracks_grid_sign_changes() {
    // grid stream +500, +500, -300, -300 W at 1 Hz, gain 0.5, battery
    // idle: first -250 W discharge, then +150 W charge after the flip
    let config = test_config();
    let mut controller = Controller::from_config(&config.control).unwrap();
    let battery_idle = DeviceSnapshot::default();

    let first = controller.on_grid_sample(0, 500.0, &battery_idle);
    assert_eq!(first, Some(ControlAction::SetPower(-250.0)));

    // same average, within tolerance: no new command
    assert_eq!(controller.on_grid_sample(1000, 500.0, &battery_idle), None);

    let flipped = controller.on_grid_sample(2000, -300.0, &battery_idle);
    assert_eq!(flipped, Some(ControlAction::SetPower(150.0)));
}

#[test]
fn winter_strategy_bleeds_down_to_the_band() {
    // battery at 60 %, band 30..50 with 10 points hysteresis: discharge
    // until 40 %, then back to the check state commanding 0 W
    let yaml = "
strategy: winter
enabled: true
winter:
  capacity_min_pc: 30
  capacity_max_pc: 50
  hysteresis_pc: 10
  charge_power_w: 300
  discharge_power_w: -300
  temp_min_c: 5
  settle_s: 1
  recheck_s: 3600
  cold_retry_s: 3600
";
    let control: config::Control = serde_yaml::from_str(yaml).unwrap();
    let mut controller = Controller::from_config(&control).unwrap();

    let warm = |cap: f64| DeviceSnapshot {
        charge_power_w: 0.0,
        temperature_c: Some(12.0),
        capacity_pc: Some(cap),
    };

    // Init -> CheckDelay parks the setpoint at zero
    assert_eq!(
        controller.on_tick(0, &warm(60.0)),
        Some(ControlAction::SetPower(0.0))
    );

    // after the settle delay the band check commands the discharge
    assert_eq!(
        controller.on_tick(2000, &warm(60.0)),
        Some(ControlAction::SetPower(-300.0))
    );

    // still above max - hysteresis, keep going
    assert_eq!(controller.on_tick(10_000, &warm(45.0)), None);

    // at 40 % the machine stops and re-enters the check state
    assert_eq!(
        controller.on_tick(20_000, &warm(40.0)),
        Some(ControlAction::SetPower(0.0))
    );

    // the following check finds the capacity within the band and parks
    assert_eq!(controller.on_tick(22_000, &warm(40.0)), None);
}

#[test]
fn grid_silence_forces_idle() {
    let config = test_config();
    let mut controller = Controller::from_config(&config.control).unwrap();
    let snapshot = DeviceSnapshot::default();

    controller.on_grid_sample(0, 200.0, &snapshot);
    // grid_timeout_s default 300
    assert_eq!(controller.on_tick(299_000, &snapshot), None);
    assert_eq!(
        controller.on_tick(301_000, &snapshot),
        Some(ControlAction::Idle)
    );
}
