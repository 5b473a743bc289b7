use bic2mqtt::prelude::*;

pub const CONFIG_YAML: &str = r#"
mqtt:
  host: localhost
  grid_power_topic: haus/power/grid/now
device:
  id: 0
  can_interface: can0
  charge_voltage: 2750
  discharge_voltage: 2520
  max_charge_current: 2000
  max_discharge_current: 1500
  min_charge_current: 60
  capacity_table:
    - {percent: 0, voltage: 22.0}
    - {percent: 20, voltage: 23.5}
    - {percent: 80, voltage: 26.0}
    - {percent: 100, voltage: 27.0}
control:
  strategy: simple
  enabled: true
  gain: 0.5
  average_window_ms: 1000
  tolerance_w: 25
"#;

pub fn test_config() -> Config {
    let config: Config = serde_yaml::from_str(CONFIG_YAML).unwrap();
    config.validate().unwrap();
    config
}
