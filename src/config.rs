use crate::prelude::*;

use serde::Deserialize;
use std::sync::{Arc, Mutex};

// Factory hard limits for the BIC-2200-24 hardware, in volts*100 / amps*100.
// Configured limits beyond these are a configuration error, not a clamp.
pub const SAFE_CHARGE_VOLTAGE: u16 = 2750;
pub const SAFE_DISCHARGE_VOLTAGE: u16 = 2520;
pub const SAFE_CHARGE_CURRENT: u16 = 3500;
pub const SAFE_DISCHARGE_CURRENT: u16 = 2600;

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub mqtt: Mqtt,
    pub device: Device,

    #[serde(default)]
    pub control: Control,

    #[serde(default = "Config::default_loglevel")]
    pub loglevel: String,
}

// Mqtt {{{
#[derive(Clone, Debug, Deserialize)]
pub struct Mqtt {
    pub host: String,
    #[serde(default = "Config::default_mqtt_port")]
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,

    #[serde(default = "Config::default_mqtt_namespace")]
    pub namespace: String,

    /// Topic carrying raw signed grid power samples in watts. Absolute,
    /// outside our namespace - it belongs to the smart meter.
    pub grid_power_topic: String,

    #[serde(default = "Config::default_app_id")]
    pub app_id: String,
}

impl Mqtt {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn username(&self) -> &Option<String> {
        &self.username
    }

    pub fn password(&self) -> &Option<String> {
        &self.password
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn grid_power_topic(&self) -> &str {
        &self.grid_power_topic
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }
} // }}}

// Device {{{
#[derive(Clone, Debug, Deserialize)]
pub struct Device {
    #[serde(default)]
    pub id: u8,

    #[serde(default = "Config::default_can_interface")]
    pub can_interface: String,

    /// Charge voltage limit, volts*100.
    #[serde(default = "Config::default_charge_voltage")]
    pub charge_voltage: u16,
    /// Discharge voltage floor, volts*100.
    #[serde(default = "Config::default_discharge_voltage")]
    pub discharge_voltage: u16,
    /// Maximum charge current, amps*100.
    #[serde(default = "Config::default_max_charge_current")]
    pub max_charge_current: u16,
    /// Maximum discharge current magnitude, amps*100.
    #[serde(default = "Config::default_max_discharge_current")]
    pub max_discharge_current: u16,
    /// Idle/safe charge current, amps*100. Pushed on bring-up and shutdown.
    #[serde(default = "Config::default_min_charge_current")]
    pub min_charge_current: u16,

    /// Nominal battery voltage, volts*100. Used for W->A conversion before
    /// the first DC voltage measurement arrives.
    #[serde(default = "Config::default_nominal_voltage")]
    pub nominal_voltage: u16,

    /// Register transaction receive timeout.
    #[serde(default = "Config::default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Battery voltage -> capacity lookup, non-decreasing in both axes.
    pub capacity_table: Vec<CapacityRow>,
}

#[derive(Clone, Copy, Debug, Deserialize)]
pub struct CapacityRow {
    pub percent: f64,
    pub voltage: f64,
}

impl Device {
    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn can_interface(&self) -> &str {
        &self.can_interface
    }

    pub fn read_timeout_ms(&self) -> u64 {
        self.read_timeout_ms
    }

    pub fn nominal_voltage_v(&self) -> f64 {
        self.nominal_voltage as f64 / 100.0
    }
} // }}}

// Control {{{
#[derive(Clone, Debug, Deserialize)]
pub struct Control {
    /// One of "disabled", "simple", "pid", "winter".
    #[serde(default = "Config::default_strategy")]
    pub strategy: String,

    /// Start with the strategy enabled instead of waiting for the
    /// control-enable command.
    #[serde(default)]
    pub enabled: bool,

    /// Loop gain for the simple strategy.
    #[serde(default = "Config::default_gain")]
    pub gain: f64,

    /// Grid power smoothing window.
    #[serde(default = "Config::default_average_window_ms")]
    pub average_window_ms: i64,

    /// Minimum setpoint change worth a bus write, watts.
    #[serde(default = "Config::default_tolerance_w")]
    pub tolerance_w: f64,

    /// Reset the device to idle if no grid sample for this long.
    #[serde(default = "Config::default_grid_timeout_s")]
    pub grid_timeout_s: i64,

    /// Fixed power envelope, watts. Discharge limit is negative.
    #[serde(default = "Config::default_max_charge_power_w")]
    pub max_charge_power_w: f64,
    #[serde(default = "Config::default_max_discharge_power_w")]
    pub max_discharge_power_w: f64,

    /// Hours [start, stop) in which discharging is suppressed. Equal
    /// values disable the window. Wrap-around (22 -> 6) is supported.
    #[serde(default)]
    pub discharge_block_start: u32,
    #[serde(default)]
    pub discharge_block_stop: u32,

    /// Cooldown after the last charging command before discharge is
    /// allowed again, seconds.
    #[serde(default = "Config::default_discharge_block_tmo_s")]
    pub discharge_block_tmo_s: i64,

    #[serde(default)]
    pub pid: PidTuning,

    #[serde(default)]
    pub winter: WinterTuning,

    /// 24 entries, one per wall-clock hour, or empty for a flat profile.
    #[serde(default)]
    pub profile: Vec<ProfileRow>,
}

impl Default for Control {
    fn default() -> Self {
        serde_yaml::from_str("{}").unwrap()
    }
}

#[derive(Clone, Copy, Debug, Deserialize)]
pub struct PidTuning {
    #[serde(default = "Config::default_kp")]
    pub kp: f64,
    #[serde(default)]
    pub ki: f64,
    #[serde(default)]
    pub kd: f64,

    /// Fixed timestep in seconds; 0 = measure dt between steps.
    #[serde(default)]
    pub step_s: f64,

    /// Integral term clamp as a fraction of the output range.
    #[serde(default = "Config::default_windup_frac")]
    pub windup_frac: f64,

    /// Grid power magnitude above which a sign flip forces a regulator
    /// reset, watts.
    #[serde(default = "Config::default_reversal_threshold_w")]
    pub reversal_threshold_w: f64,

    /// Maximum distance of the commanded setpoint from the currently
    /// measured charge power, watts.
    #[serde(default = "Config::default_max_delta_w")]
    pub max_delta_w: f64,
}

impl Default for PidTuning {
    fn default() -> Self {
        serde_yaml::from_str("{}").unwrap()
    }
}

#[derive(Clone, Copy, Debug, Deserialize)]
pub struct WinterTuning {
    #[serde(default = "Config::default_capacity_min_pc")]
    pub capacity_min_pc: f64,
    #[serde(default = "Config::default_capacity_max_pc")]
    pub capacity_max_pc: f64,

    /// Hysteresis band before leaving Charge/Discharge, capacity points.
    #[serde(default = "Config::default_hysteresis_pc")]
    pub hysteresis_pc: f64,

    /// Fixed charge power while topping up, watts.
    #[serde(default = "Config::default_winter_charge_w")]
    pub charge_power_w: f64,
    /// Fixed discharge power while bleeding off, watts (negative).
    #[serde(default = "Config::default_winter_discharge_w")]
    pub discharge_power_w: f64,

    /// Below this temperature the cycle aborts and re-arms later.
    #[serde(default = "Config::default_temp_min_c")]
    pub temp_min_c: f64,

    /// Settle delay on state entry, seconds.
    #[serde(default = "Config::default_settle_s")]
    pub settle_s: i64,
    /// Re-check period while within bounds, seconds.
    #[serde(default = "Config::default_recheck_s")]
    pub recheck_s: i64,
    /// Re-arm delay after a too-cold check, seconds.
    #[serde(default = "Config::default_cold_retry_s")]
    pub cold_retry_s: i64,
}

impl Default for WinterTuning {
    fn default() -> Self {
        serde_yaml::from_str("{}").unwrap()
    }
}

#[derive(Clone, Copy, Debug, Deserialize)]
pub struct ProfileRow {
    pub max_charge_w: f64,
    pub max_discharge_w: f64,
    #[serde(default)]
    pub grid_offset_w: f64,
}
// }}}

pub struct ConfigWrapper {
    config: Arc<Mutex<Config>>,
}

impl Clone for ConfigWrapper {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
        }
    }
}

impl ConfigWrapper {
    pub fn new(file: String) -> Result<Self> {
        let config = Config::new(file)?;
        Ok(Self::from_config(config))
    }

    pub fn from_config(config: Config) -> Self {
        Self {
            config: Arc::new(Mutex::new(config)),
        }
    }

    pub fn mqtt(&self) -> Mqtt {
        self.config.lock().unwrap().mqtt.clone()
    }

    pub fn device(&self) -> Device {
        self.config.lock().unwrap().device.clone()
    }

    pub fn control(&self) -> Control {
        self.config.lock().unwrap().control.clone()
    }

    pub fn loglevel(&self) -> String {
        self.config.lock().unwrap().loglevel.clone()
    }
}

impl Config {
    pub fn new(file: String) -> Result<Self> {
        info!("Reading configuration from {}", file);
        let content = std::fs::read_to_string(&file)
            .map_err(|err| anyhow!("error reading {}: {}", file, err))?;

        let config: Self = serde_yaml::from_str(&content)?;

        info!("Configuration loaded:");
        info!("  MQTT: {}:{} namespace={}", config.mqtt.host, config.mqtt.port, config.mqtt.namespace);
        info!("  Grid power topic: {}", config.mqtt.grid_power_topic);
        info!("  Device[{}]: {} cv:{} dv:{} cc:{} dc:{}",
            config.device.id,
            config.device.can_interface,
            config.device.charge_voltage,
            config.device.discharge_voltage,
            config.device.max_charge_current,
            config.device.max_discharge_current,
        );
        info!("  Strategy: {} (enabled: {})", config.control.strategy, config.control.enabled);
        info!("  Log level: {}", config.loglevel);

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.mqtt.host.is_empty() {
            bail!("mqtt.host cannot be empty");
        }
        if self.mqtt.port == 0 {
            bail!("mqtt.port must be between 1 and 65535");
        }
        if self.mqtt.grid_power_topic.is_empty() {
            bail!("mqtt.grid_power_topic cannot be empty");
        }

        let d = &self.device;
        if d.can_interface.is_empty() {
            bail!("device.can_interface cannot be empty");
        }
        if d.charge_voltage > SAFE_CHARGE_VOLTAGE {
            bail!(
                "device.charge_voltage {} exceeds hardware limit {}",
                d.charge_voltage,
                SAFE_CHARGE_VOLTAGE
            );
        }
        if d.discharge_voltage < SAFE_DISCHARGE_VOLTAGE {
            bail!(
                "device.discharge_voltage {} below hardware floor {}",
                d.discharge_voltage,
                SAFE_DISCHARGE_VOLTAGE
            );
        }
        if d.max_charge_current > SAFE_CHARGE_CURRENT {
            bail!(
                "device.max_charge_current {} exceeds hardware limit {}",
                d.max_charge_current,
                SAFE_CHARGE_CURRENT
            );
        }
        if d.max_discharge_current > SAFE_DISCHARGE_CURRENT {
            bail!(
                "device.max_discharge_current {} exceeds hardware limit {}",
                d.max_discharge_current,
                SAFE_DISCHARGE_CURRENT
            );
        }
        if d.min_charge_current > d.max_charge_current {
            bail!("device.min_charge_current exceeds max_charge_current");
        }
        if d.read_timeout_ms == 0 {
            bail!("device.read_timeout_ms must be non-zero");
        }

        // A device we cannot place on the capacity curve cannot be safely
        // regulated; refuse to start rather than fall back at runtime.
        let rows: Vec<(f64, f64)> = d
            .capacity_table
            .iter()
            .map(|r| (r.percent, r.voltage))
            .collect();
        crate::capacity::CapacityTable::new(rows)
            .map_err(|err| anyhow!("device.capacity_table: {}", err))?;

        let c = &self.control;
        match c.strategy.as_str() {
            "disabled" | "simple" | "pid" | "winter" => (),
            other => bail!("control.strategy: unknown strategy {:?}", other),
        }
        if !c.profile.is_empty() && c.profile.len() != 24 {
            bail!(
                "control.profile must have exactly 24 entries, got {}",
                c.profile.len()
            );
        }
        for (hour, row) in c.profile.iter().enumerate() {
            if row.max_discharge_w > 0.0 {
                bail!("control.profile[{}].max_discharge_w must be <= 0", hour);
            }
            if row.max_charge_w < 0.0 {
                bail!("control.profile[{}].max_charge_w must be >= 0", hour);
            }
        }
        if c.max_discharge_power_w > 0.0 {
            bail!("control.max_discharge_power_w must be <= 0");
        }
        if c.discharge_block_start > 23 || c.discharge_block_stop > 23 {
            bail!("control.discharge_block_start/stop must be hours 0-23");
        }
        if !(0.0..=1.0).contains(&c.pid.windup_frac) {
            bail!("control.pid.windup_frac must be between 0.0 and 1.0");
        }
        if c.winter.capacity_min_pc >= c.winter.capacity_max_pc {
            bail!("control.winter: capacity_min_pc must be below capacity_max_pc");
        }
        if c.winter.discharge_power_w > 0.0 {
            bail!("control.winter.discharge_power_w must be <= 0");
        }

        Ok(())
    }

    fn default_loglevel() -> String {
        "info".to_string()
    }
    fn default_mqtt_port() -> u16 {
        1883
    }
    fn default_mqtt_namespace() -> String {
        "haus/power/bat/bic2mqtt".to_string()
    }
    fn default_app_id() -> String {
        "0".to_string()
    }
    fn default_can_interface() -> String {
        "can0".to_string()
    }
    fn default_charge_voltage() -> u16 {
        SAFE_CHARGE_VOLTAGE
    }
    fn default_discharge_voltage() -> u16 {
        SAFE_DISCHARGE_VOLTAGE
    }
    fn default_max_charge_current() -> u16 {
        SAFE_CHARGE_CURRENT
    }
    fn default_max_discharge_current() -> u16 {
        SAFE_DISCHARGE_CURRENT
    }
    fn default_min_charge_current() -> u16 {
        0
    }
    fn default_nominal_voltage() -> u16 {
        2560
    }
    fn default_read_timeout_ms() -> u64 {
        500
    }
    fn default_strategy() -> String {
        "disabled".to_string()
    }
    fn default_gain() -> f64 {
        0.5
    }
    fn default_average_window_ms() -> i64 {
        30_000
    }
    fn default_tolerance_w() -> f64 {
        25.0
    }
    fn default_grid_timeout_s() -> i64 {
        300
    }
    fn default_max_charge_power_w() -> f64 {
        2200.0
    }
    fn default_max_discharge_power_w() -> f64 {
        -2200.0
    }
    fn default_discharge_block_tmo_s() -> i64 {
        120
    }
    fn default_kp() -> f64 {
        0.5
    }
    fn default_windup_frac() -> f64 {
        0.9
    }
    fn default_reversal_threshold_w() -> f64 {
        500.0
    }
    fn default_max_delta_w() -> f64 {
        500.0
    }
    fn default_capacity_min_pc() -> f64 {
        30.0
    }
    fn default_capacity_max_pc() -> f64 {
        50.0
    }
    fn default_hysteresis_pc() -> f64 {
        10.0
    }
    fn default_winter_charge_w() -> f64 {
        300.0
    }
    fn default_winter_discharge_w() -> f64 {
        -300.0
    }
    fn default_temp_min_c() -> f64 {
        5.0
    }
    fn default_settle_s() -> i64 {
        60
    }
    fn default_recheck_s() -> i64 {
        3600
    }
    fn default_cold_retry_s() -> i64 {
        3600
    }
}
