//! Device orchestrator: owns the online-mode state machine for one
//! inverter, its periodic telemetry refresh, energy accounting, and the
//! conversion from power commands to register writes.

use crate::bic::driver::{Bus, DeviceInfo, Driver};
use crate::bic::fault::{FaultKind, FaultTable};
use crate::bic::registers::{self as reg, Direction};
use crate::capacity::CapacityTable;
use crate::control::DeviceSnapshot;
use crate::prelude::*;
use crate::series::TimeSeries;

use serde_json::json;

const ENERGY_WINDOW_MS: i64 = 24 * 3600 * 1000;

/// Consecutive failed telemetry rounds before the device is declared
/// unreachable and bring-up starts over.
const COM_FAIL_LIMIT: u32 = 3;

/// Commanded-vs-achieved gap below which no surplus is inferred, watts.
const SURPLUS_MARGIN_W: f64 = 50.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OnlineMode {
    Offline,
    Init,
    Idle,
    Running,
}

impl OnlineMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OnlineMode::Offline => "offline",
            OnlineMode::Init => "init",
            OnlineMode::Idle => "idle",
            OnlineMode::Running => "running",
        }
    }
}

pub struct Device<B: Bus> {
    cfg: config::Device,
    driver: Driver<B>,
    channels: Channels,

    mode: OnlineMode,
    info: Option<DeviceInfo>,
    faults: FaultTable,
    com_fail_cnt: u32,

    capacity: CapacityTable,
    capacity_pc: Option<f64>,
    dc_voltage_v: Option<f64>,
    dc_current_a: Option<f64>,
    ac_voltage_v: Option<f64>,
    temperature_c: Option<f64>,
    fan_rpm: (Option<u16>, Option<u16>),

    /// Last commanded current, signed amps.
    setpoint_a: f64,
    last_power_cmd_w: Option<f64>,
    last_grid_w: Option<f64>,

    charged: TimeSeries,
    discharged: TimeSeries,
    surplus: TimeSeries,
}

impl<B: Bus> Device<B> {
    pub fn new(
        cfg: config::Device,
        driver: Driver<B>,
        channels: Channels,
    ) -> Result<Self> {
        let rows = cfg
            .capacity_table
            .iter()
            .map(|r| (r.percent, r.voltage))
            .collect();
        let capacity = CapacityTable::new(rows)?;

        Ok(Self {
            cfg,
            driver,
            channels,
            mode: OnlineMode::Offline,
            info: None,
            faults: FaultTable::new(),
            com_fail_cnt: 0,
            capacity,
            capacity_pc: None,
            dc_voltage_v: None,
            dc_current_a: None,
            ac_voltage_v: None,
            temperature_c: None,
            fan_rpm: (None, None),
            setpoint_a: 0.0,
            last_power_cmd_w: None,
            last_grid_w: None,
            charged: TimeSeries::new(ENERGY_WINDOW_MS, -1),
            discharged: TimeSeries::new(ENERGY_WINDOW_MS, -1),
            surplus: TimeSeries::new(ENERGY_WINDOW_MS, -1),
        })
    }

    pub fn mode(&self) -> OnlineMode {
        self.mode
    }

    #[cfg(test)]
    pub(crate) fn driver_bus_mut(&mut self) -> &mut B {
        self.driver.bus_mut()
    }

    pub fn is_online(&self) -> bool {
        !matches!(self.mode, OnlineMode::Offline)
    }

    /// Readings the control strategies consume.
    pub fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            charge_power_w: self.charge_power_w().unwrap_or(0.0),
            temperature_c: self.temperature_c,
            capacity_pc: self.capacity_pc,
        }
    }

    fn charge_power_w(&self) -> Option<f64> {
        Some(self.dc_voltage_v? * self.dc_current_a?)
    }

    /// Remember the latest grid sample; only its sign feeds the surplus
    /// heuristic.
    pub fn note_grid_sample(&mut self, watts: f64) {
        self.last_grid_w = Some(watts);
    }

    // bring-up / teardown {{{

    /// Bring the device up: identify it, switch it to CAN-controlled
    /// battery mode, push safe limits and enable output. Any failure
    /// leaves the device Offline for a later retry.
    pub fn start(&mut self) -> Result<(), CommError> {
        self.mode = OnlineMode::Offline;

        let info = self.driver.device_info()?;
        info!(
            "device {} up: model {} fw {} mfg {}",
            self.cfg.id, info.model, info.firmware_rev, info.manufacture_date
        );
        self.mode = OnlineMode::Init;

        self.driver.init_mode()?;

        // safe setpoints before output ever turns on
        self.driver
            .charge_current_set(self.cfg.min_charge_current, false)?;
        self.driver
            .discharge_current_set(self.cfg.min_charge_current, false)?;
        self.driver
            .charge_voltage_set(self.cfg.charge_voltage, false)?;
        self.driver
            .discharge_voltage_set(self.cfg.discharge_voltage, false)?;

        self.driver.operation_set(true)?;
        match self.driver.operation_read()? {
            Some(true) => self.mode = OnlineMode::Running,
            Some(false) => self.mode = OnlineMode::Idle,
            None => {
                self.mode = OnlineMode::Offline;
                return Err(CommError::Timeout(reg::OPERATION));
            }
        }

        self.com_fail_cnt = 0;
        self.info = Some(DeviceInfo {
            write_cnt: self.driver.write_count(),
            ..info
        });
        self.publish_info();
        Ok(())
    }

    /// Idle-safe setpoint: minimum charge current, charge direction.
    pub fn reset_idle(&mut self) -> Result<(), CommError> {
        info!("device {}: reset to idle setpoint", self.cfg.id);
        self.last_power_cmd_w = None;
        self.driver.direction_set(Direction::Charge)?;
        self.driver
            .charge_current_set(self.cfg.min_charge_current, false)?;
        self.setpoint_a = self.cfg.min_charge_current as f64 / 100.0;
        Ok(())
    }

    /// The device must never be left regulating after shutdown.
    pub fn stop(&mut self) {
        if matches!(self.mode, OnlineMode::Running | OnlineMode::Idle) {
            if let Err(err) = self.reset_idle() {
                warn!("device {}: idle reset on stop failed: {}", self.cfg.id, err);
            }
        }
        self.mode = OnlineMode::Offline;
    }
    // }}}

    // commands {{{

    /// Power command in signed watts. Converts to amps with the last
    /// measured battery voltage, nominal voltage before first contact.
    pub fn charge_set_power(&mut self, watts: f64) -> Result<(), CommError> {
        if self.last_power_cmd_w == Some(watts) {
            return Ok(());
        }

        let volts = self.dc_voltage_v.unwrap_or(self.cfg.nominal_voltage_v());
        let amps = watts / volts;
        debug!(
            "device {}: {} W -> {:.2} A at {:.2} V",
            self.cfg.id, watts, amps, volts
        );
        self.charge_set_amp(amps)?;
        self.last_power_cmd_w = Some(watts);
        Ok(())
    }

    /// Current command in signed amps, clamped to the configured limits.
    pub fn charge_set_amp(&mut self, amps: f64) -> Result<(), CommError> {
        let min_a = self.cfg.min_charge_current as f64 / 100.0;

        if amps >= 0.0 {
            let max_a = self.cfg.max_charge_current as f64 / 100.0;
            let a = amps.clamp(min_a, max_a);
            self.driver.direction_set(Direction::Charge)?;
            self.driver
                .charge_current_set((a * 100.0).round() as u16, false)?;
            self.setpoint_a = a;
        } else {
            let max_a = self.cfg.max_discharge_current as f64 / 100.0;
            let a = (-amps).clamp(min_a, max_a);
            self.driver.direction_set(Direction::Discharge)?;
            self.driver
                .discharge_current_set((a * 100.0).round() as u16, false)?;
            self.setpoint_a = -a;
        }
        Ok(())
    }

    /// Operating mode command: 0 = off, 1 = on, 2 = toggle.
    pub fn set_operation(&mut self, mode: u8) -> Result<(), CommError> {
        let on = match mode {
            0 => false,
            1 => true,
            _ => !self.driver.operation_read()?.unwrap_or(false),
        };
        self.driver.operation_set(on)?;

        match self.driver.operation_read()? {
            Some(true) => self.mode = OnlineMode::Running,
            Some(false) => self.mode = OnlineMode::Idle,
            None => return Err(CommError::Timeout(reg::OPERATION)),
        }
        info!("device {}: operation -> {}", self.cfg.id, self.mode.as_str());
        Ok(())
    }
    // }}}

    // periodic work {{{

    /// Telemetry refresh on the slow cadence. Communication faults are
    /// tolerated per round and escalate to Offline only when persistent.
    pub fn refresh_telemetry(&mut self, now_ms: i64) {
        match self.read_telemetry() {
            Ok(()) => {
                self.com_fail_cnt = 0;
                self.faults.update(FaultKind::Com, false);
            }
            Err(err) => {
                self.com_fail_cnt += 1;
                warn!(
                    "device {}: telemetry failed ({}), {} in a row",
                    self.cfg.id, err, self.com_fail_cnt
                );
                self.faults.update(FaultKind::Com, true);
                if self.com_fail_cnt >= COM_FAIL_LIMIT && self.is_online() {
                    error!("device {}: unreachable, going offline", self.cfg.id);
                    self.mode = OnlineMode::Offline;
                }
                return;
            }
        }

        if let Some(volts) = self.dc_voltage_v {
            self.capacity_pc = Some(self.capacity.capacity_percent(volts));
        }
        self.account_energy(now_ms);
        self.publish_charge(now_ms);
    }

    fn read_telemetry(&mut self) -> Result<(), CommError> {
        // the voltage read doubles as the reachability canary
        match self.driver.dc_voltage()? {
            Some(v) => self.dc_voltage_v = Some(v),
            None => return Err(CommError::Timeout(reg::DC_VOLTAGE)),
        }
        if let Some(a) = self.driver.dc_current()? {
            self.dc_current_a = Some(a);
        }
        if let Some(v) = self.driver.ac_voltage()? {
            self.ac_voltage_v = Some(v);
        }
        if let Some(t) = self.driver.temperature()? {
            self.temperature_c = Some(t);
        }
        self.fan_rpm = self.driver.fan_speeds()?;
        Ok(())
    }

    /// Track charged/discharged energy and the saturation surplus: when
    /// the battery takes less than commanded while the grid is exporting,
    /// the gap is power we had available but could not store.
    fn account_energy(&mut self, now_ms: i64) {
        let achieved = match self.charge_power_w() {
            Some(w) => w,
            None => return,
        };

        self.charged.push_at(now_ms, achieved.max(0.0));
        self.discharged.push_at(now_ms, (-achieved).max(0.0));

        let surplus = match (self.last_power_cmd_w, self.last_grid_w) {
            (Some(cmd), Some(grid))
                if grid < 0.0 && cmd > 0.0 && cmd - achieved > SURPLUS_MARGIN_W =>
            {
                cmd - achieved
            }
            _ => 0.0,
        };
        self.surplus.push_at(now_ms, surplus);
    }

    /// Fault refresh on the fast cadence; publishes only on transition.
    pub fn refresh_faults(&mut self, now_ms: i64, force: bool) {
        match self.driver.fault_bitmap() {
            Ok(Some(bitmap)) => {
                self.faults.apply_bitmap(bitmap);
                self.faults.update(FaultKind::Com, false);
            }
            Ok(None) | Err(_) => self.faults.update(FaultKind::Com, true),
        }
        if let Ok(Some(status)) = self.driver.system_status() {
            self.faults.update(
                FaultKind::Eeprom,
                reg::bit(status, reg::STATUS_EEPROM_FAULT_BIT),
            );
        }

        if self.faults.take_changed() || force {
            self.publish_faults(now_ms);
        }
    }
    // }}}

    // telemetry publication {{{

    /// Topics are namespace-relative; the MQTT sender prefixes them.
    fn publish(&self, suffix: &str, retain: bool, payload: String) {
        let msg = mqtt::Message {
            topic: format!("bic/{}/{}", self.cfg.id, suffix),
            retain,
            payload,
        };
        self.channels.to_mqtt.send(mqtt::ChannelData::Message(msg)).ok();
    }

    fn publish_info(&self) {
        if let Some(info) = &self.info {
            let mut payload = json!(info);
            payload["write_cnt"] = json!(self.driver.write_count());
            self.publish("info", true, payload.to_string());
        }
    }

    pub fn publish_state(&self) {
        let payload = json!({
            "mode": self.mode.as_str(),
            "temp_c": self.temperature_c,
            "grid_volt": self.ac_voltage_v,
            "bat_volt": self.dc_voltage_v,
            "capacity_pc": self.capacity_pc,
            "fan_rpm": [self.fan_rpm.0, self.fan_rpm.1],
            "write_cnt": self.driver.write_count(),
        });
        self.publish("state", true, payload.to_string());
    }

    fn publish_charge(&self, now_ms: i64) {
        let payload = json!({
            "amp": self.dc_current_a,
            "watt": self.charge_power_w(),
            "set_amp": self.setpoint_a,
            "charged_kwh": self.charged.energy_kwh_at(now_ms, ENERGY_WINDOW_MS),
            "discharged_kwh": self.discharged.energy_kwh_at(now_ms, ENERGY_WINDOW_MS),
            "surplus_kwh": self.surplus.energy_kwh_at(now_ms, ENERGY_WINDOW_MS),
        });
        self.publish("charge", false, payload.to_string());
    }

    fn publish_faults(&self, _now_ms: i64) {
        self.publish("fault", true, self.faults.snapshot().to_string());
    }
    // }}}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bic::driver::mock::MockBus;
    use std::time::Duration;

    fn device_cfg() -> config::Device {
        serde_yaml::from_str(
            "{id: 0, charge_voltage: 2750, discharge_voltage: 2520, \
              max_charge_current: 2000, max_discharge_current: 1500, \
              min_charge_current: 60, nominal_voltage: 2560, \
              capacity_table: [{percent: 0, voltage: 22.0}, \
                               {percent: 100, voltage: 27.0}]}",
        )
        .unwrap()
    }

    fn device(bus: MockBus) -> Device<MockBus> {
        let driver = Driver::new(bus, 0, Duration::from_millis(50));
        Device::new(device_cfg(), driver, Channels::new()).unwrap()
    }

    fn script_startup(bus: &mut MockBus) {
        // identification
        bus.reply_chars(reg::MODEL_PART_1, "BIC-22");
        bus.reply_chars(reg::MODEL_PART_2, "00-24");
        bus.reply_word(reg::FIRMWARE_REV, 0x0100);
        bus.reply_word(reg::SYSTEM_CONFIG, 0x0401);
        bus.reply_chars(reg::MANUFACTURE_DATE, "230615");
        // init_mode: CAN control + EEPROM write disable already set,
        // bidirectional mode already enabled
        bus.reply_word(reg::SYSTEM_CONFIG, 0x0401);
        bus.reply_word(reg::BIDIRECTIONAL_CONFIG, 0x0001);
        // safe setpoints already in place, each write skipped by read-first
        bus.reply_word(reg::CHARGE_CURRENT, 60);
        bus.reply_word(reg::DISCHARGE_CURRENT, 60);
        bus.reply_word(reg::CHARGE_VOLTAGE, 2750);
        bus.reply_word(reg::DISCHARGE_VOLTAGE, 2520);
        // operation readback after enable
        bus.reply_byte(reg::OPERATION, 1);
    }

    #[test]
    fn startup_reaches_running_without_eeprom_writes() {
        let mut bus = MockBus::default();
        script_startup(&mut bus);
        let mut dev = device(bus);

        dev.start().unwrap();
        assert_eq!(dev.mode(), OnlineMode::Running);
        // operation enable is the only frame sent, and it is not
        // EEPROM-backed, so the wear counter stays at zero
        assert_eq!(dev.driver.bus_mut().write_frames(), 1);
        assert_eq!(dev.driver.write_count(), 0);
    }

    #[test]
    fn startup_without_identification_stays_offline() {
        let bus = MockBus::default(); // nothing answers
        let mut dev = device(bus);
        assert!(dev.start().is_err());
        assert_eq!(dev.mode(), OnlineMode::Offline);
    }

    #[test]
    fn power_command_uses_nominal_voltage_before_first_measurement() {
        let mut bus = MockBus::default();
        // direction read (charge), current read-first, write confirm
        bus.reply_byte(reg::DIRECTION, 0);
        bus.reply_word(reg::CHARGE_CURRENT, 0);
        bus.reply_word(reg::CHARGE_CURRENT, 1000);
        let mut dev = device(bus);

        // 256 W at nominal 25.6 V = 10 A
        dev.charge_set_power(256.0).unwrap();
        assert_eq!(dev.setpoint_a, 10.0);
    }

    #[test]
    fn repeated_power_command_is_deduplicated() {
        let mut bus = MockBus::default();
        bus.reply_byte(reg::DIRECTION, 0);
        bus.reply_word(reg::CHARGE_CURRENT, 0);
        bus.reply_word(reg::CHARGE_CURRENT, 1000);
        let mut dev = device(bus);

        dev.charge_set_power(256.0).unwrap();
        let frames = dev.driver.write_count();
        // same command again: no further bus traffic at all
        dev.charge_set_power(256.0).unwrap();
        assert_eq!(dev.driver.write_count(), frames);
    }

    #[test]
    fn discharge_command_selects_direction_and_clamps() {
        let mut bus = MockBus::default();
        bus.reply_byte(reg::DIRECTION, 0); // currently charging
        bus.reply_word(reg::DISCHARGE_CURRENT, 0);
        bus.reply_word(reg::DISCHARGE_CURRENT, 1500);
        let mut dev = device(bus);

        // -30 A exceeds the 15 A discharge limit
        dev.charge_set_amp(-30.0).unwrap();
        assert_eq!(dev.setpoint_a, -15.0);
        // direction write went out
        assert!(dev
            .driver
            .bus_mut()
            .sent
            .iter()
            .any(|(_, d)| d.len() == 3 && d[2] == 1));
    }

    #[test]
    fn persistent_telemetry_failure_goes_offline() {
        let mut bus = MockBus::default();
        script_startup(&mut bus);
        let mut dev = device(bus);
        dev.start().unwrap();

        // empty reply queue: every read times out
        for i in 0..3 {
            dev.refresh_telemetry(i * 6000);
        }
        assert_eq!(dev.mode(), OnlineMode::Offline);
        assert!(dev.faults.is_active(FaultKind::Com));
    }

    #[test]
    fn telemetry_updates_capacity() {
        let mut bus = MockBus::default();
        script_startup(&mut bus);
        let mut dev = device(bus);
        dev.start().unwrap();

        dev.driver.bus_mut().reply_word(reg::DC_VOLTAGE, 2450); // 24.5 V
        dev.driver.bus_mut().reply_word(reg::DC_CURRENT, 500);
        dev.driver.bus_mut().reply_word(reg::AC_VOLTAGE, 23_012);
        dev.driver.bus_mut().reply_word(reg::TEMPERATURE, 215);
        dev.driver.bus_mut().reply_word(reg::FAN_SPEED_1, 1200);
        dev.driver.bus_mut().reply_word(reg::FAN_SPEED_2, 1180);
        dev.refresh_telemetry(6000);

        // 24.5 V on a 22..27 V table = 50 %
        assert_eq!(dev.capacity_pc, Some(50.0));
        let snap = dev.snapshot();
        assert_eq!(snap.temperature_c, Some(21.5));
        assert!((snap.charge_power_w - 24.5 * 5.0).abs() < 1e-9);
    }
}
