//! Glue between MQTT commands, the control strategy and the device.
//!
//! Everything that touches the device runs on one task: the periodic
//! tick and the command stream are multiplexed with `select!`, so no
//! register transaction can interleave with another.

use crate::bic::driver::{Bus, Driver};
use crate::control::{ControlAction, Controller};
use crate::device::Device;
use crate::prelude::*;
use crate::scheduler::{Phases, TickContext, TICK_MS};

use serde_json::json;

pub struct Coordinator<B: Bus> {
    config: ConfigWrapper,
    channels: Channels,
    device: Device<B>,
    controller: Controller,
    ticks: TickContext,
    start_ms: i64,
}

impl<B: Bus> Coordinator<B> {
    pub fn new(config: ConfigWrapper, channels: Channels, driver: Driver<B>) -> Result<Self> {
        let device = Device::new(config.device(), driver, channels.clone())?;
        let controller = Controller::from_config(&config.control())?;

        Ok(Self {
            config,
            channels,
            device,
            controller,
            ticks: TickContext::new(),
            start_ms: chrono::Local::now().timestamp_millis(),
        })
    }

    pub async fn start(&mut self) -> Result<()> {
        if let Err(err) = self.device.start() {
            warn!("device bring-up failed ({}), will retry", err);
        }

        let mut from_mqtt = self.channels.from_mqtt.subscribe();
        let mut interval = tokio::time::interval(std::time::Duration::from_millis(TICK_MS));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut last_tick = chrono::Local::now().timestamp_millis();

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let now = chrono::Local::now().timestamp_millis();
                    let dt = now - last_tick;
                    last_tick = now;
                    let phases = self.ticks.advance(dt);
                    self.on_tick(phases);
                }

                data = from_mqtt.recv() => {
                    match data? {
                        mqtt::ChannelData::Message(message) => {
                            let _ = self.process_message(message);
                        }
                        mqtt::ChannelData::Shutdown => {
                            info!("coordinator shutting down");
                            self.device.stop();
                            break;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    pub fn stop(&self) {
        let _ = self.channels.from_mqtt.send(mqtt::ChannelData::Shutdown);
    }

    fn on_tick(&mut self, phases: Phases) {
        if phases.hour_changed {
            self.controller.on_hour(phases.hour);
        }

        if !self.device.is_online() {
            // periodic bring-up retry
            if phases.one_min {
                match self.device.start() {
                    Ok(()) => info!("device back online"),
                    Err(err) => warn!("device still unreachable: {}", err),
                }
            }
            return;
        }

        if phases.one_s {
            let snapshot = self.device.snapshot();
            if let Some(action) = self.controller.on_tick(phases.now_ms, &snapshot) {
                self.apply_action(action);
            }
        }

        if phases.six_s {
            self.device.refresh_telemetry(phases.now_ms);
            self.device.refresh_faults(phases.now_ms, false);
        }

        if phases.one_min {
            self.device.publish_state();
            self.publish_app_info(phases.now_ms);
        }
    }

    fn apply_action(&mut self, action: ControlAction) {
        let result = match action {
            ControlAction::SetPower(watts) => self.device.charge_set_power(watts),
            ControlAction::Idle => self.device.reset_idle(),
        };
        if let Err(err) = result {
            warn!("control action {:?} failed: {}", action, err);
            // the setpoint was dropped; roll the dedupe back so the next
            // computed target is sent again instead of being swallowed
            self.controller.forget_target();
        }
    }

    fn process_message(&mut self, message: mqtt::Message) -> Result<()> {
        let mqtt_cfg = self.config.mqtt();
        let device_id = self.config.device().id();

        match message.to_command(mqtt_cfg.grid_power_topic(), device_id) {
            Ok(command) => {
                debug!("parsed command {:?}", command);
                if let Err(err) = self.process_command(&command) {
                    error!("{:?} failed: {}", command, err);
                    let reply = mqtt::ChannelData::Message(mqtt::Message {
                        topic: command.to_result_topic(device_id),
                        retain: false,
                        payload: "FAIL".to_string(),
                    });
                    if self.channels.to_mqtt.send(reply).is_err() {
                        bail!("send(to_mqtt) failed - channel closed?");
                    }
                }
            }
            Err(err) => {
                error!("{:?}", err);
            }
        }

        Ok(())
    }

    fn process_command(&mut self, command: &Command) -> Result<()> {
        use Command::*;

        let now_ms = chrono::Local::now().timestamp_millis();

        // grid samples are always recorded; everything else needs a
        // reachable device
        if let GridPower(watts) = command {
            self.device.note_grid_sample(*watts);
            let snapshot = self.device.snapshot();
            if let Some(action) = self.controller.on_grid_sample(now_ms, *watts, &snapshot) {
                if self.device.is_online() {
                    self.apply_action(action);
                } else {
                    self.controller.forget_target();
                }
            }
            return Ok(());
        }

        if !self.device.is_online() {
            bail!("device offline");
        }

        match command {
            ChargeAmp(amps) => self.device.charge_set_amp(*amps)?,
            ChargePower(watts) => self.device.charge_set_power(*watts)?,
            OpMode(mode) => self.device.set_operation(*mode)?,
            ControlEnable(on) => {
                info!(
                    "control strategy '{}' {}",
                    self.controller.name(),
                    if *on { "enabled" } else { "disabled" }
                );
                self.controller.set_enabled(*on);
                if !on {
                    // synchronous fallback to the idle setpoint
                    self.device.reset_idle()?;
                }
            }
            RefreshFault => self.device.refresh_faults(now_ms, true),
            GridPower(_) => unreachable!(),
        }

        Ok(())
    }

    fn publish_app_info(&self, now_ms: i64) {
        let payload = json!({
            "app_id": self.config.mqtt().app_id(),
            "version": env!("CARGO_PKG_VERSION"),
            "uptime_s": (now_ms - self.start_ms) / 1000,
            "mqtt_connections": self.channels.connection_count(),
            "strategy": self.controller.name(),
            "control_enabled": self.controller.enabled(),
        });

        let msg = mqtt::ChannelData::Message(mqtt::Message {
            topic: "sys/app".to_string(),
            retain: false,
            payload: payload.to_string(),
        });
        self.channels.to_mqtt.send(msg).ok();
    }
}
