pub mod bic;         // BIC-2200 CAN register protocol
pub mod capacity;    // voltage -> state-of-charge lookup
pub mod channels;    // inter-component communication channels
pub mod command;     // parsed inbound commands
pub mod config;      // configuration management
pub mod control;     // charge control strategies
pub mod coordinator; // control loop and command dispatch
pub mod device;      // device orchestrator
pub mod error;       // error types
pub mod mqtt;        // MQTT client and messaging
pub mod options;     // command line options parsing
pub mod pid;         // generic PID regulator
pub mod prelude;     // common imports and types
pub mod scheduler;   // tick phase bookkeeping
pub mod series;      // time-windowed aggregation

const CARGO_PKG_VERSION: &str = env!("CARGO_PKG_VERSION");

use crate::prelude::*;

use crate::bic::driver::{CanBus, Driver};
use crate::coordinator::Coordinator;
use crate::mqtt::Mqtt;
use crate::options::Options;

use std::io::Write;
use std::time::Duration;

fn logger_builder(level: &str) -> env_logger::Builder {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level));
    builder
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {} {}] {}",
                chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
                record.level(),
                record.module_path().unwrap_or(""),
                record.args()
            )
        })
        .write_style(env_logger::WriteStyle::Never);
    builder
}

pub async fn app(mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
    let options = Options::new();

    logger_builder("info").init();

    info!(
        "bic2mqtt {} starting with config file: {}",
        CARGO_PKG_VERSION, options.config_file
    );

    let config = ConfigWrapper::new(options.config_file).unwrap_or_else(|err| {
        error!("failed to load config: {:?}", err);
        std::process::exit(255);
    });

    // logger is already live, raising the level past the default only
    // works when RUST_LOG is unset
    let _ = logger_builder(&config.loglevel()).try_init();

    let channels = Channels::new();

    let device_cfg = config.device();
    let bus = CanBus::open(device_cfg.can_interface())
        .map_err(|err| anyhow!("cannot open {}: {}", device_cfg.can_interface(), err))?;
    let driver = Driver::new(
        bus,
        device_cfg.id(),
        Duration::from_millis(device_cfg.read_timeout_ms()),
    );

    let mut coordinator = Coordinator::new(config.clone(), channels.clone(), driver)?;
    let coordinator_handle = tokio::spawn(async move {
        if let Err(e) = coordinator.start().await {
            error!("coordinator task failed: {}", e);
        }
    });

    let mqtt = Mqtt::new(config.clone(), channels.clone());
    let mqtt_clone = mqtt.clone();
    let mqtt_handle = tokio::spawn(async move {
        if let Err(e) = mqtt_clone.start().await {
            error!("mqtt task failed: {}", e);
        }
    });

    let _ = shutdown_rx.recv().await;
    info!("shutdown signal received");

    // coordinator first, so the device is parked at its idle setpoint
    // before the transport goes away
    let _ = channels.from_mqtt.send(mqtt::ChannelData::Shutdown);
    let _ = coordinator_handle.await;
    let _ = mqtt.stop().await;
    mqtt_handle.abort();

    info!("shutdown complete");
    Ok(())
}
