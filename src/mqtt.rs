use crate::prelude::*;

use rumqttc::{AsyncClient, Event, EventLoop, Incoming, LastWill, MqttOptions, Publish, QoS};

// Message {{{
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct Message {
    pub topic: String,
    pub retain: bool,
    pub payload: String,
}

impl Message {
    /// Parse an inbound message into a command. Topics are
    /// namespace-relative except the grid power feed, which lives in the
    /// smart meter's own namespace and is matched verbatim.
    pub fn to_command(&self, grid_topic: &str, device_id: u8) -> Result<Command> {
        use Command::*;

        if self.topic == grid_topic {
            return Ok(GridPower(self.payload_f64()?));
        }

        let parts: Vec<&str> = self.topic.split('/').collect();

        let r = match parts[..] {
            ["cmd", "bic", id, "set"] => {
                Self::check_device(id, device_id)?;
                self.payload_charge_command()?
            }
            ["cmd", "bic", id, "mode"] => {
                Self::check_device(id, device_id)?;
                let mode = self.payload_int()?;
                if mode > 2 {
                    bail!("mode must be 0 (off), 1 (on) or 2 (toggle)");
                }
                OpMode(mode as u8)
            }
            ["cmd", "bic", id, "control"] => {
                Self::check_device(id, device_id)?;
                ControlEnable(self.payload_bool())
            }
            ["cmd", "bic", id, "fault", "get"] => {
                Self::check_device(id, device_id)?;
                RefreshFault
            }
            [..] => bail!("unhandled: {:?}", self),
        };

        Ok(r)
    }

    fn check_device(id: &str, device_id: u8) -> Result<()> {
        match id.parse::<u8>() {
            Ok(id) if id == device_id => Ok(()),
            _ => bail!("command for unknown device '{}'", id),
        }
    }

    // {"var": "chargeA"|"chargeP", "val": n}
    fn payload_charge_command(&self) -> Result<Command> {
        use serde::Deserialize;
        #[derive(Deserialize)]
        struct SetPayload {
            var: String,
            val: f64,
        }

        let p = serde_json::from_str::<SetPayload>(&self.payload)?;
        match p.var.as_str() {
            "chargeA" => Ok(Command::ChargeAmp(p.val)),
            "chargeP" => Ok(Command::ChargePower(p.val)),
            other => bail!("unknown set variable '{}'", other),
        }
    }

    fn payload_f64(&self) -> Result<f64> {
        self.payload
            .trim()
            .parse()
            .map_err(|err| anyhow!("payload_f64: {}", err))
    }

    fn payload_int(&self) -> Result<u16> {
        self.payload
            .trim()
            .parse()
            .map_err(|err| anyhow!("payload_int: {}", err))
    }

    fn payload_bool(&self) -> bool {
        matches!(
            self.payload.to_ascii_lowercase().as_str(),
            "1" | "t" | "true" | "on" | "y" | "yes"
        )
    }
} // }}}

#[derive(Eq, PartialEq, Debug, Clone)]
pub enum ChannelData {
    Message(Message),
    Shutdown,
}

pub type Sender = broadcast::Sender<ChannelData>;

#[derive(Clone)]
pub struct Mqtt {
    config: ConfigWrapper,
    channels: Channels,
}

impl Mqtt {
    pub fn new(config: ConfigWrapper, channels: Channels) -> Self {
        Self { config, channels }
    }

    pub async fn start(&self) -> Result<()> {
        let c = self.config.mqtt();

        let mut options = MqttOptions::new(
            format!("bic2mqtt-{}", c.app_id()),
            c.host(),
            c.port(),
        );

        let will = LastWill {
            topic: self.state_topic(),
            message: bytes::Bytes::from("offline"),
            qos: QoS::AtLeastOnce,
            retain: true,
        };
        options.set_last_will(will);

        options.set_keep_alive(std::time::Duration::from_secs(60));
        if let (Some(u), Some(p)) = (c.username(), c.password()) {
            options.set_credentials(u, p);
        }

        info!("initializing mqtt at {}:{}", c.host(), c.port());

        let (client, eventloop) = AsyncClient::new(options, 10);

        futures::try_join!(
            self.setup(client.clone()),
            self.receiver(eventloop),
            self.sender(client)
        )?;

        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        info!("stopping MQTT client");
        let _ = self.channels.to_mqtt.send(ChannelData::Shutdown);
        Ok(())
    }

    async fn setup(&self, client: AsyncClient) -> Result<()> {
        let c = self.config.mqtt();

        client
            .publish(self.state_topic(), QoS::AtLeastOnce, true, "online")
            .await?;

        client
            .subscribe(format!("{}/cmd/bic/#", c.namespace()), QoS::AtMostOnce)
            .await?;

        client
            .subscribe(c.grid_power_topic(), QoS::AtMostOnce)
            .await?;

        Ok(())
    }

    // mqtt -> coordinator
    async fn receiver(&self, mut eventloop: EventLoop) -> Result<()> {
        loop {
            if let Ok(event) =
                tokio::time::timeout(std::time::Duration::from_secs(1), eventloop.poll()).await
            {
                match event {
                    Ok(Event::Incoming(Incoming::Publish(publish))) => {
                        self.handle_message(publish)?;
                    }
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        self.channels.note_connected();
                    }
                    Err(e) => {
                        error!("{}", e);
                        info!("reconnecting in 5s");
                        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                    }
                    _ => {} // keepalives etc
                }
            }
        }
    }

    fn handle_message(&self, publish: Publish) -> Result<()> {
        let namespace = self.config.mqtt().namespace().to_owned();

        // strip our namespace including the first /; the grid power feed
        // is outside it and stays verbatim
        let topic = match publish.topic.strip_prefix(&format!("{}/", namespace)) {
            Some(rest) => rest.to_owned(),
            None => publish.topic.to_owned(),
        };

        let message = Message {
            topic,
            retain: publish.retain,
            payload: String::from_utf8(publish.payload.to_vec())?,
        };
        debug!("RX: {:?}", message);
        if self
            .channels
            .from_mqtt
            .send(ChannelData::Message(message))
            .is_err()
        {
            bail!("send(from_mqtt) failed - channel closed?");
        }

        Ok(())
    }

    // coordinator -> mqtt
    async fn sender(&self, client: AsyncClient) -> Result<()> {
        use ChannelData::*;

        let mut receiver = self.channels.to_mqtt.subscribe();

        loop {
            match receiver.recv().await? {
                Shutdown => {
                    info!("MQTT sender received shutdown signal");
                    let _ = client.disconnect().await;
                    break;
                }
                Message(message) => {
                    let topic = format!("{}/{}", self.config.mqtt().namespace(), message.topic);
                    debug!("TX: {} = {}", topic, message.payload);
                    if let Err(err) = client
                        .publish(
                            &topic,
                            QoS::AtLeastOnce,
                            message.retain,
                            message.payload.as_bytes(),
                        )
                        .await
                    {
                        error!("publish {} failed: {:?}", topic, err);
                    }
                }
            }
        }

        info!("MQTT sender loop exiting");
        Ok(())
    }

    fn state_topic(&self) -> String {
        format!("{}/sys/state", self.config.mqtt().namespace())
    }
}
