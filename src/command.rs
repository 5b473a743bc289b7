/// Commands arriving from the MQTT side, already parsed and validated.
///
/// One physical device per process, so commands carry no device handle;
/// the coordinator owns the single device they apply to.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Direct charge/discharge current command in amps (signed,
    /// negative = discharge).
    ChargeAmp(f64),
    /// Direct charge/discharge power command in watts (signed).
    ChargePower(f64),
    /// Operating mode: 0 = output off, 1 = on, 2 = toggle.
    OpMode(u8),
    /// Enable/disable the active charge control strategy.
    ControlEnable(bool),
    /// Raw grid power sample in watts (positive = import from grid).
    GridPower(f64),
    /// Force a fault bitmap refresh and publication.
    RefreshFault,
}

impl Command {
    pub fn to_result_topic(&self, device_id: u8) -> String {
        use Command::*;

        let rest = match self {
            ChargeAmp(_) => format!("bic/{}/set/chargeA", device_id),
            ChargePower(_) => format!("bic/{}/set/chargeP", device_id),
            OpMode(_) => format!("bic/{}/mode", device_id),
            ControlEnable(_) => format!("bic/{}/control", device_id),
            GridPower(_) => "grid/power".to_string(),
            RefreshFault => format!("bic/{}/fault/get", device_id),
        };

        format!("result/{}", rest)
    }
}
