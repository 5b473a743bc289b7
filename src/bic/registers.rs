//! BIC-2200 CAN command codes and value conventions.
//!
//! Each transaction addresses a 16-bit command code; word registers carry
//! volts*100 / amps*100 little-endian in the two bytes after the code.

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Controller message id base; the configured device id (0-7) is or-ed in.
pub const HOST_MSG_ID: u32 = 0x000C_0300;
/// Device reply message id base.
pub const DEVICE_MSG_ID: u32 = 0x000C_0200;

pub const OPERATION: u16 = 0x0000; // byte, output on/off
pub const CHARGE_VOLTAGE: u16 = 0x0020; // word, EEPROM
pub const CHARGE_CURRENT: u16 = 0x0030; // word, EEPROM
pub const FAULT_STATUS: u16 = 0x0040; // word, bitmap
pub const AC_VOLTAGE: u16 = 0x0050; // word
pub const DC_VOLTAGE: u16 = 0x0060; // word
pub const DC_CURRENT: u16 = 0x0061; // word, folded two's complement
pub const TEMPERATURE: u16 = 0x0062; // word, 0.1 degC
pub const FAN_SPEED_1: u16 = 0x0070; // word, rpm
pub const FAN_SPEED_2: u16 = 0x0071; // word, rpm
pub const MODEL_PART_1: u16 = 0x0082; // 6 ascii chars
pub const MODEL_PART_2: u16 = 0x0083; // 6 ascii chars
pub const FIRMWARE_REV: u16 = 0x0084; // word, mcu0/mcu1 bytes
pub const MANUFACTURE_DATE: u16 = 0x0086; // 6 ascii chars
pub const SYSTEM_STATUS: u16 = 0x00C1; // word, bitmap (bit 5 = eeprom fault)
pub const SYSTEM_CONFIG: u16 = 0x00C2; // word
pub const DIRECTION: u16 = 0x0100; // byte, 0 = charge, 1 = discharge
pub const DISCHARGE_VOLTAGE: u16 = 0x0120; // word, EEPROM
pub const DISCHARGE_CURRENT: u16 = 0x0130; // word, EEPROM
pub const BIDIRECTIONAL_CONFIG: u16 = 0x0140; // word

/// DC current readings above this raw value are a negative (discharge)
/// current folded into the unsigned range.
pub const CURRENT_FOLD_THRESHOLD: u16 = 20_000;

// SYSTEM_CONFIG bits
pub const SYSCFG_CAN_CTRL_BIT: u16 = 0; // low byte bit 0
pub const SYSCFG_EEPROM_WRITE_DISABLE_BIT: u16 = 10; // high byte bit 2
// BIDIRECTIONAL_CONFIG bits
pub const BIDIR_ENABLE_BIT: u16 = 0;
// SYSTEM_STATUS bits
pub const STATUS_EEPROM_FAULT_BIT: u16 = 5;

/// Registers whose writes persist to EEPROM. These get the full
/// read-first / write / read-back treatment to bound wear.
pub fn is_eeprom_backed(cmd: u16) -> bool {
    matches!(
        cmd,
        CHARGE_VOLTAGE | CHARGE_CURRENT | DISCHARGE_VOLTAGE | DISCHARGE_CURRENT
    )
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Direction {
    Charge = 0,
    Discharge = 1,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Charge => write!(f, "charge"),
            Direction::Discharge => write!(f, "discharge"),
        }
    }
}

/// Fold the raw DC current word into signed amps*100.
pub fn fold_current(raw: u16) -> i32 {
    if raw > CURRENT_FOLD_THRESHOLD {
        raw as i32 - 65_536
    } else {
        raw as i32
    }
}

pub fn bit(value: u16, index: u16) -> bool {
    (value >> index) & 1 == 1
}
