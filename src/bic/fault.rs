//! Fault bitmap decoding with transition debounce.
//!
//! A fault bit must be observed in the same state twice in a row before
//! the table reports a transition, so a single corrupted reply never
//! flips a published alarm.

use crate::bic::registers as reg;

use serde::Serialize;
use serde_json::json;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    Fan,
    Otp,
    Ovp,
    Olp,
    Short,
    AcRange,
    DcOff,
    OtpHi,
    OvpHi,
    Eeprom,
    Com,
}

impl FaultKind {
    /// Fault bitmap bit order, low to high. Eeprom comes from the system
    /// status register and Com from the driver, not from this bitmap.
    const BITMAP: [FaultKind; 9] = [
        FaultKind::Fan,
        FaultKind::Otp,
        FaultKind::Ovp,
        FaultKind::Olp,
        FaultKind::Short,
        FaultKind::AcRange,
        FaultKind::DcOff,
        FaultKind::OtpHi,
        FaultKind::OvpHi,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            FaultKind::Fan => "fan",
            FaultKind::Otp => "otp",
            FaultKind::Ovp => "ovp",
            FaultKind::Olp => "olp",
            FaultKind::Short => "short",
            FaultKind::AcRange => "ac_range",
            FaultKind::DcOff => "dc_off",
            FaultKind::OtpHi => "otp_hi",
            FaultKind::OvpHi => "ovp_hi",
            FaultKind::Eeprom => "eeprom",
            FaultKind::Com => "com",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            FaultKind::Fan => "fan failure",
            FaultKind::Otp => "over temperature",
            FaultKind::Ovp => "dc over voltage",
            FaultKind::Olp => "dc over current",
            FaultKind::Short => "short circuit",
            FaultKind::AcRange => "ac input out of range",
            FaultKind::DcOff => "dc output turned off",
            FaultKind::OtpHi => "internal high temperature",
            FaultKind::OvpHi => "internal high voltage",
            FaultKind::Eeprom => "eeprom access fault",
            FaultKind::Com => "can communication lost",
        }
    }
}

/// Debounced state of a single fault.
#[derive(Clone, Copy, Debug, Default)]
struct Slot {
    /// Confirmed state; `None` until the first confirmed observation, so
    /// startup always produces a transition for every fault.
    state: Option<bool>,
    /// Consecutive observations of `pending`.
    count: u8,
    pending: bool,
    /// Confirmed activations since startup.
    transitions: u32,
}

pub struct FaultTable {
    slots: [Slot; Self::KINDS.len()],
    changed: bool,
}

impl FaultTable {
    const KINDS: [FaultKind; 11] = [
        FaultKind::Fan,
        FaultKind::Otp,
        FaultKind::Ovp,
        FaultKind::Olp,
        FaultKind::Short,
        FaultKind::AcRange,
        FaultKind::DcOff,
        FaultKind::OtpHi,
        FaultKind::OvpHi,
        FaultKind::Eeprom,
        FaultKind::Com,
    ];

    const DEBOUNCE: u8 = 2;

    pub fn new() -> Self {
        Self {
            slots: [Slot::default(); Self::KINDS.len()],
            changed: false,
        }
    }

    fn slot_index(kind: FaultKind) -> usize {
        Self::KINDS.iter().position(|&k| k == kind).unwrap_or(0)
    }

    /// Feed one raw observation. The confirmed state only flips after
    /// `DEBOUNCE` consecutive identical observations.
    pub fn update(&mut self, kind: FaultKind, active: bool) {
        let slot = &mut self.slots[Self::slot_index(kind)];

        if slot.pending == active {
            slot.count = slot.count.saturating_add(1);
        } else {
            slot.pending = active;
            slot.count = 1;
        }

        if slot.count >= Self::DEBOUNCE && slot.state != Some(active) {
            slot.state = Some(active);
            self.changed = true;
            if active {
                slot.transitions += 1;
                log::warn!("fault raised: {}", kind.description());
            } else {
                log::info!("fault cleared: {}", kind.description());
            }
        }
    }

    /// Feed a fault status register value, one observation per bit.
    pub fn apply_bitmap(&mut self, bitmap: u16) {
        for (i, &kind) in FaultKind::BITMAP.iter().enumerate() {
            self.update(kind, reg::bit(bitmap, i as u16));
        }
    }

    pub fn is_active(&self, kind: FaultKind) -> bool {
        self.slots[Self::slot_index(kind)].state == Some(true)
    }

    pub fn any_active(&self) -> bool {
        self.slots.iter().any(|s| s.state == Some(true))
    }

    /// True once any confirmed state flipped since the last `take_changed`.
    pub fn take_changed(&mut self) -> bool {
        std::mem::take(&mut self.changed)
    }

    pub fn snapshot(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = Self::KINDS
            .iter()
            .zip(self.slots.iter())
            .map(|(kind, slot)| {
                (
                    kind.key().to_string(),
                    json!({
                        "active": slot.state.unwrap_or(false),
                        "cnt": slot.transitions,
                        "text": kind.description(),
                    }),
                )
            })
            .collect();
        serde_json::Value::Object(map)
    }
}

impl Default for FaultTable {
    fn default() -> Self {
        Self::new()
    }
}
