use thiserror::Error;

/// Recoverable communication faults from the CAN register protocol.
///
/// These are expected during normal operation (bus glitches, device busy,
/// cabling) and are handled by retry-at-next-tick in the control loop.
/// Configuration problems are *not* represented here; those are fatal
/// `anyhow` errors raised during startup validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommError {
    /// No reply frame within the bounded receive timeout.
    #[error("timeout waiting for reply to command {0:#06x}")]
    Timeout(u16),

    /// A checked write went through but the read-back value disagreed.
    /// The prior setpoint remains authoritative for the caller.
    #[error("setpoint mismatch on command {cmd:#06x}: wrote {wanted}, read back {got}")]
    SetpointMismatch { cmd: u16, wanted: u16, got: u16 },

    /// Underlying socket failure (interface down, send error).
    #[error("can bus error: {0}")]
    Bus(String),

    /// Reply frame too short for the expected payload.
    #[error("malformed response frame for command {0:#06x}")]
    Malformed(u16),
}
