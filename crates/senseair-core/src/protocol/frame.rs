//! Command and response framing.
//!
//! Every checked frame ends in a single byte holding the sum of all preceding
//! bytes, truncated to 8 bits. The checksum is always recomputed from the data,
//! never stored alongside it.

use super::FrameError;
use super::commands::{METER_CONTROL_ABC, STATUS_READY};

/// Longest command the device accepts: opcode, two address bytes, value, checksum.
pub const MAX_FRAME_LEN: usize = 5;

/// Truncated 8-bit sum of `bytes`.
#[inline]
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Returns `true` when `received` matches the checksum of `data`.
///
/// `data` must exclude the trailing checksum position.
#[inline]
pub fn validate(data: &[u8], received: u8) -> bool {
    checksum(data) == received
}

/// A command ready to be written to the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandFrame {
    buf: [u8; MAX_FRAME_LEN],
    len: usize,
}

impl CommandFrame {
    /// Build `{opcode, register-high, register-low, [value], checksum}`.
    pub fn build(opcode: u8, register: u16, value: Option<u8>) -> Self {
        let [high, low] = register.to_be_bytes();
        let mut buf = [opcode, high, low, 0, 0];
        let data_len = match value {
            Some(value) => {
                buf[3] = value;
                4
            }
            None => 3,
        };
        buf[data_len] = checksum(&buf[..data_len]);

        Self {
            buf,
            len: data_len + 1,
        }
    }

    /// Wrap a fixed four-byte command that the device accepts without a checksum.
    pub const fn unchecked(bytes: [u8; 4]) -> Self {
        Self {
            buf: [bytes[0], bytes[1], bytes[2], bytes[3], 0],
            len: 4,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

/// Decode the 4-byte measurement response into a concentration in ppm.
///
/// Layout: status (bit 0 = ready), concentration high, concentration low,
/// checksum over the first three bytes. Readiness is checked before the checksum.
pub fn decode_measurement(raw: [u8; 4]) -> Result<u16, FrameError> {
    let status = raw[0];
    if status & STATUS_READY == 0 {
        return Err(FrameError::NotReady { status });
    }

    let expected = checksum(&raw[..3]);
    if expected != raw[3] {
        return Err(FrameError::ChecksumMismatch {
            expected,
            received: raw[3],
        });
    }

    Ok(u16::from_be_bytes([raw[1], raw[2]]))
}

/// The two-byte meter control register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlRegister {
    bytes: [u8; 2],
}

impl ControlRegister {
    pub const fn new(bytes: [u8; 2]) -> Self {
        Self { bytes }
    }

    /// Decode the 3-byte control register echo, verifying its checksum.
    pub fn decode(raw: [u8; 3]) -> Result<Self, FrameError> {
        let expected = checksum(&raw[..2]);
        if expected != raw[2] {
            return Err(FrameError::ChecksumMismatch {
                expected,
                received: raw[2],
            });
        }

        Ok(Self::new([raw[0], raw[1]]))
    }

    pub const fn bytes(&self) -> [u8; 2] {
        self.bytes
    }

    /// Whether automatic baseline correction is enabled (bit 1 of byte 1).
    pub const fn abc_enabled(&self) -> bool {
        self.bytes[1] & METER_CONTROL_ABC != 0
    }

    /// Byte 1 with only the ABC bit changed to `enabled`.
    pub const fn patched(&self, enabled: bool) -> u8 {
        if enabled {
            self.bytes[1] | METER_CONTROL_ABC
        } else {
            self.bytes[1] & !METER_CONTROL_ABC
        }
    }
}
