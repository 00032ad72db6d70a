//! Senseair K30/K33 I²C wire protocol
//!
//! [`frame`] holds the checksum scheme and the frame types exchanged with the
//! device. [`commands`] holds the fixed command layouts and register constants.

pub mod commands;
pub mod frame;

pub use frame::*;

use thiserror_no_std::Error;

/// Reasons a response frame is not trusted.
///
/// Transport failures are reported separately as
/// [`embedded_hal::i2c::ErrorKind`], since those are retried and frame errors
/// never are.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    #[error("checksum mismatch (expected {expected:#04x}, received {received:#04x})")]
    ChecksumMismatch { expected: u8, received: u8 },
    #[error("measurement not finished (status {status:#04x})")]
    NotReady { status: u8 },
}
