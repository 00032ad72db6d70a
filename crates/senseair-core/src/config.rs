//! Device and engine configuration
//!
//! Supplied once before the engine is constructed and immutable afterwards.
//! The struct is serde-serializable so a firmware image can carry it as a
//! postcard blob.

use alloc::vec::Vec;

use serde::{Deserialize, Serialize};
use thiserror_no_std::Error;

use crate::protocol::commands::DEFAULT_ADDRESS;
use crate::retry::RetryPolicy;

/// Longest supported poll interval.
pub const MAX_POLL_INTERVAL_SECS: u16 = 1800;

/// Desired automatic baseline correction state.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalibrationIntent {
    pub enabled: bool,
    /// ABC period written to the device when enabling. The register is 16 bits wide.
    pub interval_secs: u16,
}

impl Default for CalibrationIntent {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 43_200,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    pub address: u8,
    pub calibration: CalibrationIntent,
    pub poll_interval_secs: u16,
    pub max_retries: u8,
    pub retry_delay_ms: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS,
            calibration: CalibrationIntent::default(),
            poll_interval_secs: 60,
            max_retries: 5,
            retry_delay_ms: 200,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("address {0:#04x} is not a 7-bit I2C address")]
    InvalidAddress(u8),
    #[error("poll interval must be between 1 and 1800 seconds, got {0}")]
    PollIntervalOutOfRange(u16),
    #[error("max_retries must be at least 1")]
    NoAttempts,
    #[error("calibration is enabled with a zero interval")]
    ZeroCalibrationInterval,
    #[error("missing required setting: {0}")]
    Missing(&'static str),
    #[error("config encoding failed: {0}")]
    Encoding(postcard::Error),
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.address > 0x7F {
            return Err(ConfigError::InvalidAddress(self.address));
        }
        if !(1..=MAX_POLL_INTERVAL_SECS).contains(&self.poll_interval_secs) {
            return Err(ConfigError::PollIntervalOutOfRange(self.poll_interval_secs));
        }
        if self.max_retries == 0 {
            return Err(ConfigError::NoAttempts);
        }
        if self.calibration.enabled && self.calibration.interval_secs == 0 {
            return Err(ConfigError::ZeroCalibrationInterval);
        }
        Ok(())
    }

    pub const fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, self.retry_delay_ms)
    }

    pub const fn poll_interval_ms(&self) -> u64 {
        self.poll_interval_secs as u64 * 1000
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ConfigError> {
        postcard::to_allocvec(self).map_err(ConfigError::Encoding)
    }

    /// Decode a postcard blob and validate it.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ConfigError> {
        let config: Self = postcard::from_bytes(bytes).map_err(ConfigError::Encoding)?;
        config.validate()?;
        Ok(config)
    }
}
