//! InfluxDB v2 time-series sink
//!
//! Builds line-protocol bodies from sensor readings and posts them through a
//! [`Transport`] supplied by the platform. The HTTP client itself is not part
//! of this crate.

pub mod line;
pub mod uploader;
pub mod writer;

pub use line::{FieldValue, Point, Tag, escape_key, escape_string};
pub use uploader::{Header, Transport, UploadError, Uploader};
pub use writer::{LineProtocolWriter, Reading};

use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use log::info;
use serde::{Deserialize, Serialize};
use thiserror_no_std::Error;

use crate::config::ConfigError;

/// Precision of the timestamps appended to each line.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TimestampUnit {
    #[default]
    Seconds,
    Milliseconds,
    Microseconds,
    Nanoseconds,
}

impl TimestampUnit {
    pub const fn as_str(self) -> &'static str {
        match self {
            TimestampUnit::Seconds => "s",
            TimestampUnit::Milliseconds => "ms",
            TimestampUnit::Microseconds => "us",
            TimestampUnit::Nanoseconds => "ns",
        }
    }

    /// Case-insensitive parse of `s`, `ms`, `us` or `ns`.
    pub fn parse(unit: &str) -> Option<Self> {
        [
            TimestampUnit::Seconds,
            TimestampUnit::Milliseconds,
            TimestampUnit::Microseconds,
            TimestampUnit::Nanoseconds,
        ]
        .into_iter()
        .find(|candidate| candidate.as_str().eq_ignore_ascii_case(unit))
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineProtocolError {
    #[error("sensor mapping table is full ({capacity} entries)")]
    TooManySensors { capacity: usize },
    #[error("tag list is full ({capacity} entries)")]
    TooManyTags { capacity: usize },
    #[error("sensor has no measurement mapping")]
    UnmappedSensor,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(bound(deserialize = "'de: 'a"))]
pub struct InfluxConfig<'a> {
    pub host: &'a str,
    pub port: u16,
    pub org: &'a str,
    pub bucket: &'a str,
    pub token: &'a str,
    pub precision: TimestampUnit,
    pub use_ssl: bool,
    /// Tag every line with the device MAC address.
    pub send_mac: bool,
    /// `None` disables periodic publishing.
    pub update_interval_ms: Option<u32>,
}

impl Default for InfluxConfig<'_> {
    fn default() -> Self {
        Self {
            host: "",
            port: 8086,
            org: "",
            bucket: "",
            token: "",
            precision: TimestampUnit::Seconds,
            use_ssl: true,
            send_mac: true,
            update_interval_ms: Some(60_000),
        }
    }
}

impl InfluxConfig<'_> {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            (self.host, "host"),
            (self.token, "token"),
            (self.bucket, "bucket"),
            (self.org, "organization"),
        ];
        for (value, name) in required {
            if value.is_empty() {
                return Err(ConfigError::Missing(name));
            }
        }
        Ok(())
    }

    /// Write endpoint. The token travels in a header, never in the URL.
    pub fn write_url(&self) -> String {
        format!(
            "{}://{}:{}/api/v2/write?org={}&bucket={}&precision={}",
            if self.use_ssl { "https" } else { "http" },
            self.host,
            self.port,
            self.org,
            self.bucket,
            self.precision.as_str()
        )
    }

    pub fn headers(&self) -> Vec<Header> {
        alloc::vec![
            Header::new("Content-Type", String::from("text/plain; charset=utf-8")),
            Header::new("Authorization", format!("Token {}", self.token)),
            Header::new("Connection", String::from("close")),
        ]
    }

    pub fn dump_config(&self) {
        info!("InfluxDB:");
        info!("  URL: {}", self.write_url());
        info!("  Organization: {}", self.org);
        info!("  Bucket: {}", self.bucket);
        info!("  Timestamp Unit: {}", self.precision.as_str());
        match self.update_interval_ms {
            Some(interval) => info!("  Update Interval: {} ms", interval),
            None => info!("  Update Interval: never (manual only)"),
        }
        info!("  SSL: {}", if self.use_ssl { "YES" } else { "NO" });
        info!("  Send MAC: {}", if self.send_mac { "YES" } else { "NO" });
    }
}
