use alloc::string::String;
use alloc::vec::Vec;
use core::fmt::Debug;

use embedded_hal::delay::DelayNs;
use log::{debug, info, warn};
use thiserror_no_std::Error;

use super::InfluxConfig;
use crate::config::ConfigError;
use crate::retry::JitteredBackoff;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: &'static str,
    pub value: String,
}

impl Header {
    pub fn new(name: &'static str, value: String) -> Self {
        Self { name, value }
    }
}

/// One-shot HTTP POST provided by the platform.
pub trait Transport {
    type Error: Debug;

    /// Post `body` and return the HTTP status code.
    fn post(&mut self, url: &str, headers: &[Header], body: &str) -> Result<u16, Self::Error>;
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UploadError<E: Debug> {
    #[error("server answered HTTP {0}")]
    Status(u16),
    #[error("transport failed: {0:?}")]
    Transport(E),
}

/// Posts line-protocol bodies on a fixed interval.
pub struct Uploader<T> {
    transport: T,
    url: String,
    headers: Vec<Header>,
    backoff: JitteredBackoff,
    interval_ms: Option<u32>,
    last_publish_ms: u64,
}

impl<T: Transport> Uploader<T> {
    pub fn new(config: &InfluxConfig<'_>, transport: T) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            transport,
            url: config.write_url(),
            headers: config.headers(),
            backoff: JitteredBackoff::default(),
            interval_ms: config.update_interval_ms,
            last_publish_ms: 0,
        })
    }

    pub fn with_backoff(mut self, backoff: JitteredBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Whether a periodic publish is due at `now_ms`.
    pub fn due(&self, now_ms: u64) -> bool {
        match self.interval_ms {
            None | Some(0) => false,
            Some(interval) => now_ms.saturating_sub(self.last_publish_ms) >= u64::from(interval),
        }
    }

    /// Post `body`, retrying with jittered backoff. Any 2xx status is success.
    ///
    /// `random` feeds the backoff jitter; `delay` blocks between attempts.
    pub fn publish<D, R>(
        &mut self,
        body: &str,
        now_ms: u64,
        delay: &mut D,
        mut random: R,
    ) -> Result<u16, UploadError<T::Error>>
    where
        D: DelayNs,
        R: FnMut() -> u32,
    {
        self.last_publish_ms = now_ms;
        let attempts = self.backoff.max_retries.saturating_add(1);
        debug!("Request body length: {} bytes", body.len());

        let mut attempt = 0;
        loop {
            attempt += 1;
            let error = match self.transport.post(&self.url, &self.headers, body) {
                Ok(status) if (200..300).contains(&status) => {
                    info!("Successfully published to InfluxDB (HTTP {})", status);
                    return Ok(status);
                }
                Ok(status) => UploadError::Status(status),
                Err(e) => UploadError::Transport(e),
            };

            if attempt >= attempts {
                warn!(
                    "InfluxDB POST failed after {} attempts ({:?})",
                    attempts, error
                );
                return Err(error);
            }

            let backoff = self.backoff.delay_ms(random());
            warn!(
                "POST failed ({:?}), retrying in {} ms (attempt {}/{})",
                error, backoff, attempt, self.backoff.max_retries
            );
            delay.delay_ms(backoff);
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn release(self) -> T {
        self.transport
    }
}
