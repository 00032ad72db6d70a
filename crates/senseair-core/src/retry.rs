//! Bounded retry with backoff
//!
//! Both state machines share one [`RetryPolicy`]. Each logical bus operation
//! (one register read, one register write, one measurement read) owns its own
//! [`RetryCounter`], reset when the operation starts. On a transport failure the
//! policy either schedules the same step again after the retry delay or reports
//! exhaustion; what "exhausted" means is up to the caller.

use core::fmt::Debug;

use log::{error, warn};

use crate::scheduler::{Scheduler, Wake};

/// Failed attempts of the current logical operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryCounter(u8);

impl RetryCounter {
    pub const fn new() -> Self {
        Self(0)
    }

    pub fn reset(&mut self) {
        self.0 = 0;
    }

    pub const fn attempts(&self) -> u8 {
        self.0
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { attempt: u8, delay_ms: u32 },
    Exhausted { attempts: u8 },
}

/// Result of running one attempt through [`RetryPolicy::attempt`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt<T, E> {
    /// The operation succeeded.
    Done(T),
    /// The operation failed and a retry has been scheduled.
    Retrying,
    /// The operation failed and the ceiling was reached.
    Exhausted { attempts: u8, error: E },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u8,
    pub retry_delay_ms: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_delay_ms: 200,
        }
    }
}

impl RetryPolicy {
    pub const fn new(max_retries: u8, retry_delay_ms: u32) -> Self {
        Self {
            max_retries,
            retry_delay_ms,
        }
    }

    /// Record a failure on `counter` and decide whether to try again.
    ///
    /// The counter never exceeds the ceiling.
    pub fn on_failure(&self, counter: &mut RetryCounter) -> RetryDecision {
        let ceiling = self.max_retries.max(1);
        counter.0 = counter.0.saturating_add(1).min(ceiling);

        if counter.0 < ceiling {
            RetryDecision::Retry {
                attempt: counter.0,
                delay_ms: self.retry_delay_ms,
            }
        } else {
            RetryDecision::Exhausted {
                attempts: counter.0,
            }
        }
    }

    /// Run `op` once. On failure, log it and either schedule `wake` after the
    /// retry delay or report exhaustion.
    pub fn attempt<T, E, S>(
        &self,
        counter: &mut RetryCounter,
        scheduler: &mut S,
        wake: Wake,
        operation: &'static str,
        op: impl FnOnce() -> Result<T, E>,
    ) -> Attempt<T, E>
    where
        E: Debug,
        S: Scheduler + ?Sized,
    {
        let error = match op() {
            Ok(value) => return Attempt::Done(value),
            Err(error) => error,
        };

        match self.on_failure(counter) {
            RetryDecision::Retry { attempt, delay_ms } => {
                warn!(
                    "Senseair: {} failed ({:?}), retry {}/{}",
                    operation, error, attempt, self.max_retries
                );
                scheduler.after(delay_ms, wake);
                Attempt::Retrying
            }
            RetryDecision::Exhausted { attempts } => {
                error!(
                    "Senseair: {} failed after {} attempts ({:?}), aborting",
                    operation, attempts, error
                );
                Attempt::Exhausted { attempts, error }
            }
        }
    }
}

/// Randomized backoff for the network-facing uploader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JitteredBackoff {
    pub base_ms: u32,
    pub range_ms: u32,
    pub max_retries: u8,
}

impl Default for JitteredBackoff {
    fn default() -> Self {
        Self {
            base_ms: 500,
            range_ms: 1500,
            max_retries: 2,
        }
    }
}

impl JitteredBackoff {
    /// Delay before the next attempt given a random value from the caller's RNG.
    pub fn delay_ms(&self, random: u32) -> u32 {
        match self.range_ms {
            0 => self.base_ms,
            range => self.base_ms.saturating_add(random % range),
        }
    }
}
