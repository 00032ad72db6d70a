//! Measurement state machine
//!
//! `Idle → CommandSent → AwaitingResult → Idle`, one pass per poll tick.
//!
//! - `CommandSent`: the measure command is being written (or waiting on a
//!   write retry).
//! - `AwaitingResult`: the command went out; the machine is waiting for the
//!   settle delay or a read retry before reading the 4-byte result.
//!
//! A tick that arrives while the machine is not `Idle` is dropped, so there is
//! never more than one write/read pair in flight.

use embedded_hal::i2c::{ErrorKind, I2c};
use log::{debug, error, warn};

use super::{SenseairDevice, Step};
use crate::protocol::commands::{self, SETTLE_DELAY_MS};
use crate::protocol::{FrameError, decode_measurement};
use crate::retry::{Attempt, RetryCounter, RetryPolicy};
use crate::scheduler::{Scheduler, Wake};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeasurementState {
    Idle,
    CommandSent,
    AwaitingResult,
}

/// How a measurement cycle ended.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MeasurementOutcome {
    /// A valid concentration in ppm.
    Published(f32),
    /// The device reported the measurement is not finished yet.
    NotReady { status: u8 },
    /// The result frame was corrupted.
    ChecksumMismatch,
    /// The bus kept failing until the retry ceiling.
    TransportFailed { attempts: u8 },
}

pub struct MeasurementMachine {
    state: MeasurementState,
    retries: RetryCounter,
    policy: RetryPolicy,
}

impl MeasurementMachine {
    pub const fn new(policy: RetryPolicy) -> Self {
        Self {
            state: MeasurementState::Idle,
            retries: RetryCounter::new(),
            policy,
        }
    }

    pub const fn state(&self) -> MeasurementState {
        self.state
    }

    /// Failed attempts of the bus operation currently in progress.
    pub const fn retries(&self) -> RetryCounter {
        self.retries
    }

    /// Start a new cycle. Returns `None` when a cycle is already in flight.
    pub fn on_tick<I, S>(
        &mut self,
        device: &mut SenseairDevice<I>,
        scheduler: &mut S,
    ) -> Option<Step<MeasurementOutcome>>
    where
        I: I2c,
        S: Scheduler + ?Sized,
    {
        if self.state != MeasurementState::Idle {
            debug!(
                "Senseair: measurement still in progress ({:?}), dropping poll tick",
                self.state
            );
            return None;
        }

        self.state = MeasurementState::CommandSent;
        self.retries.reset();
        Some(self.send_command(device, scheduler))
    }

    /// Resume after a scheduled wake. Returns `None` for a spurious wake.
    pub fn resume<I, S>(
        &mut self,
        device: &mut SenseairDevice<I>,
        scheduler: &mut S,
    ) -> Option<Step<MeasurementOutcome>>
    where
        I: I2c,
        S: Scheduler + ?Sized,
    {
        match self.state {
            MeasurementState::Idle => {
                warn!("Senseair: measurement wake while idle, ignoring");
                None
            }
            MeasurementState::CommandSent => Some(self.send_command(device, scheduler)),
            MeasurementState::AwaitingResult => Some(self.read_result(device, scheduler)),
        }
    }

    fn send_command<I, S>(
        &mut self,
        device: &mut SenseairDevice<I>,
        scheduler: &mut S,
    ) -> Step<MeasurementOutcome>
    where
        I: I2c,
        S: Scheduler + ?Sized,
    {
        let attempt = self.policy.attempt(
            &mut self.retries,
            scheduler,
            Wake::Measurement,
            "write (measure)",
            || device.send(&commands::measure()),
        );

        match attempt {
            Attempt::Done(()) => {
                self.state = MeasurementState::AwaitingResult;
                self.retries.reset();
                scheduler.after(SETTLE_DELAY_MS, Wake::Measurement);
                Step::Waiting
            }
            Attempt::Retrying => Step::Waiting,
            Attempt::Exhausted { attempts, .. } => {
                self.finish(MeasurementOutcome::TransportFailed { attempts })
            }
        }
    }

    fn read_result<I, S>(
        &mut self,
        device: &mut SenseairDevice<I>,
        scheduler: &mut S,
    ) -> Step<MeasurementOutcome>
    where
        I: I2c,
        S: Scheduler + ?Sized,
    {
        let attempt: Attempt<[u8; 4], ErrorKind> = self.policy.attempt(
            &mut self.retries,
            scheduler,
            Wake::Measurement,
            "read (measure)",
            || device.read::<4>(),
        );

        let raw = match attempt {
            Attempt::Done(raw) => raw,
            Attempt::Retrying => return Step::Waiting,
            Attempt::Exhausted { attempts, .. } => {
                return self.finish(MeasurementOutcome::TransportFailed { attempts });
            }
        };

        let outcome = match decode_measurement(raw) {
            Ok(ppm) => MeasurementOutcome::Published(f32::from(ppm)),
            Err(FrameError::NotReady { status }) => {
                warn!(
                    "Senseair: measuring process not finished (status: {:#04x})",
                    status
                );
                MeasurementOutcome::NotReady { status }
            }
            Err(FrameError::ChecksumMismatch { expected, received }) => {
                error!(
                    "Senseair: checksum error (expected: {:#04x}, got: {:#04x})",
                    expected, received
                );
                MeasurementOutcome::ChecksumMismatch
            }
        };

        self.finish(outcome)
    }

    fn finish(&mut self, outcome: MeasurementOutcome) -> Step<MeasurementOutcome> {
        self.state = MeasurementState::Idle;
        Step::Done(outcome)
    }
}
