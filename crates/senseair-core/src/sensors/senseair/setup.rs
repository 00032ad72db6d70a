//! Boot-time calibration negotiation
//!
//! `NotStarted → ReadingControl → ConfiguringCalibration → Complete`, once per boot.
//!
//! The meter control register is read and compared to the configured ABC
//! intent. Only a mismatch causes a write, and only the ABC bit is changed.
//! Setup is best effort: every failure path ends in `Complete` and the device
//! keeps whatever calibration state it already had.

use embedded_hal::i2c::{ErrorKind, I2c};
use log::{error, info, warn};

use super::{SenseairDevice, Step};
use crate::config::CalibrationIntent;
use crate::protocol::commands::{self, SETTLE_DELAY_MS};
use crate::protocol::{ControlRegister, FrameError};
use crate::retry::{Attempt, RetryCounter, RetryPolicy};
use crate::scheduler::{Scheduler, Wake};

/// Where the control register read currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlPhase {
    /// The read command is being written.
    Command,
    /// The read command went out; the 3-byte answer is due after the settle delay.
    Response,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupState {
    NotStarted,
    ReadingControl(ControlPhase),
    /// Writing the patched register. Carries the value just read.
    ConfiguringCalibration(ControlRegister),
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupAbort {
    /// The bus kept failing until the retry ceiling.
    Transport {
        operation: &'static str,
        attempts: u8,
    },
    /// The control register echo was corrupted and was not acted upon.
    ChecksumMismatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupOutcome {
    /// The device already matched the configured intent. Nothing was written.
    AlreadyConfigured,
    /// The ABC bit was rewritten. `interval_written` is `None` when disabling,
    /// otherwise whether the best-effort interval write went through.
    Reconfigured {
        enabled: bool,
        interval_written: Option<bool>,
    },
    Abandoned(SetupAbort),
}

pub struct SetupMachine {
    state: SetupState,
    retries: RetryCounter,
    policy: RetryPolicy,
    intent: CalibrationIntent,
    outcome: Option<SetupOutcome>,
}

impl SetupMachine {
    pub const fn new(intent: CalibrationIntent, policy: RetryPolicy) -> Self {
        Self {
            state: SetupState::NotStarted,
            retries: RetryCounter::new(),
            policy,
            intent,
            outcome: None,
        }
    }

    pub const fn state(&self) -> SetupState {
        self.state
    }

    pub const fn is_complete(&self) -> bool {
        matches!(self.state, SetupState::Complete)
    }

    pub const fn outcome(&self) -> Option<SetupOutcome> {
        self.outcome
    }

    pub const fn retries(&self) -> RetryCounter {
        self.retries
    }

    /// Begin setup. Returns `None` if it already ran this boot.
    pub fn start<I, S>(
        &mut self,
        device: &mut SenseairDevice<I>,
        scheduler: &mut S,
    ) -> Option<Step<SetupOutcome>>
    where
        I: I2c,
        S: Scheduler + ?Sized,
    {
        if self.state != SetupState::NotStarted {
            warn!("Senseair: setup already ran ({:?}), ignoring", self.state);
            return None;
        }

        info!("Senseair: reading meter control register");
        self.retries.reset();
        self.state = SetupState::ReadingControl(ControlPhase::Command);
        Some(self.request_control(device, scheduler))
    }

    /// Resume after a scheduled wake. Returns `None` for a spurious wake.
    pub fn resume<I, S>(
        &mut self,
        device: &mut SenseairDevice<I>,
        scheduler: &mut S,
    ) -> Option<Step<SetupOutcome>>
    where
        I: I2c,
        S: Scheduler + ?Sized,
    {
        match self.state {
            SetupState::ReadingControl(ControlPhase::Command) => {
                Some(self.request_control(device, scheduler))
            }
            SetupState::ReadingControl(ControlPhase::Response) => {
                Some(self.read_control(device, scheduler))
            }
            SetupState::ConfiguringCalibration(register) => {
                Some(self.write_control(register, device, scheduler))
            }
            SetupState::NotStarted | SetupState::Complete => {
                warn!("Senseair: setup wake in {:?}, ignoring", self.state);
                None
            }
        }
    }

    fn request_control<I, S>(
        &mut self,
        device: &mut SenseairDevice<I>,
        scheduler: &mut S,
    ) -> Step<SetupOutcome>
    where
        I: I2c,
        S: Scheduler + ?Sized,
    {
        let attempt = self.policy.attempt(
            &mut self.retries,
            scheduler,
            Wake::Setup,
            "write (meter control)",
            || device.send(&commands::read_meter_control()),
        );

        match attempt {
            Attempt::Done(()) => {
                self.state = SetupState::ReadingControl(ControlPhase::Response);
                scheduler.after(SETTLE_DELAY_MS, Wake::Setup);
                Step::Waiting
            }
            Attempt::Retrying => Step::Waiting,
            Attempt::Exhausted { attempts, .. } => {
                self.finish(SetupOutcome::Abandoned(SetupAbort::Transport {
                    operation: "read meter control",
                    attempts,
                }))
            }
        }
    }

    fn read_control<I, S>(
        &mut self,
        device: &mut SenseairDevice<I>,
        scheduler: &mut S,
    ) -> Step<SetupOutcome>
    where
        I: I2c,
        S: Scheduler + ?Sized,
    {
        let attempt: Attempt<[u8; 3], ErrorKind> = self.policy.attempt(
            &mut self.retries,
            scheduler,
            Wake::Setup,
            "read (meter control)",
            || device.read::<3>(),
        );

        let raw = match attempt {
            Attempt::Done(raw) => raw,
            Attempt::Retrying => {
                // The device only answers right after the command, so the
                // retry re-issues it. Same logical operation, same counter.
                self.state = SetupState::ReadingControl(ControlPhase::Command);
                return Step::Waiting;
            }
            Attempt::Exhausted { attempts, .. } => {
                return self.finish(SetupOutcome::Abandoned(SetupAbort::Transport {
                    operation: "read meter control",
                    attempts,
                }));
            }
        };

        let register = match ControlRegister::decode(raw) {
            Ok(register) => register,
            Err(FrameError::ChecksumMismatch { expected, received }) => {
                error!(
                    "Senseair: checksum error when reading meter control byte (expected: {:#04x}, got: {:#04x})",
                    expected, received
                );
                return self.finish(SetupOutcome::Abandoned(SetupAbort::ChecksumMismatch));
            }
            Err(other) => {
                error!("Senseair: unexpected meter control response: {:?}", other);
                return self.finish(SetupOutcome::Abandoned(SetupAbort::ChecksumMismatch));
            }
        };

        let live = register.abc_enabled();
        info!(
            "Senseair: config wants ABC {} (interval {}s), sensor currently {}",
            on_off(self.intent.enabled),
            self.intent.interval_secs,
            on_off(live)
        );

        if live == self.intent.enabled {
            info!("Senseair: initialized (no ABC update needed)");
            return self.finish(SetupOutcome::AlreadyConfigured);
        }

        self.state = SetupState::ConfiguringCalibration(register);
        self.retries.reset();
        self.write_control(register, device, scheduler)
    }

    fn write_control<I, S>(
        &mut self,
        register: ControlRegister,
        device: &mut SenseairDevice<I>,
        scheduler: &mut S,
    ) -> Step<SetupOutcome>
    where
        I: I2c,
        S: Scheduler + ?Sized,
    {
        let enabled = self.intent.enabled;
        let frame = commands::write_meter_control(register.patched(enabled));

        let attempt = self.policy.attempt(
            &mut self.retries,
            scheduler,
            Wake::Setup,
            "write (ABC config)",
            || device.send(&frame),
        );

        match attempt {
            Attempt::Done(()) => {
                info!("Senseair: ABC updated to {}", on_off(enabled));
                let interval_written = enabled.then(|| self.write_interval(device));
                self.finish(SetupOutcome::Reconfigured {
                    enabled,
                    interval_written,
                })
            }
            Attempt::Retrying => Step::Waiting,
            Attempt::Exhausted { attempts, .. } => {
                self.finish(SetupOutcome::Abandoned(SetupAbort::Transport {
                    operation: "write ABC config",
                    attempts,
                }))
            }
        }
    }

    /// Single best-effort write; the device keeps its default period on failure.
    fn write_interval<I: I2c>(&self, device: &mut SenseairDevice<I>) -> bool {
        let interval = self.intent.interval_secs;
        match device.send(&commands::abc_interval(interval)) {
            Ok(()) => {
                info!("Senseair: ABC interval set to {} seconds", interval);
                true
            }
            Err(e) => {
                error!("Senseair: failed to update ABC interval: {:?}", e);
                false
            }
        }
    }

    fn finish(&mut self, outcome: SetupOutcome) -> Step<SetupOutcome> {
        self.state = SetupState::Complete;
        self.outcome = Some(outcome);
        Step::Done(outcome)
    }
}

const fn on_off(enabled: bool) -> &'static str {
    if enabled { "ENABLED" } else { "DISABLED" }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::checksum;
    use crate::scheduler::{Event, TimerQueue};
    use embedded_hal_mock::eh1::i2c::{Mock as I2cMock, Transaction as I2cTransaction};

    const ADDR: u8 = 0x68;
    const READ_CONTROL: [u8; 4] = [0x41, 0x00, 0x3E, 0x7F];

    fn control_echo(byte0: u8, byte1: u8) -> Vec<u8> {
        vec![byte0, byte1, checksum(&[byte0, byte1])]
    }

    fn intent(enabled: bool, interval_secs: u16) -> CalibrationIntent {
        CalibrationIntent {
            enabled,
            interval_secs,
        }
    }

    fn run(
        machine: &mut SetupMachine,
        device: &mut SenseairDevice<I2cMock>,
        queue: &mut TimerQueue,
    ) -> SetupOutcome {
        let mut step = machine.start(device, queue).expect("setup starts");
        loop {
            if let Step::Done(outcome) = step {
                return outcome;
            }
            let deadline = queue.next_wake().expect("a pending setup wake");
            queue.set_now(deadline);
            assert_eq!(queue.pop_due(), Some(Event::Wake(Wake::Setup)));
            step = machine.resume(device, queue).expect("setup in progress");
        }
    }

    #[test]
    fn test_matching_register_writes_nothing() {
        let expectations = [
            I2cTransaction::write(ADDR, READ_CONTROL.to_vec()),
            I2cTransaction::read(ADDR, control_echo(0x02, 0x02)),
        ];
        let mut i2c = I2cMock::new(&expectations);
        let mut device = SenseairDevice::new(i2c.clone(), ADDR);
        let mut queue = TimerQueue::new(0, 60_000);
        let mut machine = SetupMachine::new(intent(true, 1000), RetryPolicy::default());

        assert_eq!(
            run(&mut machine, &mut device, &mut queue),
            SetupOutcome::AlreadyConfigured
        );
        assert!(machine.is_complete());
        i2c.done();
    }

    #[test]
    fn test_enabling_patches_bit_and_writes_interval() {
        let expectations = [
            I2cTransaction::write(ADDR, READ_CONTROL.to_vec()),
            I2cTransaction::read(ADDR, control_echo(0x00, 0x00)),
            I2cTransaction::write(ADDR, vec![0x31, 0x00, 0x3E, 0x02, 0x71]),
            I2cTransaction::write(ADDR, vec![0x01, 0x40, 0x03, 0xE8]),
        ];
        let mut i2c = I2cMock::new(&expectations);
        let mut device = SenseairDevice::new(i2c.clone(), ADDR);
        let mut queue = TimerQueue::new(0, 60_000);
        let mut machine = SetupMachine::new(intent(true, 1000), RetryPolicy::default());

        assert_eq!(
            run(&mut machine, &mut device, &mut queue),
            SetupOutcome::Reconfigured {
                enabled: true,
                interval_written: Some(true)
            }
        );
        i2c.done();
    }

    #[test]
    fn test_disabling_preserves_other_bits_and_skips_interval() {
        let expectations = [
            I2cTransaction::write(ADDR, READ_CONTROL.to_vec()),
            I2cTransaction::read(ADDR, control_echo(0x00, 0xF7)),
            I2cTransaction::write(ADDR, vec![0x31, 0x00, 0x3E, 0xF5, 0x64]),
        ];
        let mut i2c = I2cMock::new(&expectations);
        let mut device = SenseairDevice::new(i2c.clone(), ADDR);
        let mut queue = TimerQueue::new(0, 60_000);
        let mut machine = SetupMachine::new(intent(false, 1000), RetryPolicy::default());

        assert_eq!(
            run(&mut machine, &mut device, &mut queue),
            SetupOutcome::Reconfigured {
                enabled: false,
                interval_written: None
            }
        );
        i2c.done();
    }

    #[test]
    fn test_corrupted_register_is_never_acted_upon() {
        let expectations = [
            I2cTransaction::write(ADDR, READ_CONTROL.to_vec()),
            I2cTransaction::read(ADDR, vec![0x00, 0x00, 0x01]),
        ];
        let mut i2c = I2cMock::new(&expectations);
        let mut device = SenseairDevice::new(i2c.clone(), ADDR);
        let mut queue = TimerQueue::new(0, 60_000);
        let mut machine = SetupMachine::new(intent(true, 1000), RetryPolicy::default());

        assert_eq!(
            run(&mut machine, &mut device, &mut queue),
            SetupOutcome::Abandoned(SetupAbort::ChecksumMismatch)
        );
        assert!(queue.is_idle());
        i2c.done();
    }

    #[test]
    fn test_read_failure_reissues_command() {
        let expectations = [
            I2cTransaction::write(ADDR, READ_CONTROL.to_vec()),
            I2cTransaction::read(ADDR, vec![0; 3]).with_error(ErrorKind::Other),
            I2cTransaction::write(ADDR, READ_CONTROL.to_vec()),
            I2cTransaction::read(ADDR, control_echo(0x00, 0x02)),
        ];
        let mut i2c = I2cMock::new(&expectations);
        let mut device = SenseairDevice::new(i2c.clone(), ADDR);
        let mut queue = TimerQueue::new(0, 60_000);
        let mut machine = SetupMachine::new(intent(true, 1000), RetryPolicy::default());

        assert_eq!(
            run(&mut machine, &mut device, &mut queue),
            SetupOutcome::AlreadyConfigured
        );
        i2c.done();
    }

    #[test]
    fn test_read_command_exhaustion_completes_setup() {
        let failing = I2cTransaction::write(ADDR, READ_CONTROL.to_vec()).with_error(ErrorKind::Other);
        let expectations = [failing.clone(), failing.clone(), failing];
        let mut i2c = I2cMock::new(&expectations);
        let mut device = SenseairDevice::new(i2c.clone(), ADDR);
        let mut queue = TimerQueue::new(0, 60_000);
        let mut machine = SetupMachine::new(intent(true, 1000), RetryPolicy::new(3, 200));

        assert_eq!(
            run(&mut machine, &mut device, &mut queue),
            SetupOutcome::Abandoned(SetupAbort::Transport {
                operation: "read meter control",
                attempts: 3
            })
        );
        assert!(machine.is_complete());
        assert!(queue.is_idle());
        i2c.done();
    }

    #[test]
    fn test_config_write_retries_with_fresh_counter() {
        let patch = vec![0x31, 0x00, 0x3E, 0x02, 0x71];
        let expectations = [
            I2cTransaction::write(ADDR, READ_CONTROL.to_vec()).with_error(ErrorKind::Other),
            I2cTransaction::write(ADDR, READ_CONTROL.to_vec()),
            I2cTransaction::read(ADDR, control_echo(0x00, 0x00)),
            I2cTransaction::write(ADDR, patch.clone()).with_error(ErrorKind::Other),
            I2cTransaction::write(ADDR, patch),
            I2cTransaction::write(ADDR, vec![0x01, 0x40, 0x03, 0xE8]),
        ];
        let mut i2c = I2cMock::new(&expectations);
        let mut device = SenseairDevice::new(i2c.clone(), ADDR);
        let mut queue = TimerQueue::new(0, 60_000);
        let mut machine = SetupMachine::new(intent(true, 1000), RetryPolicy::new(2, 200));

        assert_eq!(
            run(&mut machine, &mut device, &mut queue),
            SetupOutcome::Reconfigured {
                enabled: true,
                interval_written: Some(true)
            }
        );
        i2c.done();
    }

    #[test]
    fn test_config_write_exhaustion_abandons() {
        let patch = I2cTransaction::write(ADDR, vec![0x31, 0x00, 0x3E, 0x02, 0x71])
            .with_error(ErrorKind::Other);
        let expectations = [
            I2cTransaction::write(ADDR, READ_CONTROL.to_vec()),
            I2cTransaction::read(ADDR, control_echo(0x00, 0x00)),
            patch.clone(),
            patch,
        ];
        let mut i2c = I2cMock::new(&expectations);
        let mut device = SenseairDevice::new(i2c.clone(), ADDR);
        let mut queue = TimerQueue::new(0, 60_000);
        let mut machine = SetupMachine::new(intent(true, 1000), RetryPolicy::new(2, 200));

        assert_eq!(
            run(&mut machine, &mut device, &mut queue),
            SetupOutcome::Abandoned(SetupAbort::Transport {
                operation: "write ABC config",
                attempts: 2
            })
        );
        i2c.done();
    }

    #[test]
    fn test_interval_failure_does_not_undo_enable() {
        let expectations = [
            I2cTransaction::write(ADDR, READ_CONTROL.to_vec()),
            I2cTransaction::read(ADDR, control_echo(0x00, 0x00)),
            I2cTransaction::write(ADDR, vec![0x31, 0x00, 0x3E, 0x02, 0x71]),
            I2cTransaction::write(ADDR, vec![0x01, 0x40, 0x03, 0xE8]).with_error(ErrorKind::Other),
        ];
        let mut i2c = I2cMock::new(&expectations);
        let mut device = SenseairDevice::new(i2c.clone(), ADDR);
        let mut queue = TimerQueue::new(0, 60_000);
        let mut machine = SetupMachine::new(intent(true, 1000), RetryPolicy::default());

        assert_eq!(
            run(&mut machine, &mut device, &mut queue),
            SetupOutcome::Reconfigured {
                enabled: true,
                interval_written: Some(false)
            }
        );
        // No retry of either write was scheduled.
        assert!(queue.is_idle());
        i2c.done();
    }

    #[test]
    fn test_second_boot_against_matching_device_writes_nothing() {
        // First boot enables ABC; the device now reports it enabled.
        let expectations = [
            I2cTransaction::write(ADDR, READ_CONTROL.to_vec()),
            I2cTransaction::read(ADDR, control_echo(0x00, 0x00)),
            I2cTransaction::write(ADDR, vec![0x31, 0x00, 0x3E, 0x02, 0x71]),
            I2cTransaction::write(ADDR, vec![0x01, 0x40, 0x03, 0xE8]),
            I2cTransaction::write(ADDR, READ_CONTROL.to_vec()),
            I2cTransaction::read(ADDR, control_echo(0x00, 0x02)),
        ];
        let mut i2c = I2cMock::new(&expectations);
        let mut device = SenseairDevice::new(i2c.clone(), ADDR);

        let mut queue = TimerQueue::new(0, 60_000);
        let mut first_boot = SetupMachine::new(intent(true, 1000), RetryPolicy::default());
        run(&mut first_boot, &mut device, &mut queue);

        let mut queue = TimerQueue::new(0, 60_000);
        let mut second_boot = SetupMachine::new(intent(true, 1000), RetryPolicy::default());
        assert_eq!(
            run(&mut second_boot, &mut device, &mut queue),
            SetupOutcome::AlreadyConfigured
        );
        i2c.done();
    }

    #[test]
    fn test_setup_runs_once_per_boot() {
        let expectations = [
            I2cTransaction::write(ADDR, READ_CONTROL.to_vec()),
            I2cTransaction::read(ADDR, control_echo(0x00, 0x02)),
        ];
        let mut i2c = I2cMock::new(&expectations);
        let mut device = SenseairDevice::new(i2c.clone(), ADDR);
        let mut queue = TimerQueue::new(0, 60_000);
        let mut machine = SetupMachine::new(intent(true, 1000), RetryPolicy::default());

        run(&mut machine, &mut device, &mut queue);
        assert_eq!(machine.start(&mut device, &mut queue), None);
        assert_eq!(machine.resume(&mut device, &mut queue), None);
        i2c.done();
    }
}
