//! Senseair K30/K33 CO₂ sensor
//!
//! [`Senseair`] ties the boot-time [`setup`] negotiation and the periodic
//! [`measurement`] cycle to one bus handle and one value sink. It never blocks:
//! the host loop feeds it [`Event`]s and provides a [`Scheduler`] for the
//! delays it asks for.

pub mod measurement;
pub mod setup;

use embedded_hal::i2c::{Error as _, ErrorKind, I2c};
use log::{debug, info, warn};

use measurement::{MeasurementMachine, MeasurementOutcome, MeasurementState};
use setup::{SetupMachine, SetupOutcome, SetupState};

use super::SensorSink;
use crate::config::{Config, ConfigError};
use crate::protocol::CommandFrame;
use crate::scheduler::{Event, Scheduler, Wake};

/// Progress of a state machine after one call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Step<T> {
    /// A continuation has been scheduled.
    Waiting,
    /// The machine went back to rest with this outcome.
    Done(T),
}

/// Bus handle bound to the sensor's address.
pub struct SenseairDevice<I> {
    i2c: I,
    address: u8,
}

impl<I> SenseairDevice<I> {
    pub const fn new(i2c: I, address: u8) -> Self {
        Self { i2c, address }
    }

    pub const fn address(&self) -> u8 {
        self.address
    }

    pub fn release(self) -> I {
        self.i2c
    }
}

impl<I: I2c> SenseairDevice<I> {
    /// Write one command frame.
    pub fn send(&mut self, frame: &CommandFrame) -> Result<(), ErrorKind> {
        self.i2c
            .write(self.address, frame.as_bytes())
            .map_err(|e| e.kind())
    }

    /// Read a fixed-size response.
    pub fn read<const N: usize>(&mut self) -> Result<[u8; N], ErrorKind> {
        let mut buf = [0u8; N];
        self.i2c
            .read(self.address, &mut buf)
            .map_err(|e| e.kind())?;
        Ok(buf)
    }
}

pub struct Senseair<I, K> {
    device: SenseairDevice<I>,
    config: Config,
    setup: SetupMachine,
    measurement: MeasurementMachine,
    sink: K,
    last_measurement: Option<f32>,
    warning: bool,
}

impl<I: I2c, K: SensorSink> Senseair<I, K> {
    /// Bind a validated configuration to a bus handle and a value sink.
    pub fn new(i2c: I, config: Config, sink: K) -> Result<Self, ConfigError> {
        config.validate()?;
        let policy = config.retry_policy();

        Ok(Self {
            device: SenseairDevice::new(i2c, config.address),
            config,
            setup: SetupMachine::new(config.calibration, policy),
            measurement: MeasurementMachine::new(policy),
            sink,
            last_measurement: None,
            warning: false,
        })
    }

    /// Run the calibration setup. Only the first call does anything.
    pub fn start<S: Scheduler + ?Sized>(&mut self, scheduler: &mut S) {
        if let Some(step) = self.setup.start(&mut self.device, scheduler) {
            self.on_setup_step(step);
        }
    }

    /// Start a measurement cycle, unless setup is still running or a cycle is
    /// already in flight.
    pub fn on_poll_tick<S: Scheduler + ?Sized>(&mut self, scheduler: &mut S) {
        if !self.setup.is_complete() {
            debug!(
                "Senseair: setup not complete ({:?}), dropping poll tick",
                self.setup.state()
            );
            return;
        }

        if let Some(step) = self.measurement.on_tick(&mut self.device, scheduler) {
            self.on_measurement_step(step);
        }
    }

    pub fn on_wake<S: Scheduler + ?Sized>(&mut self, wake: Wake, scheduler: &mut S) {
        match wake {
            Wake::Setup => {
                if let Some(step) = self.setup.resume(&mut self.device, scheduler) {
                    self.on_setup_step(step);
                }
            }
            Wake::Measurement => {
                if let Some(step) = self.measurement.resume(&mut self.device, scheduler) {
                    self.on_measurement_step(step);
                }
            }
        }
    }

    pub fn dispatch<S: Scheduler + ?Sized>(&mut self, event: Event, scheduler: &mut S) {
        match event {
            Event::Poll => self.on_poll_tick(scheduler),
            Event::Wake(wake) => self.on_wake(wake, scheduler),
        }
    }

    fn on_setup_step(&mut self, step: Step<SetupOutcome>) {
        if let Step::Done(SetupOutcome::Abandoned(reason)) = step {
            warn!(
                "Senseair: continuing with device calibration unchanged ({:?})",
                reason
            );
            self.warning = true;
        }
    }

    fn on_measurement_step(&mut self, step: Step<MeasurementOutcome>) {
        match step {
            Step::Waiting => {}
            Step::Done(MeasurementOutcome::Published(ppm)) => {
                debug!("Senseair: CO2 {} ppm", ppm);
                self.last_measurement = Some(ppm);
                self.warning = false;
                self.sink.publish(ppm);
            }
            Step::Done(_) => self.warning = true,
        }
    }
}

impl<I, K> Senseair<I, K> {
    pub const fn config(&self) -> &Config {
        &self.config
    }

    pub const fn setup_state(&self) -> SetupState {
        self.setup.state()
    }

    pub const fn setup_outcome(&self) -> Option<SetupOutcome> {
        self.setup.outcome()
    }

    pub const fn measurement_state(&self) -> MeasurementState {
        self.measurement.state()
    }

    /// Last valid concentration in ppm.
    pub const fn last_measurement(&self) -> Option<f32> {
        self.last_measurement
    }

    /// Set when the last measurement cycle failed or setup was abandoned.
    pub const fn has_warning(&self) -> bool {
        self.warning
    }

    pub const fn sink(&self) -> &K {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut K {
        &mut self.sink
    }

    pub fn release(self) -> (I, K) {
        (self.device.release(), self.sink)
    }

    pub fn dump_config(&self) {
        let calibration = self.config.calibration;
        info!("Senseair:");
        info!("  Address: {:#04x}", self.device.address());
        if calibration.enabled {
            info!(
                "  Automatic baseline calibration: ENABLED (interval {:.1} hours)",
                f32::from(calibration.interval_secs) / 3600.0
            );
        } else {
            info!("  Automatic baseline calibration: DISABLED");
        }
        info!("  Update interval: {} s", self.config.poll_interval_secs);
        info!(
            "  Retries: {} (delay {} ms)",
            self.config.max_retries, self.config.retry_delay_ms
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CalibrationIntent;
    use crate::protocol::checksum;
    use crate::scheduler::TimerQueue;
    use crate::sensors::LatestReading;
    use embedded_hal_mock::eh1::i2c::{Mock as I2cMock, Transaction as I2cTransaction};

    const ADDR: u8 = 0x68;
    const READ_CONTROL: [u8; 4] = [0x41, 0x00, 0x3E, 0x7F];
    const MEASURE: [u8; 4] = [0x22, 0x00, 0x08, 0x2A];

    fn control_echo(byte0: u8, byte1: u8) -> Vec<u8> {
        vec![byte0, byte1, checksum(&[byte0, byte1])]
    }

    fn config() -> Config {
        Config {
            calibration: CalibrationIntent {
                enabled: true,
                interval_secs: 1000,
            },
            poll_interval_secs: 60,
            ..Config::default()
        }
    }

    /// Deliver every event due up to `until_ms`, advancing the clock as needed.
    fn drive(engine: &mut Senseair<I2cMock, LatestReading>, queue: &mut TimerQueue, until_ms: u64) {
        loop {
            while let Some(event) = queue.pop_due() {
                engine.dispatch(event, queue);
            }
            let next = queue.next_deadline();
            if next > until_ms {
                break;
            }
            queue.set_now(next);
        }
    }

    #[test]
    fn test_setup_then_measure() {
        let expectations = [
            I2cTransaction::write(ADDR, READ_CONTROL.to_vec()),
            I2cTransaction::read(ADDR, control_echo(0x00, 0x02)),
            I2cTransaction::write(ADDR, MEASURE.to_vec()),
            I2cTransaction::read(ADDR, vec![0x01, 0x03, 0x84, 0x88]),
        ];
        let mut i2c = I2cMock::new(&expectations);
        let mut engine = Senseair::new(i2c.clone(), config(), LatestReading::new()).unwrap();
        let mut queue = TimerQueue::new(0, engine.config().poll_interval_ms());

        engine.start(&mut queue);
        drive(&mut engine, &mut queue, 60_100);

        assert_eq!(engine.setup_state(), SetupState::Complete);
        assert_eq!(engine.setup_outcome(), Some(SetupOutcome::AlreadyConfigured));
        assert_eq!(engine.measurement_state(), MeasurementState::Idle);
        assert_eq!(engine.last_measurement(), Some(900.0));
        assert_eq!(engine.sink().value(), Some(900.0));
        assert!(!engine.has_warning());
        i2c.done();
    }

    #[test]
    fn test_ticks_before_setup_completes_are_dropped() {
        let expectations = [
            I2cTransaction::write(ADDR, READ_CONTROL.to_vec()),
            I2cTransaction::read(ADDR, control_echo(0x00, 0x02)),
        ];
        let mut i2c = I2cMock::new(&expectations);
        let mut engine = Senseair::new(i2c.clone(), config(), LatestReading::new()).unwrap();
        let mut queue = TimerQueue::new(0, 60_000);

        // Pending ticks before start never reach the bus.
        engine.on_poll_tick(&mut queue);
        engine.start(&mut queue);
        assert_eq!(engine.setup_state(), SetupState::ReadingControl(setup::ControlPhase::Response));

        // A tick while the control read is pending is dropped too.
        engine.on_poll_tick(&mut queue);
        assert_eq!(engine.measurement_state(), MeasurementState::Idle);

        drive(&mut engine, &mut queue, 1_000);
        assert_eq!(engine.setup_state(), SetupState::Complete);
        assert_eq!(engine.sink().published(), 0);
        i2c.done();
    }

    #[test]
    fn test_start_is_idempotent() {
        let expectations = [
            I2cTransaction::write(ADDR, READ_CONTROL.to_vec()),
            I2cTransaction::read(ADDR, control_echo(0x00, 0x02)),
        ];
        let mut i2c = I2cMock::new(&expectations);
        let mut engine = Senseair::new(i2c.clone(), config(), LatestReading::new()).unwrap();
        let mut queue = TimerQueue::new(0, 60_000);

        engine.start(&mut queue);
        engine.start(&mut queue);
        drive(&mut engine, &mut queue, 1_000);
        engine.start(&mut queue);

        assert_eq!(engine.setup_outcome(), Some(SetupOutcome::AlreadyConfigured));
        assert!(queue.is_idle());
        i2c.done();
    }

    #[test]
    fn test_abandoned_setup_warns_until_a_reading_arrives() {
        let expectations = [
            I2cTransaction::write(ADDR, READ_CONTROL.to_vec()),
            I2cTransaction::read(ADDR, vec![0x00, 0x02, 0xFF]),
            I2cTransaction::write(ADDR, MEASURE.to_vec()),
            I2cTransaction::read(ADDR, vec![0x01, 0x01, 0x90, 0x92]),
        ];
        let mut i2c = I2cMock::new(&expectations);
        let mut engine = Senseair::new(i2c.clone(), config(), LatestReading::new()).unwrap();
        let mut queue = TimerQueue::new(0, 60_000);

        engine.start(&mut queue);
        drive(&mut engine, &mut queue, 1_000);
        assert!(matches!(
            engine.setup_outcome(),
            Some(SetupOutcome::Abandoned(setup::SetupAbort::ChecksumMismatch))
        ));
        assert!(engine.has_warning());

        drive(&mut engine, &mut queue, 60_100);
        assert_eq!(engine.last_measurement(), Some(400.0));
        assert!(!engine.has_warning());
        i2c.done();
    }

    #[test]
    fn test_failed_cycle_keeps_last_value_and_warns() {
        let expectations = [
            I2cTransaction::write(ADDR, READ_CONTROL.to_vec()),
            I2cTransaction::read(ADDR, control_echo(0x00, 0x02)),
            I2cTransaction::write(ADDR, MEASURE.to_vec()),
            I2cTransaction::read(ADDR, vec![0x01, 0x03, 0x84, 0x88]),
            I2cTransaction::write(ADDR, MEASURE.to_vec()),
            I2cTransaction::read(ADDR, vec![0x00, 0x03, 0x84, 0x87]),
        ];
        let mut i2c = I2cMock::new(&expectations);
        let mut engine = Senseair::new(i2c.clone(), config(), LatestReading::new()).unwrap();
        let mut queue = TimerQueue::new(0, 60_000);

        engine.start(&mut queue);
        drive(&mut engine, &mut queue, 120_100);

        assert_eq!(engine.last_measurement(), Some(900.0));
        assert_eq!(engine.sink().published(), 1);
        assert!(engine.has_warning());
        i2c.done();
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let bad = Config {
            max_retries: 0,
            ..Config::default()
        };
        let mut i2c = I2cMock::new(&[]);
        assert!(matches!(
            Senseair::new(i2c.clone(), bad, LatestReading::new()),
            Err(ConfigError::NoAttempts)
        ));
        i2c.done();
    }

    #[test]
    fn test_release_returns_bus_and_sink() {
        let mut i2c = I2cMock::new(&[]);
        let engine = Senseair::new(i2c.clone(), config(), LatestReading::new()).unwrap();
        engine.dump_config();
        let (_bus, sink) = engine.release();
        assert_eq!(sink.value(), None);
        i2c.done();
    }
}
