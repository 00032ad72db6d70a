//! Desktop simulator for the senseair-relay engine.
//!
//! Runs the senseair-core setup and measurement state machines against a
//! virtual K30 on a virtual clock, so a day of polling finishes in a moment.
//! The virtual sensor injects bus errors, not-ready frames and corrupted
//! checksums on a fixed schedule. Readings are turned into line protocol and
//! "posted" by a transport that only logs the request.
//!
//! Set `RUST_LOG=debug` to see every bus transaction.

use std::time::{SystemTime, UNIX_EPOCH};

use embedded_hal::delay::DelayNs;
use embedded_hal::i2c::{ErrorKind, ErrorType, I2c, NoAcknowledgeSource, Operation};
use log::{debug, error, info, warn};

use senseair_core::config::Config;
use senseair_core::influxdb::{
    FieldValue, Header, InfluxConfig, LineProtocolError, LineProtocolWriter, Reading, Transport,
    Uploader,
};
use senseair_core::protocol::commands::{
    ABC_INTERVAL_PREFIX, DEFAULT_ADDRESS, OP_READ_EEPROM, OP_READ_RAM, OP_WRITE_EEPROM,
    STATUS_READY,
};
use senseair_core::protocol::checksum;
use senseair_core::scheduler::TimerQueue;
use senseair_core::sensors::{LatestReading, Senseair};

// ---------------------------------------------------------------------------
// Simulation constants
// ---------------------------------------------------------------------------

/// Virtual time covered by one run.
const SIMULATED_DURATION_MS: u64 = 24 * 60 * 60 * 1000;

/// Sensor object id used for the line-protocol mapping.
const SENSOR_ID: &str = "k30_co2";

/// Stand-in for the station MAC address.
const SIMULATED_MAC: &str = "02:00:00:00:00:01";

// ---------------------------------------------------------------------------
// Virtual sensor
// ---------------------------------------------------------------------------

/// Which transactions misbehave. `0` disables a fault.
#[derive(Debug, Clone, Copy)]
struct FaultPlan {
    bus_error_every: u32,
    not_ready_every: u32,
    corrupt_every: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    Nothing,
    Co2,
    MeterControl,
}

#[derive(Debug, Default)]
struct Stats {
    transactions: u32,
    bus_errors: u32,
    not_ready: u32,
    corrupted: u32,
    config_writes: u32,
}

/// K30 behaviour model: RAM/EEPROM command decoding with scripted faults.
struct SimulatedK30 {
    address: u8,
    faults: FaultPlan,
    pending: Pending,
    meter_control: [u8; 2],
    abc_interval_secs: Option<u16>,
    measurements: u32,
    stats: Stats,
}

impl SimulatedK30 {
    fn new(faults: FaultPlan) -> Self {
        Self {
            address: DEFAULT_ADDRESS,
            faults,
            pending: Pending::Nothing,
            // Factory state: ABC off.
            meter_control: [0x00, 0x00],
            abc_interval_secs: None,
            measurements: 0,
            stats: Stats::default(),
        }
    }

    fn hits(every: u32, count: u32) -> bool {
        every != 0 && count % every == 0
    }

    /// Indoor CO₂ swinging 450–1150 ppm over a simulated day.
    fn co2_ppm(&self) -> u16 {
        let t = f64::from(self.measurements);
        (800.0 + 300.0 * (t / 229.0).sin() + 50.0 * (t / 17.0).cos()) as u16
    }

    fn on_write(&mut self, bytes: &[u8]) -> Result<(), ErrorKind> {
        match bytes {
            [prefix0, prefix1, high, low] if [*prefix0, *prefix1] == ABC_INTERVAL_PREFIX => {
                let interval = u16::from_be_bytes([*high, *low]);
                info!("[k30] ABC period set to {} s", interval);
                self.abc_interval_secs = Some(interval);
            }
            [OP_READ_RAM, _, _, cs] if checksum(&bytes[..3]) == *cs => self.pending = Pending::Co2,
            [OP_READ_EEPROM, _, _, cs] if checksum(&bytes[..3]) == *cs => {
                self.pending = Pending::MeterControl
            }
            [OP_WRITE_EEPROM, _, _, value, cs] if checksum(&bytes[..4]) == *cs => {
                info!("[k30] meter control byte written: {:#04x}", value);
                self.meter_control[1] = *value;
                self.stats.config_writes += 1;
            }
            other => {
                warn!("[k30] rejecting malformed command {:02x?}", other);
                return Err(ErrorKind::NoAcknowledge(NoAcknowledgeSource::Data));
            }
        }
        Ok(())
    }

    fn on_read(&mut self, buffer: &mut [u8]) -> Result<(), ErrorKind> {
        let pending = core::mem::replace(&mut self.pending, Pending::Nothing);
        match (pending, buffer.len()) {
            (Pending::Co2, 4) => {
                self.measurements += 1;
                let [high, low] = self.co2_ppm().to_be_bytes();
                let status = if Self::hits(self.faults.not_ready_every, self.measurements) {
                    self.stats.not_ready += 1;
                    0x00
                } else {
                    STATUS_READY
                };
                let mut cs = checksum(&[status, high, low]);
                if Self::hits(self.faults.corrupt_every, self.measurements) {
                    self.stats.corrupted += 1;
                    cs = cs.wrapping_add(1);
                }
                buffer.copy_from_slice(&[status, high, low, cs]);
            }
            (Pending::MeterControl, 3) => {
                let [b0, b1] = self.meter_control;
                buffer.copy_from_slice(&[b0, b1, checksum(&self.meter_control)]);
            }
            (pending, len) => {
                warn!("[k30] unexpected {}-byte read (pending {:?})", len, pending);
                return Err(ErrorKind::NoAcknowledge(NoAcknowledgeSource::Address));
            }
        }
        Ok(())
    }
}

impl ErrorType for SimulatedK30 {
    type Error = ErrorKind;
}

impl I2c for SimulatedK30 {
    fn transaction(
        &mut self,
        address: u8,
        operations: &mut [Operation<'_>],
    ) -> Result<(), Self::Error> {
        self.stats.transactions += 1;

        if address != self.address {
            return Err(ErrorKind::NoAcknowledge(NoAcknowledgeSource::Address));
        }
        if Self::hits(self.faults.bus_error_every, self.stats.transactions) {
            self.stats.bus_errors += 1;
            debug!("[k30] injecting bus error");
            return Err(ErrorKind::Bus);
        }

        for operation in operations {
            match operation {
                Operation::Write(bytes) => {
                    debug!("[k30] write {:02x?}", bytes);
                    self.on_write(bytes)?;
                }
                Operation::Read(buffer) => {
                    self.on_read(buffer)?;
                    debug!("[k30] read {:02x?}", buffer);
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Upload plumbing
// ---------------------------------------------------------------------------

/// Logs the request instead of sending it. Every fifth post answers 503.
#[derive(Default)]
struct LoggingTransport {
    posts: u32,
}

impl Transport for LoggingTransport {
    type Error = core::convert::Infallible;

    fn post(&mut self, url: &str, headers: &[Header], body: &str) -> Result<u16, Self::Error> {
        self.posts += 1;
        debug!("POST {} ({} headers)", url, headers.len());
        for line in body.lines() {
            info!("  > {}", line);
        }
        Ok(if self.posts % 5 == 0 { 503 } else { 204 })
    }
}

/// Backoff delays cost no wall-clock time in the simulator.
struct SkipDelay;

impl DelayNs for SkipDelay {
    fn delay_ns(&mut self, ns: u32) {
        debug!("(skipping {} ns backoff)", ns);
    }
}

/// xorshift32 for backoff jitter.
struct Jitter(u32);

impl Jitter {
    fn next(&mut self) -> u32 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.0 = x;
        x
    }
}

fn configure_writer(
    writer: &mut LineProtocolWriter<'static>,
    send_mac: bool,
) -> Result<(), LineProtocolError> {
    writer.add_sensor_mapping(SENSOR_ID, "co2")?;
    writer.set_field_name(SENSOR_ID, "ppm")?;
    writer.add_global_tag("source", "simulator")?;
    if send_mac {
        writer.set_device(Some(SIMULATED_MAC));
    }
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("Senseair simulator starting");

    let config = Config {
        poll_interval_secs: 60,
        ..Config::default()
    };
    let influx = InfluxConfig {
        host: "localhost",
        org: "home",
        bucket: "air",
        token: "simulator-token",
        use_ssl: false,
        update_interval_ms: Some(5 * 60 * 1000),
        ..InfluxConfig::default()
    };

    let sensor = SimulatedK30::new(FaultPlan {
        bus_error_every: 13,
        not_ready_every: 9,
        corrupt_every: 31,
    });

    let mut engine = match Senseair::new(sensor, config, LatestReading::new()) {
        Ok(engine) => engine,
        Err(e) => {
            error!("Invalid sensor configuration: {}", e);
            return;
        }
    };
    let mut uploader = match Uploader::new(&influx, LoggingTransport::default()) {
        Ok(uploader) => uploader,
        Err(e) => {
            error!("Invalid InfluxDB configuration: {}", e);
            return;
        }
    };

    let mut writer = LineProtocolWriter::new();
    if let Err(e) = configure_writer(&mut writer, influx.send_mac) {
        error!("Line protocol setup failed: {}", e);
        return;
    }

    engine.dump_config();
    influx.dump_config();

    let epoch_secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let mut jitter = Jitter(0x2545_F491);
    let mut queue = TimerQueue::new(0, engine.config().poll_interval_ms());
    let mut uploads_failed = 0u32;

    engine.start(&mut queue);

    // -----------------------------------------------------------------------
    // Main loop
    // -----------------------------------------------------------------------
    while queue.now() < SIMULATED_DURATION_MS {
        while let Some(event) = queue.pop_due() {
            engine.dispatch(event, &mut queue);
        }

        let now_ms = queue.now();
        if uploader.due(now_ms) {
            let readings: Vec<Reading> = engine
                .sink_mut()
                .take()
                .map(|ppm| Reading::new(SENSOR_ID, FieldValue::Float(ppm)))
                .into_iter()
                .collect();

            match writer.build_body(&readings, Some(epoch_secs + now_ms / 1000)) {
                Ok(Some(body)) => {
                    if let Err(e) = uploader.publish(&body, now_ms, &mut SkipDelay, || jitter.next())
                    {
                        warn!("Upload failed: {}", e);
                        uploads_failed += 1;
                    }
                }
                Ok(None) => debug!("Nothing to upload at {} ms", now_ms),
                Err(e) => error!("Line protocol error: {}", e),
            }
        }

        queue.set_now(queue.next_deadline());
    }

    let warning = engine.has_warning();
    let (sensor, sink) = engine.release();
    info!("Simulation finished after {} virtual hours", SIMULATED_DURATION_MS / 3_600_000);
    info!(
        "  Readings published: {} (last {:?}, warning {})",
        sink.published(),
        sink.value(),
        warning
    );
    info!(
        "  Bus transactions: {} ({} bus errors, {} not ready, {} corrupted)",
        sensor.stats.transactions,
        sensor.stats.bus_errors,
        sensor.stats.not_ready,
        sensor.stats.corrupted
    );
    info!(
        "  Meter control: {:#04x}, ABC period {:?} s, config writes {}",
        sensor.meter_control[1], sensor.abc_interval_secs, sensor.stats.config_writes
    );
    info!(
        "  Uploads: {} posted, {} failed",
        uploader.transport().posts,
        uploads_failed
    );
    info!("Simulator exiting");
}
