#![no_std]
#![no_main]
#![deny(
    clippy::mem_forget,
    reason = "mem::forget is generally not safe to do with esp_hal types, especially those \
    holding buffers for the duration of a data transfer."
)]

use embassy_executor::Spawner;
use embassy_time::{Instant, Timer};
use esp_hal::clock::CpuClock;
use esp_hal::i2c::master::{Config as I2cConfig, I2c};
use esp_hal::time::Rate;
use esp_hal::timer::timg::TimerGroup;
use log::{error, info};

use senseair_core::config::Config;
use senseair_core::scheduler::TimerQueue;
use senseair_core::sensors::{LatestReading, Senseair};

/// The K30 does not support fast-mode I²C.
const I2C_FREQUENCY_KHZ: u32 = 100;

/// Postcard-encoded [`Config`] baked into the image. Empty means defaults.
static SENSOR_CONFIG: &[u8] = &[];

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    rtt_target::rprintln!("PANIC: {}", info);
    loop {}
}

extern crate alloc;

// This creates a default app-descriptor required by the esp-idf bootloader.
esp_bootloader_esp_idf::esp_app_desc!();

fn load_config() -> Config {
    if SENSOR_CONFIG.is_empty() {
        return Config::default();
    }
    match Config::from_bytes(SENSOR_CONFIG) {
        Ok(config) => config,
        Err(e) => {
            error!("Stored sensor config rejected ({}), using defaults", e);
            Config::default()
        }
    }
}

#[esp_rtos::main]
async fn main(_spawner: Spawner) -> ! {
    rtt_target::rtt_init_log!();

    let config = esp_hal::Config::default().with_cpu_clock(CpuClock::max());
    let peripherals = esp_hal::init(config);

    esp_alloc::heap_allocator!(size: 32 * 1024);

    let timg0 = TimerGroup::new(peripherals.TIMG0);
    esp_rtos::start(timg0.timer0);

    info!("Embassy initialized!");

    let i2c = I2c::new(
        peripherals.I2C0,
        I2cConfig::default().with_frequency(Rate::from_khz(I2C_FREQUENCY_KHZ)),
    )
    .expect("Failed to initialize I2C bus")
    .with_sda(peripherals.GPIO12)
    .with_scl(peripherals.GPIO11);

    let sensor_config = load_config();
    let mut engine = Senseair::new(i2c, sensor_config, LatestReading::new())
        .expect("Sensor config was validated on load");
    engine.dump_config();

    let mut queue = TimerQueue::new(Instant::now().as_millis(), sensor_config.poll_interval_ms());
    engine.start(&mut queue);

    loop {
        queue.set_now(Instant::now().as_millis());
        while let Some(event) = queue.pop_due() {
            engine.dispatch(event, &mut queue);
        }

        if let Some(ppm) = engine.sink_mut().take() {
            info!("CO2: {} ppm", ppm);
        }

        Timer::at(Instant::from_millis(queue.next_deadline())).await;
    }
}
