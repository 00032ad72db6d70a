//! Command layouts and register constants for the K30/K33 I²C interface

use super::frame::CommandFrame;

/// Factory default 7-bit bus address.
pub const DEFAULT_ADDRESS: u8 = 0x68;

/// Read two bytes of RAM.
pub const OP_READ_RAM: u8 = 0x22;
/// Write one byte of EEPROM.
pub const OP_WRITE_EEPROM: u8 = 0x31;
/// Read one byte of EEPROM (the device answers with two register bytes).
pub const OP_READ_EEPROM: u8 = 0x41;

/// RAM address of the CO₂ concentration.
pub const REG_CO2: u16 = 0x0008;
/// EEPROM address of the meter control register.
pub const REG_METER_CONTROL: u16 = 0x003E;

/// Prefix of the ABC period command. This one carries no checksum.
pub const ABC_INTERVAL_PREFIX: [u8; 2] = [0x01, 0x40];

/// Status byte bit set once a measurement is complete.
pub const STATUS_READY: u8 = 0x01;
/// Meter control bit enabling automatic baseline correction.
pub const METER_CONTROL_ABC: u8 = 0x02;

/// Time the device needs between a command and its response.
pub const SETTLE_DELAY_MS: u32 = 25;

pub fn measure() -> CommandFrame {
    CommandFrame::build(OP_READ_RAM, REG_CO2, None)
}

pub fn read_meter_control() -> CommandFrame {
    CommandFrame::build(OP_READ_EEPROM, REG_METER_CONTROL, None)
}

pub fn write_meter_control(value: u8) -> CommandFrame {
    CommandFrame::build(OP_WRITE_EEPROM, REG_METER_CONTROL, Some(value))
}

pub fn abc_interval(interval_secs: u16) -> CommandFrame {
    let [high, low] = interval_secs.to_be_bytes();
    CommandFrame::unchecked([ABC_INTERVAL_PREFIX[0], ABC_INTERVAL_PREFIX[1], high, low])
}
