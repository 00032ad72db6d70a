//! Hardware-independent core library for senseair-relay
//!
//! This crate contains the platform-agnostic logic for relaying CO₂ readings
//! from a Senseair K30/K33 sensor on a shared I²C bus: command framing, the
//! non-blocking setup and measurement state machines, retry/backoff, the
//! deferred-work scheduler abstraction, configuration, and line-protocol
//! serialization for the time-series sink.
//!
//! It is `#![no_std]` with `extern crate alloc` so it compiles on both
//! embedded targets (ESP32-S3) and desktop hosts (for the simulator and tests).

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod config;
pub mod influxdb;
pub mod protocol;
pub mod retry;
pub mod scheduler;
pub mod sensors;
