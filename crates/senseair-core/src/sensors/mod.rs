pub mod senseair;

pub use senseair::{Senseair, SenseairDevice};

/// Receiver for decoded sensor values.
///
/// Fire-and-forget: there is no acknowledgement and no error path.
pub trait SensorSink {
    fn publish(&mut self, value: f32);
}

impl<F: FnMut(f32)> SensorSink for F {
    fn publish(&mut self, value: f32) {
        self(value)
    }
}

/// Sink that keeps only the most recent value.
///
/// The uploader drains it with [`take`](Self::take) on its own schedule.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LatestReading {
    value: Option<f32>,
    published: u32,
}

impl LatestReading {
    pub const fn new() -> Self {
        Self {
            value: None,
            published: 0,
        }
    }

    /// Last published value, if any.
    pub const fn value(&self) -> Option<f32> {
        self.value
    }

    /// Total number of values published since boot.
    pub const fn published(&self) -> u32 {
        self.published
    }

    /// Take the latest value, leaving the sink empty until the next publish.
    pub fn take(&mut self) -> Option<f32> {
        self.value.take()
    }
}

impl SensorSink for LatestReading {
    fn publish(&mut self, value: f32) {
        self.value = Some(value);
        self.published = self.published.wrapping_add(1);
    }
}
