use alloc::string::{String, ToString};

use log::debug;

use super::LineProtocolError;
use super::line::{DEFAULT_FIELD, FieldValue, Point, Tag};

pub const MAX_SENSORS: usize = 8;
pub const MAX_TAGS: usize = 8;

/// One sensor value handed to [`LineProtocolWriter::build_body`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading<'a> {
    pub sensor_id: &'a str,
    pub value: FieldValue<'a>,
}

impl<'a> Reading<'a> {
    pub const fn new(sensor_id: &'a str, value: FieldValue<'a>) -> Self {
        Self { sensor_id, value }
    }
}

#[derive(Debug, Clone)]
struct SensorMapping<'a> {
    sensor_id: &'a str,
    measurement: &'a str,
    field: Option<&'a str>,
    tags: heapless::Vec<Tag<'a>, MAX_TAGS>,
}

/// Turns sensor readings into a line-protocol request body.
///
/// Only sensors with a measurement mapping are written. Every line carries the
/// global tags, then the sensor's own tags, then the optional device tag.
#[derive(Debug, Clone, Default)]
pub struct LineProtocolWriter<'a> {
    sensors: heapless::Vec<SensorMapping<'a>, MAX_SENSORS>,
    global_tags: heapless::Vec<Tag<'a>, MAX_TAGS>,
    device: Option<&'a str>,
}

impl<'a> LineProtocolWriter<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `sensor_id` to a measurement name. Mapping the same sensor again
    /// replaces the measurement.
    pub fn add_sensor_mapping(
        &mut self,
        sensor_id: &'a str,
        measurement: &'a str,
    ) -> Result<(), LineProtocolError> {
        if let Some(mapping) = self.mapping_mut(sensor_id) {
            mapping.measurement = measurement;
            return Ok(());
        }

        self.sensors
            .push(SensorMapping {
                sensor_id,
                measurement,
                field: None,
                tags: heapless::Vec::new(),
            })
            .map_err(|_| LineProtocolError::TooManySensors {
                capacity: MAX_SENSORS,
            })
    }

    pub fn set_field_name(
        &mut self,
        sensor_id: &'a str,
        field: &'a str,
    ) -> Result<(), LineProtocolError> {
        let mapping = self
            .mapping_mut(sensor_id)
            .ok_or(LineProtocolError::UnmappedSensor)?;
        mapping.field = Some(field);
        Ok(())
    }

    pub fn add_static_tag(
        &mut self,
        sensor_id: &'a str,
        key: &'a str,
        value: &'a str,
    ) -> Result<(), LineProtocolError> {
        let mapping = self
            .mapping_mut(sensor_id)
            .ok_or(LineProtocolError::UnmappedSensor)?;
        upsert(&mut mapping.tags, Tag::new(key, value))
    }

    pub fn add_global_tag(&mut self, key: &'a str, value: &'a str) -> Result<(), LineProtocolError> {
        upsert(&mut self.global_tags, Tag::new(key, value))
    }

    /// Tag every line with `device=<id>`, typically the MAC address.
    pub fn set_device(&mut self, device: Option<&'a str>) {
        self.device = device;
    }

    pub fn has_mapping(&self, sensor_id: &str) -> bool {
        self.sensors.iter().any(|m| m.sensor_id == sensor_id)
    }

    pub fn sensor_count(&self) -> usize {
        self.sensors.len()
    }

    /// Build the request body. `Ok(None)` when no reading produced a line.
    pub fn build_body(
        &self,
        readings: &[Reading<'_>],
        timestamp: Option<u64>,
    ) -> Result<Option<String>, LineProtocolError> {
        let mut body = String::new();
        let mut points = 0usize;

        for reading in readings.iter().filter(|r| r.value.is_present()) {
            let Some(mapping) = self.sensors.iter().find(|m| m.sensor_id == reading.sensor_id)
            else {
                debug!("No mapping for sensor: {}", reading.sensor_id);
                continue;
            };

            let mut point = Point::new(mapping.measurement, reading.value)
                .field(mapping.field.unwrap_or(DEFAULT_FIELD))
                .timestamp(timestamp);
            for tag in self.global_tags.iter().chain(mapping.tags.iter()) {
                point.tag(*tag)?;
            }
            if let Some(device) = self.device {
                point.tag(Tag::new("device", device))?;
            }

            body.push_str(&point.to_string());
            points += 1;
        }

        if points == 0 {
            debug!("No valid sensor data to publish");
            return Ok(None);
        }

        debug!("Built {} data points ({} bytes)", points, body.len());
        Ok(Some(body))
    }

    fn mapping_mut(&mut self, sensor_id: &str) -> Option<&mut SensorMapping<'a>> {
        self.sensors.iter_mut().find(|m| m.sensor_id == sensor_id)
    }
}

fn upsert<'a>(
    tags: &mut heapless::Vec<Tag<'a>, MAX_TAGS>,
    tag: Tag<'a>,
) -> Result<(), LineProtocolError> {
    if let Some(existing) = tags.iter_mut().find(|t| t.key == tag.key) {
        existing.value = tag.value;
        return Ok(());
    }
    tags.push(tag)
        .map_err(|_| LineProtocolError::TooManyTags { capacity: MAX_TAGS })
}
