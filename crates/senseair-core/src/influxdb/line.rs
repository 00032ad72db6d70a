//! InfluxDB line protocol
//!
//! `measurement[,tag=value...] field=value[ timestamp]\n`

use alloc::string::{String, ToString};
use core::fmt;

use super::LineProtocolError;

/// Most tags a single point can carry: global tags, per-sensor tags and the
/// device tag.
pub const MAX_POINT_TAGS: usize = 17;

/// Field name used when a sensor has none configured.
pub const DEFAULT_FIELD: &str = "value";

/// Measurement names, tag keys and tag values escape spaces, commas and `=`.
struct Key<'a>(&'a str);

impl fmt::Display for Key<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for c in self.0.chars() {
            if matches!(c, ' ' | ',' | '=') {
                f.write_str("\\")?;
            }
            write!(f, "{c}")?;
        }
        Ok(())
    }
}

/// String field values escape double quotes and backslashes.
struct Quoted<'a>(&'a str);

impl fmt::Display for Quoted<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for c in self.0.chars() {
            if matches!(c, '"' | '\\') {
                f.write_str("\\")?;
            }
            write!(f, "{c}")?;
        }
        Ok(())
    }
}

pub fn escape_key(input: &str) -> String {
    Key(input).to_string()
}

pub fn escape_string(input: &str) -> String {
    Quoted(input).to_string()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldValue<'a> {
    Float(f32),
    /// Written as `1` or `0`.
    Bool(bool),
    /// Written as a quoted string.
    Text(&'a str),
}

impl FieldValue<'_> {
    /// NaN floats and empty strings carry no data and produce no line.
    pub fn is_present(&self) -> bool {
        match self {
            FieldValue::Float(value) => !value.is_nan(),
            FieldValue::Bool(_) => true,
            FieldValue::Text(text) => !text.is_empty(),
        }
    }
}

impl fmt::Display for FieldValue<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Float(value) => write!(f, "{value}"),
            FieldValue::Bool(value) => f.write_str(if *value { "1" } else { "0" }),
            FieldValue::Text(text) => write!(f, "\"{}\"", Quoted(text)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tag<'a> {
    pub key: &'a str,
    pub value: &'a str,
}

impl<'a> Tag<'a> {
    pub const fn new(key: &'a str, value: &'a str) -> Self {
        Self { key, value }
    }
}

/// A single line of line protocol.
#[derive(Debug, Clone, PartialEq)]
pub struct Point<'a> {
    measurement: &'a str,
    tags: heapless::Vec<Tag<'a>, MAX_POINT_TAGS>,
    field: &'a str,
    value: FieldValue<'a>,
    timestamp: Option<u64>,
}

impl<'a> Point<'a> {
    pub fn new(measurement: &'a str, value: FieldValue<'a>) -> Self {
        Self {
            measurement,
            tags: heapless::Vec::new(),
            field: DEFAULT_FIELD,
            value,
            timestamp: None,
        }
    }

    pub fn field(mut self, name: &'a str) -> Self {
        self.field = name;
        self
    }

    /// Without a timestamp the server assigns its own.
    pub fn timestamp(mut self, timestamp: Option<u64>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn tag(&mut self, tag: Tag<'a>) -> Result<(), LineProtocolError> {
        self.tags
            .push(tag)
            .map_err(|_| LineProtocolError::TooManyTags {
                capacity: MAX_POINT_TAGS,
            })
    }

    pub fn value(&self) -> FieldValue<'a> {
        self.value
    }
}

impl fmt::Display for Point<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Key(self.measurement))?;
        for tag in &self.tags {
            write!(f, ",{}={}", Key(tag.key), Key(tag.value))?;
        }
        write!(f, " {}={}", self.field, self.value)?;
        if let Some(timestamp) = self.timestamp {
            write!(f, " {timestamp}")?;
        }
        f.write_str("\n")
    }
}
