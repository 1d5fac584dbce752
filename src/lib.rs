#![crate_name = "dataflash_log_parser"]
#![doc = include_str!("../README.md")]
#![doc = include_str!("../docs/bin_file_format.md")]

pub mod config;
pub mod error;

/// Module for sequential parsing of dataflash log files.
pub mod bin_parser;

#[cfg(feature = "parallel")]
/// Module for parallel, chunked parsing of dataflash log files.
pub mod parallel_parser;

use crate::error::BinLogError;

/// A single decoded field value.
///
/// Message layouts are discovered at runtime from FMT records, so fields
/// are tagged values rather than per-type structs.
#[derive(Debug, Clone)]
pub enum FieldValue {
    Int8(i8),
    UInt8(u8),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Float32(f32),
    Float64(f64),
    /// Fixed length ASCII text with trailing NULs stripped.
    String(String),
    /// Opaque byte string.
    Bytes(Vec<u8>),
}

impl FieldValue {
    /// Integer value widened to `i64`, if the variant is an integer.
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            FieldValue::Int8(v) => Some(v.into()),
            FieldValue::UInt8(v) => Some(v.into()),
            FieldValue::Int16(v) => Some(v.into()),
            FieldValue::UInt16(v) => Some(v.into()),
            FieldValue::Int32(v) => Some(v.into()),
            FieldValue::UInt32(v) => Some(v.into()),
            FieldValue::Int64(v) => Some(v),
            FieldValue::UInt64(v) => i64::try_from(v).ok(),
            _ => None,
        }
    }

    /// Numeric value as `f64`, if the variant is numeric.
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            FieldValue::Int8(v) => Some(v.into()),
            FieldValue::UInt8(v) => Some(v.into()),
            FieldValue::Int16(v) => Some(v.into()),
            FieldValue::UInt16(v) => Some(v.into()),
            FieldValue::Int32(v) => Some(v.into()),
            FieldValue::UInt32(v) => Some(v.into()),
            FieldValue::Int64(v) => Some(v as f64),
            FieldValue::UInt64(v) => Some(v as f64),
            FieldValue::Float32(v) => Some(v.into()),
            FieldValue::Float64(v) => Some(v),
            _ => None,
        }
    }

    /// Text content, if the variant is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Raw content, if the variant is a byte string.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            FieldValue::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

impl PartialEq for FieldValue {
    /// Floats compare by bit pattern, so NaN values compare equal and
    /// parallel output can be checked against sequential output
    /// elementwise.
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (FieldValue::Int8(a), FieldValue::Int8(b)) => a == b,
            (FieldValue::UInt8(a), FieldValue::UInt8(b)) => a == b,
            (FieldValue::Int16(a), FieldValue::Int16(b)) => a == b,
            (FieldValue::UInt16(a), FieldValue::UInt16(b)) => a == b,
            (FieldValue::Int32(a), FieldValue::Int32(b)) => a == b,
            (FieldValue::UInt32(a), FieldValue::UInt32(b)) => a == b,
            (FieldValue::Int64(a), FieldValue::Int64(b)) => a == b,
            (FieldValue::UInt64(a), FieldValue::UInt64(b)) => a == b,
            (FieldValue::Float32(a), FieldValue::Float32(b)) => a.to_bits() == b.to_bits(),
            (FieldValue::Float64(a), FieldValue::Float64(b)) => a.to_bits() == b.to_bits(),
            (FieldValue::String(a), FieldValue::String(b)) => a == b,
            (FieldValue::Bytes(a), FieldValue::Bytes(b)) => a == b,
            _ => false,
        }
    }
}

/// A single decoded log message.
///
/// Holds the descriptor name (the reserved `mavpackettype` entry) plus one
/// value per field, iterated in FMT declaration order.
#[derive(Debug, Clone, PartialEq)]
pub struct LogMessage {
    name: String,
    offset: usize,
    fields: Vec<(String, FieldValue)>,
}

impl LogMessage {
    pub(crate) fn new(name: String, offset: usize, fields: Vec<(String, FieldValue)>) -> Self {
        Self {
            name,
            offset,
            fields,
        }
    }

    /// Descriptor name, i.e. the reserved `mavpackettype` entry.
    pub fn packet_type(&self) -> &str {
        &self.name
    }

    /// File offset of the record's sync marker.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Looks up a field value by name.
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value)
    }

    /// Fields in FMT declaration order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields
            .iter()
            .map(|(name, value)| (name.as_str(), value))
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// A trait for parsers that can decode an entire dataflash log in one
/// call.
///
/// Implemented by the sequential `BinLogParser` and, with the `parallel`
/// feature, by `ParallelBinLogParser`.
pub trait LogParser {
    /// Decodes every message in the log, in chronological order.
    ///
    /// With a `filter`, only messages whose packet type equals it are
    /// returned; FMT records encountered along the way are still
    /// registered.
    ///
    /// # Errors
    /// Returns a `BinLogError` for fatal conditions (I/O, configuration,
    /// cancellation). Localized record corruption is absorbed by
    /// resynchronization and never surfaces here.
    fn parse_all(&self, filter: Option<&str>) -> Result<Vec<LogMessage>, BinLogError>;
}
