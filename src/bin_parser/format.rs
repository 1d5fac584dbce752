//! The self-learned decoding schema.
//!
//! A dataflash log declares the layout of every message type in-stream via
//! FMT records. [`FormatTable`] starts out knowing only how to read an FMT
//! record (the bootstrap descriptor) and grows one [`FormatDescriptor`] per
//! FMT record encountered by the scan.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::FieldValue;
use crate::config::BinLogConfig;
use crate::error::BinLogError;

/// Wire codec selected by a single format character.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldCodec {
    #[serde(rename = "i8")]
    Int8,
    #[serde(rename = "u8")]
    UInt8,
    #[serde(rename = "i16")]
    Int16,
    #[serde(rename = "u16")]
    UInt16,
    #[serde(rename = "i32")]
    Int32,
    #[serde(rename = "u32")]
    UInt32,
    #[serde(rename = "i64")]
    Int64,
    #[serde(rename = "u64")]
    UInt64,
    #[serde(rename = "f32")]
    Float32,
    #[serde(rename = "f64")]
    Float64,
    /// Fixed length NUL padded ASCII text.
    #[serde(rename = "ascii")]
    Ascii(usize),
    /// Fixed length opaque byte string.
    #[serde(rename = "bytes")]
    Bytes(usize),
}

impl FieldCodec {
    /// On-wire size in bytes.
    pub fn size(&self) -> usize {
        match self {
            FieldCodec::Int8 | FieldCodec::UInt8 => 1,
            FieldCodec::Int16 | FieldCodec::UInt16 => 2,
            FieldCodec::Int32 | FieldCodec::UInt32 | FieldCodec::Float32 => 4,
            FieldCodec::Int64 | FieldCodec::UInt64 | FieldCodec::Float64 => 8,
            FieldCodec::Ascii(n) | FieldCodec::Bytes(n) => *n,
        }
    }

    pub(crate) fn is_integer(&self) -> bool {
        !matches!(
            self,
            FieldCodec::Float32
                | FieldCodec::Float64
                | FieldCodec::Ascii(_)
                | FieldCodec::Bytes(_)
        )
    }

    /// Decodes `bytes`, which the caller has sliced to exactly
    /// [`FieldCodec::size`] bytes, little-endian.
    fn decode(&self, field: &str, bytes: &[u8]) -> Result<FieldValue, BinLogError> {
        let value = match self {
            FieldCodec::Int8 => FieldValue::Int8(bytes[0] as i8),
            FieldCodec::UInt8 => FieldValue::UInt8(bytes[0]),
            FieldCodec::Int16 => FieldValue::Int16(i16::from_le_bytes(bytes.try_into().unwrap())),
            FieldCodec::UInt16 => FieldValue::UInt16(u16::from_le_bytes(bytes.try_into().unwrap())),
            FieldCodec::Int32 => FieldValue::Int32(i32::from_le_bytes(bytes.try_into().unwrap())),
            FieldCodec::UInt32 => FieldValue::UInt32(u32::from_le_bytes(bytes.try_into().unwrap())),
            FieldCodec::Int64 => FieldValue::Int64(i64::from_le_bytes(bytes.try_into().unwrap())),
            FieldCodec::UInt64 => FieldValue::UInt64(u64::from_le_bytes(bytes.try_into().unwrap())),
            FieldCodec::Float32 => {
                FieldValue::Float32(f32::from_le_bytes(bytes.try_into().unwrap()))
            }
            FieldCodec::Float64 => {
                FieldValue::Float64(f64::from_le_bytes(bytes.try_into().unwrap()))
            }
            FieldCodec::Ascii(_) => {
                let trimmed = trim_trailing_nul(bytes);
                if !trimmed.is_ascii() {
                    return Err(BinLogError::Decode {
                        field: field.to_owned(),
                        reason: "non-ASCII bytes in text field".to_owned(),
                    });
                }
                FieldValue::String(String::from_utf8_lossy(trimmed).into_owned())
            }
            FieldCodec::Bytes(_) => FieldValue::Bytes(bytes.to_vec()),
        };
        Ok(value)
    }

    /// Decodes an integer codec widened to `i64`, for scale factor fields.
    fn decode_int(&self, field: &str, bytes: &[u8]) -> Result<i64, BinLogError> {
        let out_of_range = |reason: &str| BinLogError::Decode {
            field: field.to_owned(),
            reason: reason.to_owned(),
        };
        match self {
            FieldCodec::Int8 => Ok((bytes[0] as i8).into()),
            FieldCodec::UInt8 => Ok(bytes[0].into()),
            FieldCodec::Int16 => Ok(i16::from_le_bytes(bytes.try_into().unwrap()).into()),
            FieldCodec::UInt16 => Ok(u16::from_le_bytes(bytes.try_into().unwrap()).into()),
            FieldCodec::Int32 => Ok(i32::from_le_bytes(bytes.try_into().unwrap()).into()),
            FieldCodec::UInt32 => Ok(u32::from_le_bytes(bytes.try_into().unwrap()).into()),
            FieldCodec::Int64 => Ok(i64::from_le_bytes(bytes.try_into().unwrap())),
            FieldCodec::UInt64 => i64::try_from(u64::from_le_bytes(bytes.try_into().unwrap()))
                .map_err(|_| out_of_range("scaled u64 value exceeds i64 range")),
            _ => Err(out_of_range("scale factor applied to non-integer codec")),
        }
    }
}

/// How a decoded field is emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EmitRule {
    /// The codec's value, unchanged.
    Plain,
    /// Integer divided by 100, as a double.
    Centi,
    /// Integer divided by 1e7, as a double (degrees).
    Degrees,
    /// Raw payload bytes regardless of codec.
    Raw,
}

/// One field of a message layout with its decode plan.
#[derive(Debug, Clone, PartialEq)]
struct FieldPlan {
    name: String,
    codec: FieldCodec,
    emit: EmitRule,
}

/// Parsed, in-memory form of one FMT record.
#[derive(Debug, Clone, PartialEq)]
pub struct FormatDescriptor {
    /// Message type id, unique within a file.
    pub type_id: u8,
    /// Total on-wire record length, 3 byte preamble included.
    pub length: usize,
    /// Short message name, e.g. `GPS`.
    pub name: String,
    /// One codec-selecting character per field.
    pub format: String,
    /// Field names in wire order.
    pub columns: Vec<String>,
    /// Per-field decode plan, resolved at registration.
    fields: Vec<FieldPlan>,
}

impl FormatDescriptor {
    /// Decodes a record body (everything after the 3 byte preamble) into
    /// named values in declaration order.
    pub(crate) fn decode_body(
        &self,
        body: &[u8],
    ) -> Result<Vec<(String, FieldValue)>, BinLogError> {
        let mut fields = Vec::with_capacity(self.fields.len());
        let mut offset = 0usize;
        for plan in &self.fields {
            let size = plan.codec.size();
            // in range: field sizes were checked against `length` at registration
            let raw = &body[offset..offset + size];
            let value = match plan.emit {
                EmitRule::Raw => FieldValue::Bytes(raw.to_vec()),
                EmitRule::Plain => plan.codec.decode(&plan.name, raw)?,
                EmitRule::Centi => {
                    FieldValue::Float64(plan.codec.decode_int(&plan.name, raw)? as f64 / 100.0)
                }
                EmitRule::Degrees => {
                    FieldValue::Float64(plan.codec.decode_int(&plan.name, raw)? as f64 / 1e7)
                }
            };
            fields.push((plan.name.clone(), value));
            offset += size;
        }
        Ok(fields)
    }
}

/// Type-id-keyed collection of the descriptors learned so far.
///
/// Starts from [`FormatTable::bootstrap`], which knows only the FMT
/// descriptor itself, and grows through [`FormatTable::register`] as the
/// scan encounters FMT records. Cloning the table is cheap enough to hand
/// each parallel worker its own copy.
#[derive(Debug, Clone)]
pub struct FormatTable {
    config: Arc<BinLogConfig>,
    formats: HashMap<u8, FormatDescriptor>,
}

impl FormatTable {
    /// Creates a table containing exactly the FMT descriptor, keyed by the
    /// reserved FMT type id.
    pub fn bootstrap(config: Arc<BinLogConfig>) -> Result<Self, BinLogError> {
        config.validate()?;
        let (name_size, format_size, columns_size) = config.fmt_text_sizes();
        let columns = ["Type", "Length", "Name", "Format", "Columns"];
        let codecs = [
            FieldCodec::UInt8,
            FieldCodec::UInt8,
            FieldCodec::Ascii(name_size),
            FieldCodec::Ascii(format_size),
            FieldCodec::Ascii(columns_size),
        ];
        let fields = columns
            .iter()
            .zip(codecs)
            .map(|(name, codec)| FieldPlan {
                name: (*name).to_owned(),
                codec,
                emit: EmitRule::Plain,
            })
            .collect();
        let descriptor = FormatDescriptor {
            type_id: config.format_msg_type,
            length: config.format_msg_length,
            name: "FMT".to_owned(),
            format: "BBnNZ".to_owned(),
            columns: columns.iter().map(|c| (*c).to_owned()).collect(),
            fields,
        };
        let formats = HashMap::from([(descriptor.type_id, descriptor)]);
        Ok(Self { config, formats })
    }

    /// Parses an FMT record body and installs the resulting descriptor.
    ///
    /// A byte-identical re-registration is accepted silently (real logs
    /// duplicate FMT records); a conflicting one fails and leaves the table
    /// untouched.
    pub fn register(&mut self, body: &[u8]) -> Result<(), BinLogError> {
        let descriptor = self.parse_fmt_body(body)?;
        match self.formats.get(&descriptor.type_id) {
            Some(existing) if *existing == descriptor => Ok(()),
            Some(existing) => Err(BinLogError::MalformedFormat(format!(
                "type id {} re-declared as {:?} but already bound to {:?}",
                descriptor.type_id, descriptor.name, existing.name
            ))),
            None => {
                self.formats.insert(descriptor.type_id, descriptor);
                Ok(())
            }
        }
    }

    /// Descriptor for `type_id`, if one has been registered.
    pub fn lookup(&self, type_id: u8) -> Option<&FormatDescriptor> {
        self.formats.get(&type_id)
    }

    /// Number of registered descriptors, bootstrap included.
    pub fn len(&self) -> usize {
        self.formats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.formats.is_empty()
    }

    /// The injected format constants this table was built with.
    pub fn config(&self) -> &BinLogConfig {
        &self.config
    }

    fn parse_fmt_body(&self, body: &[u8]) -> Result<FormatDescriptor, BinLogError> {
        let config = &self.config;
        let expected = config.format_msg_length - 3;
        if body.len() != expected {
            return Err(BinLogError::MalformedFormat(format!(
                "FMT body is {} bytes, expected {expected}",
                body.len()
            )));
        }
        let type_id = body[0];
        let declared_length = body[1] as usize;
        let (name_size, format_size, columns_size) = config.fmt_text_sizes();
        let mut at = 2usize;
        let name = ascii_field(&body[at..at + name_size], "name")?;
        at += name_size;
        let format = ascii_field(&body[at..at + format_size], "format string")?;
        at += format_size;
        let columns_raw = ascii_field(&body[at..at + columns_size], "field names")?;

        let columns: Vec<String> = if columns_raw.is_empty() {
            Vec::new()
        } else {
            columns_raw.split(',').map(str::to_owned).collect()
        };
        if format.chars().count() != columns.len() {
            return Err(BinLogError::MalformedFormat(format!(
                "message {name:?} declares {} format characters but {} field names",
                format.chars().count(),
                columns.len()
            )));
        }

        let mut fields = Vec::with_capacity(columns.len());
        let mut payload = 0usize;
        for (ch, column) in format.chars().zip(&columns) {
            let Some(codec) = config.format_mapping.get(&ch).copied() else {
                return Err(BinLogError::MalformedFormat(format!(
                    "unknown format character {ch:?} in message {name:?}"
                )));
            };
            payload += codec.size();
            let emit = if config.bytes_fields.contains(column) {
                EmitRule::Raw
            } else if ch == config.latitude_longitude_format {
                EmitRule::Degrees
            } else if config.scale_factor_fields.contains(&ch) {
                EmitRule::Centi
            } else {
                EmitRule::Plain
            };
            fields.push(FieldPlan {
                name: column.clone(),
                codec,
                emit,
            });
        }
        if declared_length != 3 + payload {
            return Err(BinLogError::MalformedFormat(format!(
                "message {name:?} declares length {declared_length} but fields total {}",
                3 + payload
            )));
        }

        Ok(FormatDescriptor {
            type_id,
            length: declared_length,
            name,
            format,
            columns,
            fields,
        })
    }
}

fn ascii_field(bytes: &[u8], what: &str) -> Result<String, BinLogError> {
    let trimmed = trim_trailing_nul(bytes);
    if !trimmed.is_ascii() {
        return Err(BinLogError::MalformedFormat(format!(
            "{what} field is not ASCII"
        )));
    }
    Ok(String::from_utf8_lossy(trimmed).into_owned())
}

fn trim_trailing_nul(bytes: &[u8]) -> &[u8] {
    let mut end = bytes.len();
    while end > 0 && bytes[end - 1] == 0 {
        end -= 1;
    }
    &bytes[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn padded(s: &str, n: usize) -> Vec<u8> {
        let mut out = s.as_bytes().to_vec();
        out.resize(n, 0);
        out
    }

    fn fmt_body(type_id: u8, length: u8, name: &str, format: &str, columns: &str) -> Vec<u8> {
        let mut body = vec![type_id, length];
        body.extend_from_slice(&padded(name, 4));
        body.extend_from_slice(&padded(format, 16));
        body.extend_from_slice(&padded(columns, 64));
        body
    }

    fn table() -> FormatTable {
        FormatTable::bootstrap(Arc::new(BinLogConfig::default())).expect("bootstrap")
    }

    #[test]
    fn test_codec_sizes() {
        assert_eq!(FieldCodec::Int8.size(), 1);
        assert_eq!(FieldCodec::UInt16.size(), 2);
        assert_eq!(FieldCodec::Float32.size(), 4);
        assert_eq!(FieldCodec::UInt64.size(), 8);
        assert_eq!(FieldCodec::Ascii(16).size(), 16);
        assert_eq!(FieldCodec::Bytes(64).size(), 64);
    }

    #[test]
    fn test_bootstrap_holds_fmt_descriptor() {
        let table = table();
        assert_eq!(table.len(), 1);
        let fmt = table.lookup(128).expect("FMT descriptor");
        assert_eq!(fmt.name, "FMT");
        assert_eq!(fmt.length, 89);
        assert_eq!(fmt.columns.len(), 5);
        assert!(table.lookup(10).is_none());
    }

    #[test]
    fn test_register_and_lookup() {
        let mut table = table();
        table
            .register(&fmt_body(10, 6, "TST", "Bh", "A,B"))
            .expect("register");
        let descriptor = table.lookup(10).expect("descriptor");
        assert_eq!(descriptor.type_id, 10);
        assert_eq!(descriptor.length, 6);
        assert_eq!(descriptor.name, "TST");
        assert_eq!(descriptor.format, "Bh");
        assert_eq!(descriptor.columns, vec!["A", "B"]);
    }

    #[test]
    fn test_register_rejects_unknown_format_character() {
        let mut table = table();
        let err = table
            .register(&fmt_body(10, 4, "TST", "x", "A"))
            .expect_err("unknown character");
        assert!(matches!(err, BinLogError::MalformedFormat(_)));
        assert!(table.lookup(10).is_none());
    }

    #[test]
    fn test_register_rejects_arity_mismatch() {
        let mut table = table();
        let err = table
            .register(&fmt_body(10, 5, "TST", "BB", "A"))
            .expect_err("arity mismatch");
        assert!(matches!(err, BinLogError::MalformedFormat(_)));
    }

    #[test]
    fn test_register_rejects_inconsistent_length() {
        let mut table = table();
        let err = table
            .register(&fmt_body(10, 9, "TST", "Bh", "A,B"))
            .expect_err("length mismatch");
        assert!(matches!(err, BinLogError::MalformedFormat(_)));
    }

    #[test]
    fn test_register_rejects_non_ascii_name() {
        let mut table = table();
        let mut body = fmt_body(10, 6, "TST", "Bh", "A,B");
        body[2] = 0xC3;
        let err = table.register(&body).expect_err("non-ascii name");
        assert!(matches!(err, BinLogError::MalformedFormat(_)));
    }

    #[test]
    fn test_register_rejects_wrong_body_size() {
        let mut table = table();
        let err = table.register(&[0u8; 10]).expect_err("short body");
        assert!(matches!(err, BinLogError::MalformedFormat(_)));
    }

    #[test]
    fn test_duplicate_identical_fmt_is_idempotent() {
        let mut table = table();
        let body = fmt_body(10, 6, "TST", "Bh", "A,B");
        table.register(&body).expect("first registration");
        table.register(&body).expect("identical duplicate");
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_conflicting_duplicate_fmt_is_rejected() {
        let mut table = table();
        table
            .register(&fmt_body(10, 6, "TST", "Bh", "A,B"))
            .expect("first registration");
        let err = table
            .register(&fmt_body(10, 8, "TST", "BI", "A,B"))
            .expect_err("conflicting duplicate");
        assert!(matches!(err, BinLogError::MalformedFormat(_)));
        // the original binding survives
        assert_eq!(table.lookup(10).expect("descriptor").format, "Bh");
    }

    #[test]
    fn test_decode_body_plain_values() {
        let mut table = table();
        table
            .register(&fmt_body(10, 13, "TST", "bBfn", "A,B,C,D"))
            .expect("register");
        let descriptor = table.lookup(10).expect("descriptor");
        let mut body = vec![0xFFu8, 7];
        body.extend_from_slice(&2.5f32.to_le_bytes());
        body.extend_from_slice(b"AB\0\0");
        let fields = descriptor.decode_body(&body).expect("decode");
        assert_eq!(fields[0], ("A".to_owned(), FieldValue::Int8(-1)));
        assert_eq!(fields[1], ("B".to_owned(), FieldValue::UInt8(7)));
        assert_eq!(fields[2], ("C".to_owned(), FieldValue::Float32(2.5)));
        assert_eq!(
            fields[3],
            ("D".to_owned(), FieldValue::String("AB".to_owned()))
        );
    }

    #[test]
    fn test_decode_body_applies_scale_factors() {
        let mut table = table();
        table
            .register(&fmt_body(10, 9, "TST", "cL", "Spd,Lat"))
            .expect("register");
        let descriptor = table.lookup(10).expect("descriptor");
        let mut body = (-250i16).to_le_bytes().to_vec();
        body.extend_from_slice(&473566430i32.to_le_bytes());
        let fields = descriptor.decode_body(&body).expect("decode");
        assert_eq!(
            fields[0],
            ("Spd".to_owned(), FieldValue::Float64(-250.0 / 100.0))
        );
        assert_eq!(
            fields[1],
            ("Lat".to_owned(), FieldValue::Float64(473566430.0 / 1e7))
        );
    }

    #[test]
    fn test_decode_body_emits_named_bytes_fields_raw() {
        let mut table = table();
        table
            .register(&fmt_body(10, 12, "TST", "QB", "Data,Seq"))
            .expect("register");
        let descriptor = table.lookup(10).expect("descriptor");
        let mut body = 0x0102030405060708u64.to_le_bytes().to_vec();
        body.push(9);
        let fields = descriptor.decode_body(&body).expect("decode");
        assert_eq!(
            fields[0],
            (
                "Data".to_owned(),
                FieldValue::Bytes(vec![8, 7, 6, 5, 4, 3, 2, 1])
            )
        );
        assert_eq!(fields[1], ("Seq".to_owned(), FieldValue::UInt8(9)));
    }

    #[test]
    fn test_decode_body_rejects_non_ascii_text() {
        let mut table = table();
        table
            .register(&fmt_body(10, 7, "TST", "n", "Id"))
            .expect("register");
        let descriptor = table.lookup(10).expect("descriptor");
        let err = descriptor
            .decode_body(&[0xFF, 0xFE, 0, 0])
            .expect_err("non-ascii text");
        assert!(matches!(err, BinLogError::Decode { .. }));
    }

    #[test]
    fn test_fmt_self_description_round_trips() {
        // a real log's FMT record for FMT itself must be an identical duplicate
        let mut table = table();
        let body = fmt_body(128, 89, "FMT", "BBnNZ", "Type,Length,Name,Format,Columns");
        table.register(&body).expect("self description");
        assert_eq!(table.len(), 1);
    }
}
