//! Format constants for the dataflash on-wire layout.
//!
//! Everything the parser needs to know about the format that is not learned
//! from the stream itself lives in [`BinLogConfig`]: the sync marker, the
//! reserved FMT type id, the FMT body layout and the format character
//! mapping. The defaults follow the canonical MAVLink convention. All
//! parsing entry points take the config as a parameter rather than reading
//! process-wide state, so alternate dialects can be injected, in particular
//! by tests.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::bin_parser::format::FieldCodec;
use crate::error::BinLogError;

/// Kind of one field in the FMT record body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FmtFieldKind {
    U8,
    Ascii,
}

/// Constants describing the dataflash wire format.
///
/// Loadable from a JSON document with [`BinLogConfig::load`]; keys follow
/// the configuration document convention (`MSG_HEADER`, `FORMAT_MAPPING`,
/// ...). Missing keys fall back to the defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BinLogConfig {
    /// Two byte record synchronization marker, written as a hex string.
    #[serde(rename = "MSG_HEADER", with = "hex_header")]
    pub msg_header: [u8; 2],
    /// Type id reserved for FMT records.
    #[serde(rename = "FORMAT_MSG_TYPE")]
    pub format_msg_type: u8,
    /// On-wire length of an FMT record, 3 byte preamble included.
    #[serde(rename = "FORMAT_MSG_LENGTH")]
    pub format_msg_length: usize,
    /// Layout of the FMT record body as `(size, kind)` pairs in wire order:
    /// type id, record length, name, format string, field names.
    #[serde(rename = "FMT_STRUCT")]
    pub fmt_struct: Vec<(usize, FmtFieldKind)>,
    /// Format character to codec mapping.
    #[serde(rename = "FORMAT_MAPPING")]
    pub format_mapping: HashMap<char, FieldCodec>,
    /// Format characters whose integer value is emitted divided by 100.
    #[serde(rename = "SCALE_FACTOR_FIELDS")]
    pub scale_factor_fields: HashSet<char>,
    /// Format character whose integer value is emitted divided by 1e7.
    #[serde(rename = "LATITUDE_LONGITUDE_FORMAT")]
    pub latitude_longitude_format: char,
    /// Field names always emitted as raw bytes, whatever their codec.
    #[serde(rename = "BYTES_FIELDS")]
    pub bytes_fields: HashSet<String>,
}

impl Default for BinLogConfig {
    fn default() -> Self {
        Self {
            msg_header: [0xA3, 0x95],
            format_msg_type: 0x80,
            format_msg_length: 89,
            fmt_struct: vec![
                (1, FmtFieldKind::U8),     // type id of the described message
                (1, FmtFieldKind::U8),     // total record length
                (4, FmtFieldKind::Ascii),  // message name
                (16, FmtFieldKind::Ascii), // format string
                (64, FmtFieldKind::Ascii), // comma separated field names
            ],
            format_mapping: default_format_mapping(),
            scale_factor_fields: HashSet::from(['c', 'C', 'e', 'E']),
            latitude_longitude_format: 'L',
            bytes_fields: HashSet::from([
                "Data".to_owned(),
                "Blob".to_owned(),
                "Payload".to_owned(),
            ]),
        }
    }
}

impl BinLogConfig {
    /// Reads and validates a JSON configuration document.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, BinLogError> {
        let text = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| BinLogError::Config(format!("failed to parse config document: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the constants for internal consistency.
    pub fn validate(&self) -> Result<(), BinLogError> {
        if self.format_msg_length < 3 {
            return Err(BinLogError::Config(format!(
                "FORMAT_MSG_LENGTH {} cannot hold the 3 byte preamble",
                self.format_msg_length
            )));
        }
        let body: usize = self.fmt_struct.iter().map(|(size, _)| *size).sum();
        if body != self.format_msg_length - 3 {
            return Err(BinLogError::Config(format!(
                "FMT_STRUCT sizes total {body} bytes, FORMAT_MSG_LENGTH {} requires {}",
                self.format_msg_length,
                self.format_msg_length - 3
            )));
        }
        let shape_ok = matches!(
            self.fmt_struct.as_slice(),
            [
                (1, FmtFieldKind::U8),
                (1, FmtFieldKind::U8),
                (_, FmtFieldKind::Ascii),
                (_, FmtFieldKind::Ascii),
                (_, FmtFieldKind::Ascii),
            ]
        );
        if !shape_ok {
            return Err(BinLogError::Config(
                "FMT_STRUCT must be two u8 fields followed by three ascii fields".to_owned(),
            ));
        }
        for ch in &self.scale_factor_fields {
            if let Some(codec) = self.format_mapping.get(ch) {
                if !codec.is_integer() {
                    return Err(BinLogError::Config(format!(
                        "scale factor character {ch:?} maps to non-integer codec {codec:?}"
                    )));
                }
            }
        }
        if let Some(codec) = self.format_mapping.get(&self.latitude_longitude_format) {
            if !codec.is_integer() {
                return Err(BinLogError::Config(format!(
                    "latitude/longitude character {:?} maps to non-integer codec {codec:?}",
                    self.latitude_longitude_format
                )));
            }
        }
        Ok(())
    }

    /// Sizes of the three text fields of the FMT body (name, format string,
    /// field names). Layout shape is enforced by [`BinLogConfig::validate`].
    pub(crate) fn fmt_text_sizes(&self) -> (usize, usize, usize) {
        let size = |i: usize| self.fmt_struct.get(i).map_or(0, |(size, _)| *size);
        (size(2), size(3), size(4))
    }
}

/// The canonical MAVLink format character convention.
fn default_format_mapping() -> HashMap<char, FieldCodec> {
    HashMap::from([
        ('a', FieldCodec::Bytes(64)), // int16[32], emitted as an opaque blob
        ('b', FieldCodec::Int8),
        ('B', FieldCodec::UInt8),
        ('h', FieldCodec::Int16),
        ('H', FieldCodec::UInt16),
        ('i', FieldCodec::Int32),
        ('I', FieldCodec::UInt32),
        ('f', FieldCodec::Float32),
        ('d', FieldCodec::Float64),
        ('n', FieldCodec::Ascii(4)),
        ('N', FieldCodec::Ascii(16)),
        ('Z', FieldCodec::Ascii(64)),
        ('c', FieldCodec::Int16),
        ('C', FieldCodec::UInt16),
        ('e', FieldCodec::Int32),
        ('E', FieldCodec::UInt32),
        ('L', FieldCodec::Int32),
        ('M', FieldCodec::UInt8),
        ('q', FieldCodec::Int64),
        ('Q', FieldCodec::UInt64),
    ])
}

mod hex_header {
    use serde::de::{Deserializer, Error};
    use serde::ser::Serializer;
    use serde::Deserialize;

    pub fn serialize<S: Serializer>(header: &[u8; 2], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{:02x} {:02x}", header[0], header[1]))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 2], D::Error> {
        let text = String::deserialize(deserializer)?;
        let digits: String = text.chars().filter(|c| !c.is_whitespace()).collect();
        if digits.len() != 4 {
            return Err(D::Error::custom(format!(
                "MSG_HEADER must decode to exactly 2 bytes, got {text:?}"
            )));
        }
        let byte = |s: &str| {
            u8::from_str_radix(s, 16)
                .map_err(|_| D::Error::custom(format!("invalid hex in MSG_HEADER: {text:?}")))
        };
        Ok([byte(&digits[0..2])?, byte(&digits[2..4])?])
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_default_config_validates() {
        let config = BinLogConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.msg_header, [0xA3, 0x95]);
        assert_eq!(config.format_msg_type, 128);
        assert_eq!(config.format_msg_length, 89);
        assert_eq!(config.fmt_text_sizes(), (4, 16, 64));
        assert_eq!(config.format_mapping.get(&'L'), Some(&FieldCodec::Int32));
        assert!(config.scale_factor_fields.contains(&'c'));
        assert!(config.bytes_fields.contains("Data"));
    }

    #[test]
    fn test_config_deserializes_overrides() {
        let config: BinLogConfig = serde_json::from_str(
            r#"{
                "MSG_HEADER": "aa 55",
                "FORMAT_MSG_TYPE": 127,
                "LATITUDE_LONGITUDE_FORMAT": "i"
            }"#,
        )
        .expect("config should parse");
        assert_eq!(config.msg_header, [0xAA, 0x55]);
        assert_eq!(config.format_msg_type, 127);
        assert_eq!(config.latitude_longitude_format, 'i');
        // untouched keys keep their defaults
        assert_eq!(config.format_msg_length, 89);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_round_trips_through_json() {
        let config = BinLogConfig::default();
        let text = serde_json::to_string(&config).expect("config should serialize");
        let back: BinLogConfig = serde_json::from_str(&text).expect("config should parse");
        assert_eq!(config, back);
    }

    #[test]
    fn test_config_load_from_file() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("parser.json");
        let mut file = std::fs::File::create(&path).expect("Failed to write config file");
        file.write_all(br#"{"MSG_HEADER": "a3 95", "FORMAT_MSG_LENGTH": 89}"#)
            .expect("Failed to write config file");
        drop(file);
        let config = BinLogConfig::load(&path).expect("config should load");
        assert_eq!(config, BinLogConfig::default());
    }

    #[test]
    fn test_config_rejects_bad_header() {
        assert!(serde_json::from_str::<BinLogConfig>(r#"{"MSG_HEADER": "a3"}"#).is_err());
        assert!(serde_json::from_str::<BinLogConfig>(r#"{"MSG_HEADER": "a3 95 00"}"#).is_err());
        assert!(serde_json::from_str::<BinLogConfig>(r#"{"MSG_HEADER": "zz 95"}"#).is_err());
    }

    #[test]
    fn test_config_rejects_inconsistent_fmt_struct() {
        let mut config = BinLogConfig::default();
        config.format_msg_length = 90;
        assert!(matches!(config.validate(), Err(BinLogError::Config(_))));

        let mut config = BinLogConfig::default();
        config.fmt_struct = vec![(1, FmtFieldKind::U8), (85, FmtFieldKind::Ascii)];
        assert!(matches!(config.validate(), Err(BinLogError::Config(_))));
    }

    #[test]
    fn test_config_rejects_float_scale_character() {
        let mut config = BinLogConfig::default();
        config.scale_factor_fields.insert('f');
        assert!(matches!(config.validate(), Err(BinLogError::Config(_))));

        let mut config = BinLogConfig::default();
        config.latitude_longitude_format = 'd';
        assert!(matches!(config.validate(), Err(BinLogError::Config(_))));
    }
}
