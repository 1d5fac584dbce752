use thiserror::Error;

/// Errors produced while opening or decoding a dataflash log.
///
/// Only [`Io`](BinLogError::Io), [`Config`](BinLogError::Config) and
/// [`Cancelled`](BinLogError::Cancelled) surface from the parsing entry
/// points. The remaining kinds describe a single bad record; the scanner
/// absorbs them by resynchronizing one byte forward and counts them in
/// [`ScanStats`](crate::bin_parser::ScanStats).
#[derive(Debug, Error)]
pub enum BinLogError {
    /// The log file could not be opened, read or memory mapped.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The injected format constants are internally inconsistent.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// An FMT record failed structural validation.
    #[error("malformed format record: {0}")]
    MalformedFormat(String),

    /// A record's declared length runs past the end of the scanned range.
    #[error("record at offset {offset} needs {needed} bytes but only {available} remain")]
    TruncatedRecord {
        offset: usize,
        needed: usize,
        available: usize,
    },

    /// A sync marker was followed by a type id with no registered format.
    #[error("unknown message type id {type_id}")]
    UnknownType { type_id: u8 },

    /// A single field failed to decode.
    #[error("failed to decode field {field}: {reason}")]
    Decode { field: String, reason: String },

    /// The caller cancelled the operation; no results are returned.
    #[error("operation cancelled")]
    Cancelled,
}
