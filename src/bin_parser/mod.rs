//! Sequential dataflash log decoding.
//!
//! [`BinLogParser`] memory maps a `.BIN` file and walks it record by
//! record: find the two byte sync marker, look the type id up in the
//! format table, validate the candidate against the trailing marker, then
//! decode fields per the registered descriptor. Anything that fails a
//! check is absorbed by advancing the scan position a single byte and
//! retrying, so a localized corruption never aborts the scan.

pub mod format;

use std::fs::File;
use std::ops::Range;
use std::path::Path;
use std::sync::Arc;

use log::{debug, warn};
use memmap2::Mmap;

use crate::config::BinLogConfig;
use crate::error::BinLogError;
use crate::{LogMessage, LogParser};
use format::FormatTable;

/// Sequential parser over a read-only memory map of one log file.
///
/// The map is acquired on construction and released when the parser is
/// dropped, error paths included.
pub struct BinLogParser {
    mmap: Option<Mmap>,
    config: Arc<BinLogConfig>,
}

impl BinLogParser {
    /// Opens and maps `path` with the default format constants.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, BinLogError> {
        Self::with_config(path, Arc::new(BinLogConfig::default()))
    }

    /// Opens and maps `path` with injected format constants.
    pub fn with_config(
        path: impl AsRef<Path>,
        config: Arc<BinLogConfig>,
    ) -> Result<Self, BinLogError> {
        let file = File::open(path)?;
        // an empty file cannot be mapped; it decodes to nothing
        let mmap = if file.metadata()?.len() == 0 {
            None
        } else {
            // SAFETY: the map is read-only and private to this parser.
            Some(unsafe { Mmap::map(&file)? })
        };
        Ok(Self { mmap, config })
    }

    /// File size in bytes.
    pub fn file_size(&self) -> usize {
        self.data().len()
    }

    pub(crate) fn data(&self) -> &[u8] {
        self.mmap.as_ref().map_or(&[], |m| &m[..])
    }

    /// Lazily decodes messages in file order, one record per `next` call.
    ///
    /// With a `filter`, only messages whose packet type equals it are
    /// emitted; skipped records still advance the scan by their full
    /// length, so FMT registration is unaffected. With an `end_offset`,
    /// the scan stops after the last record wholly contained in
    /// `[0, end_offset)`.
    pub fn messages(
        &self,
        filter: Option<&str>,
        end_offset: Option<usize>,
    ) -> Result<MessageIter<'_>, BinLogError> {
        let table = FormatTable::bootstrap(Arc::clone(&self.config))?;
        let end = end_offset.map_or(self.data().len(), |e| e.min(self.data().len()));
        Ok(MessageIter::new(self.data(), 0..end, table, filter))
    }

    /// Decodes every message in the file.
    pub fn decode_all(&self, filter: Option<&str>) -> Result<Vec<LogMessage>, BinLogError> {
        let mut messages = self.messages(filter, None)?;
        let decoded: Vec<LogMessage> = messages.by_ref().collect();
        let stats = messages.stats();
        if stats.resyncs > 0 {
            debug!(
                "decoded {} messages, absorbed {} resyncs: {stats:?}",
                decoded.len(),
                stats.resyncs
            );
        }
        Ok(decoded)
    }
}

impl LogParser for BinLogParser {
    fn parse_all(&self, filter: Option<&str>) -> Result<Vec<LogMessage>, BinLogError> {
        self.decode_all(filter)
    }
}

/// Counters for localized failures absorbed during one scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    /// Total one byte resynchronizations.
    pub resyncs: u64,
    /// Sync markers followed by a type id missing from the table.
    pub unknown_types: u64,
    /// Candidates rejected by the trailing marker check.
    pub rejected_candidates: u64,
    /// FMT records that failed structural validation.
    pub malformed_formats: u64,
    /// Records dropped by a field decode failure.
    pub decode_errors: u64,
    /// True when the range ended inside a declared record.
    pub truncated_tail: bool,
}

/// Pull-based message iterator over one byte range of a log.
///
/// One message is decoded per [`Iterator::next`] call; memory use is
/// constant apart from the decoded fields themselves.
pub struct MessageIter<'a> {
    data: &'a [u8],
    pos: usize,
    end: usize,
    table: FormatTable,
    filter: Option<String>,
    stats: ScanStats,
}

impl<'a> MessageIter<'a> {
    pub(crate) fn new(
        data: &'a [u8],
        range: Range<usize>,
        table: FormatTable,
        filter: Option<&str>,
    ) -> Self {
        let end = range.end.min(data.len());
        Self {
            data,
            pos: range.start.min(end),
            end,
            table,
            filter: filter.map(str::to_owned),
            stats: ScanStats::default(),
        }
    }

    /// Scan statistics accumulated so far.
    pub fn stats(&self) -> &ScanStats {
        &self.stats
    }

    /// Current scan position, in file offsets.
    pub fn position(&self) -> usize {
        self.pos
    }

    fn next_message(&mut self) -> Option<LogMessage> {
        let header = self.table.config().msg_header;
        let fmt_type = self.table.config().format_msg_type;
        loop {
            // sync to the next marker
            self.pos = find_marker(self.data, self.pos, self.end, &header)?;
            if self.pos + 3 > self.end {
                // marker at the very tail, no room for a type id
                return None;
            }
            let type_id = self.data[self.pos + 2];

            let Some(descriptor) = self.table.lookup(type_id) else {
                self.stats.unknown_types += 1;
                self.stats.resyncs += 1;
                self.pos += 1;
                continue;
            };
            let length = descriptor.length;
            let next = self.pos + length;

            // a record running past the range ends the scan cleanly
            if next > self.end {
                self.stats.truncated_tail = true;
                return None;
            }

            // trust the candidate only if its tail lines up with the next
            // marker or the end of the range; markers occur in payloads too
            if next != self.end && self.data.get(next..next + 2) != Some(&header[..]) {
                self.stats.rejected_candidates += 1;
                self.stats.resyncs += 1;
                self.pos += 1;
                continue;
            }

            // FMT records grow the table and are never emitted
            if type_id == fmt_type {
                let body = &self.data[self.pos + 3..next];
                match self.table.register(body) {
                    Ok(()) => self.pos = next,
                    Err(e) => {
                        warn!("malformed FMT record at offset {}: {e}", self.pos);
                        self.stats.malformed_formats += 1;
                        self.stats.resyncs += 1;
                        self.pos += 1;
                    }
                }
                continue;
            }

            // filtered-out records advance by full length without decoding
            if self.filter.as_deref().is_some_and(|f| f != descriptor.name) {
                self.pos = next;
                continue;
            }

            match descriptor.decode_body(&self.data[self.pos + 3..next]) {
                Ok(fields) => {
                    let message = LogMessage::new(descriptor.name.clone(), self.pos, fields);
                    self.pos = next;
                    return Some(message);
                }
                Err(e) => {
                    debug!("resync after decode error at offset {}: {e}", self.pos);
                    self.stats.decode_errors += 1;
                    self.stats.resyncs += 1;
                    self.pos += 1;
                }
            }
        }
    }
}

impl Iterator for MessageIter<'_> {
    type Item = LogMessage;

    fn next(&mut self) -> Option<LogMessage> {
        self.next_message()
    }
}

/// Offset of the next sync marker wholly inside `[pos, end)`.
pub(crate) fn find_marker(data: &[u8], pos: usize, end: usize, marker: &[u8; 2]) -> Option<usize> {
    let mut p = pos;
    while p + 2 <= end.min(data.len()) {
        if data[p] == marker[0] && data[p + 1] == marker[1] {
            return Some(p);
        }
        p += 1;
    }
    None
}

/// Builds the complete format table for `data` in a single linear pass.
///
/// Only FMT records are parsed; every other record is skipped by its
/// declared length after the same candidate validation the decoding scan
/// applies. This is the pre-scan the parallel coordinator broadcasts to
/// its workers, so a worker starting mid-file knows every descriptor its
/// range can reference.
pub fn prescan_formats(
    data: &[u8],
    config: Arc<BinLogConfig>,
) -> Result<FormatTable, BinLogError> {
    let mut table = FormatTable::bootstrap(config)?;
    let header = table.config().msg_header;
    let fmt_type = table.config().format_msg_type;
    let end = data.len();
    let mut pos = 0usize;
    while let Some(marker) = find_marker(data, pos, end, &header) {
        pos = marker;
        if pos + 3 > end {
            break;
        }
        let type_id = data[pos + 2];
        let Some(length) = table.lookup(type_id).map(|d| d.length) else {
            pos += 1;
            continue;
        };
        let next = pos + length;
        if next > end {
            break;
        }
        if next != end && data.get(next..next + 2) != Some(&header[..]) {
            pos += 1;
            continue;
        }
        if type_id == fmt_type {
            if let Err(e) = table.register(&data[pos + 3..next]) {
                warn!("malformed FMT record at offset {pos}: {e}");
                pos += 1;
                continue;
            }
        }
        pos = next;
    }
    debug!("pre-scan registered {} formats", table.len());
    Ok(table)
}
