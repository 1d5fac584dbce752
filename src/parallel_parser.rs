//! Parallel whole-file decoding.
//!
//! FMT records are dispersed through a log, so a worker dropped into the
//! middle of the file would not know how to decode what it sees. The
//! coordinator solves this with a single cheap pre-scan that collects every
//! FMT record into one immutable [`FormatTable`], then splits the file into
//! message-aligned chunks and decodes them on a rayon pool, one worker per
//! chunk. Chunks are disjoint and each preserves in-chunk order, so
//! concatenating worker outputs in chunk order reproduces the sequential
//! scan exactly.

use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use log::debug;
use rayon::prelude::*;

use crate::bin_parser::format::FormatTable;
use crate::bin_parser::{BinLogParser, MessageIter, find_marker, prescan_formats};
use crate::config::BinLogConfig;
use crate::error::BinLogError;
use crate::{LogMessage, LogParser};

/// Execution mode for [`ParallelBinLogParser`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParallelMode {
    /// Compute-bound decoding; defaults to the available hardware
    /// parallelism.
    Workers,
    /// I/O-bound decoding; defaults to 16 workers.
    Threads,
}

impl ParallelMode {
    /// Default worker count for this mode.
    pub fn default_worker_count(&self) -> usize {
        match self {
            ParallelMode::Workers => thread::available_parallelism().map_or(1, |n| n.get()),
            ParallelMode::Threads => 16,
        }
    }
}

/// Cooperative cancellation signal shared between a caller and the
/// coordinator.
///
/// Workers observe the token after each record; a cancelled run finishes
/// in-flight records, returns [`BinLogError::Cancelled`] and discards all
/// partial results.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation; observed at the next record boundary.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

/// Decodes a whole log by delegating disjoint, message-aligned chunks to
/// parallel workers and merging their output in chunk order.
pub struct ParallelBinLogParser {
    path: PathBuf,
    mode: ParallelMode,
    worker_count: usize,
    config: Arc<BinLogConfig>,
    cancel: Option<CancelToken>,
}

impl ParallelBinLogParser {
    /// Creates a coordinator for `path` with the mode's default worker
    /// count and the default format constants.
    pub fn new(path: impl AsRef<Path>, mode: ParallelMode) -> Self {
        Self::with_config(path, mode, Arc::new(BinLogConfig::default()))
    }

    /// Creates a coordinator with injected format constants.
    pub fn with_config(
        path: impl AsRef<Path>,
        mode: ParallelMode,
        config: Arc<BinLogConfig>,
    ) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            mode,
            worker_count: mode.default_worker_count(),
            config,
            cancel: None,
        }
    }

    /// Overrides the mode's default worker count.
    pub fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count.max(1);
        self
    }

    /// Installs a cancellation token observed between records.
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Decodes every message in the file, in chronological order.
    ///
    /// Equivalent to [`BinLogParser::decode_all`] over the whole file for
    /// any worker count. The first fatal worker error aborts the run.
    pub fn process_all(&self, filter: Option<&str>) -> Result<Vec<LogMessage>, BinLogError> {
        self.check_cancel()?;
        let parser = BinLogParser::with_config(&self.path, Arc::clone(&self.config))?;
        let data = parser.data();
        let table = prescan_formats(data, Arc::clone(&self.config))?;
        self.check_cancel()?;

        let chunks = align_chunks(data, self.worker_count, &table);
        debug!(
            "decoding {} bytes in {} chunks with {} workers ({:?} mode)",
            data.len(),
            chunks.len(),
            self.worker_count,
            self.mode
        );

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.worker_count)
            .build()
            .map_err(|e| BinLogError::Config(format!("failed to build worker pool: {e}")))?;
        let decoded: Result<Vec<Vec<LogMessage>>, BinLogError> = pool.install(|| {
            chunks
                .par_iter()
                .map(|chunk| self.decode_chunk(chunk.clone(), &table, filter))
                .collect()
        });
        let decoded = decoded?;
        self.check_cancel()?;
        Ok(decoded.into_iter().flatten().collect())
    }

    /// Decodes one chunk against the broadcast table.
    ///
    /// Each worker maps the file independently; the OS shares the pages.
    fn decode_chunk(
        &self,
        chunk: Range<usize>,
        table: &FormatTable,
        filter: Option<&str>,
    ) -> Result<Vec<LogMessage>, BinLogError> {
        self.check_cancel()?;
        let parser = BinLogParser::with_config(&self.path, Arc::clone(&self.config))?;
        let mut messages = MessageIter::new(parser.data(), chunk, table.clone(), filter);
        let mut decoded = Vec::new();
        while let Some(message) = messages.next() {
            decoded.push(message);
            self.check_cancel()?;
        }
        Ok(decoded)
    }

    fn check_cancel(&self) -> Result<(), BinLogError> {
        match &self.cancel {
            Some(token) if token.is_cancelled() => Err(BinLogError::Cancelled),
            _ => Ok(()),
        }
    }
}

impl LogParser for ParallelBinLogParser {
    fn parse_all(&self, filter: Option<&str>) -> Result<Vec<LogMessage>, BinLogError> {
        self.process_all(filter)
    }
}

/// Splits `data` into at most `worker_count` disjoint chunks whose starts
/// are validated record boundaries.
///
/// Nominal equal-size slice offsets are pushed forward to the next record
/// start that passes candidate validation; a slice start becomes the
/// previous slice's end, the first slice starts at 0 and the last ends at
/// the file size. Zero length slices are dropped.
fn align_chunks(data: &[u8], worker_count: usize, table: &FormatTable) -> Vec<Range<usize>> {
    let len = data.len();
    if len == 0 || worker_count == 0 {
        return Vec::new();
    }
    let nominal = (len / worker_count).max(1);
    let mut starts = vec![0usize];
    let mut last = 0usize;
    for worker in 1..worker_count {
        let aligned = align_to_record(data, worker * nominal, table);
        if aligned > last && aligned < len {
            starts.push(aligned);
            last = aligned;
        }
    }
    let mut chunks = Vec::with_capacity(starts.len());
    for (i, &start) in starts.iter().enumerate() {
        let end = starts.get(i + 1).copied().unwrap_or(len);
        if start < end {
            chunks.push(start..end);
        }
    }
    chunks
}

/// First offset at or after `nominal` that starts a validated record:
/// a sync marker, a known type id, the declared length in range and the
/// tail lining up with the next marker or the end of the file.
fn align_to_record(data: &[u8], nominal: usize, table: &FormatTable) -> usize {
    let header = table.config().msg_header;
    let len = data.len();
    let mut pos = nominal;
    while let Some(marker) = find_marker(data, pos, len, &header) {
        if marker + 3 > len {
            break;
        }
        if let Some(descriptor) = table.lookup(data[marker + 2]) {
            let next = marker + descriptor.length;
            if next <= len && (next == len || data.get(next..next + 2) == Some(&header[..])) {
                return marker;
            }
        }
        pos = marker + 1;
    }
    len
}
