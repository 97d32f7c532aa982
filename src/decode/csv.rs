//! Boundary-aware CSV decoder.
//!
//! Rows follow RFC 4180 quoting with a configurable single-byte delimiter
//! and leading-whitespace trimming per field. One canonical header governs
//! the whole session: given explicitly, or inferred from the very first
//! row. At the start of each physical source, a row identical to the
//! canonical header is discarded as a redundant repeat; a first row that
//! differs is real data and is never discarded, even if it happens to look
//! header-like for some other schema.

use csv_core::{ReadRecordResult, Reader, ReaderBuilder};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::str;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{Header, Record};
use crate::error::{
    DecodeError, FieldCountSnafu, HeaderUnavailableSnafu, InvalidUtf8Snafu, StreamSnafu,
};
use crate::mux::{MuxReader, SrcMeta};

/// Configuration for the CSV decoder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CsvDecoderConfig {
    /// Field delimiter (default: `,`).
    #[serde(default = "default_delimiter")]
    pub delimiter: u8,
    /// Explicit canonical header. When `None` or empty, the header is
    /// inferred from the first row of the stream.
    #[serde(default)]
    pub header: Option<Vec<String>>,
}

impl Default for CsvDecoderConfig {
    fn default() -> Self {
        Self {
            delimiter: default_delimiter(),
            header: None,
        }
    }
}

impl CsvDecoderConfig {
    /// Set the field delimiter.
    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    /// Set an explicit canonical header.
    pub fn with_header(mut self, header: Vec<String>) -> Self {
        self.header = Some(header);
        self
    }
}

fn default_delimiter() -> u8 {
    b','
}

/// CSV decoder producing records from a multiplexed stream.
#[derive(Debug, Clone, Default)]
pub struct CsvDecoder {
    config: CsvDecoderConfig,
}

impl CsvDecoder {
    /// Create a decoder with the given configuration.
    pub fn new(config: CsvDecoderConfig) -> Self {
        Self { config }
    }

    /// Start decoding a merged stream.
    ///
    /// Establishes the canonical header (explicit, or inferred from the
    /// first row) and returns the record iterator. Fails with a
    /// configuration error when the header has duplicate field names or
    /// when there is no row to infer one from.
    pub async fn decode(&self, mux: MuxReader) -> Result<RecordIter, DecodeError> {
        let mut rows = RowReader::new(mux, self.config.delimiter);

        let header = match &self.config.header {
            Some(names) if !names.is_empty() => Header::new(names.clone())?,
            _ => {
                let first = rows.read_row().await?.context(HeaderUnavailableSnafu)?;
                debug!("Inferred header with {} field(s)", first.len());
                Header::new(first)?
            }
        };

        // The first source is still at its start: further rows identical
        // to the canonical header are redundant repeats.
        let last_meta = rows.meta().clone();
        Ok(RecordIter {
            header: Arc::new(header),
            state: DecodeState::AtSourceStart,
            pending: None,
            last_meta,
            error: None,
            rows,
        })
    }
}

/// Classification state of the record iterator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    /// Classifying rows at the start of a new source.
    AtSourceStart,
    /// A pushed-back row is waiting to be served.
    PendingServe,
    /// Serving rows directly.
    Normal,
    /// The final source ended cleanly.
    Exhausted,
    /// A sticky error was recorded.
    Failed,
}

/// Iterator over decoded records.
///
/// Not safe for concurrent use. Clean exhaustion and failure are
/// distinguishable: after [`next`](RecordIter::next) returns `None`,
/// [`err`](RecordIter::err) is `None` only if every source was decoded
/// completely.
pub struct RecordIter {
    rows: RowReader,
    header: Arc<Header>,
    state: DecodeState,
    /// One-slot pushback buffer for a row read during classification.
    pending: Option<(Vec<String>, SrcMeta)>,
    /// Last source position observed from the stream.
    last_meta: SrcMeta,
    /// Sticky error; once set, `next` returns `None`.
    error: Option<DecodeError>,
}

impl RecordIter {
    /// Advance to the next record.
    ///
    /// Returns `None` when the stream is exhausted or after a failure;
    /// inspect [`err`](RecordIter::err) to tell the two apart.
    pub async fn next(&mut self) -> Option<Record> {
        loop {
            match self.state {
                DecodeState::Exhausted | DecodeState::Failed => return None,
                DecodeState::PendingServe => {
                    let (fields, meta) = self.pending.take()?;
                    self.state = DecodeState::Normal;
                    return Some(Record::new(fields, self.header.clone(), meta));
                }
                DecodeState::AtSourceStart | DecodeState::Normal => {}
            }

            let row = match self.rows.read_row().await {
                Ok(row) => row,
                Err(err) => {
                    self.fail(err);
                    return None;
                }
            };
            let meta = self.rows.meta().clone();
            let started = self.rows.take_source_start();
            if self.is_source_start(&meta, started) {
                self.state = DecodeState::AtSourceStart;
            }

            let Some(fields) = row else {
                self.state = DecodeState::Exhausted;
                return None;
            };

            if self.state == DecodeState::AtSourceStart {
                if self.header.matches(&fields) {
                    debug!("Discarding repeated header row from {}", meta.name);
                    self.last_meta = meta;
                    continue;
                }
                if let Err(err) = self.check_field_count(&fields) {
                    self.fail(err);
                    return None;
                }
                // Real data: push it back and serve it on the next pass.
                self.last_meta = meta.clone();
                self.pending = Some((fields, meta));
                self.state = DecodeState::PendingServe;
                continue;
            }

            if let Err(err) = self.check_field_count(&fields) {
                self.fail(err);
                return None;
            }
            self.last_meta = meta.clone();
            return Some(Record::new(fields, self.header.clone(), meta));
        }
    }

    /// The sticky error recorded by a failed advance, if any.
    pub fn err(&self) -> Option<&DecodeError> {
        self.error.as_ref()
    }

    /// The canonical header for this session.
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Close the underlying multiplexer and stop iteration, discarding any
    /// rows still buffered. Idempotent; does not disturb a recorded error.
    pub fn close(&mut self) {
        self.rows.close();
        if self.state != DecodeState::Failed {
            self.state = DecodeState::Exhausted;
        }
    }

    fn check_field_count(&self, fields: &[String]) -> Result<(), DecodeError> {
        ensure!(
            fields.len() == self.header.len(),
            FieldCountSnafu {
                expected: self.header.len(),
                found: fields.len(),
            }
        );
        Ok(())
    }

    fn fail(&mut self, err: DecodeError) {
        warn!("Decoding failed: {err}");
        self.state = DecodeState::Failed;
        self.error = Some(err);
    }

    /// A row arrives "at a source start" when its bytes came from a fill
    /// that reset to offset zero, or when the source name changed.
    fn is_source_start(&self, meta: &SrcMeta, started: bool) -> bool {
        started || meta.name != self.last_meta.name
    }
}

/// Incremental raw-row reader over a merged stream.
///
/// Parsing state machines cannot rewind the underlying stream, so the
/// iterator above layers its one-slot pushback buffer on top of this
/// reader instead.
struct RowReader {
    mux: MuxReader,
    core: Reader,
    delimiter: u8,
    /// Quote-tracking state for leading-whitespace removal; persists
    /// across buffer fills.
    trim: TrimState,
    /// Raw input buffer; `start..end` is unparsed.
    buf: Vec<u8>,
    start: usize,
    end: usize,
    eof: bool,
    /// Source position of the most recent buffer fill.
    meta: SrcMeta,
    /// Set when a fill began at offset zero, i.e. a new source started.
    source_started: bool,
    /// Field bytes of the record being assembled.
    out: Vec<u8>,
    /// Field end offsets into `out`.
    ends: Vec<usize>,
}

const INPUT_BUF_SIZE: usize = 8 * 1024;
const OUTPUT_BUF_SIZE: usize = 8 * 1024;
const ENDS_BUF_SIZE: usize = 64;

/// Where the whitespace filter stands in the row structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TrimState {
    /// At the start of a field; spaces and tabs here are dropped.
    FieldStart,
    /// Inside an unquoted field.
    Unquoted,
    /// Inside a quoted field; everything is preserved.
    Quoted,
    /// Just saw a quote inside a quoted field; it either closes the
    /// field or escapes a literal quote.
    QuoteEnd,
}

impl RowReader {
    fn new(mux: MuxReader, delimiter: u8) -> Self {
        Self {
            mux,
            core: ReaderBuilder::new().delimiter(delimiter).build(),
            delimiter,
            trim: TrimState::FieldStart,
            buf: vec![0; INPUT_BUF_SIZE],
            start: 0,
            end: 0,
            eof: false,
            meta: SrcMeta::default(),
            source_started: false,
            out: vec![0; OUTPUT_BUF_SIZE],
            ends: vec![0; ENDS_BUF_SIZE],
        }
    }

    /// Source position of the bytes that completed the last row.
    fn meta(&self) -> &SrcMeta {
        &self.meta
    }

    /// Whether a new source started since the last call. Consumes the
    /// flag.
    fn take_source_start(&mut self) -> bool {
        std::mem::take(&mut self.source_started)
    }

    fn close(&mut self) {
        self.mux.close();
    }

    /// Read one raw row; `None` at end of input.
    ///
    /// Field counts are unconstrained here; the iterator enforces them
    /// against the canonical header.
    async fn read_row(&mut self) -> Result<Option<Vec<String>>, DecodeError> {
        let mut outlen = 0;
        let mut endlen = 0;
        loop {
            if self.start == self.end && !self.eof {
                self.fill().await?;
            }
            let (result, nin, nout, nend) = self.core.read_record(
                &self.buf[self.start..self.end],
                &mut self.out[outlen..],
                &mut self.ends[endlen..],
            );
            self.start += nin;
            outlen += nout;
            endlen += nend;
            match result {
                ReadRecordResult::InputEmpty => continue,
                ReadRecordResult::OutputFull => {
                    let grown = self.out.len() * 2;
                    self.out.resize(grown, 0);
                }
                ReadRecordResult::OutputEndsFull => {
                    let grown = self.ends.len() * 2;
                    self.ends.resize(grown, 0);
                }
                ReadRecordResult::Record => return Ok(Some(self.take_fields(endlen)?)),
                ReadRecordResult::End => return Ok(None),
            }
        }
    }

    /// Pull the next run of merged bytes and record where it came from.
    ///
    /// A single fill never spans a source boundary, so `meta` always names
    /// the source whose bytes sit in the buffer.
    async fn fill(&mut self) -> Result<(), DecodeError> {
        self.start = 0;
        let n = self.mux.read(&mut self.buf).await.context(StreamSnafu)?;
        if n == 0 {
            self.end = 0;
            self.eof = true;
            return Ok(());
        }
        self.end = self.trim_leading_space(n);
        let current = self.mux.current();
        self.meta = SrcMeta {
            byte_offset: current.byte_offset - n as u64,
            name: current.name,
        };
        if self.meta.byte_offset == 0 {
            self.source_started = true;
        }
        Ok(())
    }

    /// Drop spaces and tabs at the start of each field so quote
    /// recognition sees the quote as the field's first byte. Compacts
    /// `buf[..len]` in place and returns the kept length. Whitespace
    /// inside quoted fields is preserved.
    fn trim_leading_space(&mut self, len: usize) -> usize {
        let mut kept = 0;
        for i in 0..len {
            let byte = self.buf[i];
            if self.trim == TrimState::FieldStart
                && (byte == b' ' || byte == b'\t')
                && byte != self.delimiter
            {
                continue;
            }
            self.trim = match (self.trim, byte) {
                (TrimState::Quoted, b'"') => TrimState::QuoteEnd,
                (TrimState::Quoted, _) => TrimState::Quoted,
                (TrimState::QuoteEnd, b'"') => TrimState::Quoted,
                (TrimState::FieldStart, b'"') => TrimState::Quoted,
                (_, b) if b == self.delimiter => TrimState::FieldStart,
                (_, b'\n' | b'\r') => TrimState::FieldStart,
                _ => TrimState::Unquoted,
            };
            self.buf[kept] = byte;
            kept += 1;
        }
        kept
    }

    /// Copy assembled field bytes out as strings.
    fn take_fields(&self, endlen: usize) -> Result<Vec<String>, DecodeError> {
        let mut fields = Vec::with_capacity(endlen);
        let mut begin = 0;
        for &end in &self.ends[..endlen] {
            let text = str::from_utf8(&self.out[begin..end]).context(InvalidUtf8Snafu)?;
            fields.push(text.to_string());
            begin = end;
        }
        Ok(fields)
    }
}
