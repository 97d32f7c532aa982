//! Boundary-aware record decoding.
//!
//! Parses delimited rows from a multiplexed byte stream, establishes a
//! single canonical header for the whole session, and uses the
//! multiplexer's source metadata to discard header rows that real-world
//! inputs repeat verbatim at the start of every physical source.

mod csv;
mod header;
mod record;

pub use csv::{CsvDecoder, CsvDecoderConfig, RecordIter};
pub use header::Header;
pub use record::Record;
