//! braid: source-aware stream multiplexing and CSV record decoding.
//!
//! This library merges an ordered list of independently openable sources
//! into one logical byte stream while preserving provenance (which source,
//! at what offset, produced each byte), and layers a CSV decoder on top
//! that keeps one canonical header while discarding the header rows that
//! real-world inputs repeat at the start of every physical source.
//!
//! # Example
//!
//! ```ignore
//! use braid::{CsvDecoder, CsvDecoderConfig, MuxConfig, MuxReader, Opener};
//! use braid::opener::MemoryOpener;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let sources: Vec<Box<dyn Opener>> = vec![
//!         Box::new(MemoryOpener::new("a.csv", "col1,col2\na1,b1\n")),
//!         Box::new(MemoryOpener::new("b.csv", "col1,col2\na2,b2\n")),
//!     ];
//!
//!     let mux = MuxReader::spawn(sources, MuxConfig::default(), CancellationToken::new());
//!     let decoder = CsvDecoder::new(CsvDecoderConfig::default());
//!     let mut records = decoder.decode(mux).await?;
//!
//!     while let Some(record) = records.next().await {
//!         println!("{}: {:?}", record.meta().name, record.by_name("col1"));
//!     }
//!     if let Some(err) = records.err() {
//!         eprintln!("decoding failed: {err}");
//!     }
//!     Ok(())
//! }
//! ```

pub mod decode;
pub mod error;
pub mod mux;
pub mod opener;

// Re-export main types
pub use decode::{CsvDecoder, CsvDecoderConfig, Header, Record, RecordIter};
pub use mux::{MuxConfig, MuxReader, SrcMeta};
pub use opener::{Opener, OpenerRegistry, SourceStream};
