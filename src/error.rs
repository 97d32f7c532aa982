//! Error types for braid using snafu.
//!
//! This module defines structured error types with context selectors for
//! all error conditions in the codebase, one enum per component.

use snafu::prelude::*;

// ============ Opener Errors ============

/// Errors that can occur while resolving source specifications and opening
/// individual sources.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum OpenerError {
    /// No files matched the given specification.
    #[snafu(display("No files matched: {spec:?}"))]
    NoMatch { spec: String },

    /// The specification uses a scheme the file opener does not support.
    #[snafu(display("Unsupported scheme {scheme:?} in {spec:?}"))]
    UnsupportedScheme { scheme: String, spec: String },

    /// A file: URL could not be converted to a filesystem path.
    #[snafu(display("Invalid file URL: {spec:?}"))]
    InvalidFileUrl { spec: String },

    /// The specification is not a valid glob pattern.
    #[snafu(display("Invalid glob pattern: {spec:?}"))]
    BadPattern {
        spec: String,
        source: glob::PatternError,
    },

    /// A matched glob entry could not be read.
    #[snafu(display("Failed to read glob entry for {spec:?}"))]
    GlobEntry {
        spec: String,
        source: glob::GlobError,
    },

    /// Opening a file failed.
    #[snafu(display("Failed to open {path}"))]
    FileOpen {
        path: String,
        source: std::io::Error,
    },

    /// No factory is registered for the detected scheme.
    #[snafu(display("No opener registered for scheme {scheme:?} (spec {spec:?})"))]
    UnknownScheme { scheme: String, spec: String },
}

// ============ Multiplexer Errors ============

/// Errors surfaced by the stream multiplexer.
///
/// `Open` and `Read` are fatal for the whole merged stream and carry the
/// name of the offending source. Once one has been surfaced through `read`,
/// the stream stays failed and further reads report `Terminated`.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum MuxError {
    /// A source failed to open. Aborts the merged stream; no bytes from
    /// this or later sources are delivered.
    #[snafu(display("Failed to open source {name}"))]
    Open { name: String, source: OpenerError },

    /// A source failed mid-read. Bytes obtained before the failure have
    /// already been delivered.
    #[snafu(display("Failed to read source {name}"))]
    Read {
        name: String,
        source: std::io::Error,
    },

    /// A blocking wait was cancelled by its cancellation token.
    #[snafu(display("Wait was cancelled"))]
    Cancelled,

    /// The multiplexer was closed.
    #[snafu(display("Multiplexer is closed"))]
    Closed,

    /// The merged stream previously failed; the original error was already
    /// surfaced once.
    #[snafu(display("Merged stream previously failed: {message}"))]
    Terminated { message: String },
}

// ============ Decode Errors ============

/// Errors that can occur while decoding records from a merged stream.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum DecodeError {
    /// The canonical header contains the same field name twice.
    #[snafu(display("Duplicate field {name:?} in header"))]
    DuplicateHeaderField { name: String },

    /// No explicit header was configured and the stream produced no row
    /// to infer one from.
    #[snafu(display("Unable to infer header: stream produced no row"))]
    HeaderUnavailable,

    /// A record's field count does not match the canonical header.
    #[snafu(display("Record has {found} fields, canonical header has {expected}"))]
    FieldCount { expected: usize, found: usize },

    /// A field is not valid UTF-8.
    #[snafu(display("Field is not valid UTF-8"))]
    InvalidUtf8 { source: std::str::Utf8Error },

    /// The underlying merged stream failed.
    #[snafu(display("Merged stream failed while decoding"))]
    Stream { source: MuxError },
}
