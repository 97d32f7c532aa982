//! In-memory source opener.
//!
//! Intended mainly for tests and synthetic pipelines: it feeds small
//! datasets directly into the multiplexer and makes multi-source boundary
//! behavior deterministic without touching the filesystem. Production code
//! should prefer [`FileOpener`](super::FileOpener) or another real opener.

use async_trait::async_trait;
use bytes::Bytes;
use std::io::Cursor;

use super::{Opener, SourceStream};
use crate::error::OpenerError;

/// An [`Opener`] backed by an in-memory byte buffer.
#[derive(Debug, Clone)]
pub struct MemoryOpener {
    name: String,
    data: Bytes,
}

impl MemoryOpener {
    /// Create a named in-memory source from any byte-like value.
    pub fn new(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }
}

#[async_trait]
impl Opener for MemoryOpener {
    fn name(&self) -> &str {
        &self.name
    }

    /// Always succeeds; the returned stream is independent of the opener's
    /// buffer.
    async fn open(&self) -> Result<SourceStream, OpenerError> {
        Ok(Box::new(Cursor::new(self.data.clone())))
    }
}
