//! Source openers.
//!
//! An [`Opener`] is a named entity that can produce one readable byte
//! stream on request. The multiplexer consumes an ordered list of openers
//! and opens them strictly one at a time, so an opener is the unit of
//! resource accounting for the whole merged stream.

mod file;
mod memory;
mod registry;

pub use file::{resolve_file_spec, FileOpener};
pub use memory::MemoryOpener;
pub use registry::{OpenerFactory, OpenerRegistry, OpenerRegistryBuilder};

use async_trait::async_trait;
use tokio::io::AsyncRead;

use crate::error::OpenerError;

/// A readable byte stream produced by an [`Opener`].
pub type SourceStream = Box<dyn AsyncRead + Send + Unpin>;

/// A named entity that can produce a fresh byte stream on demand.
#[async_trait]
pub trait Opener: Send + Sync {
    /// Stable display name identifying this source in metadata and errors.
    fn name(&self) -> &str;

    /// Open a fresh readable byte stream.
    ///
    /// The multiplexer invokes this at most once per entry per session.
    async fn open(&self) -> Result<SourceStream, OpenerError>;
}
