//! Source-aware stream multiplexing.
//!
//! [`MuxReader`] merges an ordered list of [`Opener`]s into one logical
//! byte stream while tracking which source, at what offset, produced the
//! bytes most recently delivered to the consumer.
//!
//! A single background producer task opens sources strictly sequentially,
//! holding at most one source handle open at a time, and forwards bounded
//! chunks through a backpressured channel. Partial data always reaches the
//! consumer before a read failure is surfaced, and an open or read failure
//! aborts the whole merged stream with an error naming the source.
//!
//! Source transitions are announced through a coalescing single-slot
//! mailbox: publishing never blocks the producer, and a consumer that polls
//! late only ever observes the latest boundary.

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{MuxError, OpenSnafu, ReadSnafu};
use crate::opener::Opener;

/// Default maximum bytes read from a source per chunk.
const DEFAULT_CHUNK_SIZE: usize = 32 * 1024;

/// Snapshot of the active source and how many of its bytes have been
/// delivered to the consumer.
///
/// The offset resets to 0 exactly when a new source begins and is
/// otherwise monotonically non-decreasing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SrcMeta {
    /// Display name of the active source.
    pub name: String,
    /// Bytes delivered to the consumer from this source so far.
    pub byte_offset: u64,
}

impl SrcMeta {
    /// Snapshot for the very start of a source.
    pub fn start_of(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            byte_offset: 0,
        }
    }
}

/// Configuration for the multiplexer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MuxConfig {
    /// Maximum bytes read from a source per chunk (default: 32 KiB).
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Capacity of the producer-to-consumer chunk channel (default: 1).
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl MuxConfig {
    /// Set the per-chunk read size.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Set the chunk channel capacity.
    pub fn with_channel_capacity(mut self, channel_capacity: usize) -> Self {
        self.channel_capacity = channel_capacity;
        self
    }
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_channel_capacity() -> usize {
    1
}

/// One contiguous run of bytes from a single source.
struct Chunk {
    data: Bytes,
    /// Source name and offset of the first byte in `data`.
    meta: SrcMeta,
}

/// Terminal condition of the merged stream, as seen by the consumer.
enum StreamState {
    Running,
    Eof,
    Failed(String),
}

/// Consumer handle over the merged byte stream.
///
/// Not safe for concurrent mutation from multiple tasks; [`current`] and
/// [`meta_watch`] are the only surfaces designed to be observed while a
/// `read` or `await_boundary` call is in flight.
///
/// [`current`]: MuxReader::current
/// [`meta_watch`]: MuxReader::meta_watch
pub struct MuxReader {
    rx: mpsc::Receiver<Result<Chunk, MuxError>>,
    pending: Option<Chunk>,
    current_tx: watch::Sender<SrcMeta>,
    boundary_rx: watch::Receiver<Option<SrcMeta>>,
    shutdown: CancellationToken,
    state: StreamState,
}

impl MuxReader {
    /// Spawn the background producer and return the consumer handle.
    ///
    /// Cancelling `shutdown` (or calling [`close`](MuxReader::close))
    /// stops the producer without blocking; the producer releases its one
    /// open source handle on its next await point.
    pub fn spawn(
        openers: Vec<Box<dyn Opener>>,
        config: MuxConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        let (boundary_tx, boundary_rx) = watch::channel(None);
        let (current_tx, _) = watch::channel(SrcMeta::default());

        tokio::spawn(produce(openers, config, tx, boundary_tx, shutdown.clone()));

        Self {
            rx,
            pending: None,
            current_tx,
            boundary_rx,
            shutdown,
            state: StreamState::Running,
        }
    }

    /// Fill `buf` with merged bytes.
    ///
    /// Returns `Ok(0)` once every source has been exhausted cleanly. A
    /// fatal open or read error is surfaced exactly once; afterwards the
    /// stream stays failed and reads report [`MuxError::Terminated`].
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, MuxError> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if self.shutdown.is_cancelled() {
                return Err(MuxError::Closed);
            }
            if let Some(n) = self.copy_pending(buf) {
                return Ok(n);
            }
            match &self.state {
                StreamState::Eof => return Ok(0),
                StreamState::Failed(message) => {
                    return Err(MuxError::Terminated {
                        message: message.clone(),
                    })
                }
                StreamState::Running => {}
            }

            let next = tokio::select! {
                _ = self.shutdown.cancelled() => return Err(MuxError::Closed),
                next = self.rx.recv() => next,
            };
            if !self.accept(next)? {
                return Ok(0);
            }
        }
    }

    /// Close the multiplexer. Idempotent; never blocks waiting for the
    /// producer, and safe to call from a different task than the one that
    /// spawned it.
    pub fn close(&mut self) {
        self.shutdown.cancel();
        self.rx.close();
    }

    /// Non-blocking snapshot of the most recently delivered source
    /// position.
    pub fn current(&self) -> SrcMeta {
        self.current_tx.borrow().clone()
    }

    /// Subscribe to source-position snapshots for observation from other
    /// tasks.
    pub fn meta_watch(&self) -> watch::Receiver<SrcMeta> {
        self.current_tx.subscribe()
    }

    /// Wait for the next source boundary.
    ///
    /// Returns `Ok(Some(meta))` with `byte_offset == 0` when a new source
    /// becomes active, `Ok(None)` once every boundary has been observed
    /// and the producer has finished, and [`MuxError::Cancelled`] when
    /// `cancel` fires first. Boundaries coalesce: only the latest
    /// unobserved one is delivered.
    pub async fn await_boundary(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Option<SrcMeta>, MuxError> {
        if self.shutdown.is_cancelled() {
            return Err(MuxError::Closed);
        }
        tokio::select! {
            _ = cancel.cancelled() => Err(MuxError::Cancelled),
            _ = self.shutdown.cancelled() => Err(MuxError::Closed),
            changed = self.boundary_rx.changed() => match changed {
                Ok(()) => Ok(self.boundary_rx.borrow_and_update().clone()),
                Err(_) => Ok(None),
            },
        }
    }

    /// Copy from the buffered chunk into `buf`, advancing the published
    /// position past the delivered bytes.
    fn copy_pending(&mut self, buf: &mut [u8]) -> Option<usize> {
        let chunk = self.pending.as_mut()?;
        let n = chunk.data.len().min(buf.len());
        buf[..n].copy_from_slice(&chunk.data.split_to(n));
        chunk.meta.byte_offset += n as u64;
        let meta = chunk.meta.clone();
        if chunk.data.is_empty() {
            self.pending = None;
        }
        self.current_tx.send_replace(meta);
        Some(n)
    }

    /// Fold the next channel message into consumer state.
    ///
    /// Returns `Ok(false)` on clean end of stream.
    fn accept(&mut self, next: Option<Result<Chunk, MuxError>>) -> Result<bool, MuxError> {
        match next {
            Some(Ok(chunk)) => {
                // Publish the offset reset before any of the new source's
                // bytes are handed out.
                if chunk.meta.byte_offset == 0 {
                    self.current_tx.send_replace(chunk.meta.clone());
                }
                self.pending = Some(chunk);
                Ok(true)
            }
            Some(Err(err)) => {
                self.state = StreamState::Failed(err.to_string());
                Err(err)
            }
            None => {
                self.state = StreamState::Eof;
                Ok(false)
            }
        }
    }
}

impl AsyncRead for MuxReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.shutdown.is_cancelled() {
            return Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, MuxError::Closed)));
        }
        if let Some(chunk) = this.pending.as_mut() {
            let n = chunk.data.len().min(buf.remaining());
            buf.put_slice(&chunk.data.split_to(n));
            chunk.meta.byte_offset += n as u64;
            let meta = chunk.meta.clone();
            if chunk.data.is_empty() {
                this.pending = None;
            }
            this.current_tx.send_replace(meta);
            return Poll::Ready(Ok(()));
        }
        match &this.state {
            StreamState::Eof => return Poll::Ready(Ok(())),
            StreamState::Failed(message) => {
                let err = MuxError::Terminated {
                    message: message.clone(),
                };
                return Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, err)));
            }
            StreamState::Running => {}
        }
        match this.rx.poll_recv(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(next) => match this.accept(next) {
                Ok(true) => {
                    // A chunk is now buffered; deliver it on the next poll
                    // without re-registering.
                    cx.waker().wake_by_ref();
                    Poll::Pending
                }
                Ok(false) => Poll::Ready(Ok(())),
                Err(err) => Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, err))),
            },
        }
    }
}

impl Drop for MuxReader {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Background producer: opens each source in list order, announces its
/// boundary, and forwards its bytes in bounded chunks.
async fn produce(
    openers: Vec<Box<dyn Opener>>,
    config: MuxConfig,
    tx: mpsc::Sender<Result<Chunk, MuxError>>,
    boundary_tx: watch::Sender<Option<SrcMeta>>,
    shutdown: CancellationToken,
) {
    let chunk_size = config.chunk_size.max(1);

    for opener in &openers {
        if shutdown.is_cancelled() {
            return;
        }
        let name = opener.name().to_string();

        let mut stream = match opener.open().await.with_context(|_| OpenSnafu {
            name: name.clone(),
        }) {
            Ok(stream) => stream,
            Err(err) => {
                warn!("Aborting merged stream: {err}");
                send_failure(&tx, err, &shutdown).await;
                return;
            }
        };
        debug!("Opened source {name}");

        // Wait until the consumer has drained every earlier chunk before
        // announcing the new source, so the boundary is never observable
        // ahead of undelivered bytes from the previous source.
        let mut permit = tokio::select! {
            _ = shutdown.cancelled() => return,
            permit = tx.reserve() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
        };
        let _ = boundary_tx.send(Some(SrcMeta::start_of(&name)));

        let mut offset = 0u64;
        loop {
            let mut buf = BytesMut::with_capacity(chunk_size);
            let read = tokio::select! {
                _ = shutdown.cancelled() => return,
                read = stream.read_buf(&mut buf) => read,
            };
            let n = match read.with_context(|_| ReadSnafu { name: name.clone() }) {
                Ok(n) => n,
                Err(err) => {
                    warn!("Aborting merged stream: {err}");
                    permit.send(Err(err));
                    return;
                }
            };
            if n == 0 {
                break;
            }

            permit.send(Ok(Chunk {
                data: buf.freeze(),
                meta: SrcMeta {
                    name: name.clone(),
                    byte_offset: offset,
                },
            }));
            offset += n as u64;

            permit = tokio::select! {
                _ = shutdown.cancelled() => return,
                permit = tx.reserve() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
            };
        }
        debug!("Source {name} exhausted after {offset} bytes");
        // The source handle drops here, before the next one opens.
    }
    // Dropping the channel senders signals clean end of stream and marks
    // the boundary mailbox closed once drained.
}

/// Deliver a fatal stream error, giving up if the consumer is gone.
async fn send_failure(
    tx: &mpsc::Sender<Result<Chunk, MuxError>>,
    err: MuxError,
    shutdown: &CancellationToken,
) {
    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = tx.send(Err(err)) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mux_config_defaults() {
        let config = MuxConfig::default();
        assert_eq!(config.chunk_size, 32 * 1024);
        assert_eq!(config.channel_capacity, 1);
    }

    #[test]
    fn test_mux_config_builders() {
        let config = MuxConfig::default()
            .with_chunk_size(512)
            .with_channel_capacity(4);
        assert_eq!(config.chunk_size, 512);
        assert_eq!(config.channel_capacity, 4);
    }

    #[test]
    fn test_src_meta_start_of() {
        let meta = SrcMeta::start_of("a.csv");
        assert_eq!(meta.name, "a.csv");
        assert_eq!(meta.byte_offset, 0);
        assert_eq!(SrcMeta::default().name, "");
    }
}
