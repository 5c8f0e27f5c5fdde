/*!
 * Transport definitions for testrig.
 *
 * A transport is an abstract byte stream to a physical device. Opening it yields
 * independent read and write halves; the switchboard owns both for the lifetime
 * of the session. Protocol semantics (SSH auth, ADB framing, baud negotiation)
 * stay inside the concrete transport.
 */
use std::fmt::Debug;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;

/// Read half of an open transport
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Write half of an open transport
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// The two halves handed out by [`Transport::open`]
pub struct TransportStreams {
    /// Bytes coming from the device
    pub reader: BoxedReader,
    /// Bytes going to the device
    pub writer: BoxedWriter,
}

impl TransportStreams {
    /// Create a pair of streams
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }

    /// Split a bidirectional stream into its halves
    pub fn split<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::new(reader, writer)
    }
}

impl Debug for TransportStreams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportStreams").finish_non_exhaustive()
    }
}

/// Transport trait for implementing device byte streams
///
/// Bounded retry with backoff on `open` is the transport's own concern; the
/// switchboard calls `open` exactly once per session.
#[async_trait]
pub trait Transport: Send + Sync + Debug {
    /// Get the transport name (e.g. "process", "serial")
    fn name(&self) -> &'static str;

    /// Get the address this transport connects to
    fn address(&self) -> &str;

    /// Whether the transport currently holds an open connection
    fn is_open(&self) -> bool;

    /// Open the connection and hand out its read and write halves
    async fn open(&mut self) -> Result<TransportStreams>;

    /// Release the connection. Calling this on a closed transport is a no-op.
    async fn close(&mut self) -> Result<()>;
}
