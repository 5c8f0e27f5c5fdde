/*!
 * In-memory transport.
 *
 * Backed by `tokio::io::duplex`. The far end is handed to the caller, who plays
 * the device: whatever it writes shows up as device output, and whatever the
 * switchboard sends can be read from it. Used for virtual devices and tests.
 */
use async_trait::async_trait;
use tokio::io::DuplexStream;

use crate::error::{Result, SwitchboardError};
use crate::transport::{Transport, TransportStreams};

const DEFAULT_CAPACITY: usize = 64 * 1024;

/// Transport over an in-memory pipe
#[derive(Debug)]
pub struct DuplexTransport {
    address: String,
    host_end: Option<DuplexStream>,
    open: bool,
}

impl DuplexTransport {
    /// Create a transport and the device end of its pipe
    pub fn pair<A: Into<String>>(address: A) -> (Self, DuplexStream) {
        Self::with_capacity(address, DEFAULT_CAPACITY)
    }

    /// Create a transport with a specific pipe buffer size
    pub fn with_capacity<A: Into<String>>(address: A, capacity: usize) -> (Self, DuplexStream) {
        let (host_end, device_end) = tokio::io::duplex(capacity);
        let transport = Self {
            address: address.into(),
            host_end: Some(host_end),
            open: false,
        };
        (transport, device_end)
    }
}

#[async_trait]
impl Transport for DuplexTransport {
    fn name(&self) -> &'static str {
        "duplex"
    }

    fn address(&self) -> &str {
        &self.address
    }

    fn is_open(&self) -> bool {
        self.open
    }

    async fn open(&mut self) -> Result<TransportStreams> {
        let stream = self
            .host_end
            .take()
            .ok_or_else(|| SwitchboardError::transport(&self.address, "in-memory pipe already consumed"))?;
        self.open = true;
        Ok(TransportStreams::split(stream))
    }

    async fn close(&mut self) -> Result<()> {
        self.open = false;
        Ok(())
    }
}
