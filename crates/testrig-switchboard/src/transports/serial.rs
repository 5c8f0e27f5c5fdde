/*!
 * Serial port transport.
 *
 * Opening a serial port right after a device re-enumerates is flaky, so `open`
 * retries a bounded number of times with a growing delay.
 */
use std::time::Duration;

use async_trait::async_trait;
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info, warn};

use crate::error::{Result, SwitchboardError};
use crate::transport::{Transport, TransportStreams};

/// Default baud rate for serial devices
pub const DEFAULT_BAUDRATE: u32 = 115_200;

const OPEN_ATTEMPTS: u32 = 3;
const OPEN_BACKOFF: Duration = Duration::from_millis(250);

/// Transport over a serial port
#[derive(Debug)]
pub struct SerialTransport {
    address: String,
    baudrate: u32,
    open: bool,
}

impl SerialTransport {
    /// Create a serial transport for the port at `address`
    pub fn new<A: Into<String>>(address: A, baudrate: u32) -> Self {
        Self {
            address: address.into(),
            baudrate,
            open: false,
        }
    }

    /// The configured baud rate
    pub fn baudrate(&self) -> u32 {
        self.baudrate
    }
}

/// List the serial port paths visible to the host right now
pub fn available_ports() -> Result<Vec<String>> {
    let ports = tokio_serial::available_ports()
        .map_err(|e| SwitchboardError::transport("serial", format!("failed to enumerate ports: {}", e)))?;
    Ok(ports.into_iter().map(|p| p.port_name).collect())
}

#[async_trait]
impl Transport for SerialTransport {
    fn name(&self) -> &'static str {
        "serial"
    }

    fn address(&self) -> &str {
        &self.address
    }

    fn is_open(&self) -> bool {
        self.open
    }

    async fn open(&mut self) -> Result<TransportStreams> {
        let mut last_error = None;
        for attempt in 1..=OPEN_ATTEMPTS {
            match tokio_serial::new(&self.address, self.baudrate).open_native_async() {
                Ok(stream) => {
                    info!("Opened serial port {} at {} baud", self.address, self.baudrate);
                    self.open = true;
                    return Ok(TransportStreams::split(stream));
                }
                Err(e) => {
                    warn!("Attempt {} to open {} failed: {}", attempt, self.address, e);
                    last_error = Some(e);
                    tokio::time::sleep(OPEN_BACKOFF * attempt).await;
                }
            }
        }
        let reason = last_error.map_or_else(|| "unknown error".to_string(), |e| e.to_string());
        Err(SwitchboardError::transport(&self.address, reason))
    }

    async fn close(&mut self) -> Result<()> {
        // The port closes when the switchboard drops both halves
        if self.open {
            debug!("Released serial port {}", self.address);
        }
        self.open = false;
        Ok(())
    }
}
