/*!
 * Lazily opened switchboard for one device.
 */
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::Mutex;
use tracing::{debug, warn};

use testrig_switchboard::{EventParser, Switchboard, SwitchboardOptions, SwitchboardState};

use crate::communication::CommunicationType;
use crate::error::Result;

/// Holds at most one live switchboard for a device
///
/// The first `get` opens the transport; later calls return the same session
/// while it is open. When a session dies on a transport failure, the next `get`
/// returns that failure once and releases the session. The call after that opens
/// a fresh session continuing the same log file.
#[derive(Debug)]
pub struct SwitchboardSlot {
    device: String,
    address: String,
    communication: Arc<dyn CommunicationType>,
    parser: Arc<EventParser>,
    options: SwitchboardOptions,
    log_path: StdMutex<PathBuf>,
    current: Mutex<Option<Arc<Switchboard>>>,
}

impl SwitchboardSlot {
    /// Create an empty slot
    pub fn new<D, A>(
        device: D,
        address: A,
        communication: Arc<dyn CommunicationType>,
        parser: Arc<EventParser>,
        options: SwitchboardOptions,
    ) -> Self
    where
        D: Into<String>,
        A: Into<String>,
    {
        let log_path = StdMutex::new(options.log_path.clone());
        Self {
            device: device.into(),
            address: address.into(),
            communication,
            parser,
            options,
            log_path,
            current: Mutex::new(None),
        }
    }

    /// The open switchboard, opening one if needed
    pub async fn get(&self) -> Result<Arc<Switchboard>> {
        let mut current = self.current.lock().await;
        if let Some(switchboard) = current.as_ref() {
            if switchboard.state() == SwitchboardState::Open {
                return Ok(Arc::clone(switchboard));
            }
        }

        if let Some(stale) = current.take() {
            self.set_log_path(stale.log_path());
            let failure = stale.take_failure();
            if let Err(e) = stale.close().await {
                warn!(device = %self.device, "Failed to release stale switchboard: {}", e);
            }
            if let Some(failure) = failure {
                return Err(failure.into());
            }
        }

        let mut options = self.options.clone();
        options.log_path = self.log_path();
        let transport = self.communication.transport(&self.address)?;
        let switchboard = Arc::new(Switchboard::new(
            self.device.clone(),
            transport,
            Arc::clone(&self.parser),
            options,
        ));
        switchboard.open().await?;
        debug!(device = %self.device, "Switchboard created on {}", self.address);
        *current = Some(Arc::clone(&switchboard));
        Ok(switchboard)
    }

    /// Whether a session is currently open
    pub async fn is_open(&self) -> bool {
        self.current
            .lock()
            .await
            .as_ref()
            .map_or(false, |s| s.state() == SwitchboardState::Open)
    }

    /// Log file of the current (or next) session
    pub fn log_path(&self) -> PathBuf {
        self.log_path.lock().map(|p| p.clone()).unwrap_or_else(|p| p.into_inner().clone())
    }

    fn set_log_path(&self, path: PathBuf) {
        match self.log_path.lock() {
            Ok(mut current) => *current = path,
            Err(poisoned) => *poisoned.into_inner() = path,
        }
    }

    /// Close the current session, if any
    pub async fn close(&self) -> Result<()> {
        let taken = self.current.lock().await.take();
        if let Some(switchboard) = taken {
            self.set_log_path(switchboard.log_path());
            switchboard.close().await?;
        }
        Ok(())
    }
}
