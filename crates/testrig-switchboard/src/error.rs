/*!
 * Error types for the switchboard crate.
 */
use thiserror::Error;

/// Error type for transport and switchboard operations
#[derive(Error, Debug)]
pub enum SwitchboardError {
    /// The switchboard is not open
    #[error("Switchboard for {0} is not open")]
    NotOpen(String),

    /// The session closed while the operation was outstanding
    #[error("Switchboard session for {device} closed: {reason}")]
    SessionClosed {
        /// The device name
        device: String,
        /// Why the session ended
        reason: String,
    },

    /// The underlying transport failed
    #[error("Transport error on {address}: {reason}")]
    Transport {
        /// The transport address
        address: String,
        /// The failure description
        reason: String,
    },

    /// A pattern could not be compiled
    #[error("Invalid pattern {pattern:?}: {reason}")]
    InvalidPattern {
        /// The offending pattern
        pattern: String,
        /// The regex compiler message
        reason: String,
    },

    /// The device log could not be written
    #[error("Log error: {0}")]
    Log(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Core error
    #[error("Core error: {0}")]
    Core(#[from] testrig_core::error::Error),
}

/// Result type for switchboard operations
pub type Result<T> = std::result::Result<T, SwitchboardError>;

impl SwitchboardError {
    /// Create a new transport error
    pub fn transport<A: AsRef<str>, S: AsRef<str>>(address: A, reason: S) -> Self {
        SwitchboardError::Transport {
            address: address.as_ref().to_string(),
            reason: reason.as_ref().to_string(),
        }
    }

    /// Create a new session-closed error
    pub fn session_closed<D: AsRef<str>, S: AsRef<str>>(device: D, reason: S) -> Self {
        SwitchboardError::SessionClosed {
            device: device.as_ref().to_string(),
            reason: reason.as_ref().to_string(),
        }
    }

    /// Create a new log error
    pub fn log<S: AsRef<str>>(msg: S) -> Self {
        SwitchboardError::Log(msg.as_ref().to_string())
    }
}

impl From<regex::Error> for SwitchboardError {
    fn from(err: regex::Error) -> Self {
        SwitchboardError::InvalidPattern {
            pattern: String::new(),
            reason: err.to_string(),
        }
    }
}
