/*!
 * Error types for the devices crate.
 */
use std::path::PathBuf;

use thiserror::Error;

use testrig_switchboard::SwitchboardError;

/// Error type for registry, capability, detection and device operations
#[derive(Error, Debug)]
pub enum DeviceError {
    /// An extension package was rejected
    #[error("Registration error for {name}: {reason}")]
    Registration {
        /// The offending name
        name: String,
        /// Why the package was rejected
        reason: String,
    },

    /// A capability is declared but cannot be provided
    #[error("Capability {interface} not ready on {device}: {reason}")]
    CapabilityNotReady {
        /// The device name
        device: String,
        /// The capability interface
        interface: String,
        /// Why resolution failed
        reason: String,
    },

    /// A post-operation device verification failed
    #[error("Health check {check} failed on {device}: {reason}")]
    HealthCheck {
        /// The device name
        device: String,
        /// The failing check
        check: String,
        /// The failure description
        reason: String,
    },

    /// Operational failure on a device
    #[error("Device {device} error: {reason}")]
    Device {
        /// The device name
        device: String,
        /// The failure description
        reason: String,
    },

    /// An expected credential file is absent
    #[error("Missing credential {key}: expected at {}", .path.display())]
    MissingCredential {
        /// The key identifier
        key: String,
        /// Where the key was expected
        path: PathBuf,
    },

    /// Detection could not run
    #[error("Detection error: {0}")]
    Detection(String),

    /// A named item does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Switchboard error
    #[error("Switchboard error: {0}")]
    Switchboard(#[from] SwitchboardError),

    /// Core error
    #[error("Core error: {0}")]
    Core(#[from] testrig_core::error::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type for device operations
pub type Result<T> = std::result::Result<T, DeviceError>;

impl DeviceError {
    /// Create a new registration error
    pub fn registration<N: AsRef<str>, S: AsRef<str>>(name: N, reason: S) -> Self {
        DeviceError::Registration {
            name: name.as_ref().to_string(),
            reason: reason.as_ref().to_string(),
        }
    }

    /// Create a new capability-not-ready error
    pub fn capability_not_ready<D, I, S>(device: D, interface: I, reason: S) -> Self
    where
        D: AsRef<str>,
        I: AsRef<str>,
        S: AsRef<str>,
    {
        DeviceError::CapabilityNotReady {
            device: device.as_ref().to_string(),
            interface: interface.as_ref().to_string(),
            reason: reason.as_ref().to_string(),
        }
    }

    /// Create a new health-check error
    pub fn health_check<D, C, S>(device: D, check: C, reason: S) -> Self
    where
        D: AsRef<str>,
        C: AsRef<str>,
        S: AsRef<str>,
    {
        DeviceError::HealthCheck {
            device: device.as_ref().to_string(),
            check: check.as_ref().to_string(),
            reason: reason.as_ref().to_string(),
        }
    }

    /// Create a new generic device error
    pub fn device<D: AsRef<str>, S: AsRef<str>>(device: D, reason: S) -> Self {
        DeviceError::Device {
            device: device.as_ref().to_string(),
            reason: reason.as_ref().to_string(),
        }
    }

    /// Create a new detection error
    pub fn detection<S: AsRef<str>>(msg: S) -> Self {
        DeviceError::Detection(msg.as_ref().to_string())
    }

    /// Create a new not-found error
    pub fn not_found<S: AsRef<str>>(what: S) -> Self {
        DeviceError::NotFound(what.as_ref().to_string())
    }
}

impl From<serde_json::Error> for DeviceError {
    fn from(err: serde_json::Error) -> Self {
        DeviceError::Serialization(err.to_string())
    }
}
