/*!
 * testrig Devices
 *
 * This crate provides device models, extension packages, capability
 * resolution, detection and the device manager for the testrig fleet.
 */

#![warn(missing_docs)]

// Re-export core types
pub use testrig_core::prelude;

pub mod builtin;
pub mod capability;
pub mod communication;
pub mod detection;
pub mod device;
pub mod error;
pub mod extension;
pub mod health;
pub mod keys;
pub mod manager;
pub mod records;
pub mod registry;
pub mod session;

pub use builtin::builtin_package;
pub use capability::{Capability, CapabilityFlavor, CapabilityInterface, CapabilityResolver};
pub use communication::CommunicationType;
pub use detection::{DetectQuery, DetectionEngine, DetectionReport, Identify, MatchCriterion, QueryResponse};
pub use device::{Device, DeviceInfo};
pub use error::{DeviceError, Result};
pub use extension::{DeviceModelDescriptor, ExtensionPackage};
pub use health::{HealthCheck, ReadySetting, RecoveryHook};
pub use manager::{Manager, ManagerEvent, RedetectOutcome};
pub use records::DeviceRecord;
pub use registry::{ExtensionRegistry, RegistrySnapshot};

/// testrig devices crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize the device system
pub fn init() -> std::result::Result<(), testrig_core::error::Error> {
    tracing::info!("testrig devices {} initialized", VERSION);
    Ok(())
}

/// A registry holding the built-in package
pub fn default_registry(config: &testrig_core::config::Config) -> Result<ExtensionRegistry> {
    let mut registry = ExtensionRegistry::new();
    registry.register(builtin_package(config)?)?;
    Ok(registry)
}
