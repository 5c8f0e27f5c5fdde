/*!
 * Prelude module for testrig core.
 *
 * This module re-exports commonly used types and functions from the core crate
 * to make them easier to import.
 */

// Re-export error types
pub use crate::error::{Error, Result};

// Re-export core types
pub use crate::types::{DeviceConfig, Id, PropertyName, PropertyValue};

// Re-export config types
pub use crate::config::{Config, ConfigBuilder, SharedConfig};

// Re-export utility functions
pub use crate::utils::{with_retry, with_timeout};

// Re-export logging macros
pub use tracing::{debug, error, info, trace, warn};

// Re-export core initialization
pub use crate::init;
