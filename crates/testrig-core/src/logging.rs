/*!
 * Logging functionality for testrig.
 *
 * This module provides tracing setup and utilities for consistent logging
 * across the switchboard, detection and manager layers. Device output is not
 * routed through tracing; it goes to the per-device log owned by each switchboard.
 */
use std::fs::{self, OpenOptions};
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer, Registry};

use crate::config::LoggingConfig;
use crate::error::{Error, Result};

/// Initialize the logging system with default configuration
pub fn init() -> Result<()> {
    init_with_filter("info")
}

/// Initialize the logging system with a specific filter
///
/// # Arguments
///
/// * `filter` - The log filter string (e.g., "info", "debug", "testrig_switchboard=trace")
pub fn init_with_filter(filter: &str) -> Result<()> {
    let config = LoggingConfig {
        level: filter.to_string(),
        ..LoggingConfig::default()
    };
    init_with_config(&config)
}

/// Initialize the logging system from a [`LoggingConfig`]
///
/// `RUST_LOG` takes precedence over the configured level. When `file_logging` is
/// set, a manager-wide log file receives every engine-level event in addition to
/// stdout.
pub fn init_with_config(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    if config.stdout {
        if config.json_format {
            layers.push(fmt::layer().json().with_target(true).boxed());
        } else {
            layers.push(fmt::layer().with_target(true).boxed());
        }
    }

    if config.file_logging {
        let path = Path::new(&config.log_file);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let writer = Mutex::new(file);
        if config.json_format {
            layers.push(fmt::layer().json().with_writer(writer).boxed());
        } else {
            layers.push(fmt::layer().with_ansi(false).with_writer(writer).boxed());
        }
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .map_err(|e| Error::runtime(format!("Failed to initialize logging: {}", e)))?;

    Ok(())
}

/// A type alias for a tracing span
pub type Span = tracing::Span;

/// Create a new span for a component
///
/// # Arguments
///
/// * `name` - The name of the component (e.g. "switchboard")
/// * `id` - An optional ID for the component instance, usually the device name
pub fn component_span(name: &str, id: Option<&str>) -> Span {
    match id {
        Some(id) => tracing::info_span!("component", name = %name, id = %id),
        None => tracing::info_span!("component", name = %name),
    }
}

/// Create a new span for an operation
///
/// # Arguments
///
/// * `name` - The name of the operation
/// * `component` - The component performing the operation
pub fn operation_span(name: &str, component: &str) -> Span {
    tracing::info_span!("operation", name = %name, component = %component)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init() {
        // A second global init in the same process fails, which is fine here
        let _ = init();
    }

    #[test]
    fn test_component_span() {
        // Spans are disabled unless a subscriber is installed, so only check the name when present
        let span = component_span("switchboard", Some("board-1234"));
        assert_eq!(span.metadata().map_or("component", |m| m.name()), "component");

        let span = component_span("switchboard", None);
        assert_eq!(span.metadata().map_or("component", |m| m.name()), "component");
    }

    #[test]
    fn test_operation_span() {
        let span = operation_span("detect", "manager");
        assert_eq!(span.metadata().map_or("operation", |m| m.name()), "operation");
    }
}
