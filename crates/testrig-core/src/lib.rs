/*!
 * testrig Core
 *
 * This crate provides the ambient functionality shared by the testrig crates:
 * configuration, errors, logging and retry helpers.
 */

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod logging;
pub mod prelude;
pub mod types;
pub mod utils;

/// Re-export of dependencies that are part of the public API
pub mod deps {
    pub use anyhow;
    pub use chrono;
    pub use tokio;
    pub use tracing;
    pub use uuid;
}

/// testrig core crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library initialization
pub fn init() -> Result<(), error::Error> {
    logging::init()?;
    tracing::info!("testrig core {} initialized", VERSION);
    Ok(())
}

/// Library initialization from a loaded configuration
pub fn init_with_config(config: &config::Config) -> Result<(), error::Error> {
    config.validate()?;
    logging::init_with_config(&config.logging)?;
    tracing::info!("testrig core {} initialized", VERSION);
    Ok(())
}
