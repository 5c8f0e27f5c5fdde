/*!
 * testrig Switchboard
 *
 * This crate owns the byte stream to a device: transports, line framing, the
 * durable device log, the event parser and expect-style synchronisation.
 */

#![warn(missing_docs)]

pub mod error;
pub mod event_parser;
pub mod expect;
pub mod framer;
pub mod log;
pub mod switchboard;
pub mod transport;
pub mod transports;

pub use error::{Result, SwitchboardError};
pub use event_parser::{EventFilter, EventParser, LogEvent};
pub use expect::ExpectResponse;
pub use switchboard::{Switchboard, SwitchboardOptions, SwitchboardState};
pub use transport::{Transport, TransportStreams};

/// testrig switchboard crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Transports compiled into this build
pub fn available_transports() -> Vec<&'static str> {
    let mut transports = vec!["duplex", "process"];

    #[cfg(feature = "serial")]
    transports.push("serial");

    transports
}
