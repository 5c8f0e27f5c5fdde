/*!
 * Transport implementations for testrig.
 *
 * This module contains implementations of the `Transport` trait for the
 * communication channels devices are reached over.
 */

pub mod duplex;
pub mod process;
#[cfg(feature = "serial")]
pub mod serial;

pub use duplex::DuplexTransport;
pub use process::ProcessTransport;
#[cfg(feature = "serial")]
pub use serial::SerialTransport;
