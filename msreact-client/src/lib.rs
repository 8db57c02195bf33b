#![deny(
    clippy::undocumented_unsafe_blocks,
    clippy::pedantic,
    clippy::nursery,
    clippy::arithmetic_side_effects
)]

//! Client library for driving real-time mass-spectrometer acquisitions through an
//! MSReact instrument server.
//!
//! The crate is layered leaves first:
//! 1. [`protocol::codec`] turns `(id, payload)` pairs into wire frames and back
//! 2. [`transport`] moves frames over a reconnecting WebSocket
//! 3. [`protocol::ProtocolClient`] combines the two into typed messages
//! 4. [`instrument::InstrumentClient`] correlates commands with responses and
//!     dispatches events
//! 5. [`manager::AlgorithmManager`] runs the acquisitions of an algorithm, one
//!     worker at a time, and relays their requests back to the network side
//! 6. [`client::MsReactClient`] runs one session: connect, run an algorithm and
//!     clean up

use std::time::Duration;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Sleep between empty polls of the queues that cross a thread or process boundary.
pub const POLL_INTERVAL: Duration = Duration::from_millis(1);

pub mod acquisition;
pub mod algorithm;
pub mod algorithms;
pub mod client;
pub mod command;
pub mod config;
pub mod download;
pub mod error;
pub mod executor;
pub mod instrument;
pub mod instruments;
pub mod ipc;
pub mod log_forward;
pub mod manager;
pub mod protocol;
pub mod scan;
pub mod state_machine;
pub mod transfer_register;
pub mod transport;
pub mod worker;

pub use error::{
    AcquisitionError, AlgorithmSelectionError, ClientError, CodecError, ConfigError,
    InstrumentClientError, IpcError, ManagerError, ProtocolError, TransportError,
};
pub use scan::{Scan, ScanParams};
pub use state_machine::AcquisitionStatus;

/// The version of this client library.
#[must_use]
pub const fn version() -> &'static str {
    VERSION
}
