//! Peer transfer connection management.
//!
//! This module establishes, accepts and tears down client-client transfer
//! connections, negotiates which side downloads and which uploads under
//! the NMDC and ADC handshakes, and hands fully identified connections to
//! the download and upload subsystems.

mod error;
mod listener;
mod manager;
mod queue;
mod transport;
mod user_connection;

pub use error::ConnectionError;
pub use manager::{ConnectionEvent, ConnectionManager, NatRole};
pub use queue::{QueueItemInfo, QueueState};
pub use user_connection::{Capabilities, ConnId, Role, State, TransferConnection};

#[cfg(test)]
mod tests;
