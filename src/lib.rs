//! rdc - A Direct Connect library
//!
//! This library implements the client-client connection layer of the
//! Direct Connect protocol family, covering both the legacy NMDC dialect
//! and ADC.
//!
//! # Modules
//!
//! - [`connection`] - Peer connection management: listeners, the connect
//!   retry queue, both handshake state machines, role dispatch
//! - [`nmdc`] - NMDC client-client commands and the lock/key challenge
//! - [`adc`] - ADC client-client commands
//! - [`user`] - CIDs and shared user handles
//! - [`crypto`] - TLS contexts and keyprint validation
//! - [`context`] - Collaborator traits for the download/upload/hub/queue
//!   subsystems
//! - [`config`] - Runtime configuration
//! - [`text`] - Base32 and hub encoding helpers

pub mod adc;
pub mod config;
pub mod connection;
pub mod context;
pub mod crypto;
pub mod nmdc;
pub mod text;
pub mod user;

pub use adc::{AdcCommand, AdcError, ErrorCode, Severity};
pub use config::Config;
pub use connection::{
    Capabilities, ConnectionError, ConnectionEvent, ConnectionManager, NatRole, QueueItemInfo,
    QueueState, Role, TransferConnection,
};
pub use context::{
    Context, DownloadHandler, HubDirectory, IpStore, Priority, SourceDropReason, TransferQueue,
    UploadHandler,
};
pub use crypto::{check_keyprint, CryptoContext, CryptoError, TlsSettings};
pub use nmdc::{NmdcCommand, NmdcError};
pub use user::{Cid, HintedUser, User};
