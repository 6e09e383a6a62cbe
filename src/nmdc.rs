//! NMDC client-client dialect.
//!
//! This module implements the legacy line-based handshake fragments spoken
//! between two clients: `$MyNick`, `$Lock`, `$Supports`, `$Direction` and
//! `$Key`, plus the lock/key challenge that proves protocol-version
//! compatibility.

mod command;
mod lock;

pub use command::{NmdcCommand, NmdcError};
pub use lock::{is_extended, make_key, pk, LOCK};

/// NMDC handshake feature tokens.
pub const FEATURE_MINISLOTS: &str = "MiniSlots";
pub const FEATURE_XML_BZLIST: &str = "XmlBZList";
pub const FEATURE_ADCGET: &str = "ADCGet";
pub const FEATURE_TTHL: &str = "TTHL";
pub const FEATURE_TTHF: &str = "TTHF";
pub const FEATURE_ZLIB_GET: &str = "ZLIG";
