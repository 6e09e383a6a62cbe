//! The runtime context threading collaborator subsystems into the
//! connection manager.
//!
//! Every method on these traits is called from the manager's hot paths,
//! sometimes while the coordinator lock is held, and must therefore be
//! non-blocking: enqueue work, flip a flag, look something up in memory,
//! and return.

use std::net::IpAddr;
use std::sync::Arc;

use crate::connection::TransferConnection;
use crate::crypto::CryptoContext;
use crate::user::{Cid, HintedUser, User};

/// Priority of a user's pending queue entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Paused,
    Lowest,
    Low,
    Normal,
    High,
    Highest,
}

/// Why a user is being dropped as a transfer source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceDropReason {
    /// The user cannot accept or make active-mode connections.
    Passive,
    /// The user's certificate could not be trusted.
    Untrusted,
}

/// The download subsystem.
pub trait DownloadHandler: Send + Sync {
    /// A download connection for this user may already be idle; recheck it.
    fn check_idle(&self, user: &User);

    /// Admission control: may a download at this priority start now?
    fn start_download(&self, priority: Priority) -> bool;

    /// Takes over a fully identified download connection.
    fn add_connection(&self, conn: TransferConnection);
}

/// The upload subsystem.
pub trait UploadHandler: Send + Sync {
    /// Takes over a fully identified upload connection.
    fn add_connection(&self, conn: TransferConnection);

    /// The user's upload queue item went away; drop any delayed upload
    /// state kept for them.
    fn remove_delay_upload(&self, user: &User);
}

/// The hub-level user directory and broker.
pub trait HubDirectory: Send + Sync {
    /// Our own CID, as sent in `INF`.
    fn my_cid(&self) -> Cid;

    /// Ask the hub to broker a connect-back from this user, quoting the
    /// given token.
    fn connect(&self, user: &HintedUser, token: &str);

    /// Report that a brokered connect never arrived.
    fn connection_timeout(&self, user: &HintedUser);

    fn find_user(&self, cid: &Cid) -> Option<User>;

    /// Derive the CID of a legacy-hub user from nick and hub URL.
    fn make_cid(&self, nick: &str, hub_url: &str) -> Cid;

    /// The wire encoding this hub speaks.
    fn hub_encoding(&self, hub_url: &str) -> String;

    fn is_op(&self, user: &User, hub_url: &str) -> bool;

    fn is_stealth(&self, hub_url: &str) -> bool;

    /// Record the IP a user was observed connecting from.
    fn set_user_ip(&self, user: &User, ip: IpAddr);

    /// Record the Pk/lock pair a legacy peer identified with.
    fn set_pk_lock(&self, user: &User, pk: &str, lock: &str);

    /// Record the feature list a legacy peer advertised.
    fn set_supports(&self, user: &User, features: &[String]);

    /// A per-user field the hub advertised, e.g. `KP` for the keyprint.
    fn user_field(&self, cid: &Cid, hub_url: &str, field: &str) -> Option<String>;
}

/// The transfer queue.
pub trait TransferQueue: Send + Sync {
    /// Highest priority among the user's queued downloads, or
    /// [`Priority::Paused`] when nothing is wanted from them.
    fn has_download(&self, user: &HintedUser) -> Priority;

    /// Drop the user as a source for queued downloads.
    fn remove_source(&self, user: &User, reason: SourceDropReason);
}

/// Persistence of last-seen user addresses.
pub trait IpStore: Send + Sync {
    fn store_last_ip(&self, hub_url: &str, nick: &str, ip: IpAddr);
}

/// Handles to every subsystem the connection manager collaborates with.
#[derive(Clone)]
pub struct Context {
    pub downloads: Arc<dyn DownloadHandler>,
    pub uploads: Arc<dyn UploadHandler>,
    pub hubs: Arc<dyn HubDirectory>,
    pub queue: Arc<dyn TransferQueue>,
    pub ip_store: Arc<dyn IpStore>,
    pub crypto: Arc<CryptoContext>,
}
