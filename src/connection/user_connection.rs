use bytes::Bytes;
use rand::Rng as _;
use std::net::SocketAddr;
use tokio::sync::mpsc;

use super::manager::NatRole;
use crate::user::{HintedUser, User};

/// Identifier of a live connection within the manager.
pub type ConnId = u64;

/// Handshake state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Outbound connect in flight.
    Connect,
    /// Waiting for the peer's `$MyNick` (NMDC) or `SUP` (ADC).
    SupNick,
    /// Waiting for the peer's `INF`.
    Inf,
    /// Waiting for the peer's `$Lock`.
    Lock,
    /// Waiting for the peer's `$Direction`.
    Direction,
    /// Waiting for the peer's `$Key`.
    Key,
    /// Handed to a transfer subsystem.
    Running,
}

/// Which side of the transfer this connection serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Download,
    Upload,
}

impl Role {
    /// The `$Direction` keyword for this role.
    pub fn direction_str(self) -> &'static str {
        match self {
            Role::Download => "Download",
            Role::Upload => "Upload",
        }
    }
}

/// Transfer capabilities negotiated during the handshake.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub adcget: bool,
    pub minislots: bool,
    pub tthl: bool,
    pub tthf: bool,
    pub xml_bzlist: bool,
    pub zlib_get: bool,
    pub tiger: bool,
}

/// Commands handled by a connection's I/O task.
#[derive(Debug)]
pub(crate) enum WriteCommand {
    /// Write these bytes to the socket.
    Send(Bytes),
    /// Tear the connection down silently.
    Close,
    /// Tear the connection down through the failure handler, so an
    /// associated queue item gets its retry bookkeeping.
    Disconnect,
}

/// One client-client TCP endpoint and its handshake bookkeeping.
///
/// The connection's socket lives in its I/O task; the manager owns this
/// record and reaches the task through the write channel.
#[derive(Debug)]
pub(crate) struct UserConnection {
    pub id: ConnId,
    pub secure: bool,
    pub nmdc: bool,
    pub incoming: bool,
    pub stealth: bool,
    pub op: bool,
    pub trusted: bool,
    /// Set once a queue item of the matching direction points at us.
    pub associated: bool,
    pub state: State,
    pub role: Option<Role>,
    pub caps: Capabilities,
    pub user: Option<User>,
    pub token: String,
    pub hub_url: String,
    pub encoding: String,
    /// NMDC direction tie-break number, random in `[0, 32767]`.
    pub number: u16,
    /// Manager tick of the last socket activity.
    pub last_activity: u64,
    pub remote: Option<SocketAddr>,
    /// NAT traversal role of the connect that created us; consumed by the
    /// transfer subsystems.
    pub nat_role: NatRole,
    /// SHA-256 of the peer's leaf certificate, secure connections only.
    pub keyprint: Option<Vec<u8>>,
    tx: mpsc::UnboundedSender<WriteCommand>,
}

impl UserConnection {
    pub fn new(
        id: ConnId,
        secure: bool,
        nmdc: bool,
        incoming: bool,
        tx: mpsc::UnboundedSender<WriteCommand>,
    ) -> Self {
        Self {
            id,
            secure,
            nmdc,
            incoming,
            stealth: false,
            op: false,
            trusted: false,
            associated: false,
            state: if incoming { State::SupNick } else { State::Connect },
            role: None,
            caps: Capabilities::default(),
            user: None,
            token: String::new(),
            hub_url: String::new(),
            encoding: "utf-8".to_string(),
            number: rand::rng().random_range(0u16..=0x7fff),
            last_activity: 0,
            remote: None,
            nat_role: NatRole::None,
            keyprint: None,
            tx,
        }
    }

    /// Queues bytes for the I/O task to write.
    pub fn send(&self, data: Bytes) {
        let _ = self.tx.send(WriteCommand::Send(data));
    }

    /// Asks the I/O task to tear the connection down through the failure
    /// handler.
    pub fn disconnect(&self) {
        let _ = self.tx.send(WriteCommand::Disconnect);
    }

    /// Builds the handle given to a transfer subsystem at hand-off.
    pub fn transfer_handle(&self, user: HintedUser, role: Role) -> TransferConnection {
        TransferConnection {
            id: self.id,
            user,
            token: self.token.clone(),
            secure: self.secure,
            role,
            caps: self.caps,
            op: self.op,
            stealth: self.stealth,
            nat_role: self.nat_role,
            tx: self.tx.clone(),
        }
    }
}

/// Handle to an identified connection, given to the download or upload
/// subsystem once the handshake placed the connection into a role.
#[derive(Debug, Clone)]
pub struct TransferConnection {
    pub id: ConnId,
    pub user: HintedUser,
    pub token: String,
    pub secure: bool,
    pub role: Role,
    pub caps: Capabilities,
    /// The peer is an operator on the hub this connection came through.
    pub op: bool,
    /// The hub asked for stealth-mode behaviour.
    pub stealth: bool,
    /// NAT traversal role of the connect that created the connection.
    pub nat_role: NatRole,
    tx: mpsc::UnboundedSender<WriteCommand>,
}

impl TransferConnection {
    /// Queues bytes for the connection's I/O task to write.
    pub fn send(&self, data: Bytes) {
        let _ = self.tx.send(WriteCommand::Send(data));
    }

    /// Tears the connection down without retry bookkeeping, for when a
    /// transfer finished normally.
    pub fn close(&self) {
        let _ = self.tx.send(WriteCommand::Close);
    }

    /// Closes the connection through the failure handler, so the queue
    /// item backing it is retried.
    pub fn disconnect(&self) {
        let _ = self.tx.send(WriteCommand::Disconnect);
    }
}
