use std::collections::HashMap;

use crate::user::{HintedUser, User};

/// State of a queued connection request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    /// Waiting for the next connect attempt.
    Waiting,
    /// A hub-brokered connect is in flight.
    Connecting,
    /// A live connection is associated with this item.
    Active,
    /// The download subsystem refused admission; retried until a slot
    /// frees up.
    NoDownloadSlots,
}

/// Sticky error sentinel: the item is not retried until forced.
pub(crate) const PROTOCOL_ERROR: i32 = -1;

/// A pending or active connection request for one user in one direction.
///
/// At most one item per user exists in each direction list.
#[derive(Debug)]
pub(crate) struct ConnectionQueueItem {
    pub user: HintedUser,
    pub token: String,
    pub download: bool,
    pub state: QueueState,
    /// Manager tick of the last connect attempt; 0 = never attempted.
    pub last_attempt: u64,
    /// Consecutive failures, driving the linear backoff.
    /// [`PROTOCOL_ERROR`] suppresses retry entirely.
    pub errors: i32,
}

impl ConnectionQueueItem {
    pub fn new(user: HintedUser, download: bool) -> Self {
        let token = user.user.cid().to_base32();
        Self {
            user,
            token,
            download,
            state: QueueState::Waiting,
            last_attempt: 0,
            errors: 0,
        }
    }

    pub fn info(&self) -> QueueItemInfo {
        QueueItemInfo {
            user: self.user.clone(),
            token: self.token.clone(),
            download: self.download,
            state: self.state,
        }
    }
}

/// Snapshot of a queue item, carried by [`super::ConnectionEvent`]s.
#[derive(Debug, Clone)]
pub struct QueueItemInfo {
    pub user: HintedUser,
    pub token: String,
    pub download: bool,
    pub state: QueueState,
}

/// Removes the queue item for `user` from a direction list.
pub(crate) fn take_cqi(
    list: &mut Vec<ConnectionQueueItem>,
    user: &User,
) -> Option<ConnectionQueueItem> {
    let pos = list.iter().position(|c| &c.user.user == user)?;
    Some(list.remove(pos))
}

/// Short-lived map from an expected peer nick to the token and hub URL of
/// the request that solicited the connection.
#[derive(Debug, Default)]
pub(crate) struct ExpectedConnections {
    map: HashMap<String, (String, String)>,
}

impl ExpectedConnections {
    pub fn add(&mut self, nick: impl Into<String>, token: String, hub_url: String) {
        self.map.insert(nick.into(), (token, hub_url));
    }

    pub fn remove(&mut self, nick: &str) -> Option<(String, String)> {
        self.map.remove(nick)
    }
}
