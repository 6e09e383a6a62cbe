//! User identity types.
//!
//! A user is identified by a 192-bit Content IDentifier (CID). The same
//! user can be reached through several hubs, so most operations carry a
//! [`HintedUser`]: the user handle plus the URL of the hub the request
//! came through.

use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::text;

/// Size of a CID in bytes (192 bits).
pub const CID_SIZE: usize = 24;

/// A Content IDentifier, the global identity of a user.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cid(pub [u8; CID_SIZE]);

impl Cid {
    pub fn new(bytes: [u8; CID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Parses the base32 text form used on the ADC wire.
    pub fn from_base32(s: &str) -> Option<Self> {
        let bytes = text::base32_decode(s, CID_SIZE)?;
        let mut cid = [0u8; CID_SIZE];
        cid.copy_from_slice(&bytes);
        Some(Self(cid))
    }

    pub fn to_base32(&self) -> String {
        text::base32_encode(&self.0)
    }

    pub fn as_bytes(&self) -> &[u8; CID_SIZE] {
        &self.0
    }
}

impl fmt::Debug for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cid({})", self.to_base32())
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base32())
    }
}

struct UserData {
    cid: Cid,
    first_nick: Mutex<String>,
    online: AtomicBool,
    last_ip: Mutex<Option<IpAddr>>,
}

/// A cheaply clonable shared handle to a user.
///
/// Two handles are equal when their CIDs are equal, regardless of which
/// hub they were observed on.
#[derive(Clone)]
pub struct User {
    inner: Arc<UserData>,
}

impl User {
    pub fn new(cid: Cid, first_nick: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(UserData {
                cid,
                first_nick: Mutex::new(first_nick.into()),
                online: AtomicBool::new(true),
                last_ip: Mutex::new(None),
            }),
        }
    }

    pub fn cid(&self) -> Cid {
        self.inner.cid
    }

    pub fn first_nick(&self) -> String {
        self.inner.first_nick.lock().clone()
    }

    pub fn set_first_nick(&self, nick: impl Into<String>) {
        *self.inner.first_nick.lock() = nick.into();
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::Relaxed)
    }

    pub fn set_online(&self, online: bool) {
        self.inner.online.store(online, Ordering::Relaxed);
    }

    pub fn last_ip(&self) -> Option<IpAddr> {
        *self.inner.last_ip.lock()
    }

    pub fn set_last_ip(&self, ip: IpAddr) {
        *self.inner.last_ip.lock() = Some(ip);
    }
}

impl PartialEq for User {
    fn eq(&self, other: &Self) -> bool {
        self.inner.cid == other.inner.cid
    }
}

impl Eq for User {}

impl std::hash::Hash for User {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.inner.cid.hash(state);
    }
}

impl fmt::Debug for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "User({}, {})", self.first_nick(), self.cid())
    }
}

/// A user handle together with the hub it was reached through.
#[derive(Debug, Clone)]
pub struct HintedUser {
    pub user: User,
    pub hub_url: String,
}

impl HintedUser {
    pub fn new(user: User, hub_url: impl Into<String>) -> Self {
        Self {
            user,
            hub_url: hub_url.into(),
        }
    }
}

impl PartialEq for HintedUser {
    fn eq(&self, other: &Self) -> bool {
        self.user == other.user
    }
}

impl Eq for HintedUser {}

#[cfg(test)]
mod tests {
    use super::*;

    fn cid(seed: u8) -> Cid {
        Cid::new([seed; CID_SIZE])
    }

    #[test]
    fn test_cid_base32_round_trip() {
        let c = cid(0xab);
        let parsed = Cid::from_base32(&c.to_base32()).unwrap();
        assert_eq!(c, parsed);
    }

    #[test]
    fn test_cid_base32_rejects_short() {
        assert!(Cid::from_base32("MZXW6").is_none());
    }

    #[test]
    fn test_user_equality_is_cid_equality() {
        let a = User::new(cid(1), "alice");
        let b = User::new(cid(1), "other-nick");
        let c = User::new(cid(2), "alice");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_user_online_flag() {
        let u = User::new(cid(3), "bob");
        assert!(u.is_online());
        u.set_online(false);
        assert!(!u.is_online());
    }
}
