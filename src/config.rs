//! Runtime configuration for the connection manager.

use std::net::{IpAddr, Ipv4Addr};

/// Configuration consumed by the connection manager.
///
/// Ports set to 0 ask the OS for an ephemeral port; the bound ports can be
/// read back from the manager after `listen()`.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address both listeners bind to.
    pub bind_address: IpAddr,
    /// Port for plain TCP transfer connections.
    pub tcp_port: u16,
    /// Port for TLS transfer connections.
    pub tls_port: u16,
    /// Per-second budget of new outbound download connects. 0 = unlimited.
    pub downconn_per_sec: u32,
    /// Advertise zlib transfer compression in the handshake feature lists.
    pub compress_transfers: bool,
    /// Keep secure connections whose peer certificate could not be trusted.
    pub allow_untrusted_clients: bool,
    /// Persist a user's last-seen IP when a connection reaches a role.
    pub enable_last_ip: bool,
    /// Pass keyprint validation when the hub advertised no keyprint or one
    /// with an unknown algorithm prefix.
    pub accept_unknown_keyprint: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            tcp_port: 0,
            tls_port: 0,
            downconn_per_sec: 2,
            compress_transfers: true,
            allow_untrusted_clients: true,
            enable_last_ip: true,
            accept_unknown_keyprint: true,
        }
    }
}
