use thiserror::Error;

use crate::adc::AdcError;
use crate::nmdc::NmdcError;

/// Errors that can occur on a peer connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Network I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed by the peer.
    #[error("connection closed")]
    Closed,

    /// Operation timed out.
    #[error("timeout")]
    Timeout,

    /// Protocol violation by the peer.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Malformed NMDC command.
    #[error("nmdc error: {0}")]
    Nmdc(#[from] NmdcError),

    /// Malformed ADC command.
    #[error("adc error: {0}")]
    Adc(#[from] AdcError),
}

impl ConnectionError {
    /// Whether this failure is the peer's fault rather than the network's.
    ///
    /// Protocol faults make the retry backoff sticky; transient faults
    /// back off linearly.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            ConnectionError::Protocol(_) | ConnectionError::Nmdc(_) | ConnectionError::Adc(_)
        )
    }
}
