use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream as ClientTlsStream;
use tokio_rustls::server::TlsStream as ServerTlsStream;

use super::error::ConnectionError;
use crate::crypto;

const MAX_LINE: usize = 16 * 1024;
const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// A peer socket, plain or TLS.
pub(crate) enum PeerStream {
    Plain(TcpStream),
    ClientTls(Box<ClientTlsStream<TcpStream>>),
    ServerTls(Box<ServerTlsStream<TcpStream>>),
}

/// Line framing over a peer socket.
///
/// Both dialects are newline-delimited at this level: ADC commands end in
/// `\n`, NMDC commands in `\r\n`; a trailing `\r` is stripped so callers
/// see bare command bytes either way.
pub(crate) struct PeerTransport {
    stream: PeerStream,
    read_buf: BytesMut,
}

impl PeerTransport {
    pub fn new(stream: PeerStream) -> Self {
        Self {
            stream,
            read_buf: BytesMut::with_capacity(4 * 1024),
        }
    }

    /// Reads one line, without its terminator.
    ///
    /// Cancel-safe: partial input stays buffered across calls.
    pub async fn read_line(&mut self) -> Result<Bytes, ConnectionError> {
        loop {
            if let Some(pos) = self.read_buf.iter().position(|&b| b == b'\n') {
                let mut line = self.read_buf.split_to(pos + 1);
                line.truncate(pos);
                if line.last() == Some(&b'\r') {
                    line.truncate(line.len() - 1);
                }
                return Ok(line.freeze());
            }
            if self.read_buf.len() > MAX_LINE {
                return Err(ConnectionError::Protocol("line too long".to_string()));
            }

            let n = match &mut self.stream {
                PeerStream::Plain(s) => s.read_buf(&mut self.read_buf).await?,
                PeerStream::ClientTls(s) => s.read_buf(&mut self.read_buf).await?,
                PeerStream::ServerTls(s) => s.read_buf(&mut self.read_buf).await?,
            };
            if n == 0 {
                return Err(ConnectionError::Closed);
            }
        }
    }

    pub async fn write_all(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        let write = async {
            match &mut self.stream {
                PeerStream::Plain(s) => s.write_all(data).await,
                PeerStream::ClientTls(s) => s.write_all(data).await,
                PeerStream::ServerTls(s) => s.write_all(data).await,
            }
        };
        timeout(WRITE_TIMEOUT, write)
            .await
            .map_err(|_| ConnectionError::Timeout)??;
        Ok(())
    }

    pub fn peer_addr(&self) -> std::io::Result<SocketAddr> {
        match &self.stream {
            PeerStream::Plain(s) => s.peer_addr(),
            PeerStream::ClientTls(s) => s.get_ref().0.peer_addr(),
            PeerStream::ServerTls(s) => s.get_ref().0.peer_addr(),
        }
    }

    /// SHA-256 keyprint of the peer's leaf certificate, if the transport
    /// is TLS and the peer presented one.
    pub fn peer_keyprint(&self) -> Option<Vec<u8>> {
        let certs = match &self.stream {
            PeerStream::Plain(_) => None,
            PeerStream::ClientTls(s) => s.get_ref().1.peer_certificates(),
            PeerStream::ServerTls(s) => s.get_ref().1.peer_certificates(),
        };
        certs.and_then(|c| c.first()).map(crypto::keyprint)
    }
}
