use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::manager::ConnectionManager;

const LISTEN_BACKLOG: u32 = 1024;
const REBIND_ATTEMPT_DELAY: Duration = Duration::from_secs(1);
const REBIND_ATTEMPTS: u32 = 60;

/// Binds a listening socket with `SO_REUSEADDR`.
pub(crate) async fn bind(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(LISTEN_BACKLOG)
}

/// One accept loop, plain or secure.
///
/// Accepted sockets are fed to the manager's accept entry point. If the
/// accept loop hits a socket-level error the listener re-binds to the same
/// address, logging a one-shot connectivity error/restored transition and
/// retrying for a minute at a time until shutdown.
pub(crate) struct Listener {
    pub secure: bool,
    pub port: u16,
    shutdown: watch::Sender<bool>,
    _handle: JoinHandle<()>,
}

impl Listener {
    pub fn spawn(
        manager: Arc<ConnectionManager>,
        listener: TcpListener,
        addr: SocketAddr,
        secure: bool,
    ) -> Self {
        let port = listener.local_addr().map(|a| a.port()).unwrap_or(addr.port());
        let (shutdown, rx) = watch::channel(false);
        let handle = tokio::spawn(run(manager, listener, addr, secure, rx));
        Self {
            secure,
            port,
            shutdown,
            _handle: handle,
        }
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

async fn run(
    manager: Arc<ConnectionManager>,
    mut listener: TcpListener,
    addr: SocketAddr,
    secure: bool,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let error = loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => manager.clone().accept(stream, peer, secure),
                    Err(e) => break e,
                },
            }
        };
        debug!("accept loop error on port {}: {}", addr.port(), error);
        drop(listener);

        let mut failed = false;
        listener = loop {
            if *shutdown.borrow() {
                return;
            }
            match bind(addr).await {
                Ok(l) => {
                    if failed {
                        info!("Connectivity restored");
                    }
                    break l;
                }
                Err(e) => {
                    if !failed {
                        warn!("Connectivity error: {}", e);
                        failed = true;
                    }
                    for _ in 0..REBIND_ATTEMPTS {
                        if *shutdown.borrow() {
                            return;
                        }
                        tokio::time::sleep(REBIND_ATTEMPT_DELAY).await;
                    }
                }
            }
        };
    }
}
