use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use rustls::pki_types::ServerName;
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout};
use tracing::{debug, warn};

use super::error::ConnectionError;
use super::listener::{self, Listener};
use super::queue::{
    take_cqi, ConnectionQueueItem, ExpectedConnections, QueueItemInfo, QueueState, PROTOCOL_ERROR,
};
use super::transport::{PeerStream, PeerTransport};
use super::user_connection::{ConnId, Role, State, UserConnection, WriteCommand};
use crate::adc::{self, AdcCommand, ErrorCode, Severity};
use crate::config::Config;
use crate::context::{Context, Priority, SourceDropReason};
use crate::crypto;
use crate::nmdc::{self, NmdcCommand};
use crate::text;
use crate::user::{Cid, HintedUser, User};

/// Window added to the flood counter per accepted connection.
const FLOOD_ADD: u64 = 2_000;
/// Flood counter lead over now at which accepts are rejected.
const FLOOD_TRIGGER: u64 = 20_000;
/// TCP / TLS establishment timeout for outbound connects.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// How long a hub-brokered connect may stay in flight.
const CONNECTING_TIMEOUT_MS: u64 = 50_000;
/// Base of the linear retry backoff.
const RETRY_BASE_MS: u64 = 60_000;
/// Idle connections are disconnected after this long.
const IDLE_TIMEOUT_MS: u64 = 180_000;
/// Cadence of the shutdown drain poll.
const SHUTDOWN_POLL: Duration = Duration::from_millis(50);
/// Refuse more outbound connects than this to one remote endpoint.
const MAX_CONNECTIONS_PER_ADDR: usize = 5;
/// Ports we refuse to be pointed at by a hub.
const BLOCKED_PORTS: [u16; 2] = [80, 2501];
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// NAT traversal role of an outbound connect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NatRole {
    #[default]
    None,
    Client,
    Server,
}

/// Notifications about connection queue items.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Added(QueueItemInfo),
    Removed(QueueItemInfo),
    StatusChanged(QueueItemInfo),
    Failed(QueueItemInfo, String),
    Connected(QueueItemInfo),
}

#[derive(Debug, Clone, Copy)]
enum Dialect {
    Nmdc,
    Adc,
}

/// Whether a handler keeps the connection alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Continue,
    Close,
}

struct ManagerState {
    downloads: Vec<ConnectionQueueItem>,
    uploads: Vec<ConnectionQueueItem>,
    connections: HashMap<ConnId, UserConnection>,
    expected: ExpectedConnections,
    flood_counter: u64,
    conn_to_me_count: u16,
    listeners: Vec<Listener>,
    timer: Option<JoinHandle<()>>,
}

/// Establishes, accepts and tears down client-client transfer
/// connections, and negotiates which side downloads and which uploads.
///
/// # Examples
///
/// ```no_run
/// use rdc::{Config, ConnectionManager, Context};
///
/// # async fn example(ctx: Context) -> Result<(), Box<dyn std::error::Error>> {
/// let manager = ConnectionManager::new(Config::default(), ctx);
///
/// // Watch queue item notifications
/// let mut events = manager.subscribe();
///
/// // Start both listeners and the retry timer
/// manager.clone().listen().await?;
///
/// // ... hand download requests to the manager ...
///
/// manager.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct ConnectionManager {
    config: Config,
    ctx: Context,
    state: Mutex<ManagerState>,
    events: broadcast::Sender<ConnectionEvent>,
    shutting_down: AtomicBool,
    next_id: AtomicU64,
    epoch: Instant,
    nmdc_features: Vec<String>,
    adc_features: Vec<String>,
}

impl ConnectionManager {
    pub fn new(config: Config, ctx: Context) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let nmdc_features = [
            nmdc::FEATURE_MINISLOTS,
            nmdc::FEATURE_XML_BZLIST,
            nmdc::FEATURE_ADCGET,
            nmdc::FEATURE_TTHL,
            nmdc::FEATURE_TTHF,
        ]
        .map(str::to_string)
        .to_vec();

        let adc_features = [
            adc::FEATURE_BAS0,
            adc::FEATURE_BASE,
            adc::FEATURE_TIGR,
            adc::FEATURE_BZIP,
        ]
        .map(|f| format!("AD{}", f))
        .to_vec();

        Arc::new(Self {
            config,
            ctx,
            state: Mutex::new(ManagerState {
                downloads: Vec::new(),
                uploads: Vec::new(),
                connections: HashMap::new(),
                expected: ExpectedConnections::default(),
                flood_counter: 0,
                conn_to_me_count: 0,
                listeners: Vec::new(),
                timer: None,
            }),
            events,
            shutting_down: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            epoch: Instant::now(),
            nmdc_features,
            adc_features,
        })
    }

    /// Subscribes to queue item notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// (Re)starts the listeners and the retry timer.
    ///
    /// The secure listener only runs when a server TLS context is
    /// available.
    pub async fn listen(self: Arc<Self>) -> Result<(), ConnectionError> {
        self.stop_listeners();
        self.shutting_down.store(false, Ordering::SeqCst);
        self.clone().ensure_timer();

        let plain_addr = SocketAddr::new(self.config.bind_address, self.config.tcp_port);
        let plain = listener::bind(plain_addr).await?;
        let handle = Listener::spawn(self.clone(), plain, plain_addr, false);
        self.state.lock().listeners.push(handle);

        if !self.ctx.crypto.tls_ok() {
            debug!("skipping secure port: {}", self.config.tls_port);
            return Ok(());
        }

        let secure_addr = SocketAddr::new(self.config.bind_address, self.config.tls_port);
        let secure = listener::bind(secure_addr).await?;
        let handle = Listener::spawn(self.clone(), secure, secure_addr, true);
        self.state.lock().listeners.push(handle);
        Ok(())
    }

    /// The currently bound (plain, secure) listener ports.
    pub fn ports(&self) -> (Option<u16>, Option<u16>) {
        let s = self.state.lock();
        let plain = s.listeners.iter().find(|l| !l.secure).map(|l| l.port);
        let secure = s.listeners.iter().find(|l| l.secure).map(|l| l.port);
        (plain, secure)
    }

    /// Number of live connections, in any handshake state.
    pub fn active_connections(&self) -> usize {
        self.state.lock().connections.len()
    }

    /// Snapshot of the pending and active download queue items.
    pub fn download_queue(&self) -> Vec<QueueItemInfo> {
        self.state.lock().downloads.iter().map(|c| c.info()).collect()
    }

    /// Snapshot of the active upload queue items.
    pub fn upload_queue(&self) -> Vec<QueueItemInfo> {
        self.state.lock().uploads.iter().map(|c| c.info()).collect()
    }

    /// Requests a connection for downloading from this user.
    ///
    /// Idempotent: if a download queue item already exists the download
    /// subsystem is nudged to recheck idle connections instead.
    pub fn get_download_connection(&self, user: &HintedUser) {
        let mut s = self.state.lock();
        if s.downloads.iter().any(|c| c.user.user == user.user) {
            self.ctx.downloads.check_idle(&user.user);
        } else {
            let cqi = ConnectionQueueItem::new(user.clone(), true);
            self.fire(ConnectionEvent::Added(cqi.info()));
            s.downloads.push(cqi);
        }
    }

    /// Clears the backoff on the user's download queue item so the next
    /// tick retries immediately. No-op if absent.
    pub fn force(&self, user: &User) {
        let mut s = self.state.lock();
        if let Some(cqi) = s.downloads.iter_mut().find(|c| &c.user.user == user) {
            cqi.last_attempt = 0;
        }
    }

    /// Registers that `nick` is expected to connect back carrying this
    /// token, on behalf of this hub.
    pub fn expect_connection(
        &self,
        nick: impl Into<String>,
        token: impl Into<String>,
        hub_url: impl Into<String>,
    ) {
        self.state
            .lock()
            .expected
            .add(nick.into(), token.into(), hub_url.into());
    }

    /// Notes that a connect-to-me request went out; accepts drain this
    /// count before the flood counter advances.
    pub fn connect_to_me_sent(&self) {
        let mut s = self.state.lock();
        s.conn_to_me_count = s.conn_to_me_count.saturating_add(1);
    }

    /// Signals all live connections of this user to close.
    pub fn disconnect_user(&self, user: &User) {
        let s = self.state.lock();
        for uc in s.connections.values() {
            if uc.user.as_ref() == Some(user) {
                uc.disconnect();
            }
        }
    }

    /// Signals the user's live connection in one direction to close.
    pub fn disconnect_user_direction(&self, user: &User, download: bool) {
        let role = if download { Role::Download } else { Role::Upload };
        let s = self.state.lock();
        for uc in s.connections.values() {
            if uc.user.as_ref() == Some(user) && uc.role == Some(role) {
                uc.disconnect();
                break;
            }
        }
    }

    /// Initiates an outbound NMDC connection.
    #[allow(clippy::too_many_arguments)]
    pub fn nmdc_connect(
        self: Arc<Self>,
        server: IpAddr,
        port: u16,
        nick: &str,
        hub_url: &str,
        encoding: &str,
        stealth: bool,
        secure: bool,
    ) {
        self.nmdc_connect_nat(
            server,
            port,
            0,
            NatRole::None,
            nick,
            hub_url,
            encoding,
            stealth,
            secure,
        );
    }

    /// Initiates an outbound NMDC connection from a fixed local port, for
    /// NAT traversal.
    #[allow(clippy::too_many_arguments)]
    pub fn nmdc_connect_nat(
        self: Arc<Self>,
        server: IpAddr,
        port: u16,
        local_port: u16,
        nat_role: NatRole,
        nick: &str,
        hub_url: &str,
        encoding: &str,
        stealth: bool,
        secure: bool,
    ) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        if self.check_ip_flood(server, port, &format!("NMDC hub: {}", hub_url)) {
            return;
        }

        let (id, rx) = {
            let (tx, rx) = mpsc::unbounded_channel();
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let mut uc = UserConnection::new(id, secure, true, false, tx);
            uc.token = nick.to_string();
            uc.hub_url = hub_url.to_string();
            uc.encoding = encoding.to_string();
            uc.stealth = stealth;
            uc.nat_role = nat_role;
            uc.remote = Some(SocketAddr::new(server, port));
            uc.last_activity = self.ticks();
            self.state.lock().connections.insert(id, uc);
            (id, rx)
        };

        let mgr = self.clone();
        tokio::spawn(async move {
            mgr.run_outbound(id, server, port, local_port, secure, Dialect::Nmdc, rx)
                .await;
        });
    }

    /// Initiates an outbound ADC connection.
    pub fn adc_connect(
        self: Arc<Self>,
        user: &HintedUser,
        server: IpAddr,
        port: u16,
        token: &str,
        secure: bool,
    ) {
        self.adc_connect_nat(user, server, port, 0, NatRole::None, token, secure);
    }

    /// Initiates an outbound ADC connection from a fixed local port, for
    /// NAT traversal.
    #[allow(clippy::too_many_arguments)]
    pub fn adc_connect_nat(
        self: Arc<Self>,
        user: &HintedUser,
        server: IpAddr,
        port: u16,
        local_port: u16,
        nat_role: NatRole,
        token: &str,
        secure: bool,
    ) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        let info = format!(
            "ADC nick: {}, hub: {}",
            user.user.first_nick(),
            user.hub_url
        );
        if self.check_ip_flood(server, port, &info) {
            return;
        }

        let (id, rx) = {
            let (tx, rx) = mpsc::unbounded_channel();
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let mut uc = UserConnection::new(id, secure, false, false, tx);
            uc.token = token.to_string();
            uc.hub_url = user.hub_url.clone();
            uc.nat_role = nat_role;
            uc.op = self.ctx.hubs.is_op(&user.user, &user.hub_url);
            uc.remote = Some(SocketAddr::new(server, port));
            uc.last_activity = self.ticks();
            self.state.lock().connections.insert(id, uc);
            (id, rx)
        };

        let mgr = self.clone();
        tokio::spawn(async move {
            mgr.run_outbound(id, server, port, local_port, secure, Dialect::Adc, rx)
                .await;
        });
    }

    /// Tears everything down: listeners, timer, every live connection,
    /// then the queue lists, spinning until the connection table drains.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let timer = {
            let mut s = self.state.lock();
            for l in s.listeners.drain(..) {
                l.stop();
            }
            s.timer.take()
        };
        if let Some(timer) = timer {
            timer.abort();
        }

        {
            let s = self.state.lock();
            for uc in s.connections.values() {
                uc.disconnect();
            }
        }
        loop {
            if self.state.lock().connections.is_empty() {
                break;
            }
            tokio::time::sleep(SHUTDOWN_POLL).await;
        }

        let mut s = self.state.lock();
        let ManagerState {
            downloads, uploads, ..
        } = &mut *s;
        for cqi in downloads.drain(..) {
            self.fire(ConnectionEvent::Removed(cqi.info()));
        }
        for cqi in uploads.drain(..) {
            self.ctx.uploads.remove_delay_upload(&cqi.user.user);
            self.fire(ConnectionEvent::Removed(cqi.info()));
        }
    }

    fn stop_listeners(&self) {
        let mut s = self.state.lock();
        for l in s.listeners.drain(..) {
            l.stop();
        }
    }

    fn ensure_timer(self: Arc<Self>) {
        let mut s = self.state.lock();
        if s.timer.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let mgr = Arc::clone(&self);
        s.timer = Some(tokio::spawn(async move {
            let mut second = interval(Duration::from_secs(1));
            let mut minute = interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = second.tick() => mgr.on_second(mgr.ticks()),
                    _ = minute.tick() => mgr.on_minute(mgr.ticks()),
                }
            }
        }));
    }

    /// Milliseconds since the manager was created.
    pub(crate) fn ticks(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn fire(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }

    /// One pass of the per-second retry walk over the download queue.
    pub(crate) fn on_second(&self, tick: u64) {
        let mut s = self.state.lock();
        let ManagerState { downloads, .. } = &mut *s;

        let mut attempts: u32 = 0;
        let mut to_remove: Vec<User> = Vec::new();

        for cqi in downloads.iter_mut() {
            if cqi.state == QueueState::Active {
                continue;
            }
            if !cqi.user.user.is_online() {
                to_remove.push(cqi.user.user.clone());
                continue;
            }
            if cqi.errors == PROTOCOL_ERROR && cqi.last_attempt != 0 {
                // protocol error, don't reconnect except after a forced
                // attempt
                continue;
            }

            let budget_left =
                self.config.downconn_per_sec == 0 || attempts < self.config.downconn_per_sec;
            let backoff = RETRY_BASE_MS * u64::from(cqi.errors.max(1) as u32);

            if cqi.last_attempt == 0 || (budget_left && cqi.last_attempt + backoff < tick) {
                cqi.last_attempt = tick;

                let priority = self.ctx.queue.has_download(&cqi.user);
                if priority == Priority::Paused {
                    to_remove.push(cqi.user.user.clone());
                    continue;
                }
                let admitted = self.ctx.downloads.start_download(priority);

                if cqi.state == QueueState::Waiting {
                    if admitted {
                        cqi.state = QueueState::Connecting;
                        self.ctx.hubs.connect(&cqi.user, &cqi.token);
                        self.fire(ConnectionEvent::StatusChanged(cqi.info()));
                        attempts += 1;
                    } else {
                        cqi.state = QueueState::NoDownloadSlots;
                        self.fire(ConnectionEvent::Failed(
                            cqi.info(),
                            "All download slots taken".to_string(),
                        ));
                    }
                } else if cqi.state == QueueState::NoDownloadSlots && admitted {
                    cqi.state = QueueState::Waiting;
                }
            } else if cqi.state == QueueState::Connecting
                && cqi.last_attempt + CONNECTING_TIMEOUT_MS < tick
            {
                self.ctx.hubs.connection_timeout(&cqi.user);
                cqi.errors += 1;
                self.fire(ConnectionEvent::Failed(
                    cqi.info(),
                    "Connection timeout".to_string(),
                ));
                cqi.state = QueueState::Waiting;
            }
        }

        for user in to_remove {
            if let Some(cqi) = take_cqi(downloads, &user) {
                self.fire(ConnectionEvent::Removed(cqi.info()));
            }
        }
    }

    /// Disconnects connections without activity for three minutes.
    pub(crate) fn on_minute(&self, tick: u64) {
        let s = self.state.lock();
        for uc in s.connections.values() {
            if uc.last_activity + IDLE_TIMEOUT_MS < tick {
                uc.disconnect();
            }
        }
    }

    /// Entry point for both listeners.
    ///
    /// Flood-suppressed sockets are closed straight away; the rest become
    /// incoming connections waiting for identification. It's always the
    /// other side that starts sending if it made the connection.
    pub(crate) fn accept(self: Arc<Self>, stream: TcpStream, peer: SocketAddr, secure: bool) {
        let now = self.ticks();
        if !self.accept_check(now) {
            debug!("connection flood detected, dropping {}", peer);
            return;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut uc = UserConnection::new(id, secure, false, true, tx);
        uc.remote = Some(peer);
        uc.last_activity = now;
        self.state.lock().connections.insert(id, uc);

        tokio::spawn(async move {
            self.run_incoming(id, stream, secure, rx).await;
        });
    }

    /// The inbound flood gate. Returns whether the accept may proceed.
    pub(crate) fn accept_check(&self, now: u64) -> bool {
        let mut s = self.state.lock();
        if s.conn_to_me_count > 0 {
            s.conn_to_me_count -= 1;
        }
        if now > s.flood_counter {
            s.flood_counter = now + FLOOD_ADD;
            return true;
        }
        if now + FLOOD_TRIGGER < s.flood_counter {
            return false;
        }
        if s.conn_to_me_count == 0 {
            s.flood_counter += FLOOD_ADD;
        }
        true
    }

    /// The outbound flood gate. Returns whether the connect must be
    /// refused.
    fn check_ip_flood(&self, server: IpAddr, port: u16, user_info: &str) -> bool {
        if BLOCKED_PORTS.contains(&port) {
            warn!(
                "{} is trying to use your client to spam {}:{}, please urge hub owner to fix this",
                user_info, server, port
            );
            return true;
        }

        let s = self.state.lock();
        let count = s
            .connections
            .values()
            .filter(|uc| matches!(uc.remote, Some(a) if a.ip() == server && a.port() == port))
            .count();
        if count >= MAX_CONNECTIONS_PER_ADDR {
            debug!(
                "already {} connections to {}:{}, connect dropped",
                count, server, port
            );
            return true;
        }
        false
    }

    async fn run_incoming(
        self: Arc<Self>,
        id: ConnId,
        stream: TcpStream,
        secure: bool,
        rx: mpsc::UnboundedReceiver<WriteCommand>,
    ) {
        let transport = if secure {
            let Some(acceptor) = self.ctx.crypto.acceptor() else {
                self.remove_connection(id);
                return;
            };
            match acceptor.accept(stream).await {
                Ok(tls) => PeerTransport::new(PeerStream::ServerTls(Box::new(tls))),
                Err(e) => {
                    self.failed(id, &e.to_string(), false);
                    self.remove_connection(id);
                    return;
                }
            }
        } else {
            PeerTransport::new(PeerStream::Plain(stream))
        };

        self.note_transport(id, &transport, secure);
        self.drive(id, transport, rx, None).await;
    }

    async fn run_outbound(
        self: Arc<Self>,
        id: ConnId,
        server: IpAddr,
        port: u16,
        local_port: u16,
        secure: bool,
        dialect: Dialect,
        rx: mpsc::UnboundedReceiver<WriteCommand>,
    ) {
        let transport = match self.connect_transport(server, port, local_port, secure).await {
            Ok(t) => t,
            Err(e) => {
                self.failed(id, &e.to_string(), false);
                self.remove_connection(id);
                return;
            }
        };

        self.note_transport(id, &transport, secure);
        if self.on_connected(id) == Outcome::Close {
            self.remove_connection(id);
            return;
        }
        self.drive(id, transport, rx, Some(dialect)).await;
    }

    async fn connect_transport(
        &self,
        server: IpAddr,
        port: u16,
        local_port: u16,
        secure: bool,
    ) -> Result<PeerTransport, ConnectionError> {
        let addr = SocketAddr::new(server, port);
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        if local_port != 0 {
            socket.set_reuseaddr(true)?;
            let unspecified: IpAddr = if addr.is_ipv4() {
                std::net::Ipv4Addr::UNSPECIFIED.into()
            } else {
                std::net::Ipv6Addr::UNSPECIFIED.into()
            };
            socket.bind(SocketAddr::new(unspecified, local_port))?;
        }

        let stream = timeout(CONNECT_TIMEOUT, socket.connect(addr))
            .await
            .map_err(|_| ConnectionError::Timeout)??;
        if !secure {
            return Ok(PeerTransport::new(PeerStream::Plain(stream)));
        }

        let connector = self.ctx.crypto.connector();
        let name = ServerName::try_from(server.to_string())
            .map_err(|e| ConnectionError::Protocol(e.to_string()))?;
        let tls = timeout(CONNECT_TIMEOUT, connector.connect(name, stream))
            .await
            .map_err(|_| ConnectionError::Timeout)??;
        Ok(PeerTransport::new(PeerStream::ClientTls(Box::new(tls))))
    }

    fn note_transport(&self, id: ConnId, transport: &PeerTransport, secure: bool) {
        let keyprint = transport.peer_keyprint();
        let mut s = self.state.lock();
        if let Some(uc) = s.connections.get_mut(&id) {
            uc.keyprint = keyprint;
            uc.trusted = secure && self.ctx.crypto.verifies_peers();
        }
    }

    /// Pumps one connection: socket reads drive the handshake handlers,
    /// queued write commands go out in order. On exit the connection is
    /// removed from the table.
    async fn drive(
        self: Arc<Self>,
        id: ConnId,
        mut transport: PeerTransport,
        mut rx: mpsc::UnboundedReceiver<WriteCommand>,
        mut dialect: Option<Dialect>,
    ) {
        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(WriteCommand::Send(data)) => {
                        if let Err(e) = transport.write_all(&data).await {
                            self.failed(id, &e.to_string(), false);
                            break;
                        }
                    }
                    Some(WriteCommand::Disconnect) => {
                        self.failed(id, "connection closed", false);
                        break;
                    }
                    Some(WriteCommand::Close) | None => break,
                },
                line = transport.read_line() => {
                    let line = match line {
                        Ok(line) => line,
                        Err(e) => {
                            self.failed(id, &e.to_string(), e.is_protocol());
                            break;
                        }
                    };
                    if line.is_empty() {
                        continue;
                    }
                    let d = match dialect {
                        Some(d) => d,
                        None => {
                            let d = if line.first() == Some(&b'$') {
                                Dialect::Nmdc
                            } else {
                                Dialect::Adc
                            };
                            if matches!(d, Dialect::Nmdc) {
                                if let Some(uc) = self.state.lock().connections.get_mut(&id) {
                                    uc.nmdc = true;
                                }
                            }
                            dialect = Some(d);
                            d
                        }
                    };
                    self.touch(id);

                    let outcome = match d {
                        Dialect::Nmdc => match NmdcCommand::parse(&line) {
                            Ok(cmd) => self.on_nmdc(id, cmd),
                            Err(e) => {
                                self.failed(id, &e.to_string(), true);
                                break;
                            }
                        },
                        Dialect::Adc => {
                            let line = String::from_utf8_lossy(&line);
                            match AdcCommand::parse(&line) {
                                Ok(cmd) => self.on_adc(id, cmd),
                                Err(e) => {
                                    self.failed(id, &e.to_string(), true);
                                    break;
                                }
                            }
                        }
                    };
                    if outcome == Outcome::Close {
                        break;
                    }
                }
            }
        }

        // flush whatever the final handler queued, e.g. a fatal STA
        while let Ok(cmd) = rx.try_recv() {
            if let WriteCommand::Send(data) = cmd {
                let _ = transport.write_all(&data).await;
            }
        }
        self.remove_connection(id);
    }

    fn touch(&self, id: ConnId) {
        let tick = self.ticks();
        if let Some(uc) = self.state.lock().connections.get_mut(&id) {
            uc.last_activity = tick;
        }
    }

    fn remove_connection(&self, id: ConnId) {
        self.state.lock().connections.remove(&id);
    }

    /// The outbound socket (and TLS handshake, if any) is up; send our
    /// side of the handshake opener.
    pub(crate) fn on_connected(&self, id: ConnId) -> Outcome {
        let (secure, trusted, user) = {
            let s = self.state.lock();
            let Some(uc) = s.connections.get(&id) else {
                return Outcome::Close;
            };
            (uc.secure, uc.trusted, uc.user.clone())
        };
        if secure && !trusted && !self.config.allow_untrusted_clients {
            if let Some(user) = user {
                self.ctx.queue.remove_source(&user, SourceDropReason::Untrusted);
            }
            return Outcome::Close;
        }

        let mut s = self.state.lock();
        let Some(uc) = s.connections.get_mut(&id) else {
            return Outcome::Close;
        };
        debug_assert_eq!(uc.state, State::Connect);
        if uc.nmdc {
            uc.send(
                NmdcCommand::MyNick {
                    nick: uc.token.clone().into_bytes(),
                }
                .encode(),
            );
            uc.send(
                NmdcCommand::Lock {
                    lock: nmdc::LOCK.to_string(),
                    pk: format!("{}Ref={}", nmdc::pk(), uc.hub_url),
                }
                .encode(),
            );
        } else {
            uc.send(Bytes::from(self.adc_sup().encode()));
            uc.send(Bytes::from(
                AdcCommand::sta(Severity::Success, ErrorCode::Generic, "")
                    .add_named("RF", &uc.hub_url)
                    .encode(),
            ));
        }
        uc.state = State::SupNick;
        Outcome::Continue
    }

    fn on_nmdc(&self, id: ConnId, cmd: NmdcCommand) -> Outcome {
        match cmd {
            NmdcCommand::MyNick { nick } => self.on_my_nick(id, &nick),
            NmdcCommand::Lock { lock, pk } => self.on_lock(id, lock, pk),
            NmdcCommand::Supports { features } => self.on_supports(id, features),
            NmdcCommand::Direction { download, number } => {
                self.on_direction(id, download, number)
            }
            NmdcCommand::Key { .. } => self.on_key(id),
            NmdcCommand::Unknown(name) => {
                debug!("ignoring nmdc command ${}", name);
                Outcome::Continue
            }
        }
    }

    fn on_adc(&self, id: ConnId, cmd: AdcCommand) -> Outcome {
        if cmd.ty != b'C' {
            debug!("ignoring non-client adc command {}", cmd);
            return Outcome::Continue;
        }
        match cmd.name {
            AdcCommand::SUP => self.on_sup(id, cmd),
            AdcCommand::INF => self.on_inf(id, cmd),
            AdcCommand::STA => Outcome::Continue,
            _ => {
                debug!("ignoring adc command {}", cmd);
                Outcome::Continue
            }
        }
    }

    /// NMDC `$MyNick`: identify the peer and pick a tentative role.
    pub(crate) fn on_my_nick(&self, id: ConnId, raw: &[u8]) -> Outcome {
        if raw.is_empty() {
            return Outcome::Close;
        }
        let nick_key = String::from_utf8_lossy(raw).into_owned();

        let (incoming, hub_url) = {
            let mut s = self.state.lock();
            let ManagerState {
                connections,
                expected,
                ..
            } = &mut *s;
            let Some(uc) = connections.get_mut(&id) else {
                return Outcome::Close;
            };
            if uc.state != State::SupNick {
                debug!("MyNick in state {:?}, ignoring", uc.state);
                return Outcome::Continue;
            }
            if uc.incoming {
                // correlate with the request that solicited this connect
                let Some((token, hub)) = expected.remove(&nick_key) else {
                    debug!("unknown incoming connection from {}", nick_key);
                    return Outcome::Close;
                };
                uc.token = token;
                uc.hub_url = hub;
            }
            (uc.incoming, uc.hub_url.clone())
        };

        if incoming {
            let encoding = self.ctx.hubs.hub_encoding(&hub_url);
            if let Some(uc) = self.state.lock().connections.get_mut(&id) {
                uc.encoding = encoding;
            }
        }
        let encoding = match self.state.lock().connections.get(&id) {
            Some(uc) => uc.encoding.clone(),
            None => return Outcome::Close,
        };

        let nick = text::to_utf8(raw, &encoding);
        let cid = self.ctx.hubs.make_cid(&nick, &hub_url);

        // First, we try looking in the pending downloads; hopefully it's
        // one of them.
        let mut user = None;
        {
            let mut s = self.state.lock();
            let ManagerState {
                connections,
                downloads,
                ..
            } = &mut *s;
            let Some(uc) = connections.get_mut(&id) else {
                return Outcome::Close;
            };
            for cqi in downloads.iter_mut() {
                if matches!(cqi.state, QueueState::Waiting | QueueState::Connecting)
                    && cqi.user.user.cid() == cid
                {
                    cqi.errors = 0;
                    uc.user = Some(cqi.user.user.clone());
                    uc.role = Some(Role::Download);
                    user = Some(cqi.user.user.clone());
                    break;
                }
            }
        }

        let user = match user {
            Some(user) => user,
            None => {
                // We don't need this connection for downloading; make it
                // an upload connection instead, if we know who it is.
                match self.ctx.hubs.find_user(&cid) {
                    Some(user) if user.is_online() => {
                        let mut s = self.state.lock();
                        let Some(uc) = s.connections.get_mut(&id) else {
                            return Outcome::Close;
                        };
                        uc.user = Some(user.clone());
                        uc.role = Some(Role::Upload);
                        user
                    }
                    _ => {
                        debug!("incoming connection from unknown user {}", nick);
                        return Outcome::Close;
                    }
                }
            }
        };

        let stealth = self.ctx.hubs.is_stealth(&hub_url);
        let op = self.ctx.hubs.is_op(&user, &hub_url);
        let remote_ip = {
            let s = self.state.lock();
            s.connections
                .get(&id)
                .and_then(|uc| uc.remote)
                .map(|a| a.ip())
        };
        if let Some(ip) = remote_ip {
            self.ctx.hubs.set_user_ip(&user, ip);
        }

        let mut s = self.state.lock();
        let Some(uc) = s.connections.get_mut(&id) else {
            return Outcome::Close;
        };
        if stealth {
            uc.stealth = true;
        }
        if op {
            uc.op = true;
        }
        if uc.incoming {
            uc.send(
                NmdcCommand::MyNick {
                    nick: uc.token.clone().into_bytes(),
                }
                .encode(),
            );
            uc.send(
                NmdcCommand::Lock {
                    lock: nmdc::LOCK.to_string(),
                    pk: nmdc::pk(),
                }
                .encode(),
            );
        }
        uc.state = State::Lock;
        Outcome::Continue
    }

    /// NMDC `$Lock`: negotiate features and answer the challenge.
    pub(crate) fn on_lock(&self, id: ConnId, lock: String, pk: String) -> Outcome {
        let user = {
            let mut s = self.state.lock();
            let Some(uc) = s.connections.get_mut(&id) else {
                return Outcome::Close;
            };
            if uc.state != State::Lock {
                debug!("Lock in state {:?}, ignoring", uc.state);
                return Outcome::Continue;
            }

            if nmdc::is_extended(&lock) {
                let mut features = self.nmdc_features.clone();
                if self.config.compress_transfers {
                    features.push(nmdc::FEATURE_ZLIB_GET.to_string());
                }
                uc.send(NmdcCommand::Supports { features }.encode());
            }

            uc.state = State::Direction;
            uc.send(
                NmdcCommand::Direction {
                    download: uc.role == Some(Role::Download),
                    number: uc.number,
                }
                .encode(),
            );
            uc.send(
                NmdcCommand::Key {
                    key: nmdc::make_key(&lock),
                }
                .encode(),
            );
            uc.user.clone()
        };

        if let Some(user) = user {
            self.ctx.hubs.set_pk_lock(&user, &pk, &lock);
        }
        Outcome::Continue
    }

    /// NMDC `$Supports`: record the peer's capabilities.
    pub(crate) fn on_supports(&self, id: ConnId, features: Vec<String>) -> Outcome {
        let user = {
            let mut s = self.state.lock();
            let Some(uc) = s.connections.get_mut(&id) else {
                return Outcome::Close;
            };
            for feature in &features {
                match feature.as_str() {
                    nmdc::FEATURE_MINISLOTS => uc.caps.minislots = true,
                    nmdc::FEATURE_XML_BZLIST => uc.caps.xml_bzlist = true,
                    nmdc::FEATURE_ADCGET => uc.caps.adcget = true,
                    nmdc::FEATURE_ZLIB_GET => uc.caps.zlib_get = true,
                    nmdc::FEATURE_TTHL => uc.caps.tthl = true,
                    nmdc::FEATURE_TTHF => uc.caps.tthf = true,
                    _ => {}
                }
            }
            uc.user.clone()
        };

        if let Some(user) = user {
            self.ctx.hubs.set_supports(&user, &features);
        }
        Outcome::Continue
    }

    /// NMDC `$Direction`: settle who downloads when both sides want to.
    pub(crate) fn on_direction(&self, id: ConnId, peer_download: bool, number: u16) -> Outcome {
        let mut s = self.state.lock();
        let Some(uc) = s.connections.get_mut(&id) else {
            return Outcome::Close;
        };
        if uc.state != State::Direction {
            debug!("Direction in state {:?}, ignoring", uc.state);
            return Outcome::Continue;
        }
        debug_assert!(uc.role.is_some());

        if !peer_download {
            // The other fellow wants to send us data; that only works if
            // we asked for it.
            if uc.role == Some(Role::Upload) {
                return Outcome::Close;
            }
        } else if uc.role == Some(Role::Download) {
            // Both want to download; the higher number wins.
            if uc.number < number {
                uc.role = Some(Role::Upload);
            } else if uc.number == number {
                return Outcome::Close;
            }
        }

        uc.state = State::Key;
        Outcome::Continue
    }

    /// NMDC `$Key`: the handshake is done, dispatch by role.
    pub(crate) fn on_key(&self, id: ConnId) -> Outcome {
        let role = {
            let s = self.state.lock();
            let Some(uc) = s.connections.get(&id) else {
                return Outcome::Close;
            };
            if uc.state != State::Key {
                debug!("Key in state {:?}, ignoring", uc.state);
                return Outcome::Continue;
            }
            if uc.user.is_none() {
                return Outcome::Close;
            }
            uc.role
        };

        match role {
            Some(Role::Download) => self.add_download_connection(id),
            _ => self.add_upload_connection(id),
        }
    }

    /// ADC `SUP`: negotiate features, reply, and move to `INF`.
    pub(crate) fn on_sup(&self, id: ConnId, cmd: AdcCommand) -> Outcome {
        let my_cid = self.ctx.hubs.my_cid();

        let mut s = self.state.lock();
        let Some(uc) = s.connections.get_mut(&id) else {
            return Outcome::Close;
        };
        if uc.state != State::SupNick {
            debug!("SUP in state {:?}, ignoring", uc.state);
            return Outcome::Continue;
        }

        let mut base_ok = false;
        for param in cmd.params() {
            let Some(feature) = param.strip_prefix("AD") else {
                continue;
            };
            match feature {
                adc::FEATURE_BASE | adc::FEATURE_BAS0 => {
                    base_ok = true;
                    // For BAS0 tiger is implicit
                    if feature == adc::FEATURE_BAS0 {
                        uc.caps.tiger = true;
                    }
                    // ADC clients must support all of these
                    uc.caps.adcget = true;
                    uc.caps.minislots = true;
                    uc.caps.tthf = true;
                    uc.caps.tthl = true;
                    // For compatibility with older clients
                    uc.caps.xml_bzlist = true;
                }
                adc::FEATURE_TIGR => uc.caps.tiger = true,
                adc::FEATURE_BZIP => uc.caps.xml_bzlist = true,
                adc::FEATURE_ZLIB_GET => uc.caps.zlib_get = true,
                _ => {}
            }
        }

        if !base_ok {
            uc.send(Bytes::from(
                AdcCommand::sta(Severity::Fatal, ErrorCode::ProtocolGeneric, "Invalid SUP")
                    .encode(),
            ));
            return Outcome::Close;
        }

        if uc.incoming {
            uc.send(Bytes::from(self.adc_sup().encode()));
            uc.send(Bytes::from(self.adc_inf(my_cid, None).encode()));
        } else {
            let token = uc.token.clone();
            uc.send(Bytes::from(self.adc_inf(my_cid, Some(&token)).encode()));
        }
        uc.state = State::Inf;
        Outcome::Continue
    }

    /// ADC `INF`: identify the peer, validate its keyprint, settle the
    /// role by token, and dispatch.
    pub(crate) fn on_inf(&self, id: ConnId, cmd: AdcCommand) -> Outcome {
        {
            let s = self.state.lock();
            let Some(uc) = s.connections.get(&id) else {
                return Outcome::Close;
            };
            if uc.state != State::Inf {
                uc.send(Bytes::from(
                    AdcCommand::sta(
                        Severity::Fatal,
                        ErrorCode::ProtocolGeneric,
                        "Expecting INF",
                    )
                    .encode(),
                ));
                return Outcome::Close;
            }
        }

        let Some(cid_str) = cmd.param("ID") else {
            self.send_to(
                id,
                AdcCommand::sta(Severity::Fatal, ErrorCode::InfMissing, "ID missing")
                    .add_named("FL", "ID"),
            );
            return Outcome::Close;
        };

        let user = Cid::from_base32(cid_str).and_then(|cid| self.ctx.hubs.find_user(&cid));
        let Some(user) = user else {
            debug!("INF from unknown user");
            self.send_to(
                id,
                AdcCommand::sta(Severity::Fatal, ErrorCode::Generic, "User not found"),
            );
            return Outcome::Close;
        };

        let (keyprint, hub_url, incoming, own_token) = {
            let s = self.state.lock();
            let Some(uc) = s.connections.get(&id) else {
                return Outcome::Close;
            };
            (
                uc.keyprint.clone().unwrap_or_default(),
                uc.hub_url.clone(),
                uc.incoming,
                uc.token.clone(),
            )
        };

        let advertised = self.ctx.hubs.user_field(&user.cid(), &hub_url, "KP");
        if !crypto::check_keyprint(
            &keyprint,
            advertised.as_deref(),
            self.config.accept_unknown_keyprint,
        ) {
            debug!("keyprint mismatch for {}", user.cid());
            return Outcome::Close;
        }

        let token = if incoming {
            match cmd.param("TO") {
                Some(token) => token.to_string(),
                None => {
                    self.send_to(
                        id,
                        AdcCommand::sta(Severity::Fatal, ErrorCode::Generic, "TO missing"),
                    );
                    return Outcome::Close;
                }
            }
        } else {
            own_token
        };

        let mut down = false;
        {
            let mut s = self.state.lock();
            let ManagerState {
                connections,
                downloads,
                ..
            } = &mut *s;
            let Some(uc) = connections.get_mut(&id) else {
                return Outcome::Close;
            };
            uc.user = Some(user.clone());
            uc.token = token.clone();
            if let Some(cqi) = downloads.iter_mut().find(|c| c.user.user == user) {
                cqi.errors = 0;
                if cqi.token == token {
                    down = true;
                }
            }
            uc.role = Some(if down { Role::Download } else { Role::Upload });
        }

        if down {
            self.add_download_connection(id)
        } else {
            self.add_upload_connection(id)
        }
    }

    /// Hands an identified download connection to the download subsystem,
    /// or closes it if its queue item went away.
    fn add_download_connection(&self, id: ConnId) -> Outcome {
        let mut handoff = None;
        {
            let mut s = self.state.lock();
            let ManagerState {
                connections,
                downloads,
                ..
            } = &mut *s;
            let Some(uc) = connections.get_mut(&id) else {
                return Outcome::Close;
            };
            debug_assert_eq!(uc.role, Some(Role::Download));
            let Some(user) = uc.user.clone() else {
                return Outcome::Close;
            };

            if let Some(cqi) = downloads.iter_mut().find(|c| c.user.user == user) {
                if matches!(cqi.state, QueueState::Waiting | QueueState::Connecting) {
                    cqi.state = QueueState::Active;
                    uc.associated = true;
                    uc.state = State::Running;
                    self.fire(ConnectionEvent::Connected(cqi.info()));
                    let hinted = cqi.user.clone();
                    handoff = Some((
                        uc.transfer_handle(hinted.clone(), Role::Download),
                        hinted,
                        uc.remote,
                    ));
                }
            }
        }

        match handoff {
            Some((handle, hinted, remote)) => {
                self.ctx.downloads.add_connection(handle);
                self.store_last_ip(&hinted, remote);
                Outcome::Continue
            }
            None => Outcome::Close,
        }
    }

    /// Hands an identified upload connection to the upload subsystem.
    ///
    /// This is the only place upload queue items are created; a second
    /// connection for a user that already has one is closed.
    fn add_upload_connection(&self, id: ConnId) -> Outcome {
        let mut handoff = None;
        {
            let mut s = self.state.lock();
            let ManagerState {
                connections,
                uploads,
                ..
            } = &mut *s;
            let Some(uc) = connections.get_mut(&id) else {
                return Outcome::Close;
            };
            debug_assert_eq!(uc.role, Some(Role::Upload));
            let Some(user) = uc.user.clone() else {
                return Outcome::Close;
            };

            if !uploads.iter().any(|c| c.user.user == user) {
                let hinted = HintedUser::new(user, uc.hub_url.clone());
                let mut cqi = ConnectionQueueItem::new(hinted.clone(), false);
                self.fire(ConnectionEvent::Added(cqi.info()));
                cqi.state = QueueState::Active;
                uc.associated = true;
                uc.state = State::Running;
                self.fire(ConnectionEvent::Connected(cqi.info()));
                handoff = Some((
                    uc.transfer_handle(hinted.clone(), Role::Upload),
                    hinted,
                    uc.remote,
                ));
                uploads.push(cqi);
            }
        }

        match handoff {
            Some((handle, hinted, remote)) => {
                self.ctx.uploads.add_connection(handle);
                self.store_last_ip(&hinted, remote);
                Outcome::Continue
            }
            None => Outcome::Close,
        }
    }

    fn store_last_ip(&self, hinted: &HintedUser, remote: Option<SocketAddr>) {
        if !self.config.enable_last_ip {
            return;
        }
        let Some(addr) = remote else { return };
        self.ctx
            .ip_store
            .store_last_ip(&hinted.hub_url, &hinted.user.first_nick(), addr.ip());
        hinted.user.set_last_ip(addr.ip());
    }

    /// The failure handler: retry bookkeeping for the associated queue
    /// item, if any. The connection itself is removed by its I/O task.
    pub(crate) fn failed(&self, id: ConnId, error: &str, protocol_error: bool) {
        let now = self.ticks();
        let mut s = self.state.lock();
        let ManagerState {
            connections,
            downloads,
            uploads,
            ..
        } = &mut *s;
        let Some(uc) = connections.get_mut(&id) else {
            return;
        };
        if !uc.associated {
            return;
        }

        match uc.role {
            Some(Role::Download) => {
                if let Some(user) = uc.user.clone() {
                    if let Some(cqi) = downloads.iter_mut().find(|c| c.user.user == user) {
                        cqi.state = QueueState::Waiting;
                        cqi.last_attempt = now;
                        cqi.errors = if protocol_error {
                            PROTOCOL_ERROR
                        } else {
                            cqi.errors + 1
                        };
                        self.fire(ConnectionEvent::Failed(cqi.info(), error.to_string()));
                    }
                }
            }
            Some(Role::Upload) => {
                if let Some(user) = uc.user.clone() {
                    if let Some(cqi) = take_cqi(uploads, &user) {
                        self.ctx.uploads.remove_delay_upload(&user);
                        self.fire(ConnectionEvent::Removed(cqi.info()));
                    }
                }
            }
            None => {}
        }
        uc.associated = false;
    }

    fn send_to(&self, id: ConnId, cmd: AdcCommand) {
        let s = self.state.lock();
        if let Some(uc) = s.connections.get(&id) {
            uc.send(Bytes::from(cmd.encode()));
        }
    }

    fn adc_sup(&self) -> AdcCommand {
        let mut cmd = AdcCommand::new(AdcCommand::SUP);
        for feature in &self.adc_features {
            cmd = cmd.add(feature.clone());
        }
        if self.config.compress_transfers {
            cmd = cmd.add(format!("AD{}", adc::FEATURE_ZLIB_GET));
        }
        cmd
    }

    fn adc_inf(&self, my_cid: Cid, token: Option<&str>) -> AdcCommand {
        let mut cmd = AdcCommand::new(AdcCommand::INF).add_named("ID", my_cid.to_base32());
        if let Some(token) = token {
            cmd = cmd.add_named("TO", token);
        }
        cmd
    }

    #[cfg(test)]
    pub(crate) fn insert_test_connection(
        &self,
        nmdc: bool,
        incoming: bool,
        secure: bool,
    ) -> (ConnId, mpsc::UnboundedReceiver<WriteCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut uc = UserConnection::new(id, secure, nmdc, incoming, tx);
        uc.remote = Some(SocketAddr::new(
            IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
            40_000,
        ));
        self.state.lock().connections.insert(id, uc);
        (id, rx)
    }

    #[cfg(test)]
    pub(crate) fn with_connection<R>(
        &self,
        id: ConnId,
        f: impl FnOnce(&mut UserConnection) -> R,
    ) -> Option<R> {
        self.state.lock().connections.get_mut(&id).map(f)
    }

    #[cfg(test)]
    pub(crate) fn with_download_cqi<R>(
        &self,
        user: &User,
        f: impl FnOnce(&mut ConnectionQueueItem) -> R,
    ) -> Option<R> {
        self.state
            .lock()
            .downloads
            .iter_mut()
            .find(|c| &c.user.user == user)
            .map(f)
    }
}
