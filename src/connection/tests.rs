use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;

use super::manager::Outcome;
use super::queue::PROTOCOL_ERROR;
use super::user_connection::{State, WriteCommand};
use super::*;
use crate::adc::AdcCommand;
use crate::config::Config;
use crate::context::{
    Context, DownloadHandler, HubDirectory, IpStore, Priority, SourceDropReason, TransferQueue,
    UploadHandler,
};
use crate::crypto::CryptoContext;
use crate::text;
use crate::user::{Cid, HintedUser, User};

const HUB: &str = "dchub://hub.example.org";

struct StubDownloads {
    admit: AtomicBool,
    idle_checks: Mutex<Vec<User>>,
    connections: Mutex<Vec<TransferConnection>>,
}

impl StubDownloads {
    fn new() -> Self {
        Self {
            admit: AtomicBool::new(true),
            idle_checks: Mutex::new(Vec::new()),
            connections: Mutex::new(Vec::new()),
        }
    }
}

impl DownloadHandler for StubDownloads {
    fn check_idle(&self, user: &User) {
        self.idle_checks.lock().push(user.clone());
    }

    fn start_download(&self, _priority: Priority) -> bool {
        self.admit.load(Ordering::SeqCst)
    }

    fn add_connection(&self, conn: TransferConnection) {
        self.connections.lock().push(conn);
    }
}

#[derive(Default)]
struct StubUploads {
    connections: Mutex<Vec<TransferConnection>>,
    delay_removed: Mutex<Vec<User>>,
}

impl UploadHandler for StubUploads {
    fn add_connection(&self, conn: TransferConnection) {
        self.connections.lock().push(conn);
    }

    fn remove_delay_upload(&self, user: &User) {
        self.delay_removed.lock().push(user.clone());
    }
}

struct StubHub {
    my_cid: Cid,
    users: Mutex<HashMap<Cid, User>>,
    connects: Mutex<Vec<(HintedUser, String)>>,
    timeouts: Mutex<Vec<HintedUser>>,
    keyprints: Mutex<HashMap<Cid, String>>,
    supports: Mutex<Vec<(User, Vec<String>)>>,
    pk_locks: Mutex<Vec<(User, String, String)>>,
    ips: Mutex<Vec<(User, IpAddr)>>,
}

impl StubHub {
    fn new() -> Self {
        Self {
            my_cid: Cid::new([0xaa; 24]),
            users: Mutex::new(HashMap::new()),
            connects: Mutex::new(Vec::new()),
            timeouts: Mutex::new(Vec::new()),
            keyprints: Mutex::new(HashMap::new()),
            supports: Mutex::new(Vec::new()),
            pk_locks: Mutex::new(Vec::new()),
            ips: Mutex::new(Vec::new()),
        }
    }

    fn add_user(&self, user: &User) {
        self.users.lock().insert(user.cid(), user.clone());
    }
}

fn derive_cid(nick: &str, hub_url: &str) -> Cid {
    let mut hasher = Sha256::new();
    hasher.update(nick.as_bytes());
    hasher.update([0]);
    hasher.update(hub_url.as_bytes());
    let digest = hasher.finalize();
    let mut cid = [0u8; 24];
    cid.copy_from_slice(&digest[..24]);
    Cid::new(cid)
}

impl HubDirectory for StubHub {
    fn my_cid(&self) -> Cid {
        self.my_cid
    }

    fn connect(&self, user: &HintedUser, token: &str) {
        self.connects.lock().push((user.clone(), token.to_string()));
    }

    fn connection_timeout(&self, user: &HintedUser) {
        self.timeouts.lock().push(user.clone());
    }

    fn find_user(&self, cid: &Cid) -> Option<User> {
        self.users.lock().get(cid).cloned()
    }

    fn make_cid(&self, nick: &str, hub_url: &str) -> Cid {
        derive_cid(nick, hub_url)
    }

    fn hub_encoding(&self, _hub_url: &str) -> String {
        "utf-8".to_string()
    }

    fn is_op(&self, _user: &User, _hub_url: &str) -> bool {
        false
    }

    fn is_stealth(&self, _hub_url: &str) -> bool {
        false
    }

    fn set_user_ip(&self, user: &User, ip: IpAddr) {
        self.ips.lock().push((user.clone(), ip));
    }

    fn set_pk_lock(&self, user: &User, pk: &str, lock: &str) {
        self.pk_locks
            .lock()
            .push((user.clone(), pk.to_string(), lock.to_string()));
    }

    fn set_supports(&self, user: &User, features: &[String]) {
        self.supports.lock().push((user.clone(), features.to_vec()));
    }

    fn user_field(&self, cid: &Cid, _hub_url: &str, field: &str) -> Option<String> {
        if field == "KP" {
            self.keyprints.lock().get(cid).cloned()
        } else {
            None
        }
    }
}

struct StubQueue {
    priority: Mutex<Priority>,
    removed: Mutex<Vec<(User, SourceDropReason)>>,
}

impl StubQueue {
    fn new() -> Self {
        Self {
            priority: Mutex::new(Priority::Normal),
            removed: Mutex::new(Vec::new()),
        }
    }
}

impl TransferQueue for StubQueue {
    fn has_download(&self, _user: &HintedUser) -> Priority {
        *self.priority.lock()
    }

    fn remove_source(&self, user: &User, reason: SourceDropReason) {
        self.removed.lock().push((user.clone(), reason));
    }
}

#[derive(Default)]
struct StubIpStore {
    stored: Mutex<Vec<(String, String, IpAddr)>>,
}

impl IpStore for StubIpStore {
    fn store_last_ip(&self, hub_url: &str, nick: &str, ip: IpAddr) {
        self.stored
            .lock()
            .push((hub_url.to_string(), nick.to_string(), ip));
    }
}

struct Fixture {
    manager: Arc<ConnectionManager>,
    downloads: Arc<StubDownloads>,
    uploads: Arc<StubUploads>,
    hub: Arc<StubHub>,
    queue: Arc<StubQueue>,
    ip_store: Arc<StubIpStore>,
}

fn fixture() -> Fixture {
    fixture_with(Config::default())
}

fn fixture_with(config: Config) -> Fixture {
    let downloads = Arc::new(StubDownloads::new());
    let uploads = Arc::new(StubUploads::default());
    let hub = Arc::new(StubHub::new());
    let queue = Arc::new(StubQueue::new());
    let ip_store = Arc::new(StubIpStore::default());
    let ctx = Context {
        downloads: downloads.clone(),
        uploads: uploads.clone(),
        hubs: hub.clone(),
        queue: queue.clone(),
        ip_store: ip_store.clone(),
        crypto: Arc::new(CryptoContext::new(None).unwrap()),
    };
    Fixture {
        manager: ConnectionManager::new(config, ctx),
        downloads,
        uploads,
        hub,
        queue,
        ip_store,
    }
}

fn hinted(seed: u8, nick: &str) -> HintedUser {
    HintedUser::new(User::new(Cid::new([seed; 24]), nick), HUB)
}

/// A user whose CID matches what the hub derives for this nick, as NMDC
/// identification requires.
fn nmdc_user(nick: &str) -> HintedUser {
    HintedUser::new(User::new(derive_cid(nick, HUB), nick), HUB)
}

fn sent_lines(rx: &mut mpsc::UnboundedReceiver<WriteCommand>) -> Vec<String> {
    let mut out = Vec::new();
    while let Ok(cmd) = rx.try_recv() {
        if let WriteCommand::Send(data) = cmd {
            out.push(String::from_utf8_lossy(&data).into_owned());
        }
    }
    out
}

fn adc(line: &str) -> AdcCommand {
    AdcCommand::parse(line).unwrap()
}

#[test]
fn test_get_download_connection_idempotent() {
    let f = fixture();
    let user = hinted(1, "alice");

    f.manager.get_download_connection(&user);
    f.manager.get_download_connection(&user);
    f.manager.get_download_connection(&user);

    let queue = f.manager.download_queue();
    assert_eq!(queue.len(), 1);
    assert_eq!(queue[0].state, QueueState::Waiting);
    assert_eq!(queue[0].token, user.user.cid().to_base32());
    assert_eq!(f.downloads.idle_checks.lock().len(), 2);
}

#[test]
fn test_tick_connects_waiting_item() {
    let f = fixture();
    let mut events = f.manager.subscribe();
    let user = hinted(1, "alice");
    f.manager.get_download_connection(&user);

    f.manager.on_second(1_000);

    assert_eq!(f.manager.download_queue()[0].state, QueueState::Connecting);
    let connects = f.hub.connects.lock();
    assert_eq!(connects.len(), 1);
    assert_eq!(connects[0].1, user.user.cid().to_base32());

    assert!(matches!(events.try_recv(), Ok(ConnectionEvent::Added(_))));
    assert!(matches!(
        events.try_recv(),
        Ok(ConnectionEvent::StatusChanged(_))
    ));
}

#[test]
fn test_tick_respects_per_second_budget() {
    let f = fixture_with(Config {
        downconn_per_sec: 2,
        ..Config::default()
    });
    for seed in 1..=5 {
        f.manager.get_download_connection(&hinted(seed, "user"));
    }
    // age every item past its backoff so the budget is the only gate
    for seed in 1..=5 {
        let user = hinted(seed, "user").user;
        f.manager
            .with_download_cqi(&user, |cqi| cqi.last_attempt = 1)
            .unwrap();
    }

    f.manager.on_second(70_000);

    let connecting = f
        .manager
        .download_queue()
        .iter()
        .filter(|c| c.state == QueueState::Connecting)
        .count();
    assert_eq!(connecting, 2);
    assert_eq!(f.hub.connects.lock().len(), 2);
}

#[test]
fn test_tick_backoff_scales_with_errors() {
    let f = fixture();
    let user = hinted(1, "alice");
    f.manager.get_download_connection(&user);
    f.manager
        .with_download_cqi(&user.user, |cqi| {
            cqi.last_attempt = 1_000;
            cqi.errors = 3;
        })
        .unwrap();

    // 3 errors back off for 180 s
    f.manager.on_second(180_000);
    assert!(f.hub.connects.lock().is_empty());

    f.manager.on_second(181_001);
    assert_eq!(f.hub.connects.lock().len(), 1);
}

#[test]
fn test_protocol_error_sticky_until_forced() {
    let f = fixture();
    let user = hinted(1, "alice");
    f.manager.get_download_connection(&user);
    f.manager
        .with_download_cqi(&user.user, |cqi| {
            cqi.last_attempt = 5;
            cqi.errors = PROTOCOL_ERROR;
        })
        .unwrap();

    f.manager.on_second(1_000_000);
    assert!(f.hub.connects.lock().is_empty());

    f.manager.force(&user.user);
    f.manager.on_second(1_001_000);
    assert_eq!(f.hub.connects.lock().len(), 1);
}

#[test]
fn test_paused_priority_removes_item() {
    let f = fixture();
    let mut events = f.manager.subscribe();
    *f.queue.priority.lock() = Priority::Paused;
    f.manager.get_download_connection(&hinted(1, "alice"));

    f.manager.on_second(1_000);

    assert!(f.manager.download_queue().is_empty());
    assert!(matches!(events.try_recv(), Ok(ConnectionEvent::Added(_))));
    assert!(matches!(events.try_recv(), Ok(ConnectionEvent::Removed(_))));
}

#[test]
fn test_offline_user_removed() {
    let f = fixture();
    let user = hinted(1, "alice");
    f.manager.get_download_connection(&user);
    user.user.set_online(false);

    f.manager.on_second(1_000);

    assert!(f.manager.download_queue().is_empty());
    assert!(f.hub.connects.lock().is_empty());
}

#[test]
fn test_no_download_slots_cycle() {
    let f = fixture();
    let mut events = f.manager.subscribe();
    f.downloads.admit.store(false, Ordering::SeqCst);
    let user = hinted(1, "alice");
    f.manager.get_download_connection(&user);

    f.manager.on_second(1_000);
    assert_eq!(
        f.manager.download_queue()[0].state,
        QueueState::NoDownloadSlots
    );
    let _ = events.try_recv(); // Added
    match events.try_recv() {
        Ok(ConnectionEvent::Failed(_, reason)) => {
            assert_eq!(reason, "All download slots taken");
        }
        other => panic!("unexpected event: {:?}", other),
    }

    // a slot frees up: back to waiting once the backoff allows
    f.downloads.admit.store(true, Ordering::SeqCst);
    f.manager.on_second(62_000);
    assert_eq!(f.manager.download_queue()[0].state, QueueState::Waiting);

    f.manager.on_second(123_000);
    assert_eq!(f.manager.download_queue()[0].state, QueueState::Connecting);
}

#[test]
fn test_connecting_timeout() {
    let f = fixture();
    let user = hinted(1, "alice");
    f.manager.get_download_connection(&user);
    f.manager.on_second(1_000);
    assert_eq!(f.manager.download_queue()[0].state, QueueState::Connecting);

    f.manager.on_second(51_001);

    assert_eq!(f.manager.download_queue()[0].state, QueueState::Waiting);
    assert_eq!(f.hub.timeouts.lock().len(), 1);
    f.manager
        .with_download_cqi(&user.user, |cqi| assert_eq!(cqi.errors, 1))
        .unwrap();
}

#[test]
fn test_inbound_flood_guard() {
    let f = fixture();
    let accepted = (0..200).filter(|_| f.manager.accept_check(5_000)).count();
    // the counter runs ahead 2 s per accept and trips 20 s out
    assert_eq!(accepted, 11);

    // counter decays with time
    assert!(f.manager.accept_check(100_000));
}

#[test]
fn test_nmdc_incoming_unknown_nick_dropped() {
    let f = fixture();
    let (id, _rx) = f.manager.insert_test_connection(false, true, false);

    assert_eq!(f.manager.on_my_nick(id, b"stranger"), Outcome::Close);
    assert!(f.manager.download_queue().is_empty());
    assert!(f.manager.upload_queue().is_empty());
}

#[test]
fn test_nmdc_incoming_upload_handshake() {
    let f = fixture();
    let peer = nmdc_user("peer");
    f.hub.add_user(&peer.user);
    f.manager.expect_connection("peer", "MyOwnNick", HUB);

    let (id, mut rx) = f.manager.insert_test_connection(false, true, false);

    assert_eq!(f.manager.on_my_nick(id, b"peer"), Outcome::Continue);
    f.manager
        .with_connection(id, |uc| {
            assert_eq!(uc.token, "MyOwnNick");
            assert_eq!(uc.hub_url, HUB);
            assert_eq!(uc.role, Some(Role::Upload));
            assert_eq!(uc.state, State::Lock);
            assert!(uc.user.is_some());
        })
        .unwrap();
    let lines = sent_lines(&mut rx);
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0], "$MyNick MyOwnNick\r\n");
    assert!(lines[1].starts_with("$Lock EXTENDEDPROTOCOL"));
    assert_eq!(f.hub.ips.lock().len(), 1);

    assert_eq!(
        f.manager
            .on_lock(id, "EXTENDEDPROTOCOLABC".to_string(), "peerPk".to_string()),
        Outcome::Continue
    );
    let lines = sent_lines(&mut rx);
    assert_eq!(lines.len(), 3);
    assert!(lines[0].starts_with("$Supports MiniSlots XmlBZList ADCGet TTHL TTHF ZLIG"));
    assert!(lines[1].starts_with("$Direction Upload "));
    assert!(lines[2].starts_with("$Key "));
    assert_eq!(f.hub.pk_locks.lock().len(), 1);

    assert_eq!(f.manager.on_direction(id, true, 55), Outcome::Continue);

    assert_eq!(f.manager.on_key(id), Outcome::Continue);
    assert_eq!(f.uploads.connections.lock().len(), 1);
    let uploads = f.manager.upload_queue();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].state, QueueState::Active);
    f.manager
        .with_connection(id, |uc| {
            assert!(uc.associated);
            assert_eq!(uc.state, State::Running);
        })
        .unwrap();
    assert_eq!(f.ip_store.stored.lock().len(), 1);
}

#[test]
fn test_nmdc_direction_tie_break_we_lose() {
    let f = fixture();
    let peer = nmdc_user("peer");
    f.hub.add_user(&peer.user);
    f.manager.get_download_connection(&peer);
    f.manager.expect_connection("peer", "MyOwnNick", HUB);

    let (id, mut rx) = f.manager.insert_test_connection(false, true, false);
    assert_eq!(f.manager.on_my_nick(id, b"peer"), Outcome::Continue);
    f.manager
        .with_connection(id, |uc| {
            assert_eq!(uc.role, Some(Role::Download));
            uc.number = 10;
        })
        .unwrap();

    f.manager
        .on_lock(id, "EXTENDEDPROTOCOLABC".to_string(), "pk".to_string());
    let lines = sent_lines(&mut rx);
    assert!(lines.iter().any(|l| l == "$Direction Download 10\r\n"));

    // peer wants to download too, with the higher number: we lose
    assert_eq!(f.manager.on_direction(id, true, 22), Outcome::Continue);
    f.manager
        .with_connection(id, |uc| {
            assert_eq!(uc.role, Some(Role::Upload));
            assert_eq!(uc.state, State::Key);
        })
        .unwrap();

    assert_eq!(f.manager.on_key(id), Outcome::Continue);
    assert_eq!(f.uploads.connections.lock().len(), 1);
    // our download request stays pending
    assert_eq!(f.manager.download_queue()[0].state, QueueState::Waiting);
}

#[test]
fn test_nmdc_direction_tie_break_equal_numbers_drop() {
    let f = fixture();
    let peer = nmdc_user("peer");
    f.hub.add_user(&peer.user);
    f.manager.get_download_connection(&peer);
    f.manager.expect_connection("peer", "MyOwnNick", HUB);

    let (id, _rx) = f.manager.insert_test_connection(false, true, false);
    assert_eq!(f.manager.on_my_nick(id, b"peer"), Outcome::Continue);
    f.manager.with_connection(id, |uc| uc.number = 17).unwrap();
    f.manager
        .on_lock(id, "EXTENDEDPROTOCOLABC".to_string(), "pk".to_string());

    assert_eq!(f.manager.on_direction(id, true, 17), Outcome::Close);
    // nothing was dispatched; the queue item survives for the next retry
    assert!(f.uploads.connections.lock().is_empty());
    assert!(f.downloads.connections.lock().is_empty());
    assert_eq!(f.manager.download_queue().len(), 1);
}

#[test]
fn test_nmdc_both_want_upload_drop() {
    let f = fixture();
    let peer = nmdc_user("peer");
    f.hub.add_user(&peer.user);
    f.manager.expect_connection("peer", "MyOwnNick", HUB);

    let (id, _rx) = f.manager.insert_test_connection(false, true, false);
    f.manager.on_my_nick(id, b"peer");
    f.manager
        .on_lock(id, "EXTENDEDPROTOCOLABC".to_string(), "pk".to_string());
    // no download queue item, so we are the upload side; the peer claims
    // Upload as well
    assert_eq!(f.manager.on_direction(id, false, 3), Outcome::Close);
}

#[test]
fn test_nmdc_my_nick_twice_ignored() {
    let f = fixture();
    let peer = nmdc_user("peer");
    f.hub.add_user(&peer.user);
    f.manager.expect_connection("peer", "MyOwnNick", HUB);

    let (id, _rx) = f.manager.insert_test_connection(false, true, false);
    assert_eq!(f.manager.on_my_nick(id, b"peer"), Outcome::Continue);
    assert_eq!(f.manager.on_my_nick(id, b"peer"), Outcome::Continue);
    f.manager
        .with_connection(id, |uc| assert_eq!(uc.state, State::Lock))
        .unwrap();
}

#[test]
fn test_nmdc_supports_sets_capabilities() {
    let f = fixture();
    let (id, _rx) = f.manager.insert_test_connection(true, true, false);
    let features = vec![
        "MiniSlots".to_string(),
        "ADCGet".to_string(),
        "ZLIG".to_string(),
        "SomethingNew".to_string(),
    ];

    assert_eq!(f.manager.on_supports(id, features), Outcome::Continue);
    f.manager
        .with_connection(id, |uc| {
            assert!(uc.caps.minislots);
            assert!(uc.caps.adcget);
            assert!(uc.caps.zlib_get);
            assert!(!uc.caps.tthl);
        })
        .unwrap();
}

#[test]
fn test_nmdc_outbound_connected_sends_opener() {
    let f = fixture();
    let (id, mut rx) = f.manager.insert_test_connection(true, false, false);
    f.manager
        .with_connection(id, |uc| {
            uc.token = "MyOwnNick".to_string();
            uc.hub_url = HUB.to_string();
        })
        .unwrap();

    assert_eq!(f.manager.on_connected(id), Outcome::Continue);

    let lines = sent_lines(&mut rx);
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0], "$MyNick MyOwnNick\r\n");
    assert!(lines[1].starts_with("$Lock EXTENDEDPROTOCOL"));
    assert!(lines[1].contains(&format!("Ref={}", HUB)));
    f.manager
        .with_connection(id, |uc| assert_eq!(uc.state, State::SupNick))
        .unwrap();
}

#[test]
fn test_adc_sup_without_base_is_fatal() {
    let f = fixture();
    let (id, mut rx) = f.manager.insert_test_connection(false, true, false);

    assert_eq!(f.manager.on_sup(id, adc("CSUP ADTIGR")), Outcome::Close);

    let lines = sent_lines(&mut rx);
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0], "CSTA 210 Invalid\\sSUP\n");
}

#[test]
fn test_adc_sup_incoming_replies_and_advances() {
    let f = fixture();
    let (id, mut rx) = f.manager.insert_test_connection(false, true, false);

    assert_eq!(
        f.manager.on_sup(id, adc("CSUP ADBAS0 ADZLIB-GET")),
        Outcome::Continue
    );

    f.manager
        .with_connection(id, |uc| {
            assert!(uc.caps.adcget);
            assert!(uc.caps.minislots);
            assert!(uc.caps.tthf);
            assert!(uc.caps.tthl);
            assert!(uc.caps.xml_bzlist);
            assert!(uc.caps.tiger);
            assert!(uc.caps.zlib_get);
            assert_eq!(uc.state, State::Inf);
        })
        .unwrap();

    let lines = sent_lines(&mut rx);
    assert_eq!(lines.len(), 2);
    assert!(lines[0].starts_with("CSUP ADBAS0 ADBASE ADTIGR ADBZIP"));
    assert!(lines[0].contains("ADZLIB-GET"));
    assert!(lines[1].starts_with(&format!("CINF ID{}", f.hub.my_cid.to_base32())));
    assert!(!lines[1].contains(" TO"));
}

#[test]
fn test_adc_sup_outgoing_sends_inf_with_token() {
    let f = fixture();
    let (id, mut rx) = f.manager.insert_test_connection(false, false, false);
    f.manager
        .with_connection(id, |uc| {
            uc.token = "tok42".to_string();
            uc.hub_url = HUB.to_string();
        })
        .unwrap();
    assert_eq!(f.manager.on_connected(id), Outcome::Continue);
    let lines = sent_lines(&mut rx);
    assert_eq!(lines.len(), 2);
    assert!(lines[0].starts_with("CSUP "));
    assert!(lines[1].starts_with("CSTA 000 "));
    assert!(lines[1].contains(&format!("RF{}", HUB)));

    assert_eq!(f.manager.on_sup(id, adc("CSUP ADBASE")), Outcome::Continue);
    let lines = sent_lines(&mut rx);
    assert_eq!(lines.len(), 1);
    assert!(lines[0].contains("TOtok42"));
}

#[test]
fn test_adc_inf_missing_id_is_fatal() {
    let f = fixture();
    let (id, mut rx) = f.manager.insert_test_connection(false, true, false);
    f.manager.on_sup(id, adc("CSUP ADBAS0"));
    let _ = sent_lines(&mut rx);

    assert_eq!(f.manager.on_inf(id, adc("CINF")), Outcome::Close);

    let lines = sent_lines(&mut rx);
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0], "CSTA 213 ID\\smissing FLID\n");
    assert!(f.manager.download_queue().is_empty());
    assert!(f.manager.upload_queue().is_empty());
}

#[test]
fn test_adc_inf_in_wrong_state_is_fatal() {
    let f = fixture();
    let (id, mut rx) = f.manager.insert_test_connection(false, true, false);

    assert_eq!(f.manager.on_inf(id, adc("CINF IDAAAA")), Outcome::Close);
    let lines = sent_lines(&mut rx);
    assert_eq!(lines[0], "CSTA 210 Expecting\\sINF\n");
}

#[test]
fn test_adc_inf_unknown_user_is_fatal() {
    let f = fixture();
    let (id, mut rx) = f.manager.insert_test_connection(false, true, false);
    f.manager.on_sup(id, adc("CSUP ADBAS0"));
    let _ = sent_lines(&mut rx);

    let cid = Cid::new([9; 24]).to_base32();
    assert_eq!(
        f.manager.on_inf(id, adc(&format!("CINF ID{} TOx", cid))),
        Outcome::Close
    );
    let lines = sent_lines(&mut rx);
    assert_eq!(lines[0], "CSTA 200 User\\snot\\sfound\n");
}

#[test]
fn test_adc_inf_incoming_requires_token() {
    let f = fixture();
    let user = hinted(3, "carol");
    f.hub.add_user(&user.user);
    let (id, mut rx) = f.manager.insert_test_connection(false, true, false);
    f.manager.on_sup(id, adc("CSUP ADBAS0"));
    let _ = sent_lines(&mut rx);

    let line = format!("CINF ID{}", user.user.cid().to_base32());
    assert_eq!(f.manager.on_inf(id, adc(&line)), Outcome::Close);
    let lines = sent_lines(&mut rx);
    assert_eq!(lines[0], "CSTA 200 TO\\smissing\n");
}

#[test]
fn test_adc_inf_token_match_dispatches_download() {
    let f = fixture();
    let user = hinted(3, "carol");
    f.hub.add_user(&user.user);
    f.manager.get_download_connection(&user);
    let token = f.manager.download_queue()[0].token.clone();

    let (id, mut rx) = f.manager.insert_test_connection(false, false, false);
    f.manager
        .with_connection(id, |uc| {
            uc.token = token.clone();
            uc.hub_url = HUB.to_string();
            uc.state = State::SupNick;
        })
        .unwrap();
    f.manager.on_sup(id, adc("CSUP ADBAS0"));
    let _ = sent_lines(&mut rx);

    let line = format!("CINF ID{}", user.user.cid().to_base32());
    assert_eq!(f.manager.on_inf(id, adc(&line)), Outcome::Continue);

    assert_eq!(f.downloads.connections.lock().len(), 1);
    assert_eq!(f.manager.download_queue()[0].state, QueueState::Active);
    f.manager
        .with_connection(id, |uc| {
            assert_eq!(uc.role, Some(Role::Download));
            assert!(uc.associated);
            assert_eq!(uc.state, State::Running);
        })
        .unwrap();
    assert_eq!(f.ip_store.stored.lock().len(), 1);
}

#[test]
fn test_adc_inf_without_matching_token_dispatches_upload() {
    let f = fixture();
    let user = hinted(3, "carol");
    f.hub.add_user(&user.user);

    let (id, mut rx) = f.manager.insert_test_connection(false, true, false);
    f.manager.on_sup(id, adc("CSUP ADBAS0"));
    let _ = sent_lines(&mut rx);

    let line = format!("CINF ID{} TOpeer-token", user.user.cid().to_base32());
    assert_eq!(f.manager.on_inf(id, adc(&line)), Outcome::Continue);

    assert_eq!(f.uploads.connections.lock().len(), 1);
    let uploads = f.manager.upload_queue();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].state, QueueState::Active);

    // a second identified connection for the same user is refused
    let (id2, mut rx2) = f.manager.insert_test_connection(false, true, false);
    f.manager.on_sup(id2, adc("CSUP ADBAS0"));
    let _ = sent_lines(&mut rx2);
    assert_eq!(f.manager.on_inf(id2, adc(&line)), Outcome::Close);
    assert_eq!(f.uploads.connections.lock().len(), 1);
    assert_eq!(f.manager.upload_queue().len(), 1);
}

#[test]
fn test_adc_inf_keyprint_mismatch_drops() {
    let f = fixture();
    let user = hinted(3, "carol");
    f.hub.add_user(&user.user);
    let wrong = [0x55u8; 32];
    f.hub.keyprints.lock().insert(
        user.user.cid(),
        format!("SHA256/{}", text::base32_encode(&wrong)),
    );

    let (id, mut rx) = f.manager.insert_test_connection(false, true, true);
    f.manager
        .with_connection(id, |uc| uc.keyprint = Some(vec![0x11; 32]))
        .unwrap();
    f.manager.on_sup(id, adc("CSUP ADBAS0"));
    let _ = sent_lines(&mut rx);

    let line = format!("CINF ID{} TOx", user.user.cid().to_base32());
    assert_eq!(f.manager.on_inf(id, adc(&line)), Outcome::Close);
    assert!(f.uploads.connections.lock().is_empty());
    assert!(f.manager.upload_queue().is_empty());
}

#[test]
fn test_adc_inf_keyprint_match_passes() {
    let f = fixture();
    let user = hinted(3, "carol");
    f.hub.add_user(&user.user);
    let kp = [0x11u8; 32];
    f.hub.keyprints.lock().insert(
        user.user.cid(),
        format!("SHA256/{}", text::base32_encode(&kp)),
    );

    let (id, mut rx) = f.manager.insert_test_connection(false, true, true);
    f.manager
        .with_connection(id, |uc| uc.keyprint = Some(kp.to_vec()))
        .unwrap();
    f.manager.on_sup(id, adc("CSUP ADBAS0"));
    let _ = sent_lines(&mut rx);

    let line = format!("CINF ID{} TOx", user.user.cid().to_base32());
    assert_eq!(f.manager.on_inf(id, adc(&line)), Outcome::Continue);
    assert_eq!(f.uploads.connections.lock().len(), 1);
}

#[test]
fn test_failed_download_marks_item_for_retry() {
    let f = fixture();
    let mut events = f.manager.subscribe();
    let user = hinted(3, "carol");
    f.hub.add_user(&user.user);
    f.manager.get_download_connection(&user);
    let token = f.manager.download_queue()[0].token.clone();

    let (id, mut rx) = f.manager.insert_test_connection(false, false, false);
    f.manager
        .with_connection(id, |uc| {
            uc.token = token;
            uc.state = State::SupNick;
        })
        .unwrap();
    f.manager.on_sup(id, adc("CSUP ADBAS0"));
    let _ = sent_lines(&mut rx);
    let line = format!("CINF ID{}", user.user.cid().to_base32());
    f.manager.on_inf(id, adc(&line));
    assert_eq!(f.manager.download_queue()[0].state, QueueState::Active);
    while events.try_recv().is_ok() {}

    f.manager.failed(id, "connection reset", false);

    let queue = f.manager.download_queue();
    assert_eq!(queue[0].state, QueueState::Waiting);
    f.manager
        .with_download_cqi(&user.user, |cqi| {
            assert_eq!(cqi.errors, 1);
            assert!(cqi.last_attempt > 0);
        })
        .unwrap();
    match events.try_recv() {
        Ok(ConnectionEvent::Failed(_, reason)) => assert_eq!(reason, "connection reset"),
        other => panic!("unexpected event: {:?}", other),
    }
}

#[test]
fn test_failed_download_protocol_error_is_sticky() {
    let f = fixture();
    let user = hinted(3, "carol");
    f.hub.add_user(&user.user);
    f.manager.get_download_connection(&user);
    let token = f.manager.download_queue()[0].token.clone();

    let (id, mut rx) = f.manager.insert_test_connection(false, false, false);
    f.manager
        .with_connection(id, |uc| {
            uc.token = token;
            uc.state = State::SupNick;
        })
        .unwrap();
    f.manager.on_sup(id, adc("CSUP ADBAS0"));
    let _ = sent_lines(&mut rx);
    f.manager
        .on_inf(id, adc(&format!("CINF ID{}", user.user.cid().to_base32())));

    f.manager.failed(id, "bad command", true);

    f.manager
        .with_download_cqi(&user.user, |cqi| assert_eq!(cqi.errors, PROTOCOL_ERROR))
        .unwrap();
}

#[test]
fn test_failed_upload_destroys_item() {
    let f = fixture();
    let user = hinted(3, "carol");
    f.hub.add_user(&user.user);

    let (id, mut rx) = f.manager.insert_test_connection(false, true, false);
    f.manager.on_sup(id, adc("CSUP ADBAS0"));
    let _ = sent_lines(&mut rx);
    let line = format!("CINF ID{} TOx", user.user.cid().to_base32());
    f.manager.on_inf(id, adc(&line));
    assert_eq!(f.manager.upload_queue().len(), 1);

    f.manager.failed(id, "connection reset", false);

    assert!(f.manager.upload_queue().is_empty());
    assert_eq!(f.uploads.delay_removed.lock().len(), 1);
}

#[test]
fn test_disconnect_user_signals_connections() {
    let f = fixture();
    let user = hinted(3, "carol");
    let (id, mut rx) = f.manager.insert_test_connection(false, true, false);
    f.manager
        .with_connection(id, |uc| uc.user = Some(user.user.clone()))
        .unwrap();

    f.manager.disconnect_user(&user.user);
    assert!(matches!(rx.try_recv(), Ok(WriteCommand::Disconnect)));

    // the direction-filtered variant only hits the matching role
    f.manager
        .with_connection(id, |uc| uc.role = Some(Role::Upload))
        .unwrap();
    f.manager.disconnect_user_direction(&user.user, true);
    assert!(rx.try_recv().is_err());
    f.manager.disconnect_user_direction(&user.user, false);
    assert!(matches!(rx.try_recv(), Ok(WriteCommand::Disconnect)));
}

#[test]
fn test_minute_tick_disconnects_idle_connections() {
    let f = fixture();
    let (idle, mut idle_rx) = f.manager.insert_test_connection(false, true, false);
    let (busy, mut busy_rx) = f.manager.insert_test_connection(false, true, false);
    f.manager.with_connection(idle, |uc| uc.last_activity = 0).unwrap();
    f.manager
        .with_connection(busy, |uc| uc.last_activity = 150_000)
        .unwrap();

    f.manager.on_minute(200_000);

    assert!(matches!(idle_rx.try_recv(), Ok(WriteCommand::Disconnect)));
    assert!(busy_rx.try_recv().is_err());
}

#[tokio::test]
async fn test_listen_accept_shutdown_cycle() {
    let f = fixture();
    f.manager.clone().listen().await.unwrap();
    let (plain, secure) = f.manager.ports();
    let port = plain.expect("plain listener bound");
    // no server TLS context, so no secure listener
    assert!(secure.is_none());

    let stream = tokio::net::TcpStream::connect(("127.0.0.1", port))
        .await
        .unwrap();
    let mut seen = false;
    for _ in 0..200 {
        if f.manager.active_connections() == 1 {
            seen = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(seen, "accepted connection never registered");
    drop(stream);

    f.manager.shutdown().await;
    assert_eq!(f.manager.active_connections(), 0);
    assert!(f.manager.download_queue().is_empty());
    assert!(f.manager.upload_queue().is_empty());

    // the manager comes back up cleanly
    f.manager.clone().listen().await.unwrap();
    assert!(f.manager.ports().0.is_some());
    f.manager.shutdown().await;
}

#[tokio::test]
async fn test_outbound_connect_failure_releases_connection() {
    let f = fixture();
    // grab a port nobody is listening on
    let port = {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().port()
    };

    f.manager.clone().nmdc_connect(
        "127.0.0.1".parse().unwrap(),
        port,
        "MyOwnNick",
        HUB,
        "utf-8",
        false,
        false,
    );
    assert_eq!(f.manager.active_connections(), 1);

    let mut released = false;
    for _ in 0..500 {
        if f.manager.active_connections() == 0 {
            released = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(released, "failed outbound connection never released");
}

#[tokio::test]
async fn test_outbound_blocked_port_refused() {
    let f = fixture();
    f.manager.clone().nmdc_connect(
        "127.0.0.1".parse().unwrap(),
        80,
        "MyOwnNick",
        HUB,
        "utf-8",
        false,
        false,
    );
    assert_eq!(f.manager.active_connections(), 0);
}

#[tokio::test]
async fn test_outbound_per_endpoint_limit() {
    let f = fixture();
    // five live connections to the same endpoint already exist
    let mut receivers = Vec::new();
    for _ in 0..5 {
        receivers.push(f.manager.insert_test_connection(false, false, false));
    }

    f.manager.clone().nmdc_connect(
        "127.0.0.1".parse().unwrap(),
        40_000,
        "MyOwnNick",
        HUB,
        "utf-8",
        false,
        false,
    );
    assert_eq!(f.manager.active_connections(), 5);
}

#[tokio::test]
async fn test_shutdown_refuses_new_connects() {
    let f = fixture();
    f.manager.clone().listen().await.unwrap();
    f.manager.shutdown().await;

    f.manager.clone().nmdc_connect(
        "127.0.0.1".parse().unwrap(),
        40_001,
        "MyOwnNick",
        HUB,
        "utf-8",
        false,
        false,
    );
    assert_eq!(f.manager.active_connections(), 0);
}
