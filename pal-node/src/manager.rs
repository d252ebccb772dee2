//! Network manager: peer table, handler registry, outbound delivery queue, and the
//! long-lived discovery/accept/delivery tasks.
//!
//! Every task the manager spawns is tracked; [`NetworkManager::stop`] cancels them all and
//! waits for them to finish before returning.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use pal_core::metrics::Counter;
use pal_core::trust::DEFAULT_MAX_MESSAGE_AGE;
use pal_core::{
    encode_frame, parse_payload, ActivityEvent, ActivityKind, ActivityTracker, Envelope, Frame,
    MessageType, PeerListPayload, PublicKey, RejectReason, RejectionTracker, SecurePeer,
    SignedEnvelope, TrustLayer, TypedPayload,
};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::discovery;
use crate::error::NetError;
use crate::handler::MessageHandler;
use crate::peers::{Admission, PeerInfo, PeerTable};
use crate::transport;

/// Outbound messages accepted by `send` but not yet handed to a link.
pub const DELIVERY_QUEUE_CAPACITY: usize = 100;
const ACTIVITY_CHANNEL_CAPACITY: usize = 64;
/// Rejections from senders whose identity was never established are counted under this
/// key, so unauthenticated traffic cannot grow the per-peer table.
pub const UNVERIFIED_PEER: &str = "unverified";

#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// UDP discovery port; shared with other local processes via SO_REUSEPORT.
    pub discovery_port: u16,
    /// TCP link port; 0 picks an ephemeral port.
    pub tcp_port: u16,
    pub max_peers: usize,
    /// Peers on a different network ID are ignored.
    pub network_id: String,
    pub discovery_interval: Duration,
    /// Peers silent for longer than this are evicted. Zero disables eviction.
    pub peer_timeout: Duration,
    pub max_message_age: Duration,
    /// Sign discovery announcements and carry the public key in them.
    pub secure_discovery: bool,
    pub capabilities: Vec<String>,
    /// Where announcements go; empty means the limited broadcast address.
    pub announce_targets: Vec<SocketAddr>,
}

impl NetworkConfig {
    pub fn announce_targets(&self) -> Vec<SocketAddr> {
        if self.announce_targets.is_empty() {
            vec![SocketAddr::from((Ipv4Addr::BROADCAST, self.discovery_port))]
        } else {
            self.announce_targets.clone()
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            discovery_port: 8080,
            tcp_port: 0,
            max_peers: 8,
            network_id: "dds-default".into(),
            discovery_interval: Duration::from_secs(5),
            peer_timeout: Duration::from_secs(30),
            max_message_age: DEFAULT_MAX_MESSAGE_AGE,
            secure_discovery: false,
            capabilities: vec!["bot".into(), "game".into()],
            announce_targets: Vec::new(),
        }
    }
}

/// Network counters. Rejections are also broken down per peer and reason, see
/// [`NetworkManager::rejections`].
#[derive(Debug, Default)]
pub struct NetStats {
    pub announcements_sent: Counter,
    pub announcements_received: Counter,
    pub ignored_self: Counter,
    pub ignored_foreign: Counter,
    pub admission_refused: Counter,
    pub evicted: Counter,
    pub links_opened: Counter,
    pub links_refused: Counter,
    pub dial_failures: Counter,
    pub frames_received: Counter,
    pub frames_sent: Counter,
    pub rejected: Counter,
    pub dispatched: Counter,
    pub unhandled: Counter,
    pub handler_errors: Counter,
    pub queue_full: Counter,
}

/// An encoded frame waiting for delivery.
#[derive(Debug)]
pub(crate) struct Outbound {
    pub target: Option<String>,
    pub bytes: Vec<u8>,
}

/// A discovered peer this node should dial.
#[derive(Debug)]
pub(crate) struct DialRequest {
    pub peer_id: String,
    pub addr: SocketAddr,
}

/// Channel ends consumed by the tasks `start` spawns.
struct Receivers {
    queue: mpsc::Receiver<Outbound>,
    dials: mpsc::UnboundedReceiver<DialRequest>,
}

/// State shared by the manager handle and all of its tasks.
pub(crate) struct Shared {
    pub config: NetworkConfig,
    pub trust: Arc<TrustLayer>,
    pub peers: Mutex<PeerTable>,
    pub cancel: CancellationToken,
    pub tracker: TaskTracker,
    pub stats: NetStats,
    handlers: RwLock<HashMap<MessageType, Arc<dyn MessageHandler>>>,
    rejections: std::sync::Mutex<RejectionTracker>,
    activity: std::sync::Mutex<ActivityTracker>,
    activity_tx: broadcast::Sender<ActivityEvent>,
    dial_tx: mpsc::UnboundedSender<DialRequest>,
    running: AtomicBool,
    tcp_port: AtomicU16,
    discovery_port: AtomicU16,
    next_link_id: AtomicU64,
}

impl Shared {
    pub fn local_id(&self) -> &str {
        self.trust.peer_id()
    }

    pub fn tcp_port(&self) -> u16 {
        self.tcp_port.load(Ordering::Relaxed)
    }

    /// Of any two peers only the one with the lower ID dials, so a pair never races two
    /// connections against each other.
    pub fn dials(&self, peer_id: &str) -> bool {
        self.local_id() < peer_id
    }

    pub fn next_link_id(&self) -> u64 {
        self.next_link_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn reject(&self, peer_id: &str, reason: RejectReason) {
        self.stats.rejected.inc();
        self.rejections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(peer_id, reason);
    }

    pub fn record_activity(&self, event: ActivityEvent) {
        self.activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .add(event.clone());
        // No subscribers is fine.
        let _ = self.activity_tx.send(event);
    }

    /// Admit or refresh a peer, then queue a dial if it has no link yet and we are the
    /// dialer. Dials are spawned by the dial loop, never from here, since this runs inside
    /// link tasks.
    pub async fn offer_peer(
        &self,
        id: &str,
        addr: SocketAddr,
        tcp_addr: SocketAddr,
        public_key: Option<PublicKey>,
    ) -> Admission {
        let (admission, dial) = {
            let mut peers = self.peers.lock().await;
            let admission = peers.admit(id, addr, tcp_addr);
            if admission == Admission::Full {
                (admission, None)
            } else {
                if let Some(key) = public_key {
                    peers.set_public_key(id, key);
                }
                let dial = if self.dials(id) { peers.begin_dial(id) } else { None };
                (admission, dial)
            }
        };
        match admission {
            Admission::New => {
                info!(peer = %id, %addr, %tcp_addr, "peer discovered");
                self.record_activity(ActivityEvent::new(
                    ActivityKind::Joined,
                    id,
                    format!("discovered at {addr}"),
                ));
            }
            Admission::Full => {
                self.stats.admission_refused.inc();
                debug!(peer = %id, "peer table full, ignoring peer");
            }
            Admission::Refreshed => {}
        }
        if let Some(addr) = dial {
            let request = DialRequest {
                peer_id: id.to_string(),
                addr,
            };
            if self.dial_tx.send(request).is_err() {
                self.peers.lock().await.end_dial(id);
            }
        }
        admission
    }

    pub async fn evict_stale(&self) {
        let gone = self.peers.lock().await.evict_stale(self.config.peer_timeout);
        for peer in gone {
            if let Some(link) = peer.link {
                link.token.cancel();
            }
            self.stats.evicted.inc();
            info!(peer = %peer.id, "peer timed out");
            self.record_activity(ActivityEvent::new(ActivityKind::Left, &peer.id, "timed out"));
        }
    }

    /// Verify and dispatch one frame read from the link to `link_peer`.
    pub async fn on_reliable_frame(self: &Arc<Self>, link_peer: &str, frame: Frame) {
        self.stats.frames_received.inc();
        let signed = match frame {
            Frame::Signed(signed) => signed,
            Frame::Plain(envelope) => {
                debug!(peer = %link_peer, msg_type = %envelope.msg_type, "unsigned frame on link");
                self.reject(link_peer, RejectReason::Signature);
                return;
            }
        };
        if signed.envelope.from != link_peer {
            debug!(peer = %link_peer, from = %signed.envelope.from, "sender does not match link");
            self.reject(link_peer, RejectReason::UnknownPeer);
            return;
        }
        if let Err(err) = self.trust.accept(&signed, self.config.max_message_age) {
            debug!(peer = %link_peer, error = %err, "rejected inbound message");
            self.reject(link_peer, RejectReason::from(&err));
            return;
        }
        let SignedEnvelope {
            envelope,
            public_key,
            ..
        } = signed;
        if envelope
            .to
            .as_deref()
            .is_some_and(|to| to != self.local_id())
        {
            debug!(peer = %link_peer, to = ?envelope.to, "message addressed to another peer");
            return;
        }
        let from = {
            let mut peers = self.peers.lock().await;
            peers.touch(link_peer);
            peers.set_public_key(link_peer, public_key);
            peers.get(link_peer)
        };
        let Some(from) = from else {
            debug!(peer = %link_peer, "message from evicted peer");
            return;
        };
        if envelope.msg_type == MessageType::PeerList {
            self.merge_peer_list(&envelope).await;
        }
        self.dispatch(envelope, from);
    }

    /// Learn peers from another peer's table, without refreshing ones already known.
    async fn merge_peer_list(&self, envelope: &Envelope) {
        let list = match parse_payload::<PeerListPayload>(envelope) {
            Ok(list) => list,
            Err(err) => {
                debug!(peer = %envelope.from, error = %err, "bad peer list");
                self.reject(&envelope.from, RejectReason::from(&err));
                return;
            }
        };
        for peer in list.peers {
            if peer.id == self.local_id() || self.peers.lock().await.contains(&peer.id) {
                continue;
            }
            let Ok(tcp_addr) = peer.addr.parse::<SocketAddr>() else {
                debug!(peer = %peer.id, addr = %peer.addr, "unparseable peer address");
                continue;
            };
            self.offer_peer(&peer.id, tcp_addr, tcp_addr, None).await;
        }
    }

    fn dispatch(self: &Arc<Self>, envelope: Envelope, from: PeerInfo) {
        let handler = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&envelope.msg_type)
            .cloned();
        let Some(handler) = handler else {
            if envelope.msg_type != MessageType::PeerList {
                self.stats.unhandled.inc();
                debug!(msg_type = %envelope.msg_type, peer = %from.id, "no handler registered");
            }
            return;
        };
        self.stats.dispatched.inc();
        let shared = Arc::clone(self);
        self.tracker.spawn(async move {
            let msg_type = envelope.msg_type;
            let peer = from.id.clone();
            tokio::select! {
                _ = shared.cancel.cancelled() => {
                    debug!(%peer, %msg_type, "handler abandoned on shutdown");
                }
                result = handler.handle(envelope, from) => {
                    if let Err(err) = result {
                        shared.stats.handler_errors.inc();
                        warn!(%peer, %msg_type, error = %err, "message handler failed");
                    }
                }
            }
        });
    }

    async fn deliver(&self, outbound: Outbound) {
        let links = self
            .peers
            .lock()
            .await
            .link_senders(outbound.target.as_deref());
        if links.is_empty() {
            debug!(to = ?outbound.target, "no live link for outbound message");
            return;
        }
        for (peer, sender) in links {
            if sender.send(outbound.bytes.clone()).is_ok() {
                self.stats.frames_sent.inc();
            } else {
                debug!(%peer, "link closed before delivery");
            }
        }
    }
}

async fn delivery_loop(shared: Arc<Shared>, mut rx: mpsc::Receiver<Outbound>) {
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(outbound) => shared.deliver(outbound).await,
                None => break,
            },
        }
    }
}

async fn dial_loop(shared: Arc<Shared>, mut rx: mpsc::UnboundedReceiver<DialRequest>) {
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(DialRequest { peer_id, addr }) => {
                    shared
                        .tracker
                        .spawn(transport::connect_peer(Arc::clone(&shared), peer_id, addr));
                }
                None => break,
            },
        }
    }
}

/// Handle to the networking core. Cheap to share behind an `Arc`.
pub struct NetworkManager {
    shared: Arc<Shared>,
    queue: mpsc::Sender<Outbound>,
    receivers: Mutex<Option<Receivers>>,
}

impl NetworkManager {
    pub fn new(config: NetworkConfig, trust: Arc<TrustLayer>) -> Self {
        let (queue, queue_rx) = mpsc::channel(DELIVERY_QUEUE_CAPACITY);
        let (dial_tx, dial_rx) = mpsc::unbounded_channel();
        let (activity_tx, _) = broadcast::channel(ACTIVITY_CHANNEL_CAPACITY);
        let shared = Arc::new(Shared {
            peers: Mutex::new(PeerTable::new(config.max_peers)),
            tcp_port: AtomicU16::new(config.tcp_port),
            discovery_port: AtomicU16::new(config.discovery_port),
            config,
            trust,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            stats: NetStats::default(),
            handlers: RwLock::new(HashMap::new()),
            rejections: std::sync::Mutex::new(RejectionTracker::new()),
            activity: std::sync::Mutex::new(ActivityTracker::default()),
            activity_tx,
            dial_tx,
            running: AtomicBool::new(false),
            next_link_id: AtomicU64::new(1),
        });
        Self {
            shared,
            queue,
            receivers: Mutex::new(Some(Receivers {
                queue: queue_rx,
                dials: dial_rx,
            })),
        }
    }

    /// Bind the discovery socket and link listener and spawn the background tasks.
    /// Fails with [`NetError::Transport`] when either bind fails.
    pub async fn start(&self) -> Result<(), NetError> {
        if self.shared.cancel.is_cancelled() {
            return Err(NetError::Shutdown);
        }
        let mut slot = self.receivers.lock().await;
        let Some(receivers) = slot.take() else {
            return Err(NetError::AlreadyRunning);
        };
        let config = &self.shared.config;
        let bound = async {
            let socket = discovery::bind_socket(config.discovery_port)?;
            let listener = transport::bind_listener(config.tcp_port).await?;
            Ok::<_, std::io::Error>((socket, listener))
        }
        .await;
        let (socket, listener) = match bound {
            Ok(bound) => bound,
            Err(err) => {
                *slot = Some(receivers);
                return Err(NetError::Transport(err));
            }
        };
        let discovery_port = socket.local_addr()?.port();
        let tcp_port = listener.local_addr()?.port();
        self.shared.discovery_port.store(discovery_port, Ordering::Relaxed);
        self.shared.tcp_port.store(tcp_port, Ordering::Relaxed);

        let socket = Arc::new(socket);
        let shared = &self.shared;
        shared
            .tracker
            .spawn(discovery::recv_loop(Arc::clone(shared), Arc::clone(&socket)));
        shared
            .tracker
            .spawn(discovery::announce_loop(Arc::clone(shared), socket));
        shared
            .tracker
            .spawn(transport::accept_loop(Arc::clone(shared), listener));
        shared
            .tracker
            .spawn(delivery_loop(Arc::clone(shared), receivers.queue));
        shared
            .tracker
            .spawn(dial_loop(Arc::clone(shared), receivers.dials));
        shared.running.store(true, Ordering::Relaxed);
        info!(
            peer_id = %shared.local_id(),
            network_id = %config.network_id,
            discovery_port,
            tcp_port,
            "network manager started"
        );
        Ok(())
    }

    /// Cancel every task, close every link, clear the peer table, and wait for the tasks
    /// to exit. Safe to call more than once.
    pub async fn stop(&self) {
        if !self.shared.cancel.is_cancelled() {
            info!(peer_id = %self.shared.local_id(), "network manager stopping");
        }
        self.shared.cancel.cancel();
        self.shared.running.store(false, Ordering::Relaxed);
        for peer in self.shared.peers.lock().await.drain() {
            if let Some(link) = peer.link {
                link.token.cancel();
            }
        }
        self.shared.tracker.close();
        self.shared.tracker.wait().await;
    }

    /// True between a successful [`start`](Self::start) and [`stop`](Self::stop).
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Relaxed)
    }

    /// Sign and queue raw payload bytes. An empty `target` broadcasts to every linked peer.
    /// Never blocks: a full queue fails with [`NetError::QueueFull`].
    pub fn send(&self, msg_type: MessageType, payload: Vec<u8>, target: &str) -> Result<(), NetError> {
        let to = (!target.is_empty()).then(|| target.to_string());
        let signed = self.shared.trust.seal(msg_type, to, payload)?;
        self.enqueue(signed)
    }

    /// Sign and queue a typed payload; the message type comes from the payload.
    pub fn send_payload<P: TypedPayload>(&self, payload: &P, target: Option<&str>) -> Result<(), NetError> {
        let signed = self.shared.trust.build(target.map(str::to_string), payload)?;
        self.enqueue(signed)
    }

    fn enqueue(&self, signed: SignedEnvelope) -> Result<(), NetError> {
        if self.shared.cancel.is_cancelled() {
            return Err(NetError::Shutdown);
        }
        let target = signed.envelope.to.clone();
        let bytes = encode_frame(&Frame::Signed(signed))?;
        self.queue
            .try_send(Outbound { target, bytes })
            .map_err(|err| match err {
                TrySendError::Full(_) => {
                    self.shared.stats.queue_full.inc();
                    NetError::QueueFull
                }
                TrySendError::Closed(_) => NetError::Shutdown,
            })
    }

    /// Route inbound messages of `msg_type` to `handler`, replacing any previous one.
    pub fn register_handler<H: MessageHandler>(&self, msg_type: MessageType, handler: H) {
        self.shared
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(msg_type, Arc::new(handler));
    }

    pub async fn peers(&self) -> Vec<PeerInfo> {
        self.shared.peers.lock().await.snapshot()
    }

    pub async fn peer_count(&self) -> usize {
        self.shared.peers.lock().await.len()
    }

    pub async fn peer(&self, peer_id: &str) -> Option<PeerInfo> {
        self.shared.peers.lock().await.get(peer_id)
    }

    /// Drop a peer and close its link. It comes back on its next announcement.
    pub async fn disconnect(&self, peer_id: &str) -> Result<(), NetError> {
        let peer = self
            .shared
            .peers
            .lock()
            .await
            .remove(peer_id)
            .ok_or_else(|| NetError::UnknownPeer(peer_id.to_string()))?;
        if let Some(link) = peer.link {
            link.token.cancel();
        }
        info!(peer = %peer_id, "peer disconnected");
        self.shared
            .record_activity(ActivityEvent::new(ActivityKind::Left, peer_id, "disconnected"));
        Ok(())
    }

    /// Broadcast the current peer table so linked peers can learn about each other.
    pub async fn announce_peer_list(&self) -> Result<(), NetError> {
        let peers: Vec<SecurePeer> = self.peers().await.iter().map(SecurePeer::from).collect();
        let payload = PeerListPayload {
            peers,
            timestamp: pal_core::now_ms(),
        };
        self.send_payload(&payload, None)
    }

    pub fn local_peer_id(&self) -> &str {
        self.shared.local_id()
    }

    /// Bound link port; the configured port until [`start`](Self::start) succeeds.
    pub fn local_tcp_port(&self) -> u16 {
        self.shared.tcp_port()
    }

    pub fn local_discovery_port(&self) -> u16 {
        self.shared.discovery_port.load(Ordering::Relaxed)
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.shared.config
    }

    pub fn trust(&self) -> &Arc<TrustLayer> {
        &self.shared.trust
    }

    pub fn stats(&self) -> &NetStats {
        &self.shared.stats
    }

    /// Count an inbound message dropped above the transport, e.g. by a handler.
    pub fn record_rejection(&self, peer_id: &str, reason: RejectReason) {
        self.shared.reject(peer_id, reason);
    }

    pub fn rejections(&self, peer_id: &str, reason: RejectReason) -> u64 {
        self.shared
            .rejections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .count(peer_id, reason)
    }

    pub fn rejections_by_reason(&self, reason: RejectReason) -> u64 {
        self.shared
            .rejections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .total_by_reason(reason)
    }

    pub fn record_activity(&self, event: ActivityEvent) {
        self.shared.record_activity(event);
    }

    /// Up to `count` most recent events, oldest first.
    pub fn recent_activity(&self, count: usize) -> Vec<ActivityEvent> {
        self.shared
            .activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .recent(count)
    }

    pub fn subscribe_activity(&self) -> broadcast::Receiver<ActivityEvent> {
        self.shared.activity_tx.subscribe()
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }
}

impl std::fmt::Debug for NetworkManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkManager")
            .field("peer_id", &self.shared.local_id())
            .field("network_id", &self.shared.config.network_id)
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pal_core::Keypair;

    fn manager(max_peers: usize) -> NetworkManager {
        let config = NetworkConfig {
            max_peers,
            ..NetworkConfig::default()
        };
        NetworkManager::new(config, Arc::new(TrustLayer::new(Keypair::generate())))
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[tokio::test]
    async fn queue_full_then_shutdown() {
        let m = manager(4);
        assert!(!m.is_running());
        for _ in 0..DELIVERY_QUEUE_CAPACITY {
            m.send(MessageType::CharacterAction, vec![1], "").unwrap();
        }
        assert!(matches!(
            m.send(MessageType::CharacterAction, vec![1], ""),
            Err(NetError::QueueFull)
        ));
        assert_eq!(m.stats().queue_full.get(), 1);

        m.stop().await;
        m.stop().await;
        assert!(!m.is_running());
        assert!(matches!(
            m.send(MessageType::CharacterAction, vec![1], ""),
            Err(NetError::Shutdown)
        ));
        assert!(matches!(m.start().await, Err(NetError::Shutdown)));
    }

    #[tokio::test]
    async fn unsigned_and_spoofed_frames_are_rejected() {
        let m = manager(4);
        let shared = m.shared();
        shared.peers.lock().await.admit("peer-a", addr(1), addr(2));

        let plain = Envelope::new(MessageType::CharacterAction, "peer-a", None, vec![]);
        shared.on_reliable_frame("peer-a", Frame::Plain(plain)).await;
        assert_eq!(m.rejections("peer-a", RejectReason::Signature), 1);

        let other = TrustLayer::with_peer_id(Keypair::generate(), "peer-b");
        let spoofed = other.seal(MessageType::CharacterAction, None, vec![]).unwrap();
        shared.on_reliable_frame("peer-a", Frame::Signed(spoofed)).await;
        assert_eq!(m.rejections("peer-a", RejectReason::UnknownPeer), 1);
        assert_eq!(m.stats().dispatched.get(), 0);
    }

    #[tokio::test]
    async fn stale_message_rejected_before_dispatch() {
        let m = manager(4);
        let shared = m.shared();
        shared.peers.lock().await.admit("peer-a", addr(1), addr(2));
        let hits = Arc::new(AtomicU64::new(0));
        let seen = Arc::clone(&hits);
        m.register_handler(MessageType::CharacterAction, move |_env: Envelope, _from: PeerInfo| -> anyhow::Result<()> {
            seen.fetch_add(1, Ordering::Relaxed);
            Ok(())
        });

        let sender = TrustLayer::with_peer_id(Keypair::generate(), "peer-a");
        let old = Envelope::at(
            MessageType::CharacterAction,
            "peer-a",
            None,
            vec![],
            pal_core::now_ms() - 10 * 60 * 1000,
        );
        let old = sender.sign(old).unwrap();
        shared.on_reliable_frame("peer-a", Frame::Signed(old)).await;
        assert_eq!(m.rejections("peer-a", RejectReason::Stale), 1);

        let fresh = sender.seal(MessageType::CharacterAction, None, vec![]).unwrap();
        shared.on_reliable_frame("peer-a", Frame::Signed(fresh)).await;
        for _ in 0..100 {
            if hits.load(Ordering::Relaxed) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(hits.load(Ordering::Relaxed), 1);
        assert_eq!(m.stats().dispatched.get(), 1);
        m.stop().await;
    }

    struct SlowHandler;

    #[async_trait::async_trait]
    impl MessageHandler for SlowHandler {
        async fn handle(&self, _envelope: Envelope, _from: PeerInfo) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn stop_does_not_wait_for_running_handlers() {
        let m = manager(4);
        let shared = m.shared();
        shared.peers.lock().await.admit("peer-a", addr(1), addr(2));
        m.register_handler(MessageType::BattleEnd, SlowHandler);
        let sender = TrustLayer::with_peer_id(Keypair::generate(), "peer-a");
        let msg = sender.seal(MessageType::BattleEnd, None, vec![]).unwrap();
        shared.on_reliable_frame("peer-a", Frame::Signed(msg)).await;
        assert_eq!(m.stats().dispatched.get(), 1);

        tokio::time::timeout(Duration::from_secs(3), m.stop())
            .await
            .expect("stop should not wait for the handler");
        assert_eq!(m.stats().handler_errors.get(), 0);
    }

    #[tokio::test]
    async fn dials_are_queued_until_started() {
        let m = manager(4);
        let shared = m.shared();
        // Hex peer IDs sort below "zz-peer", so this node is the dialer.
        let admission = shared.offer_peer("zz-peer", addr(1), addr(2), None).await;
        assert_eq!(admission, Admission::New);
        let pending = m.receivers.lock().await.as_mut().unwrap().dials.try_recv().unwrap();
        assert_eq!(pending.peer_id, "zz-peer");
        assert_eq!(pending.addr, addr(2));
    }

    #[tokio::test]
    async fn messages_for_other_peers_are_dropped() {
        let m = manager(4);
        let shared = m.shared();
        shared.peers.lock().await.admit("peer-a", addr(1), addr(2));
        let sender = TrustLayer::with_peer_id(Keypair::generate(), "peer-a");
        let msg = sender
            .seal(MessageType::BattleInvite, Some("someone-else".into()), vec![])
            .unwrap();
        shared.on_reliable_frame("peer-a", Frame::Signed(msg)).await;
        assert_eq!(m.stats().rejected.get(), 0);
        assert_eq!(m.stats().unhandled.get(), 0);
    }

    #[tokio::test]
    async fn peer_list_merge_respects_cap_and_skips_self() {
        let m = manager(2);
        let shared = m.shared();
        shared.peers.lock().await.admit("peer-a", addr(1), addr(2));
        let sender = TrustLayer::with_peer_id(Keypair::generate(), "peer-a");
        let entry = |id: &str, port: u16| SecurePeer {
            id: id.into(),
            addr: addr(port).to_string(),
            public_key: None,
            last_seen: 0,
            verified: false,
        };
        let list = PeerListPayload {
            peers: vec![
                entry(m.local_peer_id(), 10),
                entry("peer-b", 11),
                entry("peer-c", 12),
            ],
            timestamp: pal_core::now_ms(),
        };
        let msg = sender.build(None, &list).unwrap();
        shared.on_reliable_frame("peer-a", Frame::Signed(msg)).await;

        let ids: Vec<String> = m.peers().await.into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec!["peer-a", "peer-b"]);
        assert_eq!(m.stats().admission_refused.get(), 1);
        m.stop().await;
        assert_eq!(m.peer_count().await, 0);
    }

    #[tokio::test]
    async fn disconnect_unknown_peer_fails() {
        let m = manager(4);
        assert!(matches!(
            m.disconnect("nobody").await,
            Err(NetError::UnknownPeer(_))
        ));
        m.shared().peers.lock().await.admit("peer-a", addr(1), addr(2));
        m.disconnect("peer-a").await.unwrap();
        assert_eq!(m.peer_count().await, 0);
        let recent = m.recent_activity(1);
        assert_eq!(recent[0].kind, ActivityKind::Left);
    }

    #[test]
    fn default_targets_broadcast_on_discovery_port() {
        let config = NetworkConfig::default();
        assert_eq!(
            config.announce_targets(),
            vec!["255.255.255.255:8080".parse::<SocketAddr>().unwrap()]
        );
    }
}
