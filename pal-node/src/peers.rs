//! Peer table: admission capped at `max_peers`, reliable-link handles, staleness eviction.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use pal_core::{now_ms, PublicKey, SecurePeer};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Outbound half of a live reliable link. Dropping the last sender lets the writer exit.
#[derive(Debug, Clone)]
pub struct Link {
    pub id: u64,
    pub sender: mpsc::UnboundedSender<Vec<u8>>,
    pub token: CancellationToken,
}

#[derive(Debug)]
pub struct Peer {
    pub id: String,
    /// Where the last discovery announcement came from.
    pub addr: SocketAddr,
    /// Reliable-link endpoint advertised by the peer.
    pub tcp_addr: SocketAddr,
    pub link: Option<Link>,
    pub public_key: Option<PublicKey>,
    last_seen: Instant,
    last_seen_ms: u64,
    dialing: bool,
}

/// Snapshot of a peer handed to callers and message handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub id: String,
    pub addr: SocketAddr,
    pub tcp_addr: SocketAddr,
    pub connected: bool,
    pub public_key: Option<PublicKey>,
    /// Unix ms.
    pub last_seen: u64,
}

impl From<&Peer> for PeerInfo {
    fn from(p: &Peer) -> Self {
        Self {
            id: p.id.clone(),
            addr: p.addr,
            tcp_addr: p.tcp_addr,
            connected: p.link.is_some(),
            public_key: p.public_key,
            last_seen: p.last_seen_ms,
        }
    }
}

impl From<&PeerInfo> for SecurePeer {
    fn from(p: &PeerInfo) -> Self {
        Self {
            id: p.id.clone(),
            addr: p.tcp_addr.to_string(),
            public_key: p.public_key,
            last_seen: p.last_seen,
            verified: p.public_key.is_some(),
        }
    }
}

/// Result of installing a link.
#[derive(Debug)]
pub enum Attach {
    Attached,
    /// A newer connection superseded this link; the caller cancels it.
    Replaced(Link),
    UnknownPeer,
}

/// Result of offering a peer to the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    New,
    Refreshed,
    /// Table at capacity; the unknown peer was dropped.
    Full,
}

/// All known peers. Never holds more than `max_peers` entries.
#[derive(Debug)]
pub struct PeerTable {
    peers: HashMap<String, Peer>,
    max_peers: usize,
}

impl PeerTable {
    pub fn new(max_peers: usize) -> Self {
        Self {
            peers: HashMap::new(),
            max_peers,
        }
    }

    pub fn max_peers(&self) -> usize {
        self.max_peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.peers.contains_key(id)
    }

    /// Record or refresh a peer. Known peers are always refreshed; unknown peers are
    /// admitted only while the table has room. Existing entries are never evicted here.
    pub fn admit(&mut self, id: &str, addr: SocketAddr, tcp_addr: SocketAddr) -> Admission {
        if let Some(peer) = self.peers.get_mut(id) {
            peer.addr = addr;
            peer.tcp_addr = tcp_addr;
            peer.last_seen = Instant::now();
            peer.last_seen_ms = now_ms();
            return Admission::Refreshed;
        }
        if self.peers.len() >= self.max_peers {
            return Admission::Full;
        }
        self.peers.insert(
            id.to_string(),
            Peer {
                id: id.to_string(),
                addr,
                tcp_addr,
                link: None,
                public_key: None,
                last_seen: Instant::now(),
                last_seen_ms: now_ms(),
                dialing: false,
            },
        );
        Admission::New
    }

    /// Bump `last_seen` on traffic other than discovery.
    pub fn touch(&mut self, id: &str) {
        if let Some(peer) = self.peers.get_mut(id) {
            peer.last_seen = Instant::now();
            peer.last_seen_ms = now_ms();
        }
    }

    pub fn set_public_key(&mut self, id: &str, key: PublicKey) {
        if let Some(peer) = self.peers.get_mut(id) {
            peer.public_key = Some(key);
        }
    }

    /// Claim the right to dial `id`: returns its link address when it has no link and no
    /// dial in flight.
    pub fn begin_dial(&mut self, id: &str) -> Option<SocketAddr> {
        let peer = self.peers.get_mut(id)?;
        if peer.link.is_some() || peer.dialing {
            return None;
        }
        peer.dialing = true;
        Some(peer.tcp_addr)
    }

    pub fn end_dial(&mut self, id: &str) {
        if let Some(peer) = self.peers.get_mut(id) {
            peer.dialing = false;
        }
    }

    /// Install `link` as the peer's link. The most recent connection always wins, since a
    /// peer only redials after losing its previous link.
    pub fn attach_link(&mut self, id: &str, link: Link) -> Attach {
        let Some(peer) = self.peers.get_mut(id) else {
            return Attach::UnknownPeer;
        };
        peer.dialing = false;
        match peer.link.replace(link) {
            Some(old) => Attach::Replaced(old),
            None => Attach::Attached,
        }
    }

    /// Clear the peer's link, but only if it is still the one with `link_id`.
    pub fn detach_link(&mut self, id: &str, link_id: u64) -> bool {
        match self.peers.get_mut(id) {
            Some(peer) if peer.link.as_ref().map(|l| l.id) == Some(link_id) => {
                peer.link = None;
                true
            }
            _ => false,
        }
    }

    /// Senders for every live link, or just `target`'s when given.
    pub fn link_senders(&self, target: Option<&str>) -> Vec<(String, mpsc::UnboundedSender<Vec<u8>>)> {
        let linked = |p: &Peer| p.link.as_ref().map(|l| (p.id.clone(), l.sender.clone()));
        match target {
            Some(id) => self.peers.get(id).and_then(linked).into_iter().collect(),
            None => self.peers.values().filter_map(linked).collect(),
        }
    }

    pub fn get(&self, id: &str) -> Option<PeerInfo> {
        self.peers.get(id).map(PeerInfo::from)
    }

    /// Snapshot sorted by peer ID.
    pub fn snapshot(&self) -> Vec<PeerInfo> {
        let mut out: Vec<PeerInfo> = self.peers.values().map(PeerInfo::from).collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub fn remove(&mut self, id: &str) -> Option<Peer> {
        self.peers.remove(id)
    }

    /// Remove peers not seen within `timeout`. A zero timeout disables eviction.
    pub fn evict_stale(&mut self, timeout: Duration) -> Vec<Peer> {
        if timeout.is_zero() {
            return Vec::new();
        }
        let now = Instant::now();
        let stale: Vec<String> = self
            .peers
            .values()
            .filter(|p| now.saturating_duration_since(p.last_seen) > timeout)
            .map(|p| p.id.clone())
            .collect();
        stale
            .iter()
            .filter_map(|id| self.peers.remove(id))
            .collect()
    }

    pub fn drain(&mut self) -> Vec<Peer> {
        self.peers.drain().map(|(_, p)| p).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn link(id: u64) -> (Link, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (sender, rx) = mpsc::unbounded_channel();
        (
            Link {
                id,
                sender,
                token: CancellationToken::new(),
            },
            rx,
        )
    }

    #[test]
    fn never_exceeds_max_peers() {
        for max in [0usize, 1, 3, 8] {
            let mut t = PeerTable::new(max);
            // Interleave new IDs with repeats, as a noisy segment would.
            for i in 0..50u16 {
                let id = format!("p{}", (i * 7) % 13);
                t.admit(&id, addr(1000 + i), addr(2000 + i));
                assert!(t.len() <= max, "len {} > max {}", t.len(), max);
            }
            assert_eq!(t.len(), max.min(13));
        }
    }

    #[test]
    fn full_table_drops_unknown_but_refreshes_known() {
        let mut t = PeerTable::new(2);
        assert_eq!(t.admit("a", addr(1), addr(11)), Admission::New);
        assert_eq!(t.admit("b", addr(2), addr(12)), Admission::New);
        assert_eq!(t.admit("c", addr(3), addr(13)), Admission::Full);
        assert!(!t.contains("c"));
        assert_eq!(t.admit("a", addr(4), addr(14)), Admission::Refreshed);
        assert_eq!(t.get("a").unwrap().tcp_addr, addr(14));
    }

    #[test]
    fn dial_claimed_once() {
        let mut t = PeerTable::new(4);
        t.admit("a", addr(1), addr(11));
        assert_eq!(t.begin_dial("a"), Some(addr(11)));
        assert_eq!(t.begin_dial("a"), None);
        t.end_dial("a");
        assert_eq!(t.begin_dial("a"), Some(addr(11)));
        assert_eq!(t.begin_dial("missing"), None);
    }

    #[test]
    fn link_attach_and_detach_by_id() {
        let mut t = PeerTable::new(4);
        t.admit("a", addr(1), addr(11));
        let (l1, _rx1) = link(1);
        let (l2, _rx2) = link(2);
        assert!(matches!(t.attach_link("a", l1), Attach::Attached));
        assert!(t.get("a").unwrap().connected);
        assert_eq!(t.begin_dial("a"), None);
        match t.attach_link("a", l2) {
            Attach::Replaced(old) => assert_eq!(old.id, 1),
            other => panic!("expected replacement, got {other:?}"),
        }

        // The superseded link closing must not clear the live one.
        assert!(!t.detach_link("a", 1));
        assert!(t.get("a").unwrap().connected);
        assert!(t.detach_link("a", 2));
        assert!(!t.get("a").unwrap().connected);

        let (l3, _rx3) = link(3);
        assert!(matches!(t.attach_link("gone", l3), Attach::UnknownPeer));
    }

    #[test]
    fn link_senders_filters_by_target() {
        let mut t = PeerTable::new(4);
        t.admit("a", addr(1), addr(11));
        t.admit("b", addr(2), addr(12));
        t.admit("c", addr(3), addr(13));
        let (la, mut rxa) = link(1);
        let (lb, _rxb) = link(2);
        assert!(matches!(t.attach_link("a", la), Attach::Attached));
        assert!(matches!(t.attach_link("b", lb), Attach::Attached));

        assert_eq!(t.link_senders(None).len(), 2);
        let only_a = t.link_senders(Some("a"));
        assert_eq!(only_a.len(), 1);
        only_a[0].1.send(vec![1, 2, 3]).unwrap();
        assert_eq!(rxa.try_recv().unwrap(), vec![1, 2, 3]);
        assert!(t.link_senders(Some("c")).is_empty());
    }

    #[test]
    fn eviction_respects_timeout() {
        let mut t = PeerTable::new(4);
        t.admit("a", addr(1), addr(11));
        assert!(t.evict_stale(Duration::ZERO).is_empty());
        assert!(t.evict_stale(Duration::from_secs(60)).is_empty());
        std::thread::sleep(Duration::from_millis(20));
        let gone = t.evict_stale(Duration::from_millis(5));
        assert_eq!(gone.len(), 1);
        assert!(t.is_empty());
    }

    #[test]
    fn snapshot_is_sorted_and_secure_peer_marks_verified() {
        let mut t = PeerTable::new(4);
        t.admit("b", addr(2), addr(12));
        t.admit("a", addr(1), addr(11));
        let key = *pal_core::Keypair::generate().public_key();
        t.set_public_key("a", key);
        let snap = t.snapshot();
        assert_eq!(snap[0].id, "a");
        assert_eq!(snap[1].id, "b");
        let sp = SecurePeer::from(&snap[0]);
        assert!(sp.verified);
        assert_eq!(sp.addr, "127.0.0.1:11");
        assert!(!SecurePeer::from(&snap[1]).verified);
    }
}
