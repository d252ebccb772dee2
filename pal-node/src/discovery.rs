//! LAN discovery: periodic UDP announcements, announcement intake, staleness sweep.
//!
//! Announcements are plain by default; with `secure_discovery` they are signed and carry
//! the sender's public key. Link hellos always use the signed form.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use pal_core::{
    decode_frame, encode_frame, parse_payload, DiscoveryPayload, Envelope, ExtendedDiscoveryPayload,
    Frame, PublicKey, RejectReason, SignedEnvelope,
};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::error::NetError;
use crate::manager::{Shared, UNVERIFIED_PEER};

const MAX_DATAGRAM: usize = 64 * 1024;
const MIN_ANNOUNCE_INTERVAL: Duration = Duration::from_millis(100);

/// UDP socket on `0.0.0.0:port` with address/port reuse and broadcast enabled, so several
/// nodes on one host can share the discovery port.
pub fn bind_socket(port: u16) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket.set_reuse_port(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)).into())?;
    UdpSocket::from_std(socket.into())
}

fn base_payload(shared: &Shared) -> DiscoveryPayload {
    DiscoveryPayload {
        network_id: shared.config.network_id.clone(),
        peer_id: shared.local_id().to_string(),
        tcp_port: shared.tcp_port(),
    }
}

fn signed_discovery(shared: &Shared) -> Result<SignedEnvelope, NetError> {
    let payload = ExtendedDiscoveryPayload::new(
        base_payload(shared),
        *shared.trust.public_key(),
        shared.config.capabilities.clone(),
    );
    Ok(shared.trust.build(None, &payload)?)
}

/// Encoded announcement for this tick.
pub(crate) fn announcement(shared: &Shared) -> Result<Vec<u8>, NetError> {
    let frame = if shared.config.secure_discovery {
        Frame::Signed(signed_discovery(shared)?)
    } else {
        let payload = pal_core::encode_payload(&base_payload(shared))?;
        Frame::Plain(Envelope::new(
            pal_core::MessageType::Discovery,
            shared.local_id(),
            None,
            payload,
        ))
    };
    Ok(encode_frame(&frame)?)
}

/// First frame on a dialed link: a signed announcement identifying us to the acceptor.
pub(crate) fn hello_frame(shared: &Shared) -> Result<Vec<u8>, NetError> {
    Ok(encode_frame(&Frame::Signed(signed_discovery(shared)?))?)
}

pub(crate) async fn announce_loop(shared: Arc<Shared>, socket: Arc<UdpSocket>) {
    let targets = shared.config.announce_targets();
    let mut ticker =
        tokio::time::interval(shared.config.discovery_interval.max(MIN_ANNOUNCE_INTERVAL));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = ticker.tick() => {
                match announcement(&shared) {
                    Ok(bytes) => {
                        for target in &targets {
                            match socket.send_to(&bytes, target).await {
                                Ok(_) => shared.stats.announcements_sent.inc(),
                                Err(err) => debug!(%target, error = %err, "announce failed"),
                            }
                        }
                    }
                    Err(err) => warn!(error = %err, "failed to build announcement"),
                }
                shared.evict_stale().await;
            }
        }
    }
    debug!("announce loop stopped");
}

pub(crate) async fn recv_loop(shared: Arc<Shared>, socket: Arc<UdpSocket>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok((n, from)) => handle_datagram(&shared, &buf[..n], from).await,
                Err(err) => {
                    debug!(error = %err, "discovery recv failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
        }
    }
    debug!("discovery recv loop stopped");
}

/// Decode one announcement and admit its sender. Our own announcements and those for
/// other networks are ignored. Datagram senders are unauthenticated, so rejections here
/// are counted under [`UNVERIFIED_PEER`].
pub(crate) async fn handle_datagram(shared: &Arc<Shared>, datagram: &[u8], from: SocketAddr) {
    let frame = match decode_frame(datagram) {
        Ok((frame, _)) => frame,
        Err(err) => {
            debug!(%from, error = %err, "undecodable datagram");
            return;
        }
    };
    let (announcement, signed) = match frame {
        Frame::Plain(envelope) => match parse_payload::<DiscoveryPayload>(&envelope) {
            Ok(payload) => (payload, None),
            Err(err) => {
                debug!(%from, error = %err, "bad announcement");
                shared.reject(UNVERIFIED_PEER, RejectReason::from(&err));
                return;
            }
        },
        Frame::Signed(signed) => match parse_payload::<ExtendedDiscoveryPayload>(&signed.envelope) {
            Ok(ext) => (ext.base.clone(), Some((signed, ext.public_key))),
            Err(err) => {
                debug!(%from, error = %err, "bad signed announcement");
                shared.reject(UNVERIFIED_PEER, RejectReason::from(&err));
                return;
            }
        },
    };
    shared.stats.announcements_received.inc();
    if announcement.peer_id == shared.local_id() {
        shared.stats.ignored_self.inc();
        return;
    }
    if announcement.network_id != shared.config.network_id {
        shared.stats.ignored_foreign.inc();
        debug!(peer = %announcement.peer_id, network_id = %announcement.network_id, "foreign network");
        return;
    }
    let public_key = match signed {
        Some((signed, key)) => match verify_signed(shared, &signed, &announcement, key) {
            Some(key) => Some(key),
            None => return,
        },
        None => None,
    };
    let tcp_addr = SocketAddr::new(from.ip(), announcement.tcp_port);
    shared
        .offer_peer(&announcement.peer_id, from, tcp_addr, public_key)
        .await;
}

/// A signed announcement must verify and must describe the key and ID that signed it.
fn verify_signed(
    shared: &Shared,
    signed: &SignedEnvelope,
    announcement: &DiscoveryPayload,
    advertised_key: PublicKey,
) -> Option<PublicKey> {
    let sender = &signed.envelope.from;
    if *sender != announcement.peer_id || advertised_key != signed.public_key {
        debug!(peer = %sender, "announcement does not match its signer");
        shared.reject(UNVERIFIED_PEER, RejectReason::Signature);
        return None;
    }
    if let Err(err) = shared.trust.accept(signed, shared.config.max_message_age) {
        debug!(peer = %sender, error = %err, "rejected signed announcement");
        shared.reject(UNVERIFIED_PEER, RejectReason::from(&err));
        return None;
    }
    Some(signed.public_key)
}
