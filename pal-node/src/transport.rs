//! Reliable links: TCP listener, outbound dial with backoff, hello handshake, and the
//! per-link reader/writer tasks. Frames are length-prefixed, see `pal_core::wire`.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use pal_core::wire::{decode_body, frame_len, FrameDecodeError, LEN_SIZE};
use pal_core::{ActivityEvent, ActivityKind, Frame, MessageType, RejectReason};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::discovery;
use crate::manager::{Shared, UNVERIFIED_PEER};
use crate::peers::{Attach, Link};

pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
pub const DIAL_RETRIES: u32 = 3;
pub const DIAL_BASE_DELAY: Duration = Duration::from_millis(200);
/// An accepted connection must present its signed hello within this window.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Frame(#[from] FrameDecodeError),
}

pub async fn bind_listener(port: u16) -> std::io::Result<TcpListener> {
    TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await
}

/// Read one length-prefixed frame.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame, LinkError> {
    let mut prefix = [0u8; LEN_SIZE];
    reader.read_exact(&mut prefix).await?;
    let len = frame_len(&prefix)?;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(decode_body(&body)?)
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> std::io::Result<()> {
    writer.write_all(bytes).await?;
    writer.flush().await
}

/// Connect to `addr`, retrying with exponential backoff. Gives up early on cancellation.
pub async fn dial_with_backoff(
    addr: SocketAddr,
    retries: u32,
    base_delay: Duration,
    cancel: &CancellationToken,
) -> std::io::Result<TcpStream> {
    let mut attempt = 0;
    loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(std::io::Error::new(std::io::ErrorKind::Interrupted, "shutting down"));
            }
            r = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(addr)) => match r {
                Ok(r) => r,
                Err(_) => Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "dial timed out")),
            },
        };
        match result {
            Ok(stream) => return Ok(stream),
            Err(err) if attempt >= retries => return Err(err),
            Err(err) => {
                let delay = base_delay * 2u32.pow(attempt);
                debug!(%addr, attempt, ?delay, error = %err, "dial failed, retrying");
                attempt += 1;
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(std::io::Error::new(std::io::ErrorKind::Interrupted, "shutting down"));
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

pub(crate) async fn accept_loop(shared: Arc<Shared>, listener: TcpListener) {
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    shared.tracker.spawn(handle_incoming(Arc::clone(&shared), stream, addr));
                }
                Err(err) => {
                    warn!(error = %err, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
        }
    }
    debug!("accept loop stopped");
}

/// Identify an accepted connection from its hello, refusing peers we have not discovered.
/// Until the hello names a peer in the table, rejections count under [`UNVERIFIED_PEER`].
async fn handle_incoming(shared: Arc<Shared>, mut stream: TcpStream, addr: SocketAddr) {
    let first = tokio::select! {
        _ = shared.cancel.cancelled() => return,
        r = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_frame(&mut stream)) => r,
    };
    let signed = match first {
        Ok(Ok(Frame::Signed(signed))) => signed,
        Ok(Ok(Frame::Plain(_))) => {
            debug!(%addr, "unsigned hello, closing");
            shared.stats.links_refused.inc();
            return;
        }
        Ok(Err(err)) => {
            debug!(%addr, error = %err, "handshake read failed");
            shared.stats.links_refused.inc();
            return;
        }
        Err(_) => {
            debug!(%addr, "handshake timed out");
            shared.stats.links_refused.inc();
            return;
        }
    };
    let peer_id = signed.envelope.from.clone();
    if let Err(err) = shared.trust.accept(&signed, shared.config.max_message_age) {
        debug!(%addr, peer = %peer_id, error = %err, "hello rejected");
        shared.reject(UNVERIFIED_PEER, RejectReason::from(&err));
        shared.stats.links_refused.inc();
        return;
    }
    {
        let mut peers = shared.peers.lock().await;
        if !peers.contains(&peer_id) {
            drop(peers);
            info!(%addr, peer = %peer_id, "refusing link from undiscovered peer");
            shared.reject(UNVERIFIED_PEER, RejectReason::UnknownPeer);
            shared.stats.links_refused.inc();
            return;
        }
        peers.touch(&peer_id);
        peers.set_public_key(&peer_id, signed.public_key);
    }
    if signed.envelope.msg_type != MessageType::Discovery {
        // Not a hello; treat it as the first message on the link.
        shared.on_reliable_frame(&peer_id, Frame::Signed(signed)).await;
    }
    run_link(shared, peer_id, stream).await;
}

/// Dial a discovered peer, introduce ourselves, and serve the link until it closes.
pub(crate) async fn connect_peer(shared: Arc<Shared>, peer_id: String, addr: SocketAddr) {
    let mut stream = match dial_with_backoff(addr, DIAL_RETRIES, DIAL_BASE_DELAY, &shared.cancel).await {
        Ok(stream) => stream,
        Err(err) => {
            shared.stats.dial_failures.inc();
            debug!(peer = %peer_id, %addr, error = %err, "dial failed");
            shared.peers.lock().await.end_dial(&peer_id);
            return;
        }
    };
    let hello = match discovery::hello_frame(&shared) {
        Ok(hello) => hello,
        Err(err) => {
            warn!(error = %err, "failed to build hello");
            shared.peers.lock().await.end_dial(&peer_id);
            return;
        }
    };
    if let Err(err) = write_frame(&mut stream, &hello).await {
        debug!(peer = %peer_id, error = %err, "hello write failed");
        shared.peers.lock().await.end_dial(&peer_id);
        return;
    }
    run_link(shared, peer_id, stream).await;
}

/// Register the link, spawn its writer, and read frames until EOF, error, or cancellation.
async fn run_link(shared: Arc<Shared>, peer_id: String, stream: TcpStream) {
    let (mut reader, writer) = stream.into_split();
    let (sender, rx) = mpsc::unbounded_channel();
    let token = shared.cancel.child_token();
    let link_id = shared.next_link_id();
    let attached = {
        let link = Link {
            id: link_id,
            sender,
            token: token.clone(),
        };
        shared.peers.lock().await.attach_link(&peer_id, link)
    };
    match attached {
        Attach::UnknownPeer => {
            debug!(peer = %peer_id, "peer gone before link came up");
            return;
        }
        Attach::Replaced(old) => {
            debug!(peer = %peer_id, old_link = old.id, "link superseded");
            old.token.cancel();
        }
        Attach::Attached => {
            shared.record_activity(ActivityEvent::new(
                ActivityKind::Discovery,
                &peer_id,
                "link established",
            ));
        }
    }
    shared.stats.links_opened.inc();
    info!(peer = %peer_id, link_id, "link up");
    shared
        .tracker
        .spawn(write_loop(peer_id.clone(), writer, rx, token.clone()));

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            read = read_frame(&mut reader) => match read {
                Ok(frame) => shared.on_reliable_frame(&peer_id, frame).await,
                Err(LinkError::Io(err)) => {
                    debug!(peer = %peer_id, link_id, error = %err, "link read failed");
                    break;
                }
                Err(LinkError::Frame(err)) => {
                    debug!(peer = %peer_id, link_id, error = %err, "malformed frame, closing link");
                    shared.reject(&peer_id, RejectReason::Malformed);
                    break;
                }
            },
        }
    }
    token.cancel();
    if shared.peers.lock().await.detach_link(&peer_id, link_id) {
        info!(peer = %peer_id, link_id, "link down");
    }
}

async fn write_loop(
    peer_id: String,
    mut writer: tokio::net::tcp::OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            next = rx.recv() => match next {
                Some(bytes) => {
                    if let Err(err) = write_frame(&mut writer, &bytes).await {
                        debug!(peer = %peer_id, error = %err, "link write failed");
                        token.cancel();
                        break;
                    }
                }
                None => break,
            },
        }
    }
    let _ = writer.shutdown().await;
}
