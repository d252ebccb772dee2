//! Network manager errors.

use pal_core::wire::FrameEncodeError;
use pal_core::ProtocolError;

/// Errors returned synchronously to callers of the network manager.
///
/// Per-message failures on inbound traffic never surface here; they are counted in
/// [`crate::manager::NetStats`] and logged.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// Socket bind/accept/dial failure.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("delivery queue full")]
    QueueFull,

    #[error("network manager is shutting down")]
    Shutdown,

    #[error("unknown peer: {0}")]
    UnknownPeer(String),

    #[error("network manager already started")]
    AlreadyRunning,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("frame encode error: {0}")]
    Frame(#[from] FrameEncodeError),
}
