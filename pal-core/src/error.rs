//! Protocol/trust layer errors.

use crate::protocol::MessageType;

/// Errors raised while signing, verifying, or parsing envelopes and payloads.
///
/// Inbound variants are never fatal: callers count them and drop the message.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("signature verification failed")]
    Signature,

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    Integrity { expected: String, actual: String },

    #[error("message too old: {age_ms} ms (max age {max_age_ms} ms)")]
    Stale { age_ms: u64, max_age_ms: u64 },

    #[error("message from the future: {ahead_ms} ms ahead of local clock")]
    Future { ahead_ms: u64 },

    #[error("public key for peer {peer_id} differs from the pinned key")]
    KeyChanged { peer_id: String },

    #[error("unexpected message type: expected {expected}, got {actual}")]
    WrongType {
        expected: MessageType,
        actual: MessageType,
    },

    #[error("{0} field is required")]
    MissingField(&'static str),

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),
}
