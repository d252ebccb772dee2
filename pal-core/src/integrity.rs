//! Integrity: state-sync checksum and per-peer tracking of rejected inbound messages.
//!
//! The checksum guards against accidental corruption only; authenticity comes from the
//! envelope signature.

use std::collections::HashMap;

use crate::error::ProtocolError;

/// Modulus for the byte-sum checksum.
pub const CHECKSUM_PRIME: u64 = 982_451_653;

/// Byte-sum of `data` reduced modulo [`CHECKSUM_PRIME`], rendered as lowercase hex.
pub fn checksum_bytes(data: &[u8]) -> String {
    let sum = data
        .iter()
        .fold(0u64, |acc, b| (acc + u64::from(*b)) % CHECKSUM_PRIME);
    format!("{:x}", sum)
}

/// Checksum of the canonical (bincode) serialization of `value`.
pub fn checksum_of<T: serde::Serialize>(value: &T) -> Result<String, bincode::Error> {
    Ok(checksum_bytes(&bincode::serialize(value)?))
}

/// Why an inbound message was discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectReason {
    Signature,
    Integrity,
    Stale,
    Future,
    KeyChanged,
    UnknownPeer,
    Malformed,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::Signature => "signature",
            RejectReason::Integrity => "integrity",
            RejectReason::Stale => "stale",
            RejectReason::Future => "future",
            RejectReason::KeyChanged => "key_changed",
            RejectReason::UnknownPeer => "unknown_peer",
            RejectReason::Malformed => "malformed",
        }
    }
}

impl From<&ProtocolError> for RejectReason {
    fn from(err: &ProtocolError) -> Self {
        match err {
            ProtocolError::Signature => RejectReason::Signature,
            ProtocolError::Integrity { .. } => RejectReason::Integrity,
            ProtocolError::Stale { .. } => RejectReason::Stale,
            ProtocolError::Future { .. } => RejectReason::Future,
            ProtocolError::KeyChanged { .. } => RejectReason::KeyChanged,
            ProtocolError::WrongType { .. }
            | ProtocolError::MissingField(_)
            | ProtocolError::Codec(_) => RejectReason::Malformed,
        }
    }
}

/// Tracks rejected inbound messages per peer and reason.
#[derive(Debug, Default)]
pub struct RejectionTracker {
    rejections: HashMap<(String, RejectReason), u64>,
}

impl RejectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one rejection for a peer.
    pub fn record(&mut self, peer_id: &str, reason: RejectReason) {
        *self
            .rejections
            .entry((peer_id.to_string(), reason))
            .or_insert(0) += 1;
    }

    pub fn count(&self, peer_id: &str, reason: RejectReason) -> u64 {
        self.rejections
            .get(&(peer_id.to_string(), reason))
            .copied()
            .unwrap_or(0)
    }

    /// All rejections recorded for a peer, any reason.
    pub fn total_for(&self, peer_id: &str) -> u64 {
        self.rejections
            .iter()
            .filter(|((p, _), _)| p == peer_id)
            .map(|(_, n)| *n)
            .sum()
    }

    /// Total rejections for one reason across all peers.
    pub fn total_by_reason(&self, reason: RejectReason) -> u64 {
        self.rejections
            .iter()
            .filter(|((_, r), _)| *r == reason)
            .map(|(_, n)| *n)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_is_hex_byte_sum() {
        assert_eq!(checksum_bytes(&[]), "0");
        assert_eq!(checksum_bytes(&[0x10, 0x20]), "30");
        assert_eq!(checksum_bytes(&[0xff; 4]), format!("{:x}", 0xff * 4));
    }

    #[test]
    fn checksum_reduced_mod_prime() {
        // 4_000_000 bytes of 0xff sum to 1_020_000_000 > prime.
        let data = vec![0xffu8; 4_000_000];
        let expected = (255u64 * 4_000_000) % CHECKSUM_PRIME;
        assert_eq!(checksum_bytes(&data), format!("{:x}", expected));
    }

    #[test]
    fn checksum_detects_change() {
        assert_ne!(checksum_bytes(b"hunger=50"), checksum_bytes(b"hunger=75"));
    }

    #[test]
    fn tracker_counts_per_peer_and_reason() {
        let mut t = RejectionTracker::new();
        t.record("a", RejectReason::Signature);
        t.record("a", RejectReason::Signature);
        t.record("a", RejectReason::Stale);
        t.record("b", RejectReason::Signature);
        assert_eq!(t.count("a", RejectReason::Signature), 2);
        assert_eq!(t.total_for("a"), 3);
        assert_eq!(t.total_for("c"), 0);
        assert_eq!(t.total_by_reason(RejectReason::Signature), 3);
    }

    #[test]
    fn reason_from_protocol_error() {
        assert_eq!(RejectReason::from(&ProtocolError::Signature), RejectReason::Signature);
        assert_eq!(
            RejectReason::from(&ProtocolError::Stale { age_ms: 5, max_age_ms: 1 }),
            RejectReason::Stale
        );
        assert_eq!(
            RejectReason::from(&ProtocolError::MissingField("peerId")),
            RejectReason::Malformed
        );
    }
}
