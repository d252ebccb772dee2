//! PalNet wire protocol: message types, envelopes, version.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::identity::{PublicKey, Signature};

/// Current protocol version. Carried in extended discovery.
pub const PROTOCOL_VERSION: u8 = 1;

/// Enumerated message categories. The payload of an envelope is interpreted per type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MessageType {
    Discovery,
    CharacterAction,
    StateSync,
    PeerList,
    BattleInvite,
    BattleAction,
    BattleResult,
    BattleEnd,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Discovery => "discovery",
            MessageType::CharacterAction => "character_action",
            MessageType::StateSync => "state_sync",
            MessageType::PeerList => "peer_list",
            MessageType::BattleInvite => "battle_invite",
            MessageType::BattleAction => "battle_action",
            MessageType::BattleResult => "battle_result",
            MessageType::BattleEnd => "battle_end",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The unsigned message unit. One envelope per logical event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub msg_type: MessageType,
    /// Sender peer ID.
    pub from: String,
    /// Recipient peer ID; `None` is a broadcast.
    pub to: Option<String>,
    /// Opaque payload, decoded per `msg_type` (see payload module).
    pub payload: Vec<u8>,
    /// Creation time, Unix milliseconds.
    pub timestamp: u64,
}

impl Envelope {
    /// New envelope stamped with the current time.
    pub fn new(
        msg_type: MessageType,
        from: impl Into<String>,
        to: Option<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self::at(msg_type, from, to, payload, now_ms())
    }

    /// New envelope with an explicit timestamp.
    pub fn at(
        msg_type: MessageType,
        from: impl Into<String>,
        to: Option<String>,
        payload: Vec<u8>,
        timestamp: u64,
    ) -> Self {
        Self {
            msg_type,
            from: from.into(),
            to: to.filter(|t| !t.is_empty()),
            payload,
            timestamp,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.to.is_none()
    }

    /// Canonical bytes covered by the signature. Bincode with fixed field order.
    pub fn signing_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }
}

/// An envelope plus detached signature and the sender's public key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedEnvelope {
    pub envelope: Envelope,
    pub signature: Signature,
    pub public_key: PublicKey,
}

/// Top-level wire unit. Discovery datagrams may be plain; reliable links carry only signed frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    Plain(Envelope),
    Signed(SignedEnvelope),
}

impl Frame {
    pub fn envelope(&self) -> &Envelope {
        match self {
            Frame::Plain(e) => e,
            Frame::Signed(s) => &s.envelope,
        }
    }
}

/// Current wall clock in Unix milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_recipient_is_broadcast() {
        let e = Envelope::new(MessageType::CharacterAction, "a", Some(String::new()), vec![]);
        assert!(e.is_broadcast());
        let e = Envelope::new(MessageType::CharacterAction, "a", Some("b".into()), vec![]);
        assert_eq!(e.to.as_deref(), Some("b"));
    }

    #[test]
    fn signing_bytes_deterministic() {
        let e = Envelope::at(MessageType::StateSync, "a", None, vec![1, 2, 3], 42);
        assert_eq!(e.signing_bytes().unwrap(), e.clone().signing_bytes().unwrap());
    }

    #[test]
    fn signing_bytes_cover_payload() {
        let a = Envelope::at(MessageType::StateSync, "a", None, vec![1, 2, 3], 42);
        let mut b = a.clone();
        b.payload[0] = 9;
        assert_ne!(a.signing_bytes().unwrap(), b.signing_bytes().unwrap());
    }

    #[test]
    fn message_type_names() {
        assert_eq!(MessageType::BattleEnd.to_string(), "battle_end");
        assert_eq!(MessageType::PeerList.as_str(), "peer_list");
    }
}
