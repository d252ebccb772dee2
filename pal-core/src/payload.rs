//! Typed payload schemas carried inside envelopes, with required-field validation.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::identity::PublicKey;
use crate::protocol::{Envelope, MessageType, PROTOCOL_VERSION};
use crate::sync::Position;

/// A payload schema bound to one message type.
pub trait TypedPayload: Serialize + DeserializeOwned {
    const MESSAGE_TYPE: MessageType;

    /// Check required fields after decoding.
    fn validate(&self) -> Result<(), ProtocolError> {
        Ok(())
    }
}

/// Serialize a payload for an envelope.
pub fn encode_payload<P: TypedPayload>(payload: &P) -> Result<Vec<u8>, ProtocolError> {
    Ok(bincode::serialize(payload)?)
}

/// Decode and validate payload bytes without looking at an envelope.
pub fn decode_payload<P: TypedPayload>(bytes: &[u8]) -> Result<P, ProtocolError> {
    let payload: P = bincode::deserialize(bytes)?;
    payload.validate()?;
    Ok(payload)
}

/// Check the envelope type, then decode and validate its payload.
pub fn parse_payload<P: TypedPayload>(envelope: &Envelope) -> Result<P, ProtocolError> {
    if envelope.msg_type != P::MESSAGE_TYPE {
        return Err(ProtocolError::WrongType {
            expected: P::MESSAGE_TYPE,
            actual: envelope.msg_type,
        });
    }
    decode_payload(&envelope.payload)
}

fn require(value: &str, field: &'static str) -> Result<(), ProtocolError> {
    if value.is_empty() {
        return Err(ProtocolError::MissingField(field));
    }
    Ok(())
}

/// Discovery announcement: `{network_id, peer_id, tcp_port}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryPayload {
    pub network_id: String,
    pub peer_id: String,
    pub tcp_port: u16,
}

impl TypedPayload for DiscoveryPayload {
    const MESSAGE_TYPE: MessageType = MessageType::Discovery;

    fn validate(&self) -> Result<(), ProtocolError> {
        require(&self.network_id, "networkId")?;
        require(&self.peer_id, "peerId")
    }
}

/// Signed discovery variant: adds the sender's key, capabilities, and protocol version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtendedDiscoveryPayload {
    pub base: DiscoveryPayload,
    pub public_key: PublicKey,
    /// e.g. "bot", "game", "romance", "battle".
    pub capabilities: Vec<String>,
    pub version: u8,
}

impl ExtendedDiscoveryPayload {
    pub fn new(base: DiscoveryPayload, public_key: PublicKey, capabilities: Vec<String>) -> Self {
        Self {
            base,
            public_key,
            capabilities,
            version: PROTOCOL_VERSION,
        }
    }
}

impl TypedPayload for ExtendedDiscoveryPayload {
    const MESSAGE_TYPE: MessageType = MessageType::Discovery;

    fn validate(&self) -> Result<(), ProtocolError> {
        self.base.validate()
    }
}

/// A user interaction with a character ("click", "feed", "play", "pet", ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterActionPayload {
    pub action: String,
    pub character_id: String,
    pub position: Option<Position>,
    pub animation: Option<String>,
    pub response: Option<String>,
    /// Stat deltas caused by the action.
    pub stats: BTreeMap<String, f64>,
    pub interaction_id: String,
}

impl CharacterActionPayload {
    /// New action with a fresh interaction ID.
    pub fn new(action: impl Into<String>, character_id: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            character_id: character_id.into(),
            position: None,
            animation: None,
            response: None,
            stats: BTreeMap::new(),
            interaction_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

impl TypedPayload for CharacterActionPayload {
    const MESSAGE_TYPE: MessageType = MessageType::CharacterAction;

    fn validate(&self) -> Result<(), ProtocolError> {
        require(&self.action, "action")?;
        require(&self.character_id, "characterId")?;
        require(&self.interaction_id, "interactionId")
    }
}

/// Peer table entry as shared with other peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurePeer {
    pub id: String,
    /// Reliable-link address, `host:port`.
    pub addr: String,
    pub public_key: Option<PublicKey>,
    /// Unix ms.
    pub last_seen: u64,
    pub verified: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerListPayload {
    pub peers: Vec<SecurePeer>,
    pub timestamp: u64,
}

impl TypedPayload for PeerListPayload {
    const MESSAGE_TYPE: MessageType = MessageType::PeerList;

    fn validate(&self) -> Result<(), ProtocolError> {
        self.peers.iter().try_for_each(|p| require(&p.id, "id"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BattleInvitePayload {
    pub from_character_id: String,
    pub to_character_id: String,
    pub battle_id: String,
    pub timestamp: u64,
}

impl TypedPayload for BattleInvitePayload {
    const MESSAGE_TYPE: MessageType = MessageType::BattleInvite;

    fn validate(&self) -> Result<(), ProtocolError> {
        require(&self.battle_id, "battleId")?;
        require(&self.from_character_id, "fromCharacterId")?;
        require(&self.to_character_id, "toCharacterId")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BattleActionPayload {
    pub battle_id: String,
    /// attack, heal, defend, ...
    pub action_type: String,
    pub actor_id: String,
    pub target_id: String,
    pub item_used: Option<String>,
    pub timestamp: u64,
}

impl TypedPayload for BattleActionPayload {
    const MESSAGE_TYPE: MessageType = MessageType::BattleAction;

    fn validate(&self) -> Result<(), ProtocolError> {
        require(&self.battle_id, "battleId")?;
        require(&self.action_type, "actionType")?;
        require(&self.actor_id, "actorId")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BattleParticipantStats {
    pub hp: f64,
    pub max_hp: f64,
    pub attack: f64,
    pub defense: f64,
    pub speed: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BattleResultPayload {
    pub battle_id: String,
    pub action_type: String,
    pub actor_id: String,
    pub target_id: String,
    pub success: bool,
    pub damage: f64,
    pub healing: f64,
    pub animation: Option<String>,
    pub response: Option<String>,
    pub participant_stats: BTreeMap<String, BattleParticipantStats>,
    pub timestamp: u64,
}

impl TypedPayload for BattleResultPayload {
    const MESSAGE_TYPE: MessageType = MessageType::BattleResult;

    fn validate(&self) -> Result<(), ProtocolError> {
        require(&self.battle_id, "battleId")?;
        require(&self.actor_id, "actorId")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BattleEndReason {
    Defeat,
    Forfeit,
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BattleEndPayload {
    pub battle_id: String,
    /// `None` for a draw.
    pub winner: Option<String>,
    pub reason: BattleEndReason,
    pub timestamp: u64,
}

impl TypedPayload for BattleEndPayload {
    const MESSAGE_TYPE: MessageType = MessageType::BattleEnd;

    fn validate(&self) -> Result<(), ProtocolError> {
        require(&self.battle_id, "battleId")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    #[test]
    fn parse_rejects_wrong_type() {
        let p = BattleEndPayload {
            battle_id: "b1".into(),
            winner: None,
            reason: BattleEndReason::Forfeit,
            timestamp: 1,
        };
        let env = Envelope::new(MessageType::BattleInvite, "a", None, encode_payload(&p).unwrap());
        assert!(matches!(
            parse_payload::<BattleEndPayload>(&env),
            Err(ProtocolError::WrongType { .. })
        ));
    }

    #[test]
    fn character_action_requires_fields() {
        let mut p = CharacterActionPayload::new("feed", "luna");
        assert!(!p.interaction_id.is_empty());
        let env = Envelope::new(MessageType::CharacterAction, "a", None, encode_payload(&p).unwrap());
        assert_eq!(parse_payload::<CharacterActionPayload>(&env).unwrap(), p);

        p.action.clear();
        let bytes = encode_payload(&p).unwrap();
        assert!(matches!(
            decode_payload::<CharacterActionPayload>(&bytes),
            Err(ProtocolError::MissingField("action"))
        ));
    }

    #[test]
    fn discovery_requires_ids() {
        let p = DiscoveryPayload {
            network_id: String::new(),
            peer_id: "a".into(),
            tcp_port: 9000,
        };
        assert!(matches!(
            p.validate(),
            Err(ProtocolError::MissingField("networkId"))
        ));
    }

    #[test]
    fn extended_discovery_carries_key_and_version() {
        let kp = Keypair::generate();
        let ext = ExtendedDiscoveryPayload::new(
            DiscoveryPayload {
                network_id: "n1".into(),
                peer_id: kp.peer_id(),
                tcp_port: 4000,
            },
            *kp.public_key(),
            vec!["battle".into()],
        );
        let bytes = encode_payload(&ext).unwrap();
        let back: ExtendedDiscoveryPayload = decode_payload(&bytes).unwrap();
        assert_eq!(back.version, PROTOCOL_VERSION);
        assert_eq!(back.public_key, *kp.public_key());
    }

    #[test]
    fn battle_invite_requires_battle_id() {
        let p = BattleInvitePayload {
            from_character_id: "a".into(),
            to_character_id: "b".into(),
            battle_id: String::new(),
            timestamp: 0,
        };
        assert!(matches!(
            p.validate(),
            Err(ProtocolError::MissingField("battleId"))
        ));
    }

    #[test]
    fn peer_list_rejects_blank_ids() {
        let p = PeerListPayload {
            peers: vec![SecurePeer {
                id: String::new(),
                addr: "10.0.0.2:4000".into(),
                public_key: None,
                last_seen: 0,
                verified: false,
            }],
            timestamp: 0,
        };
        assert!(p.validate().is_err());
    }

    #[test]
    fn truncated_bytes_are_codec_errors() {
        let p = CharacterActionPayload::new("feed", "luna");
        let bytes = encode_payload(&p).unwrap();
        assert!(matches!(
            decode_payload::<CharacterActionPayload>(&bytes[..bytes.len() / 2]),
            Err(ProtocolError::Codec(_))
        ));
    }
}
