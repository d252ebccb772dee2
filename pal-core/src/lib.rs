//! PalNet protocol reference implementation.
//! Host-driven: no I/O; the node crate owns sockets and timers and calls in here.

pub mod activity;
pub mod conflict;
pub mod error;
pub mod identity;
pub mod integrity;
pub mod metrics;
pub mod payload;
pub mod protocol;
pub mod sync;
pub mod trust;
pub mod wire;

pub use activity::{ActivityEvent, ActivityKind, ActivityTracker};
pub use conflict::{ConflictResolver, ConflictStrategy, Resolution, Winner};
pub use error::ProtocolError;
pub use identity::{Keypair, PublicKey, Signature};
pub use integrity::{RejectReason, RejectionTracker};
pub use payload::{
    decode_payload, encode_payload, parse_payload, BattleActionPayload, BattleEndPayload,
    BattleEndReason, BattleInvitePayload, BattleParticipantStats, BattleResultPayload,
    CharacterActionPayload, DiscoveryPayload, ExtendedDiscoveryPayload, PeerListPayload,
    SecurePeer, TypedPayload,
};
pub use protocol::{now_ms, Envelope, Frame, MessageType, SignedEnvelope, PROTOCOL_VERSION};
pub use sync::{ApplyOutcome, CharacterState, Position, StateSynchronizer, SyncError, SyncStats};
pub use trust::{KeyChangePolicy, PinOutcome, PinnedKeyStore, TrustLayer, TrustStore};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
