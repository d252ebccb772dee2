//! Protocol/trust layer: signs outbound envelopes, verifies inbound ones, pins sender keys
//! on first use, and bounds message age.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ProtocolError;
use crate::identity::{Keypair, PublicKey};
use crate::metrics::Counter;
use crate::payload::{encode_payload, TypedPayload};
use crate::protocol::{now_ms, Envelope, MessageType, SignedEnvelope};
use crate::sync::CharacterState;

/// Envelopes timestamped further ahead than this are rejected as future-dated.
pub const MAX_FUTURE_SKEW: Duration = Duration::from_secs(60);

/// Default maximum accepted message age.
pub const DEFAULT_MAX_MESSAGE_AGE: Duration = Duration::from_secs(300);

/// Result of pinning a key in a [`TrustStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinOutcome {
    /// First key seen for this peer.
    Pinned,
    /// Same key as already pinned.
    Unchanged,
    /// A different key replaced the pinned one.
    Repinned { previous: PublicKey },
}

/// Peer ID → public key store. Pin-on-first-use lives behind this seam so a rotation or
/// revocation policy can replace it.
pub trait TrustStore: Send + Sync {
    fn get(&self, peer_id: &str) -> Option<PublicKey>;

    fn put(&self, peer_id: &str, key: PublicKey) -> PinOutcome;

    /// True if `key` is acceptable for `peer_id`: unpinned, or equal to the pinned key.
    fn verify(&self, peer_id: &str, key: &PublicKey) -> bool {
        self.get(peer_id).map_or(true, |pinned| pinned == *key)
    }

    fn peers(&self) -> Vec<String>;
}

/// In-memory pin-on-first-use store.
#[derive(Debug, Default)]
pub struct PinnedKeyStore {
    keys: RwLock<HashMap<String, PublicKey>>,
}

impl PinnedKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TrustStore for PinnedKeyStore {
    fn get(&self, peer_id: &str) -> Option<PublicKey> {
        self.keys
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(peer_id)
            .copied()
    }

    fn put(&self, peer_id: &str, key: PublicKey) -> PinOutcome {
        let mut keys = self.keys.write().unwrap_or_else(|e| e.into_inner());
        match keys.insert(peer_id.to_string(), key) {
            None => PinOutcome::Pinned,
            Some(previous) if previous == key => PinOutcome::Unchanged,
            Some(previous) => PinOutcome::Repinned { previous },
        }
    }

    fn peers(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .keys
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        out.sort();
        out
    }
}

/// What to do when a correctly signed envelope arrives under a key other than the pinned one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyChangePolicy {
    /// Log, count, and pin the new key.
    #[default]
    Repin,
    /// Log, count, and reject with [`ProtocolError::KeyChanged`].
    Reject,
}

/// Trust-layer counters.
#[derive(Debug, Default)]
pub struct TrustStats {
    pub signed: Counter,
    pub verified: Counter,
    pub signature_failures: Counter,
    pub stale: Counter,
    pub future: Counter,
    pub key_changes: Counter,
}

/// Local identity plus the trust store. Shared across tasks behind an `Arc`.
pub struct TrustLayer {
    keypair: Keypair,
    peer_id: String,
    store: Arc<dyn TrustStore>,
    policy: KeyChangePolicy,
    stats: TrustStats,
}

impl TrustLayer {
    /// Trust layer with the key-derived peer ID and an empty pinned store.
    pub fn new(keypair: Keypair) -> Self {
        let peer_id = keypair.peer_id();
        Self::with_peer_id(keypair, peer_id)
    }

    pub fn with_peer_id(keypair: Keypair, peer_id: impl Into<String>) -> Self {
        Self {
            keypair,
            peer_id: peer_id.into(),
            store: Arc::new(PinnedKeyStore::new()),
            policy: KeyChangePolicy::default(),
            stats: TrustStats::default(),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn TrustStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_key_change_policy(mut self, policy: KeyChangePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn public_key(&self) -> &PublicKey {
        self.keypair.public_key()
    }

    pub fn store(&self) -> &Arc<dyn TrustStore> {
        &self.store
    }

    pub fn stats(&self) -> &TrustStats {
        &self.stats
    }

    /// Sign the canonical serialization of `envelope` and attach the local public key.
    pub fn sign(&self, envelope: Envelope) -> Result<SignedEnvelope, ProtocolError> {
        let bytes = envelope.signing_bytes()?;
        let signature = self.keypair.sign(&bytes);
        self.stats.signed.inc();
        Ok(SignedEnvelope {
            envelope,
            signature,
            public_key: *self.keypair.public_key(),
        })
    }

    /// Build and sign an envelope from the local peer carrying raw payload bytes.
    pub fn seal(
        &self,
        msg_type: MessageType,
        to: Option<String>,
        payload: Vec<u8>,
    ) -> Result<SignedEnvelope, ProtocolError> {
        self.sign(Envelope::new(msg_type, self.peer_id.clone(), to, payload))
    }

    /// Build and sign a typed payload. The message type comes from the payload type.
    pub fn build<P: TypedPayload>(
        &self,
        to: Option<String>,
        payload: &P,
    ) -> Result<SignedEnvelope, ProtocolError> {
        self.seal(P::MESSAGE_TYPE, to, encode_payload(payload)?)
    }

    /// Build a broadcast state-sync message, recomputing the checksum first.
    pub fn build_state_sync(&self, state: &CharacterState) -> Result<SignedEnvelope, ProtocolError> {
        let mut state = state.clone();
        state.seal()?;
        self.build(None, &state)
    }

    /// Verify the signature on `signed` against its embedded key, then pin the sender's key.
    pub fn verify(&self, signed: &SignedEnvelope) -> Result<(), ProtocolError> {
        let bytes = signed.envelope.signing_bytes()?;
        if !signed.public_key.verify(&bytes, &signed.signature) {
            self.stats.signature_failures.inc();
            return Err(ProtocolError::Signature);
        }
        let from = &signed.envelope.from;
        if from.is_empty() {
            self.stats.verified.inc();
            return Ok(());
        }
        if !self.store.verify(from, &signed.public_key) {
            self.stats.key_changes.inc();
            warn!(peer = %from, policy = ?self.policy, "peer presented a different public key");
            if self.policy == KeyChangePolicy::Reject {
                return Err(ProtocolError::KeyChanged {
                    peer_id: from.clone(),
                });
            }
        }
        if self.store.put(from, signed.public_key) == PinOutcome::Pinned {
            debug!(peer = %from, "pinned public key on first contact");
        }
        self.stats.verified.inc();
        Ok(())
    }

    /// Reject envelopes older than `max_age` or more than [`MAX_FUTURE_SKEW`] ahead.
    pub fn validate_age(&self, envelope: &Envelope, max_age: Duration) -> Result<(), ProtocolError> {
        let res = validate_age_at(envelope, max_age, now_ms());
        match &res {
            Err(ProtocolError::Stale { .. }) => self.stats.stale.inc(),
            Err(ProtocolError::Future { .. }) => self.stats.future.inc(),
            _ => {}
        }
        res
    }

    /// Verify signature and age in one step, as done for every inbound reliable frame.
    pub fn accept(&self, signed: &SignedEnvelope, max_age: Duration) -> Result<(), ProtocolError> {
        self.verify(signed)?;
        self.validate_age(&signed.envelope, max_age)
    }

    pub fn is_peer_verified(&self, peer_id: &str) -> bool {
        self.store.get(peer_id).is_some()
    }

    pub fn verified_peers(&self) -> Vec<String> {
        self.store.peers()
    }
}

impl std::fmt::Debug for TrustLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustLayer")
            .field("peer_id", &self.peer_id)
            .field("public_key", self.keypair.public_key())
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

/// Age check against an explicit clock reading (Unix ms).
pub fn validate_age_at(
    envelope: &Envelope,
    max_age: Duration,
    now: u64,
) -> Result<(), ProtocolError> {
    let max_age_ms = max_age.as_millis() as u64;
    if envelope.timestamp > now {
        let ahead_ms = envelope.timestamp - now;
        if ahead_ms > MAX_FUTURE_SKEW.as_millis() as u64 {
            return Err(ProtocolError::Future { ahead_ms });
        }
        return Ok(());
    }
    let age_ms = now - envelope.timestamp;
    if age_ms > max_age_ms {
        return Err(ProtocolError::Stale { age_ms, max_age_ms });
    }
    Ok(())
}
