//! State synchronizer: versioned character state, local updates, remote merge.
//!
//! Host-driven like the rest of the core: the node crate owns the timer and the network,
//! this module only decides what the state becomes.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::conflict::{ConflictResolver, ConflictStrategy, Winner};
use crate::error::ProtocolError;
use crate::integrity;
use crate::payload::{decode_payload, TypedPayload};
use crate::protocol::{now_ms, MessageType};

pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(30);
pub const MIN_SYNC_INTERVAL: Duration = Duration::from_secs(1);
pub const MAX_SYNC_INTERVAL: Duration = Duration::from_secs(600);

/// 2-D screen position.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f32,
    pub y: f32,
}

/// The synchronized unit, one per character. Doubles as the state-sync payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterState {
    pub character_id: String,
    pub position: Position,
    pub animation: String,
    pub current_state: String,
    pub game_stats: BTreeMap<String, f64>,
    pub romance_stats: BTreeMap<String, f64>,
    /// Unix ms.
    pub last_update: u64,
    /// Peer that produced this update.
    pub update_source: String,
    pub version: u64,
    /// Byte-sum checksum over every other field.
    pub checksum: String,
}

impl CharacterState {
    /// Blank, unversioned state.
    pub fn new(character_id: impl Into<String>) -> Self {
        Self {
            character_id: character_id.into(),
            position: Position::default(),
            animation: String::new(),
            current_state: String::new(),
            game_stats: BTreeMap::new(),
            romance_stats: BTreeMap::new(),
            last_update: 0,
            update_source: String::new(),
            version: 0,
            checksum: String::new(),
        }
    }

    /// Checksum of this state with the checksum field cleared.
    pub fn compute_checksum(&self) -> Result<String, bincode::Error> {
        let mut cleared = self.clone();
        cleared.checksum.clear();
        integrity::checksum_of(&cleared)
    }

    /// Recompute and store the checksum.
    pub fn seal(&mut self) -> Result<(), bincode::Error> {
        self.checksum = self.compute_checksum()?;
        Ok(())
    }

    pub fn verify_checksum(&self) -> Result<(), ProtocolError> {
        let expected = self.compute_checksum()?;
        if expected != self.checksum {
            return Err(ProtocolError::Integrity {
                expected,
                actual: self.checksum.clone(),
            });
        }
        Ok(())
    }

    fn check_required(&self) -> Result<(), ProtocolError> {
        if self.character_id.is_empty() {
            return Err(ProtocolError::MissingField("characterId"));
        }
        if self.current_state.is_empty() {
            return Err(ProtocolError::MissingField("currentState"));
        }
        Ok(())
    }
}

impl TypedPayload for CharacterState {
    const MESSAGE_TYPE: MessageType = MessageType::StateSync;

    fn validate(&self) -> Result<(), ProtocolError> {
        self.check_required()?;
        self.verify_checksum()
    }
}

/// What happened to a remote update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// First record for this character.
    Inserted,
    /// Higher version replaced the stored record.
    Accepted,
    /// Lower version, dropped.
    Stale,
    /// Same version from the same source, already applied.
    Duplicate,
    /// Equal-version conflict; the stored record was kept.
    ConflictKept,
    /// Equal-version conflict; the incoming record replaced the stored one.
    ConflictReplaced,
}

impl ApplyOutcome {
    /// Whether the stored state changed.
    pub fn changed(&self) -> bool {
        matches!(
            self,
            ApplyOutcome::Inserted | ApplyOutcome::Accepted | ApplyOutcome::ConflictReplaced
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("sync interval {0:?} outside 1s..=600s")]
    IntervalOutOfRange(Duration),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl From<bincode::Error> for SyncError {
    fn from(e: bincode::Error) -> Self {
        SyncError::Protocol(ProtocolError::Codec(e))
    }
}

/// Synchronizer counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub local_updates: u64,
    pub inserted: u64,
    pub accepted: u64,
    pub stale: u64,
    pub duplicates: u64,
    pub conflicts: u64,
    pub integrity_failures: u64,
}

/// Owns every known character's state. One record per character ID, never deleted.
#[derive(Debug)]
pub struct StateSynchronizer {
    local_peer_id: String,
    states: HashMap<String, CharacterState>,
    owned: BTreeSet<String>,
    resolver: ConflictResolver,
    sync_interval: Duration,
    stats: SyncStats,
}

impl StateSynchronizer {
    pub fn new(local_peer_id: impl Into<String>, strategy: ConflictStrategy) -> Self {
        Self {
            local_peer_id: local_peer_id.into(),
            states: HashMap::new(),
            owned: BTreeSet::new(),
            resolver: ConflictResolver::new(strategy),
            sync_interval: DEFAULT_SYNC_INTERVAL,
            stats: SyncStats::default(),
        }
    }

    pub fn local_peer_id(&self) -> &str {
        &self.local_peer_id
    }

    /// Apply a local change: bump the version, restamp, reseal. Returns the new state for
    /// immediate broadcast.
    pub fn update_local_state(
        &mut self,
        character_id: &str,
        position: Position,
        animation: &str,
        current_state: &str,
        game_stats: BTreeMap<String, f64>,
        romance_stats: BTreeMap<String, f64>,
    ) -> Result<CharacterState, SyncError> {
        let mut state = self
            .states
            .get(character_id)
            .cloned()
            .unwrap_or_else(|| CharacterState::new(character_id));
        state.version += 1;
        state.position = position;
        state.animation = animation.to_string();
        state.current_state = current_state.to_string();
        state.game_stats = game_stats;
        state.romance_stats = romance_stats;
        state.last_update = now_ms();
        state.update_source = self.local_peer_id.clone();
        // Peers refuse states missing required fields; never store or broadcast one.
        state.check_required()?;
        state.seal()?;
        self.states.insert(character_id.to_string(), state.clone());
        self.owned.insert(character_id.to_string());
        self.stats.local_updates += 1;
        Ok(state)
    }

    /// Decode a state-sync payload from `peer_id`, verify its checksum, and merge it.
    pub fn apply_remote_update(
        &mut self,
        peer_id: &str,
        payload: &[u8],
    ) -> Result<ApplyOutcome, SyncError> {
        let incoming = match decode_payload::<CharacterState>(payload) {
            Ok(s) => s,
            Err(e @ ProtocolError::Integrity { .. }) => {
                self.stats.integrity_failures += 1;
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        };
        Ok(self.merge(peer_id, incoming))
    }

    /// Merge an already-verified remote state.
    pub fn merge(&mut self, peer_id: &str, incoming: CharacterState) -> ApplyOutcome {
        let id = incoming.character_id.clone();
        let outcome = match self.states.get(&id) {
            None => ApplyOutcome::Inserted,
            Some(local) if incoming.version < local.version => ApplyOutcome::Stale,
            Some(local) if incoming.version > local.version => ApplyOutcome::Accepted,
            Some(local) if incoming.update_source == local.update_source => {
                ApplyOutcome::Duplicate
            }
            Some(local) => match self.resolver.resolve(local, &incoming) {
                Winner::Local => ApplyOutcome::ConflictKept,
                Winner::Incoming => ApplyOutcome::ConflictReplaced,
            },
        };
        match outcome {
            ApplyOutcome::Inserted => self.stats.inserted += 1,
            ApplyOutcome::Accepted => self.stats.accepted += 1,
            ApplyOutcome::Stale => self.stats.stale += 1,
            ApplyOutcome::Duplicate => self.stats.duplicates += 1,
            ApplyOutcome::ConflictKept | ApplyOutcome::ConflictReplaced => {
                self.stats.conflicts += 1
            }
        }
        debug!(
            peer = %peer_id,
            character = %id,
            version = incoming.version,
            ?outcome,
            "remote state update"
        );
        if outcome.changed() {
            self.states.insert(id, incoming);
        }
        outcome
    }

    /// Copy of the current state for a character.
    pub fn get_character_state(&self, character_id: &str) -> Option<CharacterState> {
        self.states.get(character_id).cloned()
    }

    pub fn character_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.states.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Current state of every character updated locally at least once.
    pub fn owned_states(&self) -> Vec<CharacterState> {
        self.owned
            .iter()
            .filter_map(|id| self.states.get(id).cloned())
            .collect()
    }

    pub fn sync_interval(&self) -> Duration {
        self.sync_interval
    }

    pub fn set_sync_interval(&mut self, interval: Duration) -> Result<(), SyncError> {
        if !(MIN_SYNC_INTERVAL..=MAX_SYNC_INTERVAL).contains(&interval) {
            return Err(SyncError::IntervalOutOfRange(interval));
        }
        self.sync_interval = interval;
        Ok(())
    }

    pub fn set_peer_priority(&mut self, peer_id: impl Into<String>, priority: i32) {
        self.resolver.set_peer_priority(peer_id, priority);
    }

    pub fn resolver(&self) -> &ConflictResolver {
        &self.resolver
    }

    pub fn stats(&self) -> SyncStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::encode_payload;

    fn stats(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn remote(source: &str, version: u64, ts: u64, state: &str) -> CharacterState {
        let mut s = CharacterState::new("luna");
        s.current_state = state.into();
        s.animation = "idle".into();
        s.update_source = source.into();
        s.version = version;
        s.last_update = ts;
        s.game_stats = stats(&[("hunger", 50.0)]);
        s.seal().unwrap();
        s
    }

    fn bytes(s: &CharacterState) -> Vec<u8> {
        encode_payload(s).unwrap()
    }

    #[test]
    fn local_update_increments_version_and_seals() {
        let mut sync = StateSynchronizer::new("me", ConflictStrategy::TimestampWins);
        let s1 = sync
            .update_local_state("luna", Position { x: 1.0, y: 2.0 }, "walk", "idle", stats(&[]), stats(&[]))
            .unwrap();
        let s2 = sync
            .update_local_state("luna", Position::default(), "sit", "happy", stats(&[]), stats(&[]))
            .unwrap();
        assert_eq!(s1.version, 1);
        assert_eq!(s2.version, 2);
        assert_eq!(s2.update_source, "me");
        assert!(s2.verify_checksum().is_ok());
        assert_eq!(sync.owned_states(), vec![s2]);
    }

    #[test]
    fn checksum_idempotent_and_sensitive_to_stats() {
        let s = remote("a", 1, 10, "idle");
        assert_eq!(s.compute_checksum().unwrap(), s.compute_checksum().unwrap());
        let mut changed = s.clone();
        changed.game_stats.insert("hunger".into(), 75.0);
        assert_ne!(changed.compute_checksum().unwrap(), s.checksum);
        let mut romance = s.clone();
        romance.romance_stats.insert("affection".into(), 1.0);
        assert_ne!(romance.compute_checksum().unwrap(), s.checksum);
    }

    #[test]
    fn corrupted_payload_is_integrity_error() {
        let mut sync = StateSynchronizer::new("me", ConflictStrategy::TimestampWins);
        let mut s = remote("a", 1, 10, "idle");
        s.game_stats.insert("hunger".into(), 99.0);
        let err = sync.apply_remote_update("a", &bytes(&s)).unwrap_err();
        assert!(matches!(
            err,
            SyncError::Protocol(ProtocolError::Integrity { .. })
        ));
        assert_eq!(sync.stats().integrity_failures, 1);
        assert!(sync.get_character_state("luna").is_none());
    }

    #[test]
    fn missing_current_state_rejected() {
        let mut sync = StateSynchronizer::new("me", ConflictStrategy::TimestampWins);
        let s = remote("a", 1, 10, "");
        assert!(matches!(
            sync.apply_remote_update("a", &bytes(&s)),
            Err(SyncError::Protocol(ProtocolError::MissingField("currentState")))
        ));
    }

    #[test]
    fn version_ordering() {
        let mut sync = StateSynchronizer::new("me", ConflictStrategy::TimestampWins);
        assert_eq!(
            sync.apply_remote_update("a", &bytes(&remote("a", 3, 10, "idle"))).unwrap(),
            ApplyOutcome::Inserted
        );
        assert_eq!(
            sync.apply_remote_update("a", &bytes(&remote("a", 2, 99, "old"))).unwrap(),
            ApplyOutcome::Stale
        );
        assert_eq!(
            sync.apply_remote_update("a", &bytes(&remote("a", 4, 1, "new"))).unwrap(),
            ApplyOutcome::Accepted
        );
        assert_eq!(
            sync.apply_remote_update("a", &bytes(&remote("a", 4, 1, "new"))).unwrap(),
            ApplyOutcome::Duplicate
        );
        assert_eq!(sync.get_character_state("luna").unwrap().current_state, "new");
    }

    #[test]
    fn highest_version_wins_regardless_of_arrival_order() {
        let updates: Vec<CharacterState> = (1..=6)
            .map(|v| remote("a", v, 100 - v, &format!("s{v}")))
            .collect();
        let orders: [[usize; 6]; 4] = [
            [0, 1, 2, 3, 4, 5],
            [5, 4, 3, 2, 1, 0],
            [2, 5, 0, 3, 1, 4],
            [3, 0, 5, 1, 4, 2],
        ];
        for order in orders {
            let mut sync = StateSynchronizer::new("me", ConflictStrategy::LastWriteWins);
            for i in order {
                sync.apply_remote_update("a", &bytes(&updates[i])).unwrap();
            }
            let s = sync.get_character_state("luna").unwrap();
            assert_eq!(s.version, 6);
            assert_eq!(s.current_state, "s6");
        }
    }

    #[test]
    fn local_update_without_required_fields_is_refused() {
        let mut sync = StateSynchronizer::new("me", ConflictStrategy::TimestampWins);
        let err = sync
            .update_local_state("luna", Position::default(), "idle", "", stats(&[]), stats(&[]))
            .unwrap_err();
        assert!(matches!(err, SyncError::Protocol(ProtocolError::MissingField("currentState"))));
        assert!(sync.get_character_state("luna").is_none());
        assert!(sync.owned_states().is_empty());
        assert!(sync
            .update_local_state("", Position::default(), "idle", "happy", stats(&[]), stats(&[]))
            .is_err());

        let ok = sync
            .update_local_state("luna", Position::default(), "idle", "happy", stats(&[]), stats(&[]))
            .unwrap();
        assert_eq!(ok.version, 1);
        assert!(sync
            .update_local_state("luna", Position::default(), "idle", "", stats(&[]), stats(&[]))
            .is_err());
        assert_eq!(sync.get_character_state("luna").unwrap(), ok);
        assert_eq!(sync.stats().local_updates, 1);
    }

    #[test]
    fn local_update_beats_lower_remote() {
        let mut sync = StateSynchronizer::new("me", ConflictStrategy::LastWriteWins);
        sync.apply_remote_update("a", &bytes(&remote("a", 4, 10, "remote"))).unwrap();
        let local = sync
            .update_local_state("luna", Position::default(), "wave", "local", stats(&[]), stats(&[]))
            .unwrap();
        assert_eq!(local.version, 5);
        assert_eq!(
            sync.apply_remote_update("a", &bytes(&remote("a", 4, 999, "remote"))).unwrap(),
            ApplyOutcome::Stale
        );
        assert_eq!(sync.get_character_state("luna").unwrap().current_state, "local");
    }

    #[test]
    fn equal_version_conflict_goes_through_resolver() {
        let mut sync = StateSynchronizer::new("me", ConflictStrategy::TimestampWins);
        sync.apply_remote_update("a", &bytes(&remote("a", 5, 10, "from-a"))).unwrap();
        assert_eq!(
            sync.apply_remote_update("b", &bytes(&remote("b", 5, 20, "from-b"))).unwrap(),
            ApplyOutcome::ConflictReplaced
        );
        assert_eq!(
            sync.apply_remote_update("c", &bytes(&remote("c", 5, 15, "from-c"))).unwrap(),
            ApplyOutcome::ConflictKept
        );
        assert_eq!(sync.get_character_state("luna").unwrap().current_state, "from-b");
        assert_eq!(
            sync.resolver()
                .resolution_count(ConflictStrategy::TimestampWins, "luna"),
            2
        );
    }

    #[test]
    fn priority_wins_scenario_converges() {
        let mut a = StateSynchronizer::new("peer-a", ConflictStrategy::PriorityWins);
        let mut b = StateSynchronizer::new("peer-b", ConflictStrategy::PriorityWins);
        for s in [&mut a, &mut b] {
            s.set_peer_priority("peer-a", 10);
            s.set_peer_priority("peer-b", 1);
        }
        let mut a_state = None;
        let mut b_state = None;
        for _ in 0..5 {
            a_state = Some(
                a.update_local_state("luna", Position { x: 1.0, y: 1.0 }, "a", "a-state", stats(&[]), stats(&[]))
                    .unwrap(),
            );
            b_state = Some(
                b.update_local_state("luna", Position { x: 9.0, y: 9.0 }, "b", "b-state", stats(&[]), stats(&[]))
                    .unwrap(),
            );
        }
        let a_state = a_state.unwrap();
        let b_state = b_state.unwrap();
        assert_eq!(a_state.version, 5);
        assert_eq!(b_state.version, 5);

        a.apply_remote_update("peer-b", &bytes(&b_state)).unwrap();
        b.apply_remote_update("peer-a", &bytes(&a_state)).unwrap();

        let on_a = a.get_character_state("luna").unwrap();
        let on_b = b.get_character_state("luna").unwrap();
        assert_eq!(on_a, on_b);
        assert_eq!(on_a.current_state, "a-state");
        assert_eq!(on_a.update_source, "peer-a");
    }

    #[test]
    fn sync_interval_bounds() {
        let mut sync = StateSynchronizer::new("me", ConflictStrategy::TimestampWins);
        assert_eq!(sync.sync_interval(), DEFAULT_SYNC_INTERVAL);
        assert!(sync.set_sync_interval(Duration::from_millis(999)).is_err());
        assert!(sync.set_sync_interval(Duration::from_secs(601)).is_err());
        sync.set_sync_interval(Duration::from_secs(1)).unwrap();
        sync.set_sync_interval(Duration::from_secs(600)).unwrap();
        assert_eq!(sync.sync_interval(), Duration::from_secs(600));
    }
}
