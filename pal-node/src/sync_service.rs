//! Drives a [`StateSynchronizer`] over the network manager: immediate broadcast of local
//! changes, periodic re-broadcast of owned characters, and intake of remote state-sync
//! messages.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use pal_core::{
    ActivityEvent, ActivityKind, ApplyOutcome, CharacterState, ConflictStrategy, Envelope,
    MessageType, Position, RejectReason, StateSynchronizer, SyncError, SyncStats,
};
use tokio::sync::{watch, Mutex};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::handler::MessageHandler;
use crate::manager::NetworkManager;
use crate::peers::PeerInfo;

struct Inner {
    sync: Mutex<StateSynchronizer>,
    network: Arc<NetworkManager>,
    interval_tx: watch::Sender<Duration>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl Inner {
    fn broadcast(&self, state: &CharacterState) {
        if let Err(err) = self.network.send_payload(state, None) {
            warn!(character = %state.character_id, error = %err, "state broadcast not queued");
        }
    }

    /// Re-broadcast every locally owned character, changed or not.
    async fn broadcast_owned(&self) -> usize {
        let owned = self.sync.lock().await.owned_states();
        for state in &owned {
            self.broadcast(state);
        }
        owned.len()
    }

    async fn apply(&self, envelope: &Envelope, from: &PeerInfo) -> Result<ApplyOutcome, SyncError> {
        let outcome = match self.sync.lock().await.apply_remote_update(&from.id, &envelope.payload) {
            Ok(outcome) => outcome,
            Err(SyncError::Protocol(err)) => {
                self.network.record_rejection(&from.id, RejectReason::from(&err));
                return Err(SyncError::Protocol(err));
            }
            Err(err) => return Err(err),
        };
        match outcome {
            ApplyOutcome::Inserted | ApplyOutcome::Accepted => {
                self.network.record_activity(ActivityEvent::new(
                    ActivityKind::StateChange,
                    &from.id,
                    "character state updated",
                ));
            }
            ApplyOutcome::ConflictKept | ApplyOutcome::ConflictReplaced => {
                info!(peer = %from.id, ?outcome, "state conflict resolved");
                self.network.record_activity(ActivityEvent::new(
                    ActivityKind::Conflict,
                    &from.id,
                    format!("{outcome:?}"),
                ));
            }
            ApplyOutcome::Stale | ApplyOutcome::Duplicate => {}
        }
        Ok(outcome)
    }
}

/// Holds a weak reference so the manager's handler table does not keep the service alive.
struct StateSyncHandler {
    inner: Weak<Inner>,
}

#[async_trait]
impl MessageHandler for StateSyncHandler {
    async fn handle(&self, envelope: Envelope, from: PeerInfo) -> anyhow::Result<()> {
        let Some(inner) = self.inner.upgrade() else {
            return Ok(());
        };
        inner.apply(&envelope, &from).await?;
        Ok(())
    }
}

async fn periodic_loop(inner: Arc<Inner>, mut interval_rx: watch::Receiver<Duration>) {
    let period = *interval_rx.borrow_and_update();
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            changed = interval_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let period = *interval_rx.borrow_and_update();
                ticker = interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                debug!(?period, "sync interval changed");
            }
            _ = ticker.tick() => {
                let sent = inner.broadcast_owned().await;
                debug!(characters = sent, "periodic state broadcast");
            }
        }
    }
}

/// Character-state synchronization over a [`NetworkManager`].
pub struct SyncService {
    inner: Arc<Inner>,
}

impl SyncService {
    pub fn new(
        network: Arc<NetworkManager>,
        strategy: ConflictStrategy,
        priorities: &HashMap<String, i32>,
    ) -> Self {
        let mut sync = StateSynchronizer::new(network.local_peer_id(), strategy);
        for (peer, priority) in priorities {
            sync.set_peer_priority(peer.clone(), *priority);
        }
        let (interval_tx, _) = watch::channel(sync.sync_interval());
        Self {
            inner: Arc::new(Inner {
                sync: Mutex::new(sync),
                network,
                interval_tx,
                cancel: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
        }
    }

    /// Register the state-sync handler and start the periodic broadcast.
    pub fn start(&self) {
        self.inner.network.register_handler(
            MessageType::StateSync,
            StateSyncHandler {
                inner: Arc::downgrade(&self.inner),
            },
        );
        let rx = self.inner.interval_tx.subscribe();
        self.inner
            .tracker
            .spawn(periodic_loop(Arc::clone(&self.inner), rx));
    }

    pub async fn stop(&self) {
        self.inner.cancel.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
    }

    /// Apply a local change and broadcast the new state right away. A full delivery queue
    /// is logged, not returned; the next periodic broadcast carries the state.
    pub async fn update_local_state(
        &self,
        character_id: &str,
        position: Position,
        animation: &str,
        current_state: &str,
        game_stats: BTreeMap<String, f64>,
        romance_stats: BTreeMap<String, f64>,
    ) -> Result<CharacterState, SyncError> {
        let state = self.inner.sync.lock().await.update_local_state(
            character_id,
            position,
            animation,
            current_state,
            game_stats,
            romance_stats,
        )?;
        self.inner.broadcast(&state);
        Ok(state)
    }

    pub async fn get_character_state(&self, character_id: &str) -> Option<CharacterState> {
        self.inner.sync.lock().await.get_character_state(character_id)
    }

    pub async fn character_ids(&self) -> Vec<String> {
        self.inner.sync.lock().await.character_ids()
    }

    /// Takes effect on the running broadcast loop immediately.
    pub async fn set_sync_interval(&self, interval: Duration) -> Result<(), SyncError> {
        self.inner.sync.lock().await.set_sync_interval(interval)?;
        self.inner.interval_tx.send_replace(interval);
        Ok(())
    }

    pub async fn sync_interval(&self) -> Duration {
        self.inner.sync.lock().await.sync_interval()
    }

    pub async fn set_peer_priority(&self, peer_id: &str, priority: i32) {
        self.inner.sync.lock().await.set_peer_priority(peer_id, priority);
    }

    pub async fn stats(&self) -> SyncStats {
        self.inner.sync.lock().await.stats()
    }

    /// Broadcast every owned character now; returns how many were queued or attempted.
    pub async fn broadcast_now(&self) -> usize {
        self.inner.broadcast_owned().await
    }
}
