//! Conflict resolver: picks a winner between two equal-version updates to one character.

use std::collections::HashMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::protocol::now_ms;
use crate::sync::CharacterState;

/// Resolution policy, selected per deployment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictStrategy {
    /// Later `last_update` wins; ties go to the lexically greater update source.
    #[default]
    TimestampWins,
    /// Higher configured peer priority wins (unconfigured = 0); ties fall back to timestamp.
    PriorityWins,
    /// The incoming update always wins.
    LastWriteWins,
}

impl ConflictStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictStrategy::TimestampWins => "timestamp-wins",
            ConflictStrategy::PriorityWins => "priority-wins",
            ConflictStrategy::LastWriteWins => "last-write-wins",
        }
    }
}

impl std::fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown conflict strategy: {0}")]
pub struct UnknownStrategy(pub String);

impl FromStr for ConflictStrategy {
    type Err = UnknownStrategy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "timestamp-wins" => Ok(ConflictStrategy::TimestampWins),
            "priority-wins" => Ok(ConflictStrategy::PriorityWins),
            "last-write-wins" => Ok(ConflictStrategy::LastWriteWins),
            other => Err(UnknownStrategy(other.to_string())),
        }
    }
}

/// Which side of a conflict was kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Winner {
    Local,
    Incoming,
}

/// Record of one resolved conflict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub character_id: String,
    pub winner: Winner,
    pub winning_peer: String,
    pub losing_peer: String,
    pub strategy: ConflictStrategy,
    /// Unix ms.
    pub resolved_at: u64,
}

/// Holds only the priority map and resolution counters besides the strategy.
#[derive(Debug, Default)]
pub struct ConflictResolver {
    strategy: ConflictStrategy,
    priorities: HashMap<String, i32>,
    counts: HashMap<(ConflictStrategy, String), u64>,
    last: HashMap<String, Resolution>,
}

impl ConflictResolver {
    pub fn new(strategy: ConflictStrategy) -> Self {
        Self {
            strategy,
            ..Self::default()
        }
    }

    pub fn strategy(&self) -> ConflictStrategy {
        self.strategy
    }

    pub fn set_strategy(&mut self, strategy: ConflictStrategy) {
        self.strategy = strategy;
    }

    pub fn set_peer_priority(&mut self, peer_id: impl Into<String>, priority: i32) {
        self.priorities.insert(peer_id.into(), priority);
    }

    /// Configured priority, 0 when unset.
    pub fn priority(&self, peer_id: &str) -> i32 {
        self.priorities.get(peer_id).copied().unwrap_or(0)
    }

    /// Resolve a conflict between the stored state and an incoming one of equal version.
    pub fn resolve(&mut self, local: &CharacterState, incoming: &CharacterState) -> Winner {
        let winner = match self.strategy {
            ConflictStrategy::TimestampWins => timestamp_winner(local, incoming),
            ConflictStrategy::PriorityWins => {
                let lp = self.priority(&local.update_source);
                let ip = self.priority(&incoming.update_source);
                match ip.cmp(&lp) {
                    std::cmp::Ordering::Greater => Winner::Incoming,
                    std::cmp::Ordering::Less => Winner::Local,
                    std::cmp::Ordering::Equal => timestamp_winner(local, incoming),
                }
            }
            ConflictStrategy::LastWriteWins => Winner::Incoming,
        };
        let (won, lost) = match winner {
            Winner::Local => (local, incoming),
            Winner::Incoming => (incoming, local),
        };
        *self
            .counts
            .entry((self.strategy, local.character_id.clone()))
            .or_insert(0) += 1;
        self.last.insert(
            local.character_id.clone(),
            Resolution {
                character_id: local.character_id.clone(),
                winner,
                winning_peer: won.update_source.clone(),
                losing_peer: lost.update_source.clone(),
                strategy: self.strategy,
                resolved_at: now_ms(),
            },
        );
        winner
    }

    /// Resolutions performed for one character under one strategy.
    pub fn resolution_count(&self, strategy: ConflictStrategy, character_id: &str) -> u64 {
        self.counts
            .get(&(strategy, character_id.to_string()))
            .copied()
            .unwrap_or(0)
    }

    pub fn total_resolutions(&self) -> u64 {
        self.counts.values().sum()
    }

    pub fn last_resolution(&self, character_id: &str) -> Option<&Resolution> {
        self.last.get(character_id)
    }
}

fn timestamp_winner(local: &CharacterState, incoming: &CharacterState) -> Winner {
    match incoming.last_update.cmp(&local.last_update) {
        std::cmp::Ordering::Greater => Winner::Incoming,
        std::cmp::Ordering::Less => Winner::Local,
        std::cmp::Ordering::Equal if incoming.update_source > local.update_source => {
            Winner::Incoming
        }
        std::cmp::Ordering::Equal => Winner::Local,
    }
}
