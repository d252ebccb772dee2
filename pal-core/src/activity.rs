//! Activity feed: bounded history of network events for display by collaborators.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::protocol::now_ms;

pub const DEFAULT_MAX_EVENTS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActivityKind {
    Joined,
    Left,
    Discovery,
    Interaction,
    StateChange,
    Conflict,
    Battle,
}

impl ActivityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityKind::Joined => "joined",
            ActivityKind::Left => "left",
            ActivityKind::Discovery => "discovery",
            ActivityKind::Interaction => "interaction",
            ActivityKind::StateChange => "state_change",
            ActivityKind::Conflict => "conflict",
            ActivityKind::Battle => "battle",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub kind: ActivityKind,
    pub peer_id: String,
    pub description: String,
    /// Unix ms.
    pub timestamp: u64,
}

impl ActivityEvent {
    pub fn new(kind: ActivityKind, peer_id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            kind,
            peer_id: peer_id.into(),
            description: description.into(),
            timestamp: now_ms(),
        }
    }
}

/// Ring of the most recent events; oldest dropped first.
#[derive(Debug)]
pub struct ActivityTracker {
    events: VecDeque<ActivityEvent>,
    max_events: usize,
}

impl ActivityTracker {
    /// `max_events == 0` falls back to [`DEFAULT_MAX_EVENTS`].
    pub fn new(max_events: usize) -> Self {
        let max_events = if max_events == 0 {
            DEFAULT_MAX_EVENTS
        } else {
            max_events
        };
        Self {
            events: VecDeque::with_capacity(max_events),
            max_events,
        }
    }

    pub fn add(&mut self, event: ActivityEvent) {
        if self.events.len() == self.max_events {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    /// Up to `count` most recent events, oldest first.
    pub fn recent(&self, count: usize) -> Vec<ActivityEvent> {
        let skip = self.events.len().saturating_sub(count);
        self.events.iter().skip(skip).cloned().collect()
    }

    pub fn by_kind(&self, kind: ActivityKind) -> Vec<ActivityEvent> {
        self.events.iter().filter(|e| e.kind == kind).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_EVENTS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drops_oldest_past_capacity() {
        let mut t = ActivityTracker::new(3);
        for i in 0..5 {
            t.add(ActivityEvent::new(ActivityKind::Joined, format!("p{i}"), "joined"));
        }
        assert_eq!(t.len(), 3);
        let ids: Vec<String> = t.recent(10).into_iter().map(|e| e.peer_id).collect();
        assert_eq!(ids, vec!["p2", "p3", "p4"]);
    }

    #[test]
    fn recent_returns_tail() {
        let mut t = ActivityTracker::default();
        t.add(ActivityEvent::new(ActivityKind::Joined, "a", ""));
        t.add(ActivityEvent::new(ActivityKind::StateChange, "b", ""));
        t.add(ActivityEvent::new(ActivityKind::Left, "a", ""));
        let last_two = t.recent(2);
        assert_eq!(last_two[0].kind, ActivityKind::StateChange);
        assert_eq!(last_two[1].kind, ActivityKind::Left);
        assert!(t.recent(0).is_empty());
        assert_eq!(t.by_kind(ActivityKind::Joined).len(), 1);
    }

    #[test]
    fn zero_capacity_uses_default() {
        let mut t = ActivityTracker::new(0);
        for _ in 0..DEFAULT_MAX_EVENTS + 10 {
            t.add(ActivityEvent::new(ActivityKind::Discovery, "x", ""));
        }
        assert_eq!(t.len(), DEFAULT_MAX_EVENTS);
        t.clear();
        assert!(t.is_empty());
    }
}
