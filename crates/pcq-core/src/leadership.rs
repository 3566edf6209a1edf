//! Process-local cache of the most recent cluster leadership signal.
//!
//! The election itself happens elsewhere; this only remembers the last grant or
//! revoke it was told about. A fresh tracker is a follower until the first grant.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Payload attached to a grant. Its shape belongs to the election mechanism.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct LeadershipContext(pub Value);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LeadershipEvent {
    Granted { context: LeadershipContext },
    Revoked,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeadershipState {
    Leader { context: LeadershipContext },
    Follower,
}

#[derive(Debug)]
pub struct LeadershipTracker {
    state: RwLock<LeadershipState>,
}

impl Default for LeadershipTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl LeadershipTracker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: RwLock::new(LeadershipState::Follower),
        }
    }

    pub fn on_granted(&self, context: LeadershipContext) {
        *self.state.write() = LeadershipState::Leader { context };
    }

    pub fn on_revoked(&self) {
        *self.state.write() = LeadershipState::Follower;
    }

    pub fn apply(&self, event: LeadershipEvent) {
        match event {
            LeadershipEvent::Granted { context } => self.on_granted(context),
            LeadershipEvent::Revoked => self.on_revoked(),
        }
    }

    #[must_use]
    pub fn is_leader(&self) -> bool {
        matches!(*self.state.read(), LeadershipState::Leader { .. })
    }

    #[must_use]
    pub fn state(&self) -> LeadershipState {
        self.state.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use serde_json::json;

    use super::*;

    fn context(node: &str) -> LeadershipContext {
        LeadershipContext(json!({ "role": "pcq-backend", "node": node }))
    }

    fn granted(node: &str) -> LeadershipEvent {
        LeadershipEvent::Granted {
            context: context(node),
        }
    }

    fn leader(node: &str) -> LeadershipState {
        LeadershipState::Leader {
            context: context(node),
        }
    }

    fn parse_event(value: Value) -> LeadershipEvent {
        match serde_json::from_value(value) {
            Ok(event) => event,
            Err(err) => panic!("leadership event should parse: {err}"),
        }
    }

    #[test]
    fn new_tracker_is_not_leader() {
        let tracker = LeadershipTracker::new();
        assert!(!tracker.is_leader());
        assert_eq!(tracker.state(), LeadershipState::Follower);
    }

    #[test]
    fn grant_then_revoke_toggles_leadership() {
        let tracker = LeadershipTracker::new();
        tracker.on_granted(context("node-a"));
        assert!(tracker.is_leader());
        assert_eq!(tracker.state(), leader("node-a"));

        tracker.on_revoked();
        assert!(!tracker.is_leader());
    }

    #[test]
    fn most_recent_event_wins() {
        let tracker = LeadershipTracker::new();
        tracker.apply(LeadershipEvent::Revoked);
        assert!(!tracker.is_leader());
        tracker.apply(granted("node-a"));
        tracker.apply(granted("node-b"));
        assert_eq!(tracker.state(), leader("node-b"));
        tracker.apply(LeadershipEvent::Revoked);
        tracker.apply(LeadershipEvent::Revoked);
        assert!(!tracker.is_leader());
    }

    #[test]
    fn events_deserialize_from_tagged_json() {
        let granted = parse_event(json!({ "event": "granted", "context": { "term": 4 } }));
        let expected = LeadershipEvent::Granted {
            context: LeadershipContext(json!({ "term": 4 })),
        };
        assert_eq!(granted, expected);

        let revoked = parse_event(json!({ "event": "revoked" }));
        assert_eq!(revoked, LeadershipEvent::Revoked);
    }

    #[test]
    fn shared_tracker_is_visible_across_threads() {
        let tracker = Arc::new(LeadershipTracker::new());
        let writer = Arc::clone(&tracker);
        let handle = thread::spawn(move || writer.on_granted(context("node-c")));
        if let Err(err) = handle.join() {
            panic!("grant thread panicked: {err:?}");
        }
        assert!(tracker.is_leader());
    }
}
