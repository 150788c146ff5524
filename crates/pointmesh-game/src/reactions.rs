//! Reaction expiry deadlines, at most one per player.
//!
//! Deadlines are wall-clock unix milliseconds so that every peer expires a
//! reaction at roughly the same moment, whenever it learned about it.

use std::collections::HashMap;

use pointmesh_protocol::PeerId;

/// How long to keep a reaction that originated at `origin` and is first
/// seen at `now`: whatever is left of `ttl`, but never less than `floor`.
pub fn remaining_ttl(ttl: u64, floor: u64, origin: u64, now: u64) -> u64 {
    let elapsed = now.saturating_sub(origin);
    ttl.saturating_sub(elapsed).max(floor)
}

/// Pending reaction expiries keyed by player.
#[derive(Debug, Default)]
pub struct ReactionTimers {
    deadlines: HashMap<PeerId, u64>,
}

impl ReactionTimers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the timer for `peer`, replacing any pending one.
    pub fn schedule(&mut self, peer: &PeerId, deadline: u64) -> Option<u64> {
        self.deadlines.insert(peer.clone(), deadline)
    }

    pub fn cancel(&mut self, peer: &PeerId) -> bool {
        self.deadlines.remove(peer).is_some()
    }

    pub fn deadline(&self, peer: &PeerId) -> Option<u64> {
        self.deadlines.get(peer).copied()
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.deadlines.values().copied().min()
    }

    /// Remove and return every player whose deadline is at or before `now`.
    pub fn take_due(&mut self, now: u64) -> Vec<PeerId> {
        let mut due: Vec<PeerId> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(peer, _)| peer.clone())
            .collect();
        due.sort();
        for peer in &due {
            self.deadlines.remove(peer);
        }
        due
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }

    pub fn clear(&mut self) {
        self.deadlines.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remaining_ttl_counts_from_origin() {
        assert_eq!(remaining_ttl(5000, 100, 10_000, 10_000), 5000);
        assert_eq!(remaining_ttl(5000, 100, 10_000, 13_000), 2000);
        assert_eq!(remaining_ttl(5000, 100, 10_000, 14_950), 100);
        assert_eq!(remaining_ttl(5000, 100, 10_000, 60_000), 100);
    }

    #[test]
    fn remaining_ttl_tolerates_origin_in_the_future() {
        assert_eq!(remaining_ttl(5000, 100, 20_000, 19_000), 5000);
    }

    #[test]
    fn rescheduling_replaces_the_pending_timer() {
        let mut timers = ReactionTimers::new();
        let peer = PeerId::from("a");
        assert_eq!(timers.schedule(&peer, 100), None);
        assert_eq!(timers.schedule(&peer, 300), Some(100));
        assert_eq!(timers.len(), 1);
        assert_eq!(timers.deadline(&peer), Some(300));
    }

    #[test]
    fn take_due_only_returns_expired_players() {
        let mut timers = ReactionTimers::new();
        timers.schedule(&PeerId::from("b"), 200);
        timers.schedule(&PeerId::from("a"), 100);
        timers.schedule(&PeerId::from("c"), 900);

        assert_eq!(timers.next_deadline(), Some(100));
        assert_eq!(timers.take_due(200), vec![PeerId::from("a"), PeerId::from("b")]);
        assert_eq!(timers.next_deadline(), Some(900));
        assert!(timers.take_due(899).is_empty());
    }

    #[test]
    fn cancel_disarms() {
        let mut timers = ReactionTimers::new();
        let peer = PeerId::from("a");
        timers.schedule(&peer, 100);
        assert!(timers.cancel(&peer));
        assert!(!timers.cancel(&peer));
        assert!(timers.is_empty());
    }
}
