//! # Subscriber Registry
//!
//! In-memory store of every light peer's filter criteria plus the health
//! bookkeeping used to decide whether the peer is still worth pushing to.
//!
//! ```text
//! SubscriberRegistry
//!   peers: DashMap<PeerId, PeerEntry {
//!       topics: pubsub_topic -> {content_topic, ...},
//!       health: PeerHealth,
//!   }>
//! ```
//!
//! ## Concurrency
//!
//! The map is sharded: a peer's entry is guarded by its shard lock, so
//! mutations of one peer are serialized while peers in other shards proceed
//! in parallel. Every public operation touches at most one entry under one
//! lock, so no caller can observe a half-updated peer. [`items`] walks the
//! shards one read-lock at a time and returns an owned snapshot, which keeps
//! the dispatcher from holding locks while it spawns pushes.
//!
//! ## Eviction
//!
//! A single `timeout` drives two rules:
//!
//! | Rule | Condition | Applied by |
//! |------|-----------|------------|
//! | Unreachable | failure streak started ≥ `timeout` ago | `flag_as_failure`, `prune_expired` |
//! | Inactive | `last_seen` ≥ `timeout` ago | `prune_expired` |
//!
//! The unreachable rule can be switched off; the inactivity rule cannot.
//! Subscribe, ping and successful pushes refresh `last_seen`.
//!
//! [`items`]: SubscriberRegistry::items

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::debug;

use crate::identity::PeerId;

/// Default inactivity/unreachability timeout.
pub const DEFAULT_SUBSCRIPTION_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Returned when removing state a peer does not have.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoSubscriptionError;

impl std::fmt::Display for NoSubscriptionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "peer has no subscriptions")
    }
}

impl std::error::Error for NoSubscriptionError {}

/// Liveness bookkeeping for one subscribed peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerHealth {
    /// Last subscribe, ping or successful push.
    pub last_seen: Instant,
    pub last_success: Option<Instant>,
    /// Start of the current failure streak.
    pub failing_since: Option<Instant>,
    pub consecutive_failures: u32,
}

impl PeerHealth {
    fn new(now: Instant) -> Self {
        Self {
            last_seen: now,
            last_success: None,
            failing_since: None,
            consecutive_failures: 0,
        }
    }

    pub fn is_failing(&self) -> bool {
        self.failing_since.is_some()
    }
}

struct PeerEntry {
    topics: HashMap<String, HashSet<String>>,
    health: PeerHealth,
}

impl PeerEntry {
    fn new(now: Instant) -> Self {
        Self {
            topics: HashMap::new(),
            health: PeerHealth::new(now),
        }
    }

    fn criteria_count(&self) -> usize {
        self.topics.values().map(HashSet::len).sum()
    }

    fn unreachable_for(&self, now: Instant, timeout: Duration) -> bool {
        self.health
            .failing_since
            .is_some_and(|since| now.saturating_duration_since(since) >= timeout)
    }

    fn inactive_for(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.health.last_seen) >= timeout
    }
}

pub struct SubscriberRegistry {
    peers: DashMap<PeerId, PeerEntry>,
    timeout: Duration,
    evict_unreachable: bool,
}

impl SubscriberRegistry {
    pub fn new(timeout: Duration) -> Self {
        Self {
            peers: DashMap::new(),
            timeout,
            evict_unreachable: true,
        }
    }

    /// Enable or disable removal of peers that keep failing pushes.
    pub fn with_unreachable_eviction(mut self, enabled: bool) -> Self {
        self.evict_unreachable = enabled;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn has(&self, peer: &PeerId) -> bool {
        self.peers.contains_key(peer)
    }

    /// Owned snapshot of a peer's full subscription set.
    pub fn get(&self, peer: &PeerId) -> Option<HashMap<String, HashSet<String>>> {
        self.peers.get(peer).map(|entry| entry.topics.clone())
    }

    /// Total content topics held by `peer` across all pubsub topics.
    pub fn criteria_count(&self, peer: &PeerId) -> usize {
        self.peers.get(peer).map_or(0, |entry| entry.criteria_count())
    }

    /// How many of `content_topics` `peer` does not yet hold under `pubsub_topic`.
    pub fn count_new_criteria(&self, peer: &PeerId, pubsub_topic: &str, content_topics: &[String]) -> usize {
        let requested: HashSet<&str> = content_topics.iter().map(String::as_str).collect();
        match self.peers.get(peer) {
            Some(entry) => match entry.topics.get(pubsub_topic) {
                Some(existing) => requested
                    .into_iter()
                    .filter(|ct| !existing.contains(*ct))
                    .count(),
                None => requested.len(),
            },
            None => requested.len(),
        }
    }

    /// Union-insert `content_topics` under `pubsub_topic`. Caps are the caller's job.
    pub fn set(&self, peer: PeerId, pubsub_topic: &str, content_topics: &[String]) {
        if content_topics.is_empty() {
            return;
        }
        let now = Instant::now();
        let mut entry = self.peers.entry(peer).or_insert_with(|| PeerEntry::new(now));
        entry.health.last_seen = now;
        entry
            .topics
            .entry(pubsub_topic.to_string())
            .or_default()
            .extend(content_topics.iter().cloned());
    }

    /// Remove `content_topics` from `peer`'s criteria under `pubsub_topic`.
    ///
    /// Fails when the peer or the pubsub topic is unknown, or when none of the
    /// content topics were subscribed. Emptied sets and peers are dropped.
    pub fn delete(
        &self,
        peer: &PeerId,
        pubsub_topic: &str,
        content_topics: &[String],
    ) -> Result<(), NoSubscriptionError> {
        let Entry::Occupied(mut occupied) = self.peers.entry(*peer) else {
            return Err(NoSubscriptionError);
        };

        let topics = &mut occupied.get_mut().topics;
        let set = topics.get_mut(pubsub_topic).ok_or(NoSubscriptionError)?;
        let removed = content_topics
            .iter()
            .filter(|ct| set.remove(ct.as_str()))
            .count();
        if removed == 0 {
            return Err(NoSubscriptionError);
        }

        if set.is_empty() {
            topics.remove(pubsub_topic);
        }
        if topics.is_empty() {
            occupied.remove();
        }
        Ok(())
    }

    pub fn delete_all(&self, peer: &PeerId) -> Result<(), NoSubscriptionError> {
        self.peers.remove(peer).map(|_| ()).ok_or(NoSubscriptionError)
    }

    /// Number of distinct subscribed peers.
    pub fn count(&self) -> usize {
        self.peers.len()
    }

    /// Snapshot of every peer subscribed to exactly (`pubsub_topic`, `content_topic`).
    pub fn items(&self, pubsub_topic: &str, content_topic: &str) -> std::vec::IntoIter<PeerId> {
        let matching: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|entry| {
                entry
                    .topics
                    .get(pubsub_topic)
                    .is_some_and(|set| set.contains(content_topic))
            })
            .map(|entry| *entry.key())
            .collect();
        matching.into_iter()
    }

    /// Record client activity. Returns `false` if the peer is not subscribed.
    pub fn refresh(&self, peer: &PeerId) -> bool {
        match self.peers.get_mut(peer) {
            Some(mut entry) => {
                entry.health.last_seen = Instant::now();
                true
            }
            None => false,
        }
    }

    pub fn health(&self, peer: &PeerId) -> Option<PeerHealth> {
        self.peers.get(peer).map(|entry| entry.health)
    }

    pub fn flag_as_success(&self, peer: &PeerId) {
        if let Some(mut entry) = self.peers.get_mut(peer) {
            let now = Instant::now();
            let health = &mut entry.health;
            health.last_seen = now;
            health.last_success = Some(now);
            health.failing_since = None;
            health.consecutive_failures = 0;
        }
    }

    /// Record a failed push. Returns `true` if the peer was evicted as unreachable.
    pub fn flag_as_failure(&self, peer: &PeerId) -> bool {
        let Entry::Occupied(mut occupied) = self.peers.entry(*peer) else {
            return false;
        };

        let now = Instant::now();
        let entry = occupied.get_mut();
        entry.health.consecutive_failures = entry.health.consecutive_failures.saturating_add(1);
        entry.health.failing_since.get_or_insert(now);

        if self.evict_unreachable && entry.unreachable_for(now, self.timeout) {
            let failures = entry.health.consecutive_failures;
            occupied.remove();
            debug!(
                peer = %peer.short(),
                failures,
                "evicted unreachable subscriber"
            );
            return true;
        }
        false
    }

    /// Remove inactive peers (and unreachable ones, when enabled).
    pub fn prune_expired(&self) -> Vec<PeerId> {
        let now = Instant::now();
        let mut expired = Vec::new();
        self.peers.retain(|peer, entry| {
            let unreachable = self.evict_unreachable && entry.unreachable_for(now, self.timeout);
            if unreachable || entry.inactive_for(now, self.timeout) {
                expired.push(*peer);
                false
            } else {
                true
            }
        });
        expired
    }
}

impl Default for SubscriberRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIPTION_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(seed: u8) -> PeerId {
        PeerId::from_bytes([seed; 32])
    }

    fn topics(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    const TOPIC: &str = "/strainer/1/default";

    #[test]
    fn set_creates_peer_and_unions_topics() {
        let registry = SubscriberRegistry::default();
        let p = peer(1);
        assert!(!registry.has(&p));

        registry.set(p, TOPIC, &topics(&["a", "b"]));
        registry.set(p, TOPIC, &topics(&["b", "c"]));
        registry.set(p, "/other", &topics(&["a"]));

        assert!(registry.has(&p));
        assert_eq!(registry.count(), 1);
        assert_eq!(registry.criteria_count(&p), 4);

        let snapshot = registry.get(&p).unwrap();
        assert_eq!(snapshot[TOPIC].len(), 3);
        assert!(snapshot["/other"].contains("a"));
    }

    #[test]
    fn set_is_idempotent() {
        let registry = SubscriberRegistry::default();
        let p = peer(1);
        registry.set(p, TOPIC, &topics(&["a", "b"]));
        let once = registry.get(&p).unwrap();

        registry.set(p, TOPIC, &topics(&["a", "b"]));
        assert_eq!(registry.get(&p).unwrap(), once);
        assert_eq!(registry.criteria_count(&p), 2);
        assert_eq!(registry.count_new_criteria(&p, TOPIC, &topics(&["a", "b"])), 0);
    }

    #[test]
    fn set_with_no_content_topics_creates_nothing() {
        let registry = SubscriberRegistry::default();
        registry.set(peer(1), TOPIC, &[]);
        assert!(!registry.has(&peer(1)));
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn count_new_criteria_ignores_duplicates() {
        let registry = SubscriberRegistry::default();
        let p = peer(1);
        assert_eq!(registry.count_new_criteria(&p, TOPIC, &topics(&["a", "a", "b"])), 2);

        registry.set(p, TOPIC, &topics(&["a"]));
        assert_eq!(registry.count_new_criteria(&p, TOPIC, &topics(&["a", "b"])), 1);
        assert_eq!(registry.count_new_criteria(&p, "/other", &topics(&["a"])), 1);
    }

    #[test]
    fn partial_delete_keeps_remaining_topics() {
        let registry = SubscriberRegistry::default();
        let p = peer(1);
        registry.set(p, TOPIC, &topics(&["a", "b"]));

        registry.delete(&p, TOPIC, &topics(&["a"])).unwrap();

        assert!(registry.has(&p));
        let snapshot = registry.get(&p).unwrap();
        assert_eq!(snapshot[TOPIC], HashSet::from(["b".to_string()]));
    }

    #[test]
    fn deleting_last_topic_removes_peer() {
        let registry = SubscriberRegistry::default();
        let p = peer(1);
        registry.set(p, TOPIC, &topics(&["a"]));
        registry.set(p, "/other", &topics(&["x"]));

        registry.delete(&p, TOPIC, &topics(&["a"])).unwrap();
        assert!(registry.has(&p));
        assert!(!registry.get(&p).unwrap().contains_key(TOPIC));

        registry.delete(&p, "/other", &topics(&["x"])).unwrap();
        assert!(!registry.has(&p));
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn delete_of_unknown_state_fails() {
        let registry = SubscriberRegistry::default();
        let p = peer(1);
        assert_eq!(registry.delete(&p, TOPIC, &topics(&["a"])), Err(NoSubscriptionError));

        registry.set(p, TOPIC, &topics(&["a"]));
        assert_eq!(registry.delete(&p, "/other", &topics(&["a"])), Err(NoSubscriptionError));
        assert_eq!(registry.delete(&p, TOPIC, &topics(&["zzz"])), Err(NoSubscriptionError));
        assert_eq!(registry.criteria_count(&p), 1);
    }

    #[test]
    fn delete_all_then_again_fails() {
        let registry = SubscriberRegistry::default();
        let p = peer(1);
        registry.set(p, TOPIC, &topics(&["a", "b"]));

        assert!(registry.delete_all(&p).is_ok());
        assert!(!registry.has(&p));
        assert_eq!(registry.delete_all(&p), Err(NoSubscriptionError));
    }

    #[test]
    fn items_matches_exact_pair() {
        let registry = SubscriberRegistry::default();
        registry.set(peer(1), TOPIC, &topics(&["c1"]));
        registry.set(peer(2), TOPIC, &topics(&["c1", "c2"]));
        registry.set(peer(3), "/other", &topics(&["c1"]));

        let mut matched: Vec<PeerId> = registry.items(TOPIC, "c1").collect();
        matched.sort();
        assert_eq!(matched, vec![peer(1), peer(2)]);

        let matched: Vec<PeerId> = registry.items(TOPIC, "c2").collect();
        assert_eq!(matched, vec![peer(2)]);

        assert_eq!(registry.items(TOPIC, "c3").count(), 0);
        assert_eq!(registry.items("/missing", "c1").count(), 0);
    }

    #[test]
    fn items_is_a_snapshot() {
        let registry = SubscriberRegistry::default();
        registry.set(peer(1), TOPIC, &topics(&["c1"]));

        let snapshot = registry.items(TOPIC, "c1");
        registry.delete_all(&peer(1)).unwrap();
        registry.set(peer(2), TOPIC, &topics(&["c1"]));

        assert_eq!(snapshot.collect::<Vec<_>>(), vec![peer(1)]);
        assert_eq!(registry.items(TOPIC, "c1").collect::<Vec<_>>(), vec![peer(2)]);
    }

    #[test]
    fn success_clears_failure_streak() {
        let registry = SubscriberRegistry::new(Duration::from_secs(3600));
        let p = peer(1);
        registry.set(p, TOPIC, &topics(&["a"]));

        assert!(!registry.flag_as_failure(&p));
        assert!(!registry.flag_as_failure(&p));
        let health = registry.health(&p).unwrap();
        assert_eq!(health.consecutive_failures, 2);
        assert!(health.is_failing());

        registry.flag_as_success(&p);
        let health = registry.health(&p).unwrap();
        assert_eq!(health.consecutive_failures, 0);
        assert!(!health.is_failing());
        assert!(health.last_success.is_some());
    }

    #[test]
    fn failing_longer_than_timeout_evicts() {
        let registry = SubscriberRegistry::new(Duration::ZERO);
        let p = peer(1);
        registry.set(p, TOPIC, &topics(&["a"]));

        assert!(registry.flag_as_failure(&p));
        assert!(!registry.has(&p));
        assert!(!registry.flag_as_failure(&p));
    }

    #[test]
    fn unreachable_eviction_can_be_disabled() {
        let registry = SubscriberRegistry::new(Duration::ZERO).with_unreachable_eviction(false);
        let p = peer(1);
        registry.set(p, TOPIC, &topics(&["a"]));

        assert!(!registry.flag_as_failure(&p));
        assert!(registry.has(&p));
        assert_eq!(registry.health(&p).unwrap().consecutive_failures, 1);
    }

    #[test]
    fn flags_on_unknown_peer_are_ignored() {
        let registry = SubscriberRegistry::default();
        registry.flag_as_success(&peer(9));
        assert!(!registry.flag_as_failure(&peer(9)));
        assert!(!registry.refresh(&peer(9)));
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn prune_removes_inactive_peers() {
        let registry = SubscriberRegistry::new(Duration::from_millis(30));
        registry.set(peer(1), TOPIC, &topics(&["a"]));
        registry.set(peer(2), TOPIC, &topics(&["a"]));

        std::thread::sleep(Duration::from_millis(50));
        assert!(registry.refresh(&peer(2)));

        let expired = registry.prune_expired();
        assert_eq!(expired, vec![peer(1)]);
        assert!(!registry.has(&peer(1)));
        assert!(registry.has(&peer(2)));
    }

    #[test]
    fn prune_keeps_fresh_peers() {
        let registry = SubscriberRegistry::new(Duration::from_secs(3600));
        registry.set(peer(1), TOPIC, &topics(&["a"]));
        assert!(!registry.flag_as_failure(&peer(1)));

        assert!(registry.prune_expired().is_empty());
        assert!(registry.has(&peer(1)));
    }

    #[test]
    fn concurrent_writers_on_distinct_peers() {
        let registry = SubscriberRegistry::default();

        std::thread::scope(|scope| {
            for t in 0..8u8 {
                let registry = &registry;
                scope.spawn(move || {
                    for i in 0..50u8 {
                        let mut bytes = [0u8; 32];
                        bytes[0] = t;
                        bytes[1] = i;
                        let p = PeerId::from_bytes(bytes);
                        registry.set(p, TOPIC, &topics(&["a", "b"]));
                        let _ = registry.items(TOPIC, "a").count();
                        if i % 2 == 0 {
                            registry.delete(&p, TOPIC, &topics(&["a", "b"])).unwrap();
                        }
                    }
                });
            }
        });

        assert_eq!(registry.count(), 8 * 25);
        assert_eq!(registry.items(TOPIC, "b").count(), 8 * 25);
    }

    #[test]
    fn concurrent_writers_on_same_peer_serialize() {
        let registry = SubscriberRegistry::default();
        let p = peer(7);

        std::thread::scope(|scope| {
            for t in 0..8 {
                let registry = &registry;
                scope.spawn(move || {
                    for i in 0..25 {
                        registry.set(p, TOPIC, &[format!("ct-{t}-{i}")]);
                    }
                });
            }
        });

        assert_eq!(registry.count(), 1);
        assert_eq!(registry.criteria_count(&p), 200);
    }
}
