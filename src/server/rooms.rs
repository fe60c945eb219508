//! Room registry: in-process map of active rooms with TTL eviction.
//!
//! Rooms are strictly two-occupant rendezvous points. The registry is
//! only ever touched by the signaling hub behind its mutex, so none of
//! this needs interior synchronization. Time is passed in explicitly so
//! eviction is testable without sleeping.

use crate::core::config::{MAX_PEERS_PER_ROOM, ROOM_TTL};
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// A live room: creation time plus the set of member peer handles.
#[derive(Debug)]
pub struct Room {
    pub created_at: Instant,
    pub peers: HashSet<String>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    Exists,
}

#[derive(Debug, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined,
    NotFound,
    Full,
}

/// All active rooms, keyed by room id.
#[derive(Debug)]
pub struct RoomRegistry {
    rooms: HashMap<String, Room>,
    max_peers: usize,
    ttl: Duration,
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::with_limits(MAX_PEERS_PER_ROOM, ROOM_TTL)
    }
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(max_peers: usize, ttl: Duration) -> Self {
        Self {
            rooms: HashMap::new(),
            max_peers,
            ttl,
        }
    }

    /// Register a new room with `by_peer` as its first member.
    /// Creation is not idempotent: an existing id is refused.
    pub fn create(&mut self, room_id: &str, by_peer: &str, now: Instant) -> CreateOutcome {
        if self.rooms.contains_key(room_id) {
            return CreateOutcome::Exists;
        }
        let mut peers = HashSet::new();
        peers.insert(by_peer.to_string());
        self.rooms.insert(
            room_id.to_string(),
            Room {
                created_at: now,
                peers,
            },
        );
        debug!(event = "room_created", room = room_id, peer = by_peer);
        CreateOutcome::Created
    }

    /// Add a peer to an existing room, refusing once it is at capacity.
    pub fn join(&mut self, room_id: &str, peer: &str) -> JoinOutcome {
        match self.rooms.get_mut(room_id) {
            None => JoinOutcome::NotFound,
            Some(room) if room.peers.contains(peer) => JoinOutcome::Joined,
            Some(room) if room.peers.len() >= self.max_peers => JoinOutcome::Full,
            Some(room) => {
                room.peers.insert(peer.to_string());
                JoinOutcome::Joined
            }
        }
    }

    /// Remove a peer from every room it is in, deleting rooms that
    /// become empty. Returns the ids of rooms the peer actually left.
    pub fn leave(&mut self, peer: &str) -> Vec<String> {
        let mut left = Vec::new();
        self.rooms.retain(|id, room| {
            if room.peers.remove(peer) {
                left.push(id.clone());
            }
            if room.peers.is_empty() {
                debug!(event = "room_emptied", room = %id);
                false
            } else {
                true
            }
        });
        left
    }

    /// Delete rooms older than the configured TTL. Returns how many
    /// were evicted.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let before = self.rooms.len();
        let ttl = self.ttl;
        self.rooms
            .retain(|_, room| now.duration_since(room.created_at) <= ttl);
        let evicted = before - self.rooms.len();
        if evicted > 0 {
            info!(event = "room_sweep", evicted, remaining = self.rooms.len());
        }
        evicted
    }

    pub fn contains(&self, room_id: &str) -> bool {
        self.rooms.contains_key(room_id)
    }

    pub fn is_member(&self, room_id: &str, peer: &str) -> bool {
        self.rooms
            .get(room_id)
            .map(|r| r.peers.contains(peer))
            .unwrap_or(false)
    }

    /// Members of a room, or an empty vec for a missing room.
    pub fn members(&self, room_id: &str) -> Vec<String> {
        self.rooms
            .get(room_id)
            .map(|r| r.peers.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn member_count(&self, room_id: &str) -> usize {
        self.rooms.get(room_id).map(|r| r.peers.len()).unwrap_or(0)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

/// Receivers that announced interest in a room but have not yet been
/// admitted by the sender. At most one pending room per peer; a newer
/// request supersedes the old one.
#[derive(Debug, Default)]
pub struct PendingJoins {
    by_peer: HashMap<String, String>,
}

impl PendingJoins {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, peer: &str, room_id: &str) {
        self.by_peer.insert(peer.to_string(), room_id.to_string());
    }

    /// Whether `peer` has a pending join for exactly this room.
    pub fn matches(&self, peer: &str, room_id: &str) -> bool {
        self.by_peer.get(peer).map(String::as_str) == Some(room_id)
    }

    /// Clear a pending join; returns whether one existed for this room.
    pub fn clear(&mut self, peer: &str, room_id: &str) -> bool {
        if self.matches(peer, room_id) {
            self.by_peer.remove(peer);
            true
        } else {
            false
        }
    }

    /// Drop any pending join the peer holds (disconnect path).
    pub fn forget_peer(&mut self, peer: &str) {
        self.by_peer.remove(peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_create_is_not_idempotent() {
        let mut reg = RoomRegistry::new();
        let now = Instant::now();
        assert_eq!(reg.create("r1", "a", now), CreateOutcome::Created);
        assert_eq!(reg.create("r1", "b", now), CreateOutcome::Exists);
        assert_eq!(reg.members("r1"), vec!["a".to_string()]);
    }

    #[test]
    fn test_join_capacity() {
        let mut reg = RoomRegistry::new();
        reg.create("r1", "a", Instant::now());
        assert_eq!(reg.join("r1", "b"), JoinOutcome::Joined);
        assert_eq!(reg.join("r1", "c"), JoinOutcome::Full);
        assert_eq!(reg.join("nope", "c"), JoinOutcome::NotFound);
        assert_eq!(reg.member_count("r1"), 2);
    }

    #[test]
    fn test_rejoin_is_idempotent() {
        let mut reg = RoomRegistry::new();
        reg.create("r1", "a", Instant::now());
        reg.join("r1", "b");
        // A member re-joining a full room is a no-op, not a Full error.
        assert_eq!(reg.join("r1", "b"), JoinOutcome::Joined);
        assert_eq!(reg.member_count("r1"), 2);
    }

    #[test]
    fn test_leave_deletes_empty_rooms() {
        let mut reg = RoomRegistry::new();
        let now = Instant::now();
        reg.create("r1", "a", now);
        reg.join("r1", "b");
        assert_eq!(reg.leave("a"), vec!["r1".to_string()]);
        assert!(reg.contains("r1"));
        assert_eq!(reg.leave("b"), vec!["r1".to_string()]);
        assert!(!reg.contains("r1"));
    }

    #[test]
    fn test_sweep_evicts_expired_rooms() {
        let mut reg = RoomRegistry::new();
        let t0 = Instant::now();
        reg.create("old", "a", t0);
        reg.create("new", "b", t0 + ROOM_TTL);
        let evicted = reg.sweep(t0 + ROOM_TTL + Duration::from_secs(1));
        assert_eq!(evicted, 1);
        assert!(!reg.contains("old"));
        assert!(reg.contains("new"));
    }

    #[test]
    fn test_pending_joins() {
        let mut pending = PendingJoins::new();
        pending.register("p", "r1");
        assert!(pending.matches("p", "r1"));
        assert!(!pending.matches("p", "r2"));
        assert!(!pending.clear("p", "r2"));
        assert!(pending.clear("p", "r1"));
        assert!(!pending.matches("p", "r1"));

        pending.register("p", "r1");
        pending.register("p", "r2");
        assert!(!pending.matches("p", "r1"));
        assert!(pending.matches("p", "r2"));
        pending.forget_peer("p");
        assert!(!pending.matches("p", "r2"));
    }
}
