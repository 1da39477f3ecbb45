//! # Rooms
//!
//! Room membership and per-participant language preferences. The registry
//! owns two indexes that are always mutated together under one lock: the
//! room table (code → room) and the member index (identity → room code), so
//! an identity is in at most one room at any time.
//!
//! ## Key Features:
//! - **Implicit leave on join**: joining a new room atomically leaves the old
//! - **Synchronous destruction**: a room with zero participants is removed
//! - **Broadcast with eviction**: unreachable members are removed mid-send

use crate::relay::connection::ConnectionRegistry;
use crate::relay::protocol::ServerMessage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use tracing::{debug, info, warn};

/// One member of a room.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    pub name: String,
    /// Language the participant speaks
    pub language: String,
    /// Language the participant wants to receive
    pub listen_language: String,
    pub joined_at: DateTime<Utc>,
}

struct Room {
    code: String,
    /// BTreeMap keeps member snapshots deterministically ordered by identity
    participants: BTreeMap<String, Participant>,
    created_at: DateTime<Utc>,
    message_count: u64,
}

/// Membership snapshot handed back from `join`.
#[derive(Debug, Clone)]
pub struct RoomSnapshot {
    pub room_code: String,
    pub members: Vec<Participant>,
}

/// Room listing entry for the REST surface.
#[derive(Debug, Clone, Serialize)]
pub struct RoomOverview {
    pub room_code: String,
    pub member_count: usize,
    pub created_at: DateTime<Utc>,
    pub message_count: u64,
}

struct Tables {
    rooms: HashMap<String, Room>,
    /// identity → room code
    member_index: HashMap<String, String>,
}

/// All rooms in the process, plus the identity→room index.
///
/// ## Thread Safety:
/// Every mutation happens inside one synchronous method holding the write
/// lock; no method awaits while holding it.
pub struct RoomRegistry {
    tables: RwLock<Tables>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables {
                rooms: HashMap::new(),
                member_index: HashMap::new(),
            }),
        }
    }

    /// Add `participant` to `room_code`, creating the room lazily.
    ///
    /// If the identity is already in another room it leaves that room first,
    /// atomically with the join. Returns the post-join snapshot and the code
    /// of the room that was left, if any.
    pub fn join(&self, room_code: &str, participant: Participant) -> (RoomSnapshot, Option<String>) {
        let mut tables = self.tables.write().unwrap();
        let identity = participant.id.clone();

        let prior = tables.member_index.get(&identity).cloned();
        let left = match prior {
            Some(ref prior_code) if prior_code != room_code => {
                Self::remove_member(&mut tables, &identity, prior_code);
                Some(prior_code.clone())
            }
            _ => None,
        };

        let room = tables
            .rooms
            .entry(room_code.to_string())
            .or_insert_with(|| {
                info!(room_code, "room created");
                Room {
                    code: room_code.to_string(),
                    participants: BTreeMap::new(),
                    created_at: Utc::now(),
                    message_count: 0,
                }
            });
        room.participants.insert(identity.clone(), participant);
        tables
            .member_index
            .insert(identity.clone(), room_code.to_string());

        let snapshot = RoomSnapshot {
            room_code: room_code.to_string(),
            members: tables.rooms[room_code].participants.values().cloned().collect(),
        };
        debug!(room_code, identity, members = snapshot.members.len(), "participant joined room");
        (snapshot, left)
    }

    /// Remove the identity from whatever room it is in.
    ///
    /// Returns the room code that was left, or `None` if the identity was
    /// not in any room.
    pub fn leave(&self, identity: &str) -> Option<String> {
        let mut tables = self.tables.write().unwrap();
        let room_code = tables.member_index.get(identity).cloned()?;
        Self::remove_member(&mut tables, identity, &room_code);
        Some(room_code)
    }

    /// Remove the identity from `room_code` specifically.
    ///
    /// Returns false if the identity was not a member of that room.
    pub fn leave_room(&self, identity: &str, room_code: &str) -> bool {
        let mut tables = self.tables.write().unwrap();
        match tables.member_index.get(identity) {
            Some(current) if current == room_code => {
                Self::remove_member(&mut tables, identity, room_code);
                true
            }
            _ => false,
        }
    }

    fn remove_member(tables: &mut Tables, identity: &str, room_code: &str) {
        tables.member_index.remove(identity);
        let empty = match tables.rooms.get_mut(room_code) {
            Some(room) => {
                room.participants.remove(identity);
                room.participants.is_empty()
            }
            None => false,
        };
        if empty {
            tables.rooms.remove(room_code);
            info!(room_code, "room destroyed (last participant left)");
        }
        debug!(room_code, identity, "participant left room");
    }

    /// Ordered membership snapshot, or `None` if the room does not exist.
    pub fn members(&self, room_code: &str) -> Option<Vec<Participant>> {
        let tables = self.tables.read().unwrap();
        tables
            .rooms
            .get(room_code)
            .map(|room| room.participants.values().cloned().collect())
    }

    /// Which room the identity is in, if any.
    pub fn room_of(&self, identity: &str) -> Option<String> {
        self.tables.read().unwrap().member_index.get(identity).cloned()
    }

    /// Update the identity's language preferences in place.
    ///
    /// Returns false if the identity is not in any room.
    pub fn set_languages(&self, identity: &str, spoken: &str, listen: &str) -> bool {
        let mut tables = self.tables.write().unwrap();
        let room_code = match tables.member_index.get(identity) {
            Some(code) => code.clone(),
            None => return false,
        };
        if let Some(participant) = tables
            .rooms
            .get_mut(&room_code)
            .and_then(|room| room.participants.get_mut(identity))
        {
            participant.language = spoken.to_string();
            participant.listen_language = listen.to_string();
            debug!(identity, spoken, listen, "languages updated");
            true
        } else {
            false
        }
    }

    /// Bump the room's relayed-message counter.
    pub fn record_message(&self, room_code: &str) {
        let mut tables = self.tables.write().unwrap();
        if let Some(room) = tables.rooms.get_mut(room_code) {
            room.message_count += 1;
        }
    }

    pub fn active_rooms(&self) -> Vec<RoomOverview> {
        let tables = self.tables.read().unwrap();
        let mut overviews: Vec<RoomOverview> = tables
            .rooms
            .values()
            .map(|room| RoomOverview {
                room_code: room.code.clone(),
                member_count: room.participants.len(),
                created_at: room.created_at,
                message_count: room.message_count,
            })
            .collect();
        overviews.sort_by(|a, b| a.room_code.cmp(&b.room_code));
        overviews
    }

    pub fn room_count(&self) -> usize {
        self.tables.read().unwrap().rooms.len()
    }

    /// Deliver `message` to every member of `room_code` except `exclude`.
    ///
    /// Members whose delivery fails are evicted: removed from the room and
    /// unregistered from `registry`. Returns the evicted identities so the
    /// caller can announce them.
    pub fn broadcast(
        &self,
        registry: &ConnectionRegistry,
        room_code: &str,
        message: &ServerMessage,
        exclude: Option<&str>,
    ) -> Vec<String> {
        let members = match self.members(room_code) {
            Some(members) => members,
            None => return Vec::new(),
        };

        let mut evicted = Vec::new();
        for member in members {
            if Some(member.id.as_str()) == exclude {
                continue;
            }
            if let Err(err) = registry.send(&member.id, message.clone()) {
                warn!(room_code, identity = %member.id, %err, "evicting unreachable participant");
                self.leave_room(&member.id, room_code);
                registry.unregister(&member.id);
                evicted.push(member.id);
            }
        }
        evicted
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn participant(id: &str, language: &str) -> Participant {
        Participant {
            id: id.to_string(),
            name: id.to_string(),
            language: language.to_string(),
            listen_language: language.to_string(),
            joined_at: Utc::now(),
        }
    }

    #[test]
    fn join_then_leave_destroys_empty_room() {
        let registry = RoomRegistry::new();
        let (snapshot, left) = registry.join("room-1", participant("alice", "en"));
        assert_eq!(snapshot.members.len(), 1);
        assert!(left.is_none());

        assert_eq!(registry.leave("alice"), Some("room-1".to_string()));
        assert_eq!(registry.room_count(), 0);
        assert!(registry.members("room-1").is_none());
    }

    #[test]
    fn joining_second_room_leaves_the_first() {
        let registry = RoomRegistry::new();
        registry.join("room-1", participant("alice", "en"));
        let (_, left) = registry.join("room-2", participant("alice", "en"));

        assert_eq!(left, Some("room-1".to_string()));
        assert_eq!(registry.room_of("alice"), Some("room-2".to_string()));
        // room-1 emptied out and was destroyed
        assert!(registry.members("room-1").is_none());
    }

    #[test]
    fn members_are_ordered_by_identity() {
        let registry = RoomRegistry::new();
        registry.join("room-1", participant("carol", "fr"));
        registry.join("room-1", participant("alice", "en"));
        registry.join("room-1", participant("bob", "es"));

        let ids: Vec<String> = registry
            .members("room-1")
            .unwrap()
            .into_iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(ids, vec!["alice", "bob", "carol"]);
    }

    #[test]
    fn set_languages_updates_in_place() {
        let registry = RoomRegistry::new();
        registry.join("room-1", participant("alice", "en"));
        assert!(registry.set_languages("alice", "de", "fr"));

        let members = registry.members("room-1").unwrap();
        assert_eq!(members[0].language, "de");
        assert_eq!(members[0].listen_language, "fr");
        assert!(!registry.set_languages("ghost", "en", "en"));
    }

    #[test]
    fn broadcast_evicts_unreachable_members() {
        let rooms = RoomRegistry::new();
        let connections = ConnectionRegistry::new();

        let (alice_tx, mut alice_rx) = mpsc::unbounded_channel();
        let (bob_tx, bob_rx) = mpsc::unbounded_channel();
        connections.register("alice", alice_tx);
        connections.register("bob", bob_tx);
        drop(bob_rx); // bob's socket died

        rooms.join("room-1", participant("alice", "en"));
        rooms.join("room-1", participant("bob", "es"));

        let evicted = rooms.broadcast(
            &connections,
            "room-1",
            &ServerMessage::Pong { timestamp: 9 },
            None,
        );

        assert_eq!(evicted, vec!["bob"]);
        assert!(alice_rx.try_recv().is_ok());
        assert!(!connections.is_connected("bob"));
        assert_eq!(
            rooms.members("room-1").unwrap().len(),
            1,
            "bob should be gone from the room"
        );
    }

    #[test]
    fn broadcast_excludes_the_sender() {
        let rooms = RoomRegistry::new();
        let connections = ConnectionRegistry::new();

        let (alice_tx, mut alice_rx) = mpsc::unbounded_channel();
        connections.register("alice", alice_tx);
        rooms.join("room-1", participant("alice", "en"));

        rooms.broadcast(
            &connections,
            "room-1",
            &ServerMessage::Pong { timestamp: 1 },
            Some("alice"),
        );
        assert!(alice_rx.try_recv().is_err());
    }
}
