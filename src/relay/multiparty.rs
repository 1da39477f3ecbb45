//! # Multiparty Sessions
//!
//! Capacity-bounded conversation sessions with an append-only history.
//! Unlike plain rooms (uncapped), a multiparty session rejects joins beyond
//! its participant cap, and it keeps the conversation transcript for the
//! session-info endpoints.

use crate::error::AppError;
use crate::relay::connection::ConnectionRegistry;
use crate::relay::protocol::ServerMessage;
use crate::relay::room::Participant;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use tracing::{debug, info, warn};

pub const DEFAULT_MAX_PARTICIPANTS: usize = 4;

/// One entry in a session's conversation history.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub speaker_id: String,
    pub content: String,
    /// "text" or "voice"
    pub message_type: String,
    pub timestamp: DateTime<Utc>,
}

struct MultipartySession {
    session_id: String,
    participants: BTreeMap<String, Participant>,
    history: Vec<HistoryEntry>,
    created_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
}

/// Read-only view of a session for the REST surface.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub participants: Vec<Participant>,
    pub history: Vec<HistoryEntry>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

/// What a session broadcast accomplished.
#[derive(Debug, Clone)]
pub struct BroadcastReport {
    pub participants_notified: usize,
    pub evicted: Vec<String>,
}

struct Tables {
    sessions: HashMap<String, MultipartySession>,
    /// identity → session id
    speaker_index: HashMap<String, String>,
}

/// All multiparty sessions in the process.
pub struct MultipartyManager {
    tables: RwLock<Tables>,
    max_participants: usize,
}

impl MultipartyManager {
    pub fn new(max_participants: usize) -> Self {
        Self {
            tables: RwLock::new(Tables {
                sessions: HashMap::new(),
                speaker_index: HashMap::new(),
            }),
            max_participants,
        }
    }

    /// Join `session_id`, creating it lazily.
    ///
    /// Fails with `SessionFull` when the session is at capacity; the failure
    /// leaves all state untouched. An identity already in another session
    /// leaves it first.
    pub fn join(&self, session_id: &str, participant: Participant) -> Result<SessionInfo, AppError> {
        let mut tables = self.tables.write().unwrap();
        let identity = participant.id.clone();

        // Capacity check before any mutation
        if let Some(session) = tables.sessions.get(session_id) {
            if !session.participants.contains_key(&identity)
                && session.participants.len() >= self.max_participants
            {
                return Err(AppError::SessionFull(format!(
                    "session '{}' is full ({} participants)",
                    session_id, self.max_participants
                )));
            }
        }

        if let Some(prior) = tables.speaker_index.get(&identity).cloned() {
            if prior != session_id {
                Self::remove_speaker(&mut tables, &identity, &prior);
            }
        }

        let now = Utc::now();
        let session = tables
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                info!(session_id, "multiparty session created");
                MultipartySession {
                    session_id: session_id.to_string(),
                    participants: BTreeMap::new(),
                    history: Vec::new(),
                    created_at: now,
                    last_activity: now,
                }
            });
        session.participants.insert(identity.clone(), participant);
        session.last_activity = now;
        tables
            .speaker_index
            .insert(identity.clone(), session_id.to_string());

        debug!(session_id, identity, "joined multiparty session");
        Ok(Self::info_of(&tables.sessions[session_id]))
    }

    /// Remove the identity from its session, destroying empty sessions.
    pub fn leave(&self, identity: &str) -> Option<String> {
        let mut tables = self.tables.write().unwrap();
        let session_id = tables.speaker_index.get(identity).cloned()?;
        Self::remove_speaker(&mut tables, identity, &session_id);
        Some(session_id)
    }

    fn remove_speaker(tables: &mut Tables, identity: &str, session_id: &str) {
        tables.speaker_index.remove(identity);
        let empty = match tables.sessions.get_mut(session_id) {
            Some(session) => {
                session.participants.remove(identity);
                session.participants.is_empty()
            }
            None => false,
        };
        if empty {
            tables.sessions.remove(session_id);
            info!(session_id, "multiparty session destroyed (empty)");
        }
    }

    /// Append to the session history and broadcast to the other members.
    ///
    /// Unreachable members are evicted from the session and unregistered.
    pub fn process_message(
        &self,
        registry: &ConnectionRegistry,
        session_id: &str,
        speaker_id: &str,
        content: &str,
        message_type: &str,
        message: &ServerMessage,
    ) -> Result<BroadcastReport, AppError> {
        let recipients = {
            let mut tables = self.tables.write().unwrap();
            let session = tables.sessions.get_mut(session_id).ok_or_else(|| {
                AppError::NotFound(format!("multiparty session '{}' not found", session_id))
            })?;
            session.history.push(HistoryEntry {
                speaker_id: speaker_id.to_string(),
                content: content.to_string(),
                message_type: message_type.to_string(),
                timestamp: Utc::now(),
            });
            session.last_activity = Utc::now();
            session
                .participants
                .keys()
                .filter(|id| id.as_str() != speaker_id)
                .cloned()
                .collect::<Vec<_>>()
        };

        let mut notified = 0;
        let mut evicted = Vec::new();
        for recipient in recipients {
            match registry.send(&recipient, message.clone()) {
                Ok(()) => notified += 1,
                Err(err) => {
                    warn!(session_id, identity = %recipient, %err, "evicting unreachable session member");
                    let mut tables = self.tables.write().unwrap();
                    Self::remove_speaker(&mut tables, &recipient, session_id);
                    drop(tables);
                    registry.unregister(&recipient);
                    evicted.push(recipient);
                }
            }
        }

        Ok(BroadcastReport {
            participants_notified: notified,
            evicted,
        })
    }

    pub fn session_info(&self, session_id: &str) -> Option<SessionInfo> {
        let tables = self.tables.read().unwrap();
        tables.sessions.get(session_id).map(Self::info_of)
    }

    pub fn all_sessions(&self) -> Vec<SessionInfo> {
        let tables = self.tables.read().unwrap();
        let mut infos: Vec<SessionInfo> = tables.sessions.values().map(Self::info_of).collect();
        infos.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        infos
    }

    fn info_of(session: &MultipartySession) -> SessionInfo {
        SessionInfo {
            session_id: session.session_id.clone(),
            participants: session.participants.values().cloned().collect(),
            history: session.history.clone(),
            created_at: session.created_at,
            last_activity: session.last_activity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn participant(id: &str) -> Participant {
        Participant {
            id: id.to_string(),
            name: id.to_string(),
            language: "en".to_string(),
            listen_language: "en".to_string(),
            joined_at: Utc::now(),
        }
    }

    #[test]
    fn join_beyond_capacity_fails_without_mutation() {
        let manager = MultipartyManager::new(4);
        for id in ["a", "b", "c", "d"] {
            manager.join("s1", participant(id)).unwrap();
        }

        let err = manager.join("s1", participant("e")).unwrap_err();
        assert!(matches!(err, AppError::SessionFull(_)));

        let info = manager.session_info("s1").unwrap();
        assert_eq!(info.participants.len(), 4);
        // the rejected joiner was not indexed anywhere
        assert!(manager.leave("e").is_none());
    }

    #[test]
    fn rejoining_same_session_is_not_a_capacity_violation() {
        let manager = MultipartyManager::new(2);
        manager.join("s1", participant("a")).unwrap();
        manager.join("s1", participant("b")).unwrap();
        // "a" re-joins (e.g. after reconnect) without tripping the cap
        assert!(manager.join("s1", participant("a")).is_ok());
    }

    #[test]
    fn history_is_append_only_and_ordered() {
        let manager = MultipartyManager::new(4);
        let connections = ConnectionRegistry::new();
        manager.join("s1", participant("a")).unwrap();

        for i in 0..3 {
            manager
                .process_message(
                    &connections,
                    "s1",
                    "a",
                    &format!("message {}", i),
                    "text",
                    &ServerMessage::Pong { timestamp: i },
                )
                .unwrap();
        }

        let info = manager.session_info("s1").unwrap();
        assert_eq!(info.history.len(), 3);
        assert_eq!(info.history[2].content, "message 2");
    }

    #[test]
    fn empty_sessions_are_destroyed() {
        let manager = MultipartyManager::new(4);
        manager.join("s1", participant("a")).unwrap();
        assert_eq!(manager.leave("a"), Some("s1".to_string()));
        assert!(manager.session_info("s1").is_none());
    }
}
