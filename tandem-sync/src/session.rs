//! Session registry: live connection scopes, their document memberships and
//! presence.
//!
//! Two keyed maps, never locked at the same time:
//! ```text
//! sessions: session_id ──► { participant, sink }
//! members:  document   ──► { session_id, … }
//! ```
//! Every method drops the guard of one map before touching the other, so
//! the shard locks cannot deadlock against each other.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use uuid::Uuid;

use crate::broadcast::EventSink;
use crate::change::DocumentUri;
use crate::error::SyncError;

pub type SessionId = Uuid;
pub type UserId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Presence {
    Online,
    Away,
    Offline,
}

/// A session as seen by other participants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub display_name: String,
    pub presence: Presence,
    pub joined_documents: BTreeSet<DocumentUri>,
}

struct SessionEntry {
    participant: Participant,
    sink: EventSink,
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, SessionEntry>,
    members: DashMap<DocumentUri, HashSet<SessionId>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection scope. Re-opening an existing session only
    /// replaces its sink.
    pub fn open_session(
        &self,
        session_id: SessionId,
        user_id: impl Into<UserId>,
        display_name: impl Into<String>,
        sink: EventSink,
    ) -> Participant {
        let mut entry = self
            .sessions
            .entry(session_id)
            .or_insert_with(|| SessionEntry {
                participant: Participant {
                    session_id,
                    user_id: user_id.into(),
                    display_name: display_name.into(),
                    presence: Presence::Online,
                    joined_documents: BTreeSet::new(),
                },
                sink: sink.clone(),
            });
        entry.sink = sink;
        entry.participant.clone()
    }

    /// Add `uri` to the session's memberships.
    ///
    /// Returns the participant and whether the membership is new.
    pub fn join(
        &self,
        session_id: SessionId,
        user_id: &str,
        uri: &str,
    ) -> Result<(Participant, bool), SyncError> {
        let (participant, newly_joined) = {
            let mut entry = self
                .sessions
                .get_mut(&session_id)
                .ok_or(SyncError::UnknownSession(session_id))?;
            if entry.participant.user_id != user_id {
                return Err(SyncError::validation(format!(
                    "session {session_id} belongs to {}, not {user_id}",
                    entry.participant.user_id
                )));
            }
            let newly_joined = entry.participant.joined_documents.insert(uri.to_string());
            (entry.participant.clone(), newly_joined)
        };

        if newly_joined {
            self.members
                .entry(uri.to_string())
                .or_default()
                .insert(session_id);
        }
        Ok((participant, newly_joined))
    }

    /// Remove `uri` from the session's memberships. `None` if it was not a
    /// member.
    pub fn leave(&self, session_id: SessionId, uri: &str) -> Option<Participant> {
        let participant = {
            let mut entry = self.sessions.get_mut(&session_id)?;
            if !entry.participant.joined_documents.remove(uri) {
                return None;
            }
            entry.participant.clone()
        };
        self.remove_member(uri, session_id);
        Some(participant)
    }

    pub fn set_presence(
        &self,
        session_id: SessionId,
        presence: Presence,
    ) -> Result<Participant, SyncError> {
        let mut entry = self
            .sessions
            .get_mut(&session_id)
            .ok_or(SyncError::UnknownSession(session_id))?;
        entry.participant.presence = presence;
        Ok(entry.participant.clone())
    }

    /// Drop the session and all of its memberships.
    ///
    /// The returned participant still lists the documents it was joined to.
    pub fn close(&self, session_id: SessionId) -> Option<Participant> {
        let (_, entry) = self.sessions.remove(&session_id)?;
        let mut participant = entry.participant;
        for uri in &participant.joined_documents {
            self.remove_member(uri, session_id);
        }
        participant.presence = Presence::Offline;
        Some(participant)
    }

    fn remove_member(&self, uri: &str, session_id: SessionId) {
        if let Some(mut members) = self.members.get_mut(uri) {
            members.remove(&session_id);
        }
        self.members.remove_if(uri, |_, members| members.is_empty());
    }

    pub fn participant(&self, session_id: SessionId) -> Option<Participant> {
        self.sessions
            .get(&session_id)
            .map(|entry| entry.participant.clone())
    }

    pub fn sink(&self, session_id: SessionId) -> Option<EventSink> {
        self.sessions.get(&session_id).map(|entry| entry.sink.clone())
    }

    pub fn is_member(&self, session_id: SessionId, uri: &str) -> bool {
        self.members
            .get(uri)
            .is_some_and(|members| members.contains(&session_id))
    }

    /// Participants currently joined to `uri`.
    pub fn participants(&self, uri: &str) -> Vec<Participant> {
        let ids: Vec<SessionId> = match self.members.get(uri) {
            Some(members) => members.iter().copied().collect(),
            None => return Vec::new(),
        };
        let mut participants: Vec<Participant> = ids
            .into_iter()
            .filter_map(|id| self.participant(id))
            .collect();
        participants.sort_by_key(|p| p.session_id);
        participants
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
