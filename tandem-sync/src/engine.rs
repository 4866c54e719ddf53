//! The synchronization engine: conflict detection and resolution wired to
//! the registries, the version tracker and the dispatcher.
//!
//! ```text
//!              ┌───────────────────────── SyncEngine ─────────────────────────┐
//! session ───► │ validate ──► lock(doc) ──► base == V ? ──► record ──► publish │ ──► all joined sessions
//!              │                               │                              │
//!              │                               └─ no ──► park conflict ───────│ ──► originating session
//!              └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The per-document write lock is held from the version check through the
//! append and the publish of `change-applied`, so acceptance order, log
//! order and notification order are the same total order per document.

use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::broadcast::{mailbox, BroadcastDispatcher, BroadcastStats, EventStream};
use crate::change::{apply_edits, validate_uri, Change, ChangeLimits, DocumentUri};
use crate::conflict::{
    Conflict, ConflictStatus, ConflictTable, LastWriterWins, ResolutionPolicy,
};
use crate::device::{Device, DeviceRegistry, Platform};
use crate::error::SyncError;
use crate::protocol::OutboundEvent;
use crate::session::{Participant, Presence, SessionId, SessionRegistry};
use crate::storage::ChangeStore;
use crate::version::{DocumentSnapshot, DocumentVersionState, VersionTracker};

/// Engine configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum operations in a single change
    pub max_operations_per_change: usize,
    /// Maximum total replacement text per change, in bytes
    pub max_replacement_bytes: usize,
    /// Maximum document URI length, in bytes
    pub max_uri_len: usize,
    /// Undelivered events buffered per session
    pub mailbox_capacity: usize,
    /// Stale resolution attempts before last-writer-wins forces one
    pub max_resolution_attempts: u32,
    /// Conflicts older than this are forced on their next attempt
    pub resolution_timeout_secs: Option<u64>,
    /// Pending conflicts older than this are abandoned
    pub abandon_after_secs: Option<u64>,
    /// Period of the abandon sweep
    pub sweep_interval_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_operations_per_change: 1024,
            max_replacement_bytes: 1024 * 1024,
            max_uri_len: 1024,
            mailbox_capacity: 256,
            max_resolution_attempts: 3,
            resolution_timeout_secs: None,
            abandon_after_secs: None,
            sweep_interval_secs: 30,
        }
    }
}

impl EngineConfig {
    /// Small mailboxes and limits for tests.
    pub fn for_testing() -> Self {
        Self {
            max_operations_per_change: 64,
            max_replacement_bytes: 64 * 1024,
            mailbox_capacity: 64,
            ..Self::default()
        }
    }

    pub fn limits(&self) -> ChangeLimits {
        ChangeLimits {
            max_operations: self.max_operations_per_change,
            max_replacement_bytes: self.max_replacement_bytes,
            max_uri_len: self.max_uri_len,
        }
    }

    fn resolution_timeout(&self) -> Option<Duration> {
        self.resolution_timeout_secs.map(Duration::from_secs)
    }

    fn abandon_after(&self) -> Option<Duration> {
        self.abandon_after_secs.map(Duration::from_secs)
    }
}

/// Result of submitting a change. A version conflict is an outcome, not an
/// error.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// Accepted; `version` is the version it produced
    Applied { version: u64 },
    /// The change id was accepted before, at `version`
    Duplicate { version: u64 },
    /// Stale base; the conflict was sent to the originating session
    Conflicted(Conflict),
}

/// Result of a resolution attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolveOutcome {
    /// The resolution (or the policy's forced version of it) was applied.
    /// `conflict.forced` tells which.
    Applied { version: u64, conflict: Conflict },
    /// The resolution was itself stale; the refreshed conflict was re-sent
    Rejected(Conflict),
}

/// What a session receives on joining a document.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinedDocument {
    pub snapshot: DocumentSnapshot,
    pub participants: Vec<Participant>,
}

pub struct SyncEngine {
    config: EngineConfig,
    tracker: VersionTracker,
    sessions: SessionRegistry,
    devices: DeviceRegistry,
    dispatcher: BroadcastDispatcher,
    conflicts: ConflictTable,
    policy: Box<dyn ResolutionPolicy>,
}

impl SyncEngine {
    /// Engine over an in-memory change store.
    pub fn new(config: EngineConfig) -> Self {
        Self::with_tracker(config, VersionTracker::in_memory())
    }

    /// Engine writing through to `store`.
    pub fn with_store(config: EngineConfig, store: Arc<dyn ChangeStore>) -> Self {
        Self::with_tracker(config, VersionTracker::new(store))
    }

    fn with_tracker(config: EngineConfig, tracker: VersionTracker) -> Self {
        let policy = LastWriterWins {
            max_attempts: config.max_resolution_attempts,
        };
        Self {
            config,
            tracker,
            sessions: SessionRegistry::new(),
            devices: DeviceRegistry::new(),
            dispatcher: BroadcastDispatcher::new(),
            conflicts: ConflictTable::new(),
            policy: Box::new(policy),
        }
    }

    /// Replace the resolution policy.
    pub fn with_policy(mut self, policy: impl ResolutionPolicy + 'static) -> Self {
        self.policy = Box::new(policy);
        self
    }

    /// Load every document held by the change store.
    pub async fn recover(&self) -> Result<usize, SyncError> {
        self.tracker.recover().await
    }

    // ─── Sessions ────────────────────────────────────────────────

    /// Open a session for `user_id`. The returned stream carries every
    /// event addressed to the session.
    pub fn open_session(
        &self,
        user_id: impl Into<String>,
        display_name: impl Into<String>,
    ) -> (Participant, EventStream) {
        let (sink, stream) = mailbox(self.config.mailbox_capacity);
        let participant =
            self.sessions
                .open_session(Uuid::new_v4(), user_id, display_name, sink);
        log::info!(
            "Session {} opened for {}",
            participant.session_id,
            participant.user_id
        );
        (participant, stream)
    }

    /// Join `uri`, returning a consistent snapshot and the participants.
    ///
    /// The session is subscribed before the snapshot is taken, so every
    /// change after the snapshot's version reaches it. Repeat joins are
    /// idempotent and broadcast nothing.
    pub async fn join_document(
        &self,
        session_id: SessionId,
        user_id: &str,
        uri: &str,
    ) -> Result<JoinedDocument, SyncError> {
        validate_uri(uri, self.config.max_uri_len)?;
        let (participant, newly_joined) = self.sessions.join(session_id, user_id, uri)?;

        if newly_joined {
            self.publish(
                uri,
                OutboundEvent::PresenceUpdate {
                    document_uri: uri.to_string(),
                    presence: participant.presence,
                    participant: participant.clone(),
                },
            );
        }
        if let Some(sink) = self.sessions.sink(session_id) {
            self.dispatcher.subscribe(uri, session_id, sink);
        }

        let snapshot = match self.tracker.snapshot(uri).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                if newly_joined {
                    self.sessions.leave(session_id, uri);
                    self.dispatcher.unsubscribe(uri, session_id);
                }
                return Err(e);
            }
        };

        if newly_joined {
            log::info!(
                "{} joined {uri} at version {}",
                participant.user_id,
                snapshot.version
            );
        }
        Ok(JoinedDocument {
            snapshot,
            participants: self.sessions.participants(uri),
        })
    }

    /// Leave `uri`. Returns `false` if the session was not a member.
    pub fn leave_document(&self, session_id: SessionId, uri: &str) -> bool {
        let Some(participant) = self.sessions.leave(session_id, uri) else {
            return false;
        };
        self.dispatcher.unsubscribe(uri, session_id);
        self.publish_presence(uri, participant.clone(), Presence::Offline);
        log::info!("{} left {uri}", participant.user_id);
        true
    }

    /// Update presence and tell every joined document.
    pub fn set_presence(
        &self,
        session_id: SessionId,
        presence: Presence,
    ) -> Result<Participant, SyncError> {
        let participant = self.sessions.set_presence(session_id, presence)?;
        for uri in &participant.joined_documents {
            self.publish_presence(uri, participant.clone(), presence);
        }
        Ok(participant)
    }

    /// Close the session, leaving every document it joined.
    pub fn close_session(&self, session_id: SessionId) -> Option<Participant> {
        let participant = self.sessions.close(session_id)?;
        for uri in &participant.joined_documents {
            self.dispatcher.unsubscribe(uri, session_id);
        }
        for pending in self.conflicts.drain_for_origin(session_id) {
            let mut conflict = pending.conflict;
            conflict.status = ConflictStatus::Abandoned;
            log::debug!(
                "Abandoned conflict {} on {} of closed session {session_id}",
                conflict.conflict_id,
                conflict.document_uri
            );
        }
        log::info!("Session {session_id} of {} closed", participant.user_id);
        for uri in &participant.joined_documents {
            self.publish_presence(uri, participant.clone(), Presence::Offline);
        }
        Some(participant)
    }

    /// Publish to `uri`, then evict whoever could not keep up.
    fn publish(&self, uri: &str, event: OutboundEvent) -> usize {
        let delivered = self.dispatcher.publish(uri, event);
        self.evict_lagging();
        delivered
    }

    /// Close every session that missed an event. Its stream ends after the
    /// events it did receive and the client has to rejoin.
    fn evict_lagging(&self) {
        for session_id in self.dispatcher.take_lagging() {
            if let Some(participant) = self.close_session(session_id) {
                log::warn!(
                    "Evicted lagging session {session_id} of {}",
                    participant.user_id
                );
            }
        }
    }

    fn publish_presence(&self, uri: &str, participant: Participant, presence: Presence) {
        self.publish(
            uri,
            OutboundEvent::PresenceUpdate {
                document_uri: uri.to_string(),
                participant,
                presence,
            },
        );
    }

    // ─── Changes ─────────────────────────────────────────────────

    /// Run `change` through the version gate.
    ///
    /// Exactly one of: applied (broadcast to the document), duplicate
    /// (acknowledged to the originator only), conflicted (conflict sent to
    /// the originator only), or an error.
    pub async fn submit_change(
        &self,
        session_id: SessionId,
        change: Change,
    ) -> Result<SubmitOutcome, SyncError> {
        change.validate_structure(&self.config.limits())?;
        self.require_member(session_id, &change.document_uri)?;

        let uri = change.document_uri.clone();
        let doc = self.tracker.document(&uri).await?;
        let mut state = doc.write().await;

        if let Some(version) = state.version_of(&change.change_id) {
            let accepted = accepted_at(&state, version)?;
            drop(state);
            log::debug!(
                "Change {} on {uri} already applied at version {version}",
                change.change_id
            );
            self.ack_applied(session_id, accepted, version);
            return Ok(SubmitOutcome::Duplicate { version });
        }

        let current = state.current_version;
        if change.base_version == current {
            let change_id = change.change_id;
            let next = apply_edits(state.content(), &change.operations)?;
            let version = self.tracker.record_change(&mut state, change.clone(), next)?;
            self.publish(
                &uri,
                OutboundEvent::ChangeApplied {
                    document_uri: uri.clone(),
                    change,
                    new_version: version,
                },
            );
            drop(state);
            log::debug!("Accepted change on {uri}, now at version {version}");
            for settled in self.conflicts.remove_for_change(&change_id) {
                log::debug!(
                    "Conflict {} on {uri} settled by resubmission",
                    settled.conflict.conflict_id
                );
            }
            return Ok(SubmitOutcome::Applied { version });
        }

        let intervening = state.history_since(change.base_version);
        drop(state);

        let conflict = self
            .conflicts
            .park(Conflict::new(current, change, intervening), session_id);
        log::debug!(
            "Conflict {} on {uri}: base {} against version {current}",
            conflict.conflict_id,
            conflict.incoming_change.base_version
        );
        self.send_conflict(session_id, &conflict);
        Ok(SubmitOutcome::Conflicted(conflict))
    }

    /// Apply a resolution for a pending conflict.
    ///
    /// The resolution must be based on the current version. A stale one
    /// counts as a failed attempt: the policy may force it, otherwise the
    /// conflict is refreshed and sent back.
    pub async fn resolve_conflict(
        &self,
        session_id: SessionId,
        conflict_id: Uuid,
        resolution: Change,
    ) -> Result<ResolveOutcome, SyncError> {
        resolution.validate_structure(&self.config.limits())?;
        self.require_member(session_id, &resolution.document_uri)?;

        let uri = resolution.document_uri.clone();
        let doc = self.tracker.document(&uri).await?;
        let mut state = doc.write().await;

        // Looked up under the document lock so concurrent attempts serialize
        let pending = self
            .conflicts
            .get(&conflict_id)
            .ok_or(SyncError::UnknownConflict(conflict_id))?;
        if pending.origin != session_id {
            return Err(SyncError::validation(format!(
                "conflict {conflict_id} belongs to another session"
            )));
        }
        let mut conflict = pending.conflict;
        if conflict.document_uri != uri {
            return Err(SyncError::validation(format!(
                "conflict {conflict_id} is on {}, not {uri}",
                conflict.document_uri
            )));
        }

        // Settled outside this call: the resolution, or a change that lost
        // under this conflict, was accepted as a plain change
        let settled = std::iter::once(&resolution.change_id)
            .chain(pending.changes.iter())
            .find_map(|id| state.version_of(id));
        if let Some(version) = settled {
            let accepted = accepted_at(&state, version)?;
            drop(state);
            self.conflicts.remove(&conflict_id);
            conflict.resolve(accepted.clone(), false);
            log::debug!("Conflict {conflict_id} on {uri} was already settled at version {version}");
            self.ack_applied(session_id, accepted, version);
            return Ok(ResolveOutcome::Applied { version, conflict });
        }

        let current = state.current_version;
        let (accepted, forced) = if resolution.base_version == current {
            (resolution, false)
        } else {
            conflict.attempts += 1;
            let expired = self
                .config
                .resolution_timeout()
                .is_some_and(|timeout| pending.created_at.elapsed() >= timeout);

            if !self.policy.should_force(&conflict, expired) {
                let intervening = state.history_since(resolution.base_version);
                drop(state);
                conflict.refresh(current, resolution, intervening);
                log::debug!(
                    "Resolution of conflict {conflict_id} on {uri} is stale (attempt {})",
                    conflict.attempts
                );
                self.conflicts.update(conflict.clone());
                self.send_conflict(session_id, &conflict);
                return Ok(ResolveOutcome::Rejected(conflict));
            }
            (self.policy.force(&resolution, &state), true)
        };

        let next = apply_edits(state.content(), &accepted.operations)?;
        let version = self.tracker.record_change(&mut state, accepted.clone(), next)?;
        self.publish(
            &uri,
            OutboundEvent::ChangeApplied {
                document_uri: uri.clone(),
                change: accepted.clone(),
                new_version: version,
            },
        );
        drop(state);

        conflict.resolve(accepted, forced);
        self.conflicts.remove(&conflict_id);
        if forced {
            log::warn!(
                "Forced resolution of conflict {conflict_id} on {uri} by {} after {} attempts",
                self.policy.name(),
                conflict.attempts
            );
        } else {
            log::debug!("Conflict {conflict_id} on {uri} resolved at version {version}");
        }
        Ok(ResolveOutcome::Applied { version, conflict })
    }

    /// Abandon pending conflicts older than `abandon_after`. Returns the
    /// abandoned conflicts; a no-op when abandoning is not configured.
    pub fn abandon_expired(&self, now: Instant) -> Vec<Conflict> {
        let Some(max_age) = self.config.abandon_after() else {
            return Vec::new();
        };
        let abandoned: Vec<Conflict> = self
            .conflicts
            .drain_older_than(max_age, now)
            .into_iter()
            .map(|pending| {
                let mut conflict = pending.conflict;
                conflict.status = ConflictStatus::Abandoned;
                conflict
            })
            .collect();
        if !abandoned.is_empty() {
            log::info!("Abandoned {} expired conflicts", abandoned.len());
        }
        abandoned
    }

    /// Run [`abandon_expired`](Self::abandon_expired) every
    /// `sweep_interval_secs`. `None` when abandoning is not configured. The
    /// task ends once the engine is dropped.
    pub fn spawn_conflict_sweeper(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        self.config.abandon_after()?;
        let period = Duration::from_secs(self.config.sweep_interval_secs.max(1));
        let engine = Arc::downgrade(self);

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                engine.abandon_expired(Instant::now());
            }
        }))
    }

    fn require_member(&self, session_id: SessionId, uri: &str) -> Result<(), SyncError> {
        if self.sessions.participant(session_id).is_none() {
            return Err(SyncError::UnknownSession(session_id));
        }
        if !self.sessions.is_member(session_id, uri) {
            return Err(SyncError::validation(format!(
                "session {session_id} has not joined {uri}"
            )));
        }
        Ok(())
    }

    fn send_conflict(&self, session_id: SessionId, conflict: &Conflict) {
        self.send_to(
            session_id,
            OutboundEvent::ConflictDetected {
                document_uri: conflict.document_uri.clone(),
                conflict: conflict.clone(),
            },
        );
    }

    /// Re-send `change-applied` for an already accepted change to its
    /// submitter only.
    fn ack_applied(&self, session_id: SessionId, change: Change, version: u64) {
        self.send_to(
            session_id,
            OutboundEvent::ChangeApplied {
                document_uri: change.document_uri.clone(),
                change,
                new_version: version,
            },
        );
    }

    /// Session-targeted delivery; a session that went away is only logged.
    fn send_to(&self, session_id: SessionId, event: OutboundEvent) {
        match self.sessions.sink(session_id) {
            Some(sink) => {
                self.dispatcher.send_direct(session_id, &sink, event);
            }
            None => log::debug!("Session {session_id} is gone, event undeliverable"),
        }
        self.evict_lagging();
    }

    // ─── Devices ─────────────────────────────────────────────────

    pub fn register_device(&self, device_id: impl Into<String>, platform: Platform) -> Device {
        self.devices.register(device_id, platform)
    }

    /// Acknowledge that `device_id` has consumed `uri` up to `version`.
    pub async fn mark_synced(
        &self,
        device_id: &str,
        uri: &str,
        version: u64,
    ) -> Result<(), SyncError> {
        let current = self.tracker.current_version(uri).await?;
        if version > current {
            return Err(SyncError::validation(format!(
                "{uri} is at version {current}, cannot acknowledge {version}"
            )));
        }
        self.devices.mark_synced(device_id, uri, version)
    }

    /// Changes `device_id` has not consumed yet for `uri`.
    pub async fn catch_up(&self, device_id: &str, uri: &str) -> Result<Vec<Change>, SyncError> {
        let last = self.devices.last_synced(device_id, uri)?;
        self.tracker.history_since(uri, last).await
    }

    // ─── Queries ─────────────────────────────────────────────────

    pub async fn history_since(&self, uri: &str, version: u64) -> Result<Vec<Change>, SyncError> {
        self.tracker.history_since(uri, version).await
    }

    pub async fn snapshot(&self, uri: &str) -> Result<DocumentSnapshot, SyncError> {
        validate_uri(uri, self.config.max_uri_len)?;
        self.tracker.snapshot(uri).await
    }

    pub async fn current_version(&self, uri: &str) -> Result<u64, SyncError> {
        self.tracker.current_version(uri).await
    }

    pub fn conflict(&self, conflict_id: &Uuid) -> Option<Conflict> {
        self.conflicts.get(conflict_id).map(|pending| pending.conflict)
    }

    /// Pending conflicts on `uri`.
    pub fn pending_conflicts(&self, uri: &str) -> Vec<Conflict> {
        self.conflicts.for_document(uri)
    }

    pub fn participant(&self, session_id: SessionId) -> Option<Participant> {
        self.sessions.participant(session_id)
    }

    pub fn participants(&self, uri: &str) -> Vec<Participant> {
        self.sessions.participants(uri)
    }

    pub fn device(&self, device_id: &str) -> Option<Device> {
        self.devices.device(device_id)
    }

    pub async fn documents(&self) -> Vec<DocumentUri> {
        self.tracker.documents().await
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn broadcast_stats(&self) -> BroadcastStats {
        self.dispatcher.stats()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }
}

/// The accepted change that produced `version`.
fn accepted_at(state: &DocumentVersionState, version: u64) -> Result<Change, SyncError> {
    state
        .history_since(version.saturating_sub(1))
        .into_iter()
        .next()
        .ok_or_else(|| {
            SyncError::InternalInvariant(format!(
                "{} has no change at version {version}",
                state.document_uri
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::TextEdit;
    use crate::conflict::ManualResolution;

    fn insert(uri: &str, base: u64, at: usize, text: &str, author: &str) -> Change {
        Change::new(uri, base, vec![TextEdit::insert(at, text)], author)
    }

    async fn joined(engine: &SyncEngine, user: &str, uri: &str) -> (SessionId, EventStream) {
        let (participant, stream) = engine.open_session(user, user);
        engine
            .join_document(participant.session_id, user, uri)
            .await
            .unwrap();
        (participant.session_id, stream)
    }

    fn drain(stream: &mut EventStream) -> Vec<OutboundEvent> {
        let mut events = Vec::new();
        while let Ok(event) = stream.try_recv() {
            events.push((*event).clone());
        }
        events
    }

    #[tokio::test]
    async fn test_accept_broadcasts_to_all_members() {
        let engine = SyncEngine::new(EngineConfig::for_testing());
        let (alice, mut alice_rx) = joined(&engine, "alice", "doc-1").await;
        let (_bob, mut bob_rx) = joined(&engine, "bob", "doc-1").await;
        drain(&mut alice_rx);

        let outcome = engine
            .submit_change(alice, insert("doc-1", 0, 0, "hi", "alice"))
            .await
            .unwrap();
        assert_eq!(outcome, SubmitOutcome::Applied { version: 1 });

        for rx in [&mut alice_rx, &mut bob_rx] {
            let applied = drain(rx)
                .into_iter()
                .filter(|e| matches!(e, OutboundEvent::ChangeApplied { new_version: 1, .. }))
                .count();
            assert_eq!(applied, 1);
        }
    }

    #[tokio::test]
    async fn test_conflict_goes_to_originator_only() {
        let engine = SyncEngine::new(EngineConfig::for_testing());
        let (alice, mut alice_rx) = joined(&engine, "alice", "doc-1").await;
        let (bob, mut bob_rx) = joined(&engine, "bob", "doc-1").await;

        let winner = insert("doc-1", 0, 0, "a", "alice");
        engine.submit_change(alice, winner.clone()).await.unwrap();
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        let outcome = engine
            .submit_change(bob, insert("doc-1", 0, 0, "b", "bob"))
            .await
            .unwrap();
        let SubmitOutcome::Conflicted(conflict) = outcome else {
            panic!("Expected conflict");
        };
        assert_eq!(conflict.server_version, 1);
        assert_eq!(conflict.intervening_changes, vec![winner]);
        assert_eq!(conflict.status, ConflictStatus::Pending);

        assert!(matches!(
            drain(&mut bob_rx).as_slice(),
            [OutboundEvent::ConflictDetected { .. }]
        ));
        assert!(drain(&mut alice_rx).is_empty());
        assert_eq!(engine.current_version("doc-1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_resubmission_is_idempotent() {
        let engine = SyncEngine::new(EngineConfig::for_testing());
        let (alice, mut rx) = joined(&engine, "alice", "doc-1").await;
        let change = insert("doc-1", 0, 0, "x", "alice");

        engine.submit_change(alice, change.clone()).await.unwrap();
        drain(&mut rx);
        let again = engine.submit_change(alice, change).await.unwrap();
        assert_eq!(again, SubmitOutcome::Duplicate { version: 1 });
        assert_eq!(engine.current_version("doc-1").await.unwrap(), 1);
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [OutboundEvent::ChangeApplied { new_version: 1, .. }]
        ));
    }

    #[tokio::test]
    async fn test_invalid_change_never_reaches_log() {
        let engine = SyncEngine::new(EngineConfig::for_testing());
        let (alice, _rx) = joined(&engine, "alice", "doc-1").await;

        let out_of_bounds = Change::new("doc-1", 0, vec![TextEdit::delete(0, 3)], "alice");
        assert!(matches!(
            engine.submit_change(alice, out_of_bounds).await,
            Err(SyncError::Validation(_))
        ));
        let empty = Change::new("doc-1", 0, vec![], "alice");
        assert!(engine.submit_change(alice, empty).await.is_err());
        assert_eq!(engine.current_version("doc-1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_submit_requires_membership() {
        let engine = SyncEngine::new(EngineConfig::for_testing());
        let (alice, _rx) = engine.open_session("alice", "Alice");
        let err = engine
            .submit_change(alice.session_id, insert("doc-1", 0, 0, "x", "alice"))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));

        let err = engine
            .submit_change(Uuid::new_v4(), insert("doc-1", 0, 0, "x", "alice"))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::UnknownSession(_)));
    }

    #[tokio::test]
    async fn test_resolution_applies_when_rebased() {
        let engine = SyncEngine::new(EngineConfig::for_testing());
        let (alice, _a) = joined(&engine, "alice", "doc-1").await;
        let (bob, _b) = joined(&engine, "bob", "doc-1").await;

        engine.submit_change(alice, insert("doc-1", 0, 0, "a", "alice")).await.unwrap();
        let SubmitOutcome::Conflicted(conflict) = engine
            .submit_change(bob, insert("doc-1", 0, 0, "b", "bob"))
            .await
            .unwrap()
        else {
            panic!("Expected conflict");
        };

        let resolution = insert("doc-1", 1, 1, "b", "bob");
        let outcome = engine
            .resolve_conflict(bob, conflict.conflict_id, resolution)
            .await
            .unwrap();
        let ResolveOutcome::Applied { version, conflict } = outcome else {
            panic!("Expected applied resolution");
        };
        assert_eq!(version, 2);
        assert!(!conflict.forced);
        assert_eq!(conflict.status, ConflictStatus::Resolved);
        assert_eq!(engine.snapshot("doc-1").await.unwrap().content, "ab");
        assert!(engine.pending_conflicts("doc-1").is_empty());
    }

    #[tokio::test]
    async fn test_only_origin_may_resolve() {
        let engine = SyncEngine::new(EngineConfig::for_testing());
        let (alice, _a) = joined(&engine, "alice", "doc-1").await;
        let (bob, _b) = joined(&engine, "bob", "doc-1").await;

        engine.submit_change(alice, insert("doc-1", 0, 0, "a", "alice")).await.unwrap();
        let SubmitOutcome::Conflicted(conflict) = engine
            .submit_change(bob, insert("doc-1", 0, 0, "b", "bob"))
            .await
            .unwrap()
        else {
            panic!("Expected conflict");
        };

        let err = engine
            .resolve_conflict(alice, conflict.conflict_id, insert("doc-1", 1, 0, "c", "alice"))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));

        let err = engine
            .resolve_conflict(bob, Uuid::new_v4(), insert("doc-1", 1, 0, "c", "bob"))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::UnknownConflict(_)));
    }

    #[tokio::test]
    async fn test_resolving_settled_conflict_does_not_reapply() {
        let engine = SyncEngine::new(EngineConfig::for_testing());
        let (alice, _a) = joined(&engine, "alice", "doc-1").await;
        let (bob, mut bob_rx) = joined(&engine, "bob", "doc-1").await;

        engine.submit_change(alice, insert("doc-1", 0, 0, "a", "alice")).await.unwrap();
        let stale = insert("doc-1", 0, 0, "b", "bob");
        let SubmitOutcome::Conflicted(conflict) =
            engine.submit_change(bob, stale.clone()).await.unwrap()
        else {
            panic!("Expected conflict");
        };
        engine.submit_change(bob, stale.rebased(1)).await.unwrap();

        // Record left behind by a submit that raced the resolution
        engine.conflicts.park(conflict.clone(), bob);
        drain(&mut bob_rx);

        let outcome = engine
            .resolve_conflict(bob, conflict.conflict_id, insert("doc-1", 2, 0, "b", "bob"))
            .await
            .unwrap();
        let ResolveOutcome::Applied { version, conflict: settled } = outcome else {
            panic!("Expected applied");
        };
        assert_eq!(version, 2);
        assert_eq!(settled.status, ConflictStatus::Resolved);
        assert_eq!(engine.current_version("doc-1").await.unwrap(), 2);
        assert_eq!(engine.snapshot("doc-1").await.unwrap().content, "ba");
        assert!(engine.pending_conflicts("doc-1").is_empty());

        let events = drain(&mut bob_rx);
        assert!(matches!(
            events.as_slice(),
            [OutboundEvent::ChangeApplied { new_version: 2, .. }]
        ));
    }

    #[tokio::test]
    async fn test_stale_resolution_is_forced_after_max_attempts() {
        let engine = SyncEngine::new(EngineConfig::for_testing());
        let (alice, _a) = joined(&engine, "alice", "doc-1").await;
        let (bob, mut bob_rx) = joined(&engine, "bob", "doc-1").await;

        engine.submit_change(alice, insert("doc-1", 0, 0, "a", "alice")).await.unwrap();
        let SubmitOutcome::Conflicted(conflict) = engine
            .submit_change(bob, insert("doc-1", 0, 0, "b", "bob"))
            .await
            .unwrap()
        else {
            panic!("Expected conflict");
        };
        let id = conflict.conflict_id;

        for attempt in 1..=2 {
            let outcome = engine
                .resolve_conflict(bob, id, insert("doc-1", 0, 0, "b", "bob"))
                .await
                .unwrap();
            let ResolveOutcome::Rejected(refreshed) = outcome else {
                panic!("Expected rejection on attempt {attempt}");
            };
            assert_eq!(refreshed.conflict_id, id);
            assert_eq!(refreshed.attempts, attempt);
        }
        drain(&mut bob_rx);

        let outcome = engine
            .resolve_conflict(bob, id, insert("doc-1", 0, 5, "b", "bob"))
            .await
            .unwrap();
        let ResolveOutcome::Applied { version, conflict } = outcome else {
            panic!("Expected forced resolution");
        };
        assert_eq!(version, 2);
        assert!(conflict.forced);
        assert_eq!(conflict.attempts, 3);
        // Range clamped onto "a"
        assert_eq!(engine.snapshot("doc-1").await.unwrap().content, "ab");
    }

    #[tokio::test]
    async fn test_manual_policy_never_forces() {
        let engine = SyncEngine::new(EngineConfig::for_testing()).with_policy(ManualResolution);
        assert_eq!(engine.policy_name(), "manual");
        let (alice, _a) = joined(&engine, "alice", "doc-1").await;
        let (bob, _b) = joined(&engine, "bob", "doc-1").await;

        engine.submit_change(alice, insert("doc-1", 0, 0, "a", "alice")).await.unwrap();
        let SubmitOutcome::Conflicted(conflict) = engine
            .submit_change(bob, insert("doc-1", 0, 0, "b", "bob"))
            .await
            .unwrap()
        else {
            panic!("Expected conflict");
        };

        for _ in 0..5 {
            let outcome = engine
                .resolve_conflict(bob, conflict.conflict_id, insert("doc-1", 0, 0, "b", "bob"))
                .await
                .unwrap();
            assert!(matches!(outcome, ResolveOutcome::Rejected(_)));
        }
        assert_eq!(engine.current_version("doc-1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_timed_out_conflict_is_forced() {
        let config = EngineConfig {
            resolution_timeout_secs: Some(0),
            ..EngineConfig::for_testing()
        };
        let engine = SyncEngine::new(config);
        let (alice, _a) = joined(&engine, "alice", "doc-1").await;
        let (bob, _b) = joined(&engine, "bob", "doc-1").await;

        engine.submit_change(alice, insert("doc-1", 0, 0, "a", "alice")).await.unwrap();
        let SubmitOutcome::Conflicted(conflict) = engine
            .submit_change(bob, insert("doc-1", 0, 0, "b", "bob"))
            .await
            .unwrap()
        else {
            panic!("Expected conflict");
        };

        let outcome = engine
            .resolve_conflict(bob, conflict.conflict_id, insert("doc-1", 0, 0, "b", "bob"))
            .await
            .unwrap();
        assert!(matches!(outcome, ResolveOutcome::Applied { conflict, .. } if conflict.forced));
    }

    #[tokio::test]
    async fn test_abandon_expired() {
        let config = EngineConfig {
            abandon_after_secs: Some(60),
            ..EngineConfig::for_testing()
        };
        let engine = SyncEngine::new(config);
        let (alice, _a) = joined(&engine, "alice", "doc-1").await;
        let (bob, _b) = joined(&engine, "bob", "doc-1").await;

        engine.submit_change(alice, insert("doc-1", 0, 0, "a", "alice")).await.unwrap();
        engine.submit_change(bob, insert("doc-1", 0, 0, "b", "bob")).await.unwrap();
        assert_eq!(engine.pending_conflicts("doc-1").len(), 1);

        assert!(engine.abandon_expired(Instant::now()).is_empty());
        let abandoned = engine.abandon_expired(Instant::now() + Duration::from_secs(61));
        assert_eq!(abandoned.len(), 1);
        assert_eq!(abandoned[0].status, ConflictStatus::Abandoned);
        assert!(engine.pending_conflicts("doc-1").is_empty());
    }

    #[tokio::test]
    async fn test_join_broadcasts_presence_and_leave_is_noop_twice() {
        let engine = SyncEngine::new(EngineConfig::for_testing());
        let (_alice, mut alice_rx) = joined(&engine, "alice", "doc-1").await;
        let (bob, _b) = joined(&engine, "bob", "doc-1").await;

        let events = drain(&mut alice_rx);
        assert!(events.iter().any(|e| matches!(
            e,
            OutboundEvent::PresenceUpdate { participant, presence: Presence::Online, .. }
                if participant.user_id == "bob"
        )));

        assert!(engine.leave_document(bob, "doc-1"));
        assert!(!engine.leave_document(bob, "doc-1"));
        assert!(drain(&mut alice_rx).iter().any(|e| matches!(
            e,
            OutboundEvent::PresenceUpdate { presence: Presence::Offline, .. }
        )));
        assert_eq!(engine.participants("doc-1").len(), 1);
    }

    #[tokio::test]
    async fn test_repeat_join_returns_same_snapshot() {
        let engine = SyncEngine::new(EngineConfig::for_testing());
        let (alice, _rx) = joined(&engine, "alice", "doc-1").await;
        engine.submit_change(alice, insert("doc-1", 0, 0, "x", "alice")).await.unwrap();

        let first = engine.join_document(alice, "alice", "doc-1").await.unwrap();
        let second = engine.join_document(alice, "alice", "doc-1").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.snapshot.version, 1);
        assert_eq!(first.participants.len(), 1);
    }

    #[tokio::test]
    async fn test_device_catch_up() {
        let engine = SyncEngine::new(EngineConfig::for_testing());
        let (alice, _rx) = joined(&engine, "alice", "doc-1").await;
        for v in 0..4 {
            engine.submit_change(alice, insert("doc-1", v, 0, "x", "alice")).await.unwrap();
        }

        engine.register_device("phone", Platform::Mobile);
        assert_eq!(engine.catch_up("phone", "doc-1").await.unwrap().len(), 4);

        engine.mark_synced("phone", "doc-1", 3).await.unwrap();
        let missed = engine.catch_up("phone", "doc-1").await.unwrap();
        assert_eq!(missed.len(), 1);
        assert_eq!(missed[0].base_version, 3);

        assert!(matches!(
            engine.mark_synced("phone", "doc-1", 9).await,
            Err(SyncError::Validation(_))
        ));
        assert!(matches!(
            engine.mark_synced("phone", "doc-1", 1).await,
            Err(SyncError::StaleAck { .. })
        ));
    }

    #[tokio::test]
    async fn test_close_session_leaves_documents() {
        let engine = SyncEngine::new(EngineConfig::for_testing());
        let (alice, _a) = joined(&engine, "alice", "doc-1").await;
        let (_bob, mut bob_rx) = joined(&engine, "bob", "doc-1").await;
        drain(&mut bob_rx);

        let closed = engine.close_session(alice).unwrap();
        assert!(closed.joined_documents.contains("doc-1"));
        assert_eq!(engine.session_count(), 1);
        assert!(matches!(
            drain(&mut bob_rx).as_slice(),
            [OutboundEvent::PresenceUpdate { presence: Presence::Offline, .. }]
        ));
    }

    #[tokio::test]
    async fn test_set_presence_reaches_joined_documents() {
        let engine = SyncEngine::new(EngineConfig::for_testing());
        let (alice, _a) = joined(&engine, "alice", "doc-1").await;
        let (_bob, mut bob_rx) = joined(&engine, "bob", "doc-1").await;
        drain(&mut bob_rx);

        engine.set_presence(alice, Presence::Away).unwrap();
        assert!(matches!(
            drain(&mut bob_rx).as_slice(),
            [OutboundEvent::PresenceUpdate { presence: Presence::Away, .. }]
        ));
    }
}
