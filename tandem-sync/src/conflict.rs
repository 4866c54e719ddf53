//! Conflict records and resolution policy.
//!
//! ```text
//!            ┌──────────── resolution rebased onto current ───────────┐
//!            │                                                        ▼
//! RECEIVED ──┼── base == current ──► VALID ──► APPLIED          RESOLVED ──► APPLIED
//!            │                                                        ▲
//!            └── base != current ──► CONFLICTED (parked) ─────────────┤
//!                                        │   stale resolution:        │
//!                                        │   attempts += 1 ── policy ─┘ (forced)
//!                                        └── older than abandon_after ──► ABANDONED
//! ```
//!
//! Parked conflicts never block the document: other changes keep flowing
//! while a client (or a human) works out a resolution.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::change::{clamp_edits, Change, ChangeId, DocumentUri};
use crate::session::SessionId;
use crate::version::DocumentVersionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictStatus {
    Pending,
    Resolved,
    Abandoned,
}

/// A change whose base version did not match the document's version.
///
/// Carries everything the author needs to rebase and retry: the version it
/// lost against and every change accepted since its base.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    pub conflict_id: Uuid,
    pub document_uri: DocumentUri,
    pub server_version: u64,
    /// The change (or latest resolution attempt) that failed the gate
    pub incoming_change: Change,
    /// Accepted changes between the incoming base and `server_version`
    pub intervening_changes: Vec<Change>,
    /// The change that was finally applied, once resolved
    pub resolution: Option<Change>,
    /// Resolution attempts that failed the version gate
    pub attempts: u32,
    /// Resolution was imposed by the policy rather than rebased by the client
    pub forced: bool,
    pub status: ConflictStatus,
}

impl Conflict {
    pub fn new(
        server_version: u64,
        incoming_change: Change,
        intervening_changes: Vec<Change>,
    ) -> Self {
        Self {
            conflict_id: Uuid::new_v4(),
            document_uri: incoming_change.document_uri.clone(),
            server_version,
            incoming_change,
            intervening_changes,
            resolution: None,
            attempts: 0,
            forced: false,
            status: ConflictStatus::Pending,
        }
    }

    /// Point the conflict at a newer losing attempt.
    pub(crate) fn refresh(&mut self, server_version: u64, attempt: Change, intervening: Vec<Change>) {
        self.server_version = server_version;
        self.incoming_change = attempt;
        self.intervening_changes = intervening;
    }

    pub(crate) fn resolve(&mut self, resolution: Change, forced: bool) {
        self.resolution = Some(resolution);
        self.forced = forced;
        self.status = ConflictStatus::Resolved;
    }
}

/// Decides when a conflict stops waiting for the client and what gets
/// applied instead.
pub trait ResolutionPolicy: Send + Sync {
    /// Whether the failed attempt just counted should be forced. `expired`
    /// is set once the conflict is older than the resolution timeout.
    fn should_force(&self, conflict: &Conflict, expired: bool) -> bool;

    /// The change to apply on top of `current` in place of `attempt`.
    /// Its `base_version` must equal `current.current_version`.
    fn force(&self, attempt: &Change, current: &DocumentVersionState) -> Change;

    fn name(&self) -> &'static str;
}

/// Default policy: after `max_attempts` stale resolutions (or once the
/// timeout passed) the latest attempt wins, rebased onto the current version
/// with its ranges clamped to the current text.
#[derive(Debug, Clone, Copy)]
pub struct LastWriterWins {
    pub max_attempts: u32,
}

impl Default for LastWriterWins {
    fn default() -> Self {
        Self { max_attempts: 3 }
    }
}

impl ResolutionPolicy for LastWriterWins {
    fn should_force(&self, conflict: &Conflict, expired: bool) -> bool {
        expired || conflict.attempts >= self.max_attempts
    }

    fn force(&self, attempt: &Change, current: &DocumentVersionState) -> Change {
        Change {
            base_version: current.current_version,
            operations: clamp_edits(current.content(), &attempt.operations),
            ..attempt.clone()
        }
    }

    fn name(&self) -> &'static str {
        "last-writer-wins"
    }
}

/// Never forces: conflicts wait for a correctly rebased resolution or for
/// the abandon sweep.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManualResolution;

impl ResolutionPolicy for ManualResolution {
    fn should_force(&self, _conflict: &Conflict, _expired: bool) -> bool {
        false
    }

    fn force(&self, attempt: &Change, current: &DocumentVersionState) -> Change {
        attempt.rebased(current.current_version)
    }

    fn name(&self) -> &'static str {
        "manual"
    }
}

/// A parked conflict and the session it belongs to.
#[derive(Debug, Clone)]
pub struct PendingConflict {
    pub conflict: Conflict,
    pub origin: SessionId,
    pub created_at: Instant,
    /// Every change id that lost the gate under this conflict: the original
    /// change and each stale resolution attempt
    pub changes: Vec<ChangeId>,
}

impl PendingConflict {
    pub fn involves(&self, change_id: &ChangeId) -> bool {
        self.changes.contains(change_id)
    }
}

/// Conflicts waiting for resolution, keyed by conflict id.
#[derive(Default)]
pub struct ConflictTable {
    pending: Mutex<HashMap<Uuid, PendingConflict>>,
}

impl ConflictTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park `conflict` for `origin` and return the record now pending.
    ///
    /// If the same author's change is already parked (a resent change),
    /// that conflict is refreshed and handed to `origin` instead of a second
    /// one being created.
    pub fn park(&self, conflict: Conflict, origin: SessionId) -> Conflict {
        let mut pending = self.pending.lock();
        let incoming = &conflict.incoming_change;
        let existing = pending.values_mut().find(|p| {
            p.involves(&incoming.change_id)
                && p.conflict.incoming_change.author_id == incoming.author_id
        });
        if let Some(existing) = existing {
            existing.conflict.server_version = conflict.server_version;
            existing.conflict.intervening_changes = conflict.intervening_changes;
            existing.origin = origin;
            return existing.conflict.clone();
        }

        let parked = conflict.clone();
        pending.insert(
            conflict.conflict_id,
            PendingConflict {
                changes: vec![conflict.incoming_change.change_id],
                conflict,
                origin,
                created_at: Instant::now(),
            },
        );
        parked
    }

    pub fn get(&self, conflict_id: &Uuid) -> Option<PendingConflict> {
        self.pending.lock().get(conflict_id).cloned()
    }

    /// Replace the stored record, keeping origin and creation time.
    pub fn update(&self, conflict: Conflict) {
        if let Some(pending) = self.pending.lock().get_mut(&conflict.conflict_id) {
            let change_id = conflict.incoming_change.change_id;
            if !pending.involves(&change_id) {
                pending.changes.push(change_id);
            }
            pending.conflict = conflict;
        }
    }

    pub fn remove(&self, conflict_id: &Uuid) -> Option<PendingConflict> {
        self.pending.lock().remove(conflict_id)
    }

    /// Remove every conflict that `change_id` lost under, once that change
    /// has been accepted by other means.
    pub fn remove_for_change(&self, change_id: &ChangeId) -> Vec<PendingConflict> {
        self.drain_where(|p| p.involves(change_id))
    }

    /// Remove every conflict parked for `origin`.
    pub fn drain_for_origin(&self, origin: SessionId) -> Vec<PendingConflict> {
        self.drain_where(|p| p.origin == origin)
    }

    /// Remove and return every conflict created more than `max_age` before `now`.
    pub fn drain_older_than(&self, max_age: Duration, now: Instant) -> Vec<PendingConflict> {
        self.drain_where(|p| now.saturating_duration_since(p.created_at) >= max_age)
    }

    fn drain_where<F>(&self, pred: F) -> Vec<PendingConflict>
    where
        F: Fn(&PendingConflict) -> bool,
    {
        let mut pending = self.pending.lock();
        let matching: Vec<Uuid> = pending
            .iter()
            .filter(|(_, p)| pred(p))
            .map(|(id, _)| *id)
            .collect();
        matching
            .into_iter()
            .filter_map(|id| pending.remove(&id))
            .collect()
    }

    /// Pending conflicts raised against `uri`.
    pub fn for_document(&self, uri: &str) -> Vec<Conflict> {
        self.pending
            .lock()
            .values()
            .filter(|p| p.conflict.document_uri == uri)
            .map(|p| p.conflict.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::TextEdit;
    use crate::version::VersionTracker;

    fn conflict_with_attempts(attempts: u32) -> Conflict {
        let change = Change::new("doc-1", 0, vec![TextEdit::insert(0, "x")], "bob");
        let mut conflict = Conflict::new(1, change, vec![]);
        conflict.attempts = attempts;
        conflict
    }

    #[test]
    fn test_last_writer_wins_threshold() {
        let policy = LastWriterWins::default();
        assert!(!policy.should_force(&conflict_with_attempts(2), false));
        assert!(policy.should_force(&conflict_with_attempts(3), false));
        assert!(policy.should_force(&conflict_with_attempts(0), true));
    }

    #[test]
    fn test_manual_never_forces() {
        let policy = ManualResolution;
        assert!(!policy.should_force(&conflict_with_attempts(100), true));
    }

    #[tokio::test]
    async fn test_last_writer_wins_rebases_and_clamps() {
        let tracker = VersionTracker::in_memory();
        let doc = tracker.document("doc-1").await.unwrap();
        let state = doc.read().await;

        let attempt = Change::new("doc-1", 5, vec![TextEdit::new(3, 9, "tail")], "bob");
        let forced = LastWriterWins::default().force(&attempt, &state);
        assert_eq!(forced.change_id, attempt.change_id);
        assert_eq!(forced.base_version, 0);
        assert_eq!(forced.operations, vec![TextEdit::new(0, 0, "tail")]);
    }

    #[test]
    fn test_table_park_update_remove() {
        let table = ConflictTable::new();
        let origin = Uuid::new_v4();
        let mut conflict = conflict_with_attempts(0);
        let id = conflict.conflict_id;
        table.park(conflict.clone(), origin);
        assert_eq!(table.len(), 1);
        assert_eq!(table.for_document("doc-1").len(), 1);
        assert!(table.for_document("doc-2").is_empty());

        conflict.attempts = 2;
        table.update(conflict);
        let pending = table.get(&id).unwrap();
        assert_eq!(pending.conflict.attempts, 2);
        assert_eq!(pending.origin, origin);

        assert!(table.remove(&id).is_some());
        assert!(table.is_empty());
    }

    #[test]
    fn test_remove_for_change() {
        let table = ConflictTable::new();
        let conflict = conflict_with_attempts(0);
        let change_id = conflict.incoming_change.change_id;
        table.park(conflict, Uuid::new_v4());

        assert!(table.remove_for_change(&Uuid::new_v4()).is_empty());
        assert_eq!(table.remove_for_change(&change_id).len(), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn test_resent_change_reuses_pending_conflict() {
        let table = ConflictTable::new();
        let first = conflict_with_attempts(0);
        let change = first.incoming_change.clone();
        let parked = table.park(first.clone(), Uuid::new_v4());
        assert_eq!(parked.conflict_id, first.conflict_id);

        // Same change, resent after another version was accepted
        let reconnected = Uuid::new_v4();
        let again = table.park(Conflict::new(2, change.clone(), vec![]), reconnected);
        assert_eq!(again.conflict_id, first.conflict_id);
        assert_eq!(again.server_version, 2);
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(&first.conflict_id).unwrap().origin, reconnected);

        assert_eq!(table.remove_for_change(&change.change_id).len(), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn test_same_change_id_from_other_author_is_separate() {
        let table = ConflictTable::new();
        let first = conflict_with_attempts(0);
        let mut other = first.incoming_change.clone();
        other.author_id = "mallory".into();
        table.park(first, Uuid::new_v4());
        table.park(Conflict::new(1, other, vec![]), Uuid::new_v4());
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_stale_attempts_are_tracked() {
        let table = ConflictTable::new();
        let mut conflict = conflict_with_attempts(0);
        let original = conflict.incoming_change.change_id;
        table.park(conflict.clone(), Uuid::new_v4());

        let attempt = Change::new("doc-1", 1, vec![TextEdit::insert(0, "y")], "bob");
        let attempt_id = attempt.change_id;
        conflict.refresh(2, attempt, vec![]);
        table.update(conflict.clone());

        let pending = table.get(&conflict.conflict_id).unwrap();
        assert!(pending.involves(&original));
        assert!(pending.involves(&attempt_id));
        assert_eq!(table.remove_for_change(&attempt_id).len(), 1);
    }

    #[test]
    fn test_drain_for_origin() {
        let table = ConflictTable::new();
        let carol = Uuid::new_v4();
        table.park(conflict_with_attempts(0), carol);
        table.park(conflict_with_attempts(0), Uuid::new_v4());

        assert_eq!(table.drain_for_origin(carol).len(), 1);
        assert_eq!(table.len(), 1);
        assert!(table.drain_for_origin(carol).is_empty());
    }

    #[test]
    fn test_drain_older_than() {
        let table = ConflictTable::new();
        table.park(conflict_with_attempts(0), Uuid::new_v4());
        table.park(conflict_with_attempts(0), Uuid::new_v4());

        let now = Instant::now();
        assert!(table.drain_older_than(Duration::from_secs(60), now).is_empty());

        let later = now + Duration::from_secs(120);
        assert_eq!(table.drain_older_than(Duration::from_secs(60), later).len(), 2);
        assert!(table.is_empty());
    }

    #[test]
    fn test_resolve_marks_status() {
        let mut conflict = conflict_with_attempts(3);
        let resolution = conflict.incoming_change.rebased(1);
        conflict.resolve(resolution.clone(), true);
        assert_eq!(conflict.status, ConflictStatus::Resolved);
        assert_eq!(conflict.resolution, Some(resolution));
        assert!(conflict.forced);
    }
}
