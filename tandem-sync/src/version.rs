//! Per-document version tracking over the change log.
//!
//! ```text
//! VersionTracker
//!   documents: uri ──► Arc<RwLock<DocumentVersionState>>   (one lock per document)
//!   store:     dyn ChangeStore                             (write-through, replayed on first touch)
//! ```
//!
//! Each document's state sits behind its own lock. Version-mutating paths
//! hold the write lock across gate → append; read-only queries take the read
//! lock and clone, so they never observe a half-applied change.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::change::{apply_edits, Change, ChangeId, DocumentUri};
use crate::error::SyncError;
use crate::storage::{ChangeStore, MemoryChangeStore};

/// Authoritative state of one document.
#[derive(Debug, Clone)]
pub struct DocumentVersionState {
    pub document_uri: DocumentUri,
    /// Number of accepted changes
    pub current_version: u64,
    /// Accepted changes; `history[i]` produced version `i + 1`
    pub history: Vec<Change>,
    /// Text obtained by applying `history` in order to ""
    content: String,
    /// change_id → version it produced
    applied: HashMap<ChangeId, u64>,
}

impl DocumentVersionState {
    fn new(document_uri: DocumentUri) -> Self {
        Self {
            document_uri,
            current_version: 0,
            history: Vec::new(),
            content: String::new(),
            applied: HashMap::new(),
        }
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    /// Version produced by an already-accepted change.
    pub fn version_of(&self, change_id: &ChangeId) -> Option<u64> {
        self.applied.get(change_id).copied()
    }

    /// Changes `version + 1 ..= current_version`.
    pub fn history_since(&self, version: u64) -> Vec<Change> {
        if version >= self.current_version {
            return Vec::new();
        }
        self.history[version as usize..].to_vec()
    }

    pub fn snapshot(&self) -> DocumentSnapshot {
        DocumentSnapshot {
            document_uri: self.document_uri.clone(),
            version: self.current_version,
            content: self.content.clone(),
        }
    }

    fn push(&mut self, change: Change, next_content: String) -> u64 {
        self.current_version += 1;
        self.applied.insert(change.change_id, self.current_version);
        self.history.push(change);
        self.content = next_content;
        self.current_version
    }
}

/// Point-in-time copy of a document, sent to joining sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentSnapshot {
    pub document_uri: DocumentUri,
    pub version: u64,
    pub content: String,
}

type DocumentHandle = Arc<RwLock<DocumentVersionState>>;

/// Keyed store of document states, written through to a [`ChangeStore`].
pub struct VersionTracker {
    documents: RwLock<HashMap<DocumentUri, DocumentHandle>>,
    store: Arc<dyn ChangeStore>,
}

impl VersionTracker {
    pub fn new(store: Arc<dyn ChangeStore>) -> Self {
        Self {
            documents: RwLock::new(HashMap::new()),
            store,
        }
    }

    /// Tracker over a fresh [`MemoryChangeStore`].
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryChangeStore::new()))
    }

    /// Get or lazily create the state for `uri`.
    ///
    /// Creation replays whatever the store already holds for the document.
    pub(crate) async fn document(&self, uri: &str) -> Result<DocumentHandle, SyncError> {
        // Fast path: read lock
        {
            let documents = self.documents.read().await;
            if let Some(doc) = documents.get(uri) {
                return Ok(doc.clone());
            }
        }

        // Slow path: write lock to create
        let mut documents = self.documents.write().await;
        // Double-check after acquiring write lock
        if let Some(doc) = documents.get(uri) {
            return Ok(doc.clone());
        }

        let state = self.replay(uri)?;
        if state.current_version > 0 {
            log::info!(
                "Recovered {uri} at version {} from change store",
                state.current_version
            );
        }
        let doc = Arc::new(RwLock::new(state));
        documents.insert(uri.to_string(), doc.clone());
        Ok(doc)
    }

    /// State for `uri` only if the document exists in memory or in the store.
    async fn existing(&self, uri: &str) -> Result<Option<DocumentHandle>, SyncError> {
        if let Some(doc) = self.documents.read().await.get(uri) {
            return Ok(Some(doc.clone()));
        }
        if self.store.head(uri)? > 0 {
            return self.document(uri).await.map(Some);
        }
        Ok(None)
    }

    fn replay(&self, uri: &str) -> Result<DocumentVersionState, SyncError> {
        let mut state = DocumentVersionState::new(uri.to_string());
        for change in self.store.read_range(uri, 1, u64::MAX)? {
            if change.base_version != state.current_version {
                return Err(SyncError::InternalInvariant(format!(
                    "stored change {} for {uri} has base {} at version {}",
                    change.change_id, change.base_version, state.current_version
                )));
            }
            let next = apply_edits(&state.content, &change.operations).map_err(|e| {
                SyncError::InternalInvariant(format!("stored change does not apply: {e}"))
            })?;
            state.push(change, next);
        }
        Ok(state)
    }

    /// Append an accepted change and advance the version by one.
    ///
    /// Only the conflict gate calls this, holding `state`'s write lock and
    /// having computed `next_content` from the current content.
    pub(crate) fn record_change(
        &self,
        state: &mut DocumentVersionState,
        change: Change,
        next_content: String,
    ) -> Result<u64, SyncError> {
        if change.base_version != state.current_version {
            return Err(SyncError::InternalInvariant(format!(
                "record_change for {} with base {} at version {}",
                state.document_uri, change.base_version, state.current_version
            )));
        }

        let expected = state.current_version + 1;
        let sequence = self.store.append(&state.document_uri, &change)?;
        if sequence != expected {
            return Err(SyncError::InternalInvariant(format!(
                "store assigned sequence {sequence} to {}, expected {expected}",
                state.document_uri
            )));
        }

        Ok(state.push(change, next_content))
    }

    /// Current version of `uri` (0 if unseen).
    pub async fn current_version(&self, uri: &str) -> Result<u64, SyncError> {
        match self.existing(uri).await? {
            Some(doc) => Ok(doc.read().await.current_version),
            None => Ok(0),
        }
    }

    /// Consistent snapshot, creating the document if needed.
    pub async fn snapshot(&self, uri: &str) -> Result<DocumentSnapshot, SyncError> {
        let doc = self.document(uri).await?;
        let state = doc.read().await;
        Ok(state.snapshot())
    }

    /// Changes `version + 1 ..= current_version` of `uri`.
    ///
    /// An unseen URI is only an error when the caller claims to have seen
    /// some of it (`version != 0`).
    pub async fn history_since(&self, uri: &str, version: u64) -> Result<Vec<Change>, SyncError> {
        match self.existing(uri).await? {
            Some(doc) => Ok(doc.read().await.history_since(version)),
            None if version == 0 => Ok(Vec::new()),
            None => Err(SyncError::DocumentNotFound(uri.to_string())),
        }
    }

    /// Load every document the store knows about.
    pub async fn recover(&self) -> Result<usize, SyncError> {
        let uris = self.store.documents()?;
        for uri in &uris {
            self.document(uri).await?;
        }
        log::info!("Recovery complete: {} documents restored", uris.len());
        Ok(uris.len())
    }

    /// URIs with in-memory state.
    pub async fn documents(&self) -> Vec<DocumentUri> {
        self.documents.read().await.keys().cloned().collect()
    }
}
