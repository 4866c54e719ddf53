//! In-memory change store. The default backend; nothing survives a restart.

use parking_lot::RwLock;
use std::collections::HashMap;

use super::{ChangeStore, StoreError};
use crate::change::{Change, DocumentUri};

#[derive(Default)]
pub struct MemoryChangeStore {
    logs: RwLock<HashMap<DocumentUri, Vec<Change>>>,
}

impl MemoryChangeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of changes across all documents.
    pub fn len(&self) -> usize {
        self.logs.read().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ChangeStore for MemoryChangeStore {
    fn append(&self, document_uri: &str, change: &Change) -> Result<u64, StoreError> {
        let mut logs = self.logs.write();
        let log = logs.entry(document_uri.to_string()).or_default();
        log.push(change.clone());
        Ok(log.len() as u64)
    }

    fn read_range(
        &self,
        document_uri: &str,
        from: u64,
        to: u64,
    ) -> Result<Vec<Change>, StoreError> {
        let logs = self.logs.read();
        let Some(log) = logs.get(document_uri) else {
            return Ok(Vec::new());
        };
        let from = from.max(1);
        if from > to {
            return Ok(Vec::new());
        }
        let start = (from - 1).min(log.len() as u64) as usize;
        let end = to.min(log.len() as u64) as usize;
        Ok(log[start..end].to_vec())
    }

    fn head(&self, document_uri: &str) -> Result<u64, StoreError> {
        Ok(self
            .logs
            .read()
            .get(document_uri)
            .map_or(0, |log| log.len() as u64))
    }

    fn documents(&self) -> Result<Vec<DocumentUri>, StoreError> {
        Ok(self.logs.read().keys().cloned().collect())
    }
}
