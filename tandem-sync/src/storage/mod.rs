//! Persistence contract for the change log.
//!
//! Architecture:
//! ```text
//! ┌────────────────┐  append / read_range  ┌──────────────────────┐
//! │ VersionTracker │ ────────────────────► │ dyn ChangeStore      │
//! │ (per-doc lock) │                       ├──────────────────────┤
//! └────────────────┘                       │ MemoryChangeStore    │
//!                                          │ RocksChangeStore     │
//!                                          │  CF "changes" (LZ4)  │
//!                                          │  CF "heads"          │
//!                                          └──────────────────────┘
//! ```
//!
//! The store only has to be an ordered, append-only log per document.
//! Durability, compaction and retention are the backend's business.

pub mod memory;
pub mod rocks;

pub use memory::MemoryChangeStore;
pub use rocks::{RocksChangeStore, StoreConfig};

use thiserror::Error;

use crate::change::{Change, DocumentUri};

/// Storage errors.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Compression error: {0}")]
    Compression(String),
    /// A stored entry does not match its key
    #[error("Corrupt entry for {document_uri} at sequence {sequence}")]
    Corrupt {
        document_uri: DocumentUri,
        sequence: u64,
    },
}

/// Append-only, per-document ordered log of accepted changes.
///
/// Sequence numbers start at 1 and advance by exactly one per append, so
/// the sequence of an accepted change equals the version it produced.
/// Callers serialize appends per document; backends need not.
pub trait ChangeStore: Send + Sync {
    /// Append `change` to the log of `document_uri`, returning its sequence.
    fn append(&self, document_uri: &str, change: &Change) -> Result<u64, StoreError>;

    /// Changes with sequence in `from..=to`, in order.
    fn read_range(&self, document_uri: &str, from: u64, to: u64)
        -> Result<Vec<Change>, StoreError>;

    /// Highest sequence stored for `document_uri` (0 if none).
    fn head(&self, document_uri: &str) -> Result<u64, StoreError>;

    /// All documents with at least one stored change.
    fn documents(&self) -> Result<Vec<DocumentUri>, StoreError>;
}
