//! Error taxonomy for the synchronization engine.
//!
//! A version conflict is not an error variant: it is the
//! expected outcome of submitting against stale state and travels as
//! [`SubmitOutcome::Conflicted`](crate::engine::SubmitOutcome) /
//! [`ResolveOutcome::Rejected`](crate::engine::ResolveOutcome) instead.

use thiserror::Error;
use uuid::Uuid;

use crate::change::DocumentUri;
use crate::device::DeviceId;
use crate::protocol::ProtocolError;
use crate::session::SessionId;
use crate::storage::StoreError;

#[derive(Error, Debug)]
pub enum SyncError {
    /// Malformed change or request; rejected before reaching the log.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Read-only query against a URI that has no state.
    #[error("Document not found: {0}")]
    DocumentNotFound(DocumentUri),

    /// A device reported a catch-up index lower than the stored one.
    #[error("Stale ack for {document_uri}: reported {reported}, already at {stored}")]
    StaleAck {
        document_uri: DocumentUri,
        reported: u64,
        stored: u64,
    },

    /// The version gate was bypassed. Indicates a bug, never a client error.
    #[error("Internal invariant violated: {0}")]
    InternalInvariant(String),

    #[error("Unknown session: {0}")]
    UnknownSession(SessionId),

    #[error("Unknown device: {0}")]
    UnknownDevice(DeviceId),

    #[error("Unknown conflict: {0}")]
    UnknownConflict(Uuid),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl SyncError {
    /// Stable code carried by outbound `error` events.
    pub fn code(&self) -> &'static str {
        match self {
            SyncError::Validation(_) => "validation",
            SyncError::DocumentNotFound(_) => "document-not-found",
            SyncError::StaleAck { .. } => "stale-ack",
            SyncError::InternalInvariant(_) => "internal",
            SyncError::UnknownSession(_) => "unknown-session",
            SyncError::UnknownDevice(_) => "unknown-device",
            SyncError::UnknownConflict(_) => "unknown-conflict",
            SyncError::Storage(_) => "storage",
            SyncError::Protocol(_) => "protocol",
        }
    }

    /// Errors the transport swallows instead of reporting.
    pub fn is_ignorable(&self) -> bool {
        matches!(self, SyncError::StaleAck { .. })
    }

    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        SyncError::Validation(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(SyncError::validation("bad").code(), "validation");
        assert_eq!(
            SyncError::DocumentNotFound("doc-1".into()).code(),
            "document-not-found"
        );
        assert_eq!(SyncError::UnknownConflict(Uuid::nil()).code(), "unknown-conflict");
    }

    #[test]
    fn test_only_stale_ack_is_ignorable() {
        let stale = SyncError::StaleAck {
            document_uri: "doc-1".into(),
            reported: 2,
            stored: 3,
        };
        assert!(stale.is_ignorable());
        assert!(!SyncError::validation("x").is_ignorable());
    }

    #[test]
    fn test_error_display() {
        let err = SyncError::StaleAck {
            document_uri: "doc-1".into(),
            reported: 2,
            stored: 3,
        };
        assert_eq!(err.to_string(), "Stale ack for doc-1: reported 2, already at 3");
        assert_eq!(
            SyncError::validation("empty change").to_string(),
            "Validation error: empty change"
        );
    }
}
