//! Wire protocol between the transport and its clients.
//!
//! One event per WebSocket binary frame, bincode-encoded:
//! ```text
//! ┌──────────────┬──────────────────────────────┐
//! │ variant idx  │ variant fields (serde order) │
//! │ varint       │ variable                     │
//! └──────────────┴──────────────────────────────┘
//! ```
//!
//! Both directions are closed enums: a frame either decodes into one of the
//! known variants or is rejected as malformed.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::change::{Change, ChangeId, DocumentUri, TextEdit};
use crate::conflict::Conflict;
use crate::device::{DeviceId, Platform};
use crate::session::{Participant, Presence, SessionId};

/// An edit as submitted by a client; the server fills in author and time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRequest {
    /// Client-chosen id; re-sending the same id is idempotent
    pub change_id: ChangeId,
    pub base_version: u64,
    pub operations: Vec<TextEdit>,
}

impl ChangeRequest {
    pub fn new(base_version: u64, operations: Vec<TextEdit>) -> Self {
        Self {
            change_id: Uuid::new_v4(),
            base_version,
            operations,
        }
    }

    /// Materialize into a [`Change`] authored by `author_id`.
    pub fn into_change(self, document_uri: DocumentUri, author_id: impl Into<String>) -> Change {
        Change {
            change_id: self.change_id,
            document_uri,
            base_version: self.base_version,
            operations: self.operations,
            author_id: author_id.into(),
            timestamp: crate::change::now_millis(),
        }
    }
}

/// Client → server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InboundEvent {
    /// Opens the session; must be the first event on a connection.
    Hello {
        user_id: String,
        display_name: String,
    },
    JoinDocument {
        document_uri: DocumentUri,
    },
    LeaveDocument {
        document_uri: DocumentUri,
    },
    Change {
        document_uri: DocumentUri,
        change: ChangeRequest,
    },
    ResolveConflict {
        document_uri: DocumentUri,
        conflict_id: Uuid,
        resolution: ChangeRequest,
    },
    RegisterDevice {
        device_id: DeviceId,
        platform: Platform,
    },
    MarkSynced {
        device_id: DeviceId,
        document_uri: DocumentUri,
        version: u64,
    },
    CatchUp {
        device_id: DeviceId,
        document_uri: DocumentUri,
    },
    SetPresence {
        presence: Presence,
    },
    Ping,
}

/// Server → client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutboundEvent {
    Welcome {
        session_id: SessionId,
    },
    DocumentState {
        document_uri: DocumentUri,
        version: u64,
        content: String,
        participants: Vec<Participant>,
    },
    ChangeApplied {
        document_uri: DocumentUri,
        change: Change,
        new_version: u64,
    },
    ConflictDetected {
        document_uri: DocumentUri,
        conflict: Conflict,
    },
    PresenceUpdate {
        document_uri: DocumentUri,
        participant: Participant,
        presence: Presence,
    },
    CatchUp {
        device_id: DeviceId,
        document_uri: DocumentUri,
        changes: Vec<Change>,
    },
    Error {
        code: String,
        message: String,
    },
    Pong,
}

impl OutboundEvent {
    /// Document the event belongs to, if any.
    pub fn document_uri(&self) -> Option<&str> {
        match self {
            OutboundEvent::DocumentState { document_uri, .. }
            | OutboundEvent::ChangeApplied { document_uri, .. }
            | OutboundEvent::ConflictDetected { document_uri, .. }
            | OutboundEvent::PresenceUpdate { document_uri, .. }
            | OutboundEvent::CatchUp { document_uri, .. } => Some(document_uri),
            OutboundEvent::Welcome { .. } | OutboundEvent::Error { .. } | OutboundEvent::Pong => {
                None
            }
        }
    }

    pub fn error(err: &crate::error::SyncError) -> Self {
        OutboundEvent::Error {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

/// Protocol errors.
#[derive(Error, Debug, Clone)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Frame of {size} bytes exceeds limit of {limit}")]
    FrameTooLarge { size: usize, limit: usize },
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Connection timeout")]
    Timeout,
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, read) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    if read != bytes.len() {
        return Err(ProtocolError::Deserialization(format!(
            "{} trailing bytes",
            bytes.len() - read
        )));
    }
    Ok(value)
}

impl InboundEvent {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

impl OutboundEvent {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}
