//! # tandem-sync: multi-client document synchronization
//!
//! Accepts concurrent edits to shared documents, gates them on the version
//! they were written against, and keeps every connected session and
//! registered device consistent with one authoritative history per document.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket       ┌─────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer  │
//! │ (per user)  │   bincode events    │ (transport) │
//! └─────────────┘                     └──────┬──────┘
//!                                            │
//!                                            ▼
//!                                     ┌─────────────┐      ┌──────────────┐
//!                                     │ SyncEngine  │ ───► │ ChangeStore  │
//!                                     │ version gate│      │ memory/Rocks │
//!                                     └──────┬──────┘      └──────────────┘
//!                                            │
//!                           ┌────────────────┼────────────────┐
//!                           ▼                ▼                ▼
//!                    SessionRegistry  BroadcastDispatcher  DeviceRegistry
//! ```
//!
//! A change is accepted only if its base version equals the document's
//! current version. Otherwise a [`Conflict`] goes back to the author, who
//! rebases and resolves; a [`ResolutionPolicy`] decides when to stop
//! waiting.
//!
//! ## Modules
//!
//! - [`change`]: changes, text edits, validation and application
//! - [`version`]: per-document version state and change log
//! - [`storage`]: persistence contract with memory and RocksDB backends
//! - [`conflict`]: conflict records and resolution policies
//! - [`engine`]: the conflict detector/resolver
//! - [`session`] / [`device`]: registries
//! - [`broadcast`]: per-document fan-out with backpressure
//! - [`protocol`]: wire events and their binary codec
//! - [`server`] / [`client`]: WebSocket transport

pub mod broadcast;
pub mod change;
pub mod client;
pub mod conflict;
pub mod device;
pub mod engine;
pub mod error;
pub mod protocol;
pub mod server;
pub mod session;
pub mod storage;
pub mod version;

// Re-exports for convenience
pub use broadcast::{BroadcastDispatcher, BroadcastStats, EventSink, EventStream};
pub use change::{apply_edits, Change, ChangeId, ChangeLimits, DocumentUri, TextEdit};
pub use client::{ConnectionState, SyncClient};
pub use conflict::{Conflict, ConflictStatus, LastWriterWins, ManualResolution, ResolutionPolicy};
pub use device::{Device, DeviceId, Platform};
pub use engine::{EngineConfig, JoinedDocument, ResolveOutcome, SubmitOutcome, SyncEngine};
pub use error::SyncError;
pub use protocol::{ChangeRequest, InboundEvent, OutboundEvent, ProtocolError};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use session::{Participant, Presence, SessionId, UserId};
pub use storage::{ChangeStore, MemoryChangeStore, RocksChangeStore, StoreConfig, StoreError};
pub use version::{DocumentSnapshot, DocumentVersionState, VersionTracker};
