//! WebSocket transport for the sync engine.
//!
//! Architecture:
//! ```text
//! Client A ──┐                 ┌──────────── SyncEngine ────────────┐
//!            ├── conn task ──► │ sessions · tracker · conflicts     │
//! Client B ──┘   (1 per peer)  │        │                           │
//!                 ▲            │        ├── ChangeStore             │
//!                 │            │        │   (memory | RocksDB)      │
//!                 │            │        └── BroadcastDispatcher ────┼──┐
//!                 │            └────────────────────────────────────┘  │
//!                 └──────────────── session mailbox ◄──────────────────┘
//! ```
//!
//! Each connection task multiplexes two sources with `select!`: frames from
//! the socket (decoded into [`InboundEvent`]s and dispatched to the engine)
//! and the session mailbox (engine events encoded back onto the socket).
//! Replies that only concern the caller (`welcome`, `document-state`,
//! `catch-up`, `error`, `pong`) are written directly.

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;

use crate::broadcast::EventStream;
use crate::engine::{EngineConfig, SyncEngine};
use crate::error::SyncError;
use crate::protocol::{InboundEvent, OutboundEvent, ProtocolError};
use crate::session::SessionId;
use crate::storage::{RocksChangeStore, StoreConfig};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Largest accepted inbound frame, in bytes
    pub max_frame_bytes: usize,
    /// RocksDB directory (None = in-memory only)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_frame_bytes: 4 * 1024 * 1024,
            storage_path: None,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub malformed_frames: u64,
    pub active_sessions: usize,
    pub messages_sent: u64,
    pub messages_dropped: u64,
}

#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_messages: AtomicU64,
    total_bytes: AtomicU64,
    malformed_frames: AtomicU64,
}

/// Identity established by `hello`.
struct ConnectionSession {
    session_id: SessionId,
    user_id: String,
    events: EventStream,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    engine: Arc<SyncEngine>,
    stats: Arc<AtomicServerStats>,
}

impl SyncServer {
    /// Create a server, opening the RocksDB store if `storage_path` is set.
    pub fn new(config: ServerConfig, engine_config: EngineConfig) -> Result<Self, SyncError> {
        let engine = match &config.storage_path {
            Some(path) => {
                let store = RocksChangeStore::open(StoreConfig {
                    path: path.clone(),
                    ..StoreConfig::default()
                })?;
                log::info!("Persisting changes to {}", path.display());
                SyncEngine::with_store(engine_config, Arc::new(store))
            }
            None => SyncEngine::new(engine_config),
        };
        Ok(Self::with_engine(config, Arc::new(engine)))
    }

    /// Serve an existing engine.
    pub fn with_engine(config: ServerConfig, engine: Arc<SyncEngine>) -> Self {
        Self {
            config,
            engine,
            stats: Arc::new(AtomicServerStats::default()),
        }
    }

    /// Create with default configuration (in-memory, no persistence).
    pub fn with_defaults() -> Self {
        Self::with_engine(
            ServerConfig::default(),
            Arc::new(SyncEngine::new(EngineConfig::default())),
        )
    }

    /// Recover persisted documents, bind and serve forever.
    pub async fn run(&self) -> Result<(), BoxError> {
        let recovered = self.engine.recover().await?;
        if recovered > 0 {
            log::info!("Recovered {recovered} documents from persistent storage");
        }

        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Accept connections on `listener`, one task per connection.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        let _sweeper = self.engine.spawn_conflict_sweeper();

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let engine = self.engine.clone();
            let stats = self.stats.clone();
            let max_frame_bytes = self.config.max_frame_bytes;

            tokio::spawn(async move {
                if let Err(e) =
                    Self::handle_connection(stream, addr, engine, stats, max_frame_bytes).await
                {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        engine: Arc<SyncEngine>,
        stats: Arc<AtomicServerStats>,
        max_frame_bytes: usize,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");
        stats.total_connections.fetch_add(1, Ordering::Relaxed);
        stats.active_connections.fetch_add(1, Ordering::Relaxed);

        let mut session: Option<ConnectionSession> = None;

        let result = async {
            loop {
                tokio::select! {
                    // Incoming WebSocket message
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Binary(data))) => {
                                stats.total_messages.fetch_add(1, Ordering::Relaxed);
                                stats.total_bytes.fetch_add(data.len() as u64, Ordering::Relaxed);

                                let reply = match Self::decode_frame(&data, max_frame_bytes) {
                                    Ok(event) => Self::handle_event(&engine, &mut session, event).await,
                                    Err(e) => {
                                        stats.malformed_frames.fetch_add(1, Ordering::Relaxed);
                                        log::warn!("Malformed frame from {addr}: {e}");
                                        Some(OutboundEvent::Error {
                                            code: "malformed".to_string(),
                                            message: e.to_string(),
                                        })
                                    }
                                };
                                if let Some(reply) = reply {
                                    ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                                }
                            }

                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }

                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }

                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }

                            _ => {}
                        }
                    }

                    // Outgoing engine event
                    event = async {
                        match session.as_mut() {
                            Some(s) => s.events.recv().await,
                            // No session yet, wait forever
                            None => std::future::pending().await,
                        }
                    } => {
                        match event {
                            Some(event) => {
                                ws_sender.send(Message::Binary(event.encode()?.into())).await?;
                            }
                            None => {
                                // Evicted for lagging; the client must rejoin
                                log::warn!("Session of {addr} fell behind, closing connection");
                                let notice = OutboundEvent::Error {
                                    code: "resync".to_string(),
                                    message: "session fell behind, reconnect and rejoin".to_string(),
                                };
                                ws_sender.send(Message::Binary(notice.encode()?.into())).await?;
                                let _ = ws_sender.send(Message::Close(None)).await;
                                break;
                            }
                        }
                    }
                }
            }
            Ok::<(), BoxError>(())
        }
        .await;

        // Cleanup: leave every joined document
        if let Some(s) = session {
            engine.close_session(s.session_id);
        }
        stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        result
    }

    fn decode_frame(data: &[u8], max_frame_bytes: usize) -> Result<InboundEvent, ProtocolError> {
        if data.len() > max_frame_bytes {
            return Err(ProtocolError::FrameTooLarge {
                size: data.len(),
                limit: max_frame_bytes,
            });
        }
        InboundEvent::decode(data)
    }

    /// Handle one decoded event, returning the direct reply if any.
    async fn handle_event(
        engine: &SyncEngine,
        session: &mut Option<ConnectionSession>,
        event: InboundEvent,
    ) -> Option<OutboundEvent> {
        let current = session
            .as_ref()
            .map(|s| (s.session_id, s.user_id.clone()));
        let result = match (event, current) {
            (InboundEvent::Ping, _) => Ok(Some(OutboundEvent::Pong)),
            (InboundEvent::Hello { user_id, display_name }, None) => {
                if user_id.is_empty() {
                    Err(SyncError::validation("hello without user id"))
                } else {
                    let (participant, events) = engine.open_session(user_id, display_name);
                    let session_id = participant.session_id;
                    *session = Some(ConnectionSession {
                        session_id,
                        user_id: participant.user_id,
                        events,
                    });
                    Ok(Some(OutboundEvent::Welcome { session_id }))
                }
            }
            (InboundEvent::Hello { .. }, Some(_)) => {
                Err(SyncError::validation("session already open on this connection"))
            }
            (_, None) => Err(SyncError::validation("hello must be the first event")),
            (event, Some((session_id, user_id))) => {
                Self::dispatch(engine, session_id, &user_id, event).await
            }
        };

        match result {
            Ok(reply) => reply,
            Err(e) if e.is_ignorable() => {
                log::debug!("Ignoring {e}");
                None
            }
            Err(e) => {
                match &e {
                    SyncError::Storage(_) | SyncError::InternalInvariant(_) => log::error!("{e}"),
                    _ => log::debug!("Rejected event: {e}"),
                }
                Some(OutboundEvent::error(&e))
            }
        }
    }

    /// Route a session event to the engine.
    async fn dispatch(
        engine: &SyncEngine,
        session_id: SessionId,
        user_id: &str,
        event: InboundEvent,
    ) -> Result<Option<OutboundEvent>, SyncError> {
        match event {
            InboundEvent::JoinDocument { document_uri } => {
                let joined = engine.join_document(session_id, user_id, &document_uri).await?;
                Ok(Some(OutboundEvent::DocumentState {
                    document_uri,
                    version: joined.snapshot.version,
                    content: joined.snapshot.content,
                    participants: joined.participants,
                }))
            }
            InboundEvent::LeaveDocument { document_uri } => {
                engine.leave_document(session_id, &document_uri);
                Ok(None)
            }
            InboundEvent::Change {
                document_uri,
                change,
            } => {
                let change = change.into_change(document_uri, user_id);
                engine.submit_change(session_id, change).await?;
                Ok(None)
            }
            InboundEvent::ResolveConflict {
                document_uri,
                conflict_id,
                resolution,
            } => {
                let resolution = resolution.into_change(document_uri, user_id);
                engine
                    .resolve_conflict(session_id, conflict_id, resolution)
                    .await?;
                Ok(None)
            }
            InboundEvent::RegisterDevice {
                device_id,
                platform,
            } => {
                engine.register_device(device_id, platform);
                Ok(None)
            }
            InboundEvent::MarkSynced {
                device_id,
                document_uri,
                version,
            } => {
                engine
                    .mark_synced(&device_id, &document_uri, version)
                    .await?;
                Ok(None)
            }
            InboundEvent::CatchUp {
                device_id,
                document_uri,
            } => {
                let changes = engine.catch_up(&device_id, &document_uri).await?;
                Ok(Some(OutboundEvent::CatchUp {
                    device_id,
                    document_uri,
                    changes,
                }))
            }
            InboundEvent::SetPresence { presence } => {
                engine.set_presence(session_id, presence)?;
                Ok(None)
            }
            InboundEvent::Ping => Ok(Some(OutboundEvent::Pong)),
            InboundEvent::Hello { .. } => Err(SyncError::validation(
                "session already open on this connection",
            )),
        }
    }

    /// Get server statistics.
    pub fn stats(&self) -> ServerStats {
        let broadcast = self.engine.broadcast_stats();
        ServerStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            total_messages: self.stats.total_messages.load(Ordering::Relaxed),
            total_bytes: self.stats.total_bytes.load(Ordering::Relaxed),
            malformed_frames: self.stats.malformed_frames.load(Ordering::Relaxed),
            active_sessions: self.engine.session_count(),
            messages_sent: broadcast.messages_sent,
            messages_dropped: broadcast.messages_dropped,
        }
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }
}
