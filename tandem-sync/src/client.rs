//! WebSocket client for the sync server.
//!
//! Sends `hello` on connect, waits for `welcome`, then runs a writer task
//! (outgoing channel → socket) and a reader task (socket → event channel).

use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::change::TextEdit;
use crate::device::Platform;
use crate::protocol::{ChangeRequest, InboundEvent, OutboundEvent, ProtocolError};
use crate::session::{Presence, SessionId};

/// Time allowed for the `hello` → `welcome` handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// The sync client.
pub struct SyncClient {
    user_id: String,
    display_name: String,
    server_url: String,
    session_id: Option<SessionId>,

    /// Connection state
    state: Arc<RwLock<ConnectionState>>,

    /// Channel to send events to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<InboundEvent>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<OutboundEvent>>,

    /// Event sender (held by the reader task)
    event_tx: mpsc::Sender<OutboundEvent>,
}

impl SyncClient {
    pub fn new(
        user_id: impl Into<String>,
        display_name: impl Into<String>,
        server_url: impl Into<String>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
            server_url: server_url.into(),
            session_id: None,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<OutboundEvent>> {
        self.event_rx.take()
    }

    /// Connect and open a session.
    pub async fn connect(&mut self) -> Result<SessionId, ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;
        match self.handshake().await {
            Ok(session_id) => {
                *self.state.write().await = ConnectionState::Connected;
                Ok(session_id)
            }
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                Err(e)
            }
        }
    }

    async fn handshake(&mut self) -> Result<SessionId, ProtocolError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(self.server_url.as_str())
            .await
            .map_err(|e| {
                log::warn!("Failed to connect to {}: {e}", self.server_url);
                ProtocolError::ConnectionClosed
            })?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let hello = InboundEvent::Hello {
            user_id: self.user_id.clone(),
            display_name: self.display_name.clone(),
        };
        ws_writer
            .send(Message::Binary(hello.encode()?.into()))
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;

        let session_id = tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => match OutboundEvent::decode(&data)? {
                        OutboundEvent::Welcome { session_id } => return Ok(session_id),
                        OutboundEvent::Error { code, message } => {
                            log::warn!("Server refused session: {code}: {message}");
                            return Err(ProtocolError::ConnectionClosed);
                        }
                        _ => {}
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            Err::<SessionId, _>(ProtocolError::ConnectionClosed)
        })
        .await
        .map_err(|_| ProtocolError::Timeout)??;

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<InboundEvent>(256);
        tokio::spawn(async move {
            while let Some(event) = out_rx.recv().await {
                let Ok(encoded) = event.encode() else {
                    continue;
                };
                if ws_writer.send(Message::Binary(encoded.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });
        self.outgoing_tx = Some(out_tx);

        // Reader task: decode incoming frames into events
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => match OutboundEvent::decode(&data) {
                        Ok(event) => {
                            if event_tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => log::warn!("Undecodable frame from server: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost
            *state.write().await = ConnectionState::Disconnected;
        });

        self.session_id = Some(session_id);
        log::info!("Connected to {} as session {session_id}", self.server_url);
        Ok(session_id)
    }

    /// Send any inbound event.
    pub async fn send(&self, event: InboundEvent) -> Result<(), ProtocolError> {
        let tx = self
            .outgoing_tx
            .as_ref()
            .ok_or(ProtocolError::ConnectionClosed)?;
        tx.send(event)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    pub async fn join(&self, document_uri: impl Into<String>) -> Result<(), ProtocolError> {
        self.send(InboundEvent::JoinDocument {
            document_uri: document_uri.into(),
        })
        .await
    }

    pub async fn leave(&self, document_uri: impl Into<String>) -> Result<(), ProtocolError> {
        self.send(InboundEvent::LeaveDocument {
            document_uri: document_uri.into(),
        })
        .await
    }

    /// Submit `operations` against `base_version`. Returns the change id.
    pub async fn submit(
        &self,
        document_uri: impl Into<String>,
        base_version: u64,
        operations: Vec<TextEdit>,
    ) -> Result<Uuid, ProtocolError> {
        let change = ChangeRequest::new(base_version, operations);
        let change_id = change.change_id;
        self.send(InboundEvent::Change {
            document_uri: document_uri.into(),
            change,
        })
        .await?;
        Ok(change_id)
    }

    pub async fn resolve(
        &self,
        document_uri: impl Into<String>,
        conflict_id: Uuid,
        resolution: ChangeRequest,
    ) -> Result<(), ProtocolError> {
        self.send(InboundEvent::ResolveConflict {
            document_uri: document_uri.into(),
            conflict_id,
            resolution,
        })
        .await
    }

    pub async fn register_device(
        &self,
        device_id: impl Into<String>,
        platform: Platform,
    ) -> Result<(), ProtocolError> {
        self.send(InboundEvent::RegisterDevice {
            device_id: device_id.into(),
            platform,
        })
        .await
    }

    /// Acknowledge that `device_id` has consumed `document_uri` up to `version`.
    pub async fn mark_synced(
        &self,
        device_id: impl Into<String>,
        document_uri: impl Into<String>,
        version: u64,
    ) -> Result<(), ProtocolError> {
        self.send(InboundEvent::MarkSynced {
            device_id: device_id.into(),
            document_uri: document_uri.into(),
            version,
        })
        .await
    }

    /// Ask for the changes `device_id` has not consumed yet. The answer
    /// arrives as a `catch-up` event.
    pub async fn catch_up(
        &self,
        device_id: impl Into<String>,
        document_uri: impl Into<String>,
    ) -> Result<(), ProtocolError> {
        self.send(InboundEvent::CatchUp {
            device_id: device_id.into(),
            document_uri: document_uri.into(),
        })
        .await
    }

    pub async fn set_presence(&self, presence: Presence) -> Result<(), ProtocolError> {
        self.send(InboundEvent::SetPresence { presence }).await
    }

    pub async fn send_ping(&self) -> Result<(), ProtocolError> {
        self.send(InboundEvent::Ping).await
    }

    /// Close the connection; the writer task sends a close frame.
    pub async fn disconnect(&mut self) {
        self.outgoing_tx = None;
        self.session_id = None;
        *self.state.write().await = ConnectionState::Disconnected;
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Get the server URL.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let client = SyncClient::new("alice", "Alice", "ws://localhost:9090");
        assert_eq!(client.user_id(), "alice");
        assert_eq!(client.server_url(), "ws://localhost:9090");
        assert!(client.session_id().is_none());
    }

    #[tokio::test]
    async fn test_client_initial_state() {
        let client = SyncClient::new("alice", "Alice", "ws://localhost:9090");
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_send_while_disconnected_fails() {
        let client = SyncClient::new("alice", "Alice", "ws://localhost:9090");
        assert!(matches!(
            client.send_ping().await,
            Err(ProtocolError::ConnectionClosed)
        ));
        assert!(client.mark_synced("laptop", "doc-1", 3).await.is_err());
        assert!(client.catch_up("laptop", "doc-1").await.is_err());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Nothing listens on port 1
        let mut client = SyncClient::new("alice", "Alice", "ws://127.0.0.1:1");
        assert!(client.connect().await.is_err());
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_take_event_rx() {
        let mut client = SyncClient::new("alice", "Alice", "ws://localhost:9090");
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }
}
