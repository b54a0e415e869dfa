//! WebSocket session server with room-based diagram routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── Room (diagram_id) ── DocumentStore ── BroadcastGroup
//! Client B ──┘                              │
//!                                           ├── ShareTokenRegistry
//!                                           │   (RocksDB, shared diagrams)
//!                                           │
//!                                ┌──────────┼───────────┐
//!                                ▼          ▼           ▼
//!                             Client A   Client B    Client C
//! ```
//!
//! Each room maintains:
//! - An authoritative `DocumentStore` that every inbound patch is applied to
//! - A `BroadcastGroup` for fan-out to connected peers
//! - Participant presence tracking
//!
//! Shared diagrams are seeded from the registry snapshot on first join and
//! written back when the last peer leaves, so the fallback poller on other
//! clients observes edits made over the channel.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;
use umlflow_core::{Diagram, DocumentStore, SHARED_ID_PREFIX};
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, RoomFrame};
use crate::protocol::{Credential, MessageType, ProtocolError, SessionMessage};
use crate::registry::{RegistryError, ShareTokenRegistry};
use crate::storage::{SharedStore, SharedStoreConfig};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum peers per room
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Shared store path for token-authenticated sessions (None = bearer only)
    pub shared_store_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
            shared_store_path: None,
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
    pub active_rooms: usize,
}

/// Session room: authoritative document + broadcast group.
struct SessionRoom {
    /// Authoritative document state for the session
    store: DocumentStore,
    /// Broadcast group for fan-out
    broadcast: Arc<BroadcastGroup>,
}

impl SessionRoom {
    fn new(diagram: Diagram, broadcast_capacity: usize) -> Self {
        Self {
            store: DocumentStore::new(diagram),
            broadcast: Arc::new(BroadcastGroup::new(broadcast_capacity)),
        }
    }
}

/// The session server.
pub struct SessionServer {
    config: ServerConfig,
    /// Session rooms: diagram_id → (DocumentStore + BroadcastGroup)
    rooms: Arc<RwLock<HashMap<String, SessionRoom>>>,
    /// Server-wide statistics
    stats: Arc<RwLock<ServerStats>>,
    /// Token registry for shared sessions (optional)
    registry: Option<Arc<ShareTokenRegistry>>,
}

impl SessionServer {
    /// Create a new session server with the given configuration.
    ///
    /// Opens the shared store if a path is configured; failure to open
    /// is a startup error, not a silent degradation.
    pub fn new(config: ServerConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let registry = match config.shared_store_path.as_ref() {
            Some(path) => {
                let store_config = SharedStoreConfig {
                    path: path.clone(),
                    ..SharedStoreConfig::default()
                };
                let store = Arc::new(SharedStore::open(store_config)?);
                Some(Arc::new(ShareTokenRegistry::new(store)))
            }
            None => None,
        };

        Ok(Self {
            config,
            rooms: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(ServerStats::default())),
            registry,
        })
    }

    /// Create with default configuration (bearer auth only, no shared store).
    pub fn with_defaults() -> Self {
        // Default config has no store path, so open cannot fail
        match Self::new(ServerConfig::default()) {
            Ok(server) => server,
            Err(_) => unreachable!("default config opens no store"),
        }
    }

    /// Create with a shared store at the given path.
    pub fn with_shared_store(
        bind_addr: impl Into<String>,
        path: impl Into<PathBuf>,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let config = ServerConfig {
            bind_addr: bind_addr.into(),
            shared_store_path: Some(path.into()),
            ..ServerConfig::default()
        };
        Self::new(config)
    }

    /// Start listening for WebSocket connections.
    ///
    /// This runs the server event loop. Call from an async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        // Purge expired tokens before serving
        if let Some(ref registry) = self.registry {
            if let Err(e) = registry.sweep() {
                log::warn!("Token sweep at startup failed: {e}");
            }
        }

        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Session server listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let rooms = self.rooms.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();
            let registry = self.registry.clone();

            tokio::spawn(async move {
                if let Err(e) =
                    Self::handle_connection(stream, addr, rooms, stats, config, registry).await
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
        rooms: Arc<RwLock<HashMap<String, SessionRoom>>>,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
        registry: Option<Arc<ShareTokenRegistry>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // State for this connection
        let mut peer_id: Option<Uuid> = None;
        let mut diagram_id: Option<String> = None;
        let mut broadcast_rx: Option<tokio::sync::broadcast::Receiver<RoomFrame>> = None;

        loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            let session_msg = match SessionMessage::decode(&bytes) {
                                Ok(m) => m,
                                Err(e) => {
                                    log::warn!("Failed to decode message from {addr}: {e}");
                                    continue;
                                }
                            };

                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += bytes.len() as u64;
                            }

                            match session_msg.msg_type {
                                MessageType::Join => {
                                    // First message: peer joins a diagram session
                                    let request = match session_msg.join_request() {
                                        Ok(r) => r,
                                        Err(e) => {
                                            log::warn!("Malformed join from {addr}: {e}");
                                            break;
                                        }
                                    };

                                    if let Err(reason) = validate_credential(
                                        registry.as_deref(),
                                        &request.credential,
                                    ) {
                                        log::warn!(
                                            "Rejected join for {} from {addr}: {reason}",
                                            session_msg.diagram_id
                                        );
                                        break;
                                    }

                                    // Get or create room
                                    let mut rooms_w = rooms.write().await;
                                    if !rooms_w.contains_key(&session_msg.diagram_id) {
                                        let diagram = seed_diagram(
                                            registry.as_deref(),
                                            &session_msg.diagram_id,
                                        );
                                        rooms_w.insert(
                                            session_msg.diagram_id.clone(),
                                            SessionRoom::new(diagram, config.broadcast_capacity),
                                        );
                                    }
                                    // Just inserted above if absent
                                    let room = match rooms_w.get(&session_msg.diagram_id) {
                                        Some(r) => r,
                                        None => break,
                                    };

                                    if room.broadcast.peer_count().await
                                        >= config.max_peers_per_room
                                    {
                                        log::warn!(
                                            "Room {} full, rejecting {addr}",
                                            session_msg.diagram_id
                                        );
                                        break;
                                    }

                                    peer_id = Some(request.participant.peer_id);
                                    diagram_id = Some(session_msg.diagram_id.clone());

                                    let rx =
                                        room.broadcast.join(request.participant.clone()).await;
                                    broadcast_rx = Some(rx);

                                    let roster = room.broadcast.roster().await;
                                    let joined_msg = SessionMessage::user_joined(
                                        &session_msg.diagram_id,
                                        &request.participant,
                                    );
                                    let broadcast_clone = room.broadcast.clone();
                                    let room_count = rooms_w.len();
                                    drop(rooms_w); // Release lock before await

                                    // Presence roster to the joiner, join notice to the rest
                                    let presence =
                                        SessionMessage::presence(&session_msg.diagram_id, &roster)?;
                                    ws_sender
                                        .send(Message::Binary(presence.encode()?.into()))
                                        .await?;
                                    let _ = broadcast_clone.publish(&joined_msg);

                                    {
                                        let mut s = stats.write().await;
                                        s.active_rooms = room_count;
                                    }

                                    log::info!(
                                        "Peer {} ({}) joined session {}",
                                        request.participant.name,
                                        request.participant.peer_id,
                                        session_msg.diagram_id
                                    );
                                }

                                MessageType::Patch => {
                                    // Apply to the authoritative store, then fan out
                                    if let Some(ref did) = diagram_id {
                                        let patch = match session_msg.diagram_patch() {
                                            Ok(p) => p,
                                            Err(e) => {
                                                log::warn!("Malformed patch from {addr}: {e}");
                                                continue;
                                            }
                                        };

                                        let broadcast_clone = {
                                            let mut rooms_w = rooms.write().await;
                                            match rooms_w.get_mut(did) {
                                                Some(room) => {
                                                    if !room.store.apply_remote(&patch) {
                                                        log::debug!(
                                                            "Patch for {} dropped as stale",
                                                            patch.class_id()
                                                        );
                                                    }
                                                    Some(room.broadcast.clone())
                                                }
                                                None => None,
                                            }
                                        };

                                        if let Some(bc) = broadcast_clone {
                                            bc.send(session_msg.peer_id, Arc::new(bytes));
                                        }
                                    }
                                }

                                MessageType::Cursor => {
                                    if let Some(ref did) = diagram_id {
                                        log::trace!("Cursor update in session {did}");
                                        let broadcast_clone = {
                                            let rooms_r = rooms.read().await;
                                            rooms_r.get(did).map(|r| r.broadcast.clone())
                                        };
                                        if let Some(bc) = broadcast_clone {
                                            bc.send(session_msg.peer_id, Arc::new(bytes));
                                        }
                                    }
                                }

                                MessageType::Leave => {
                                    log::info!("Peer {:?} left session {:?}", peer_id, diagram_id);
                                    break;
                                }

                                _ => {
                                    log::debug!(
                                        "Unhandled message type: {:?}",
                                        session_msg.msg_type
                                    );
                                }
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

                // Outgoing broadcast message
                msg = async {
                    if let Some(ref mut rx) = broadcast_rx {
                        rx.recv().await
                    } else {
                        // No broadcast receiver until the join completes
                        std::future::pending().await
                    }
                } => {
                    match msg {
                        Ok(frame) => {
                            // The frame names its sender, so echo filtering
                            // needs no decode
                            if Some(frame.sender) == peer_id {
                                continue;
                            }
                            ws_sender
                                .send(Message::Binary(frame.bytes.to_vec().into()))
                                .await?;
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("Peer {peer_id:?} lagged by {n} messages");
                        }
                        Err(_) => break,
                    }
                }
            }
        }

        // Connection is gone whether or not a join ever completed
        {
            let mut s = stats.write().await;
            s.active_connections -= 1;
        }

        // Cleanup: remove peer from room, notify the rest
        if let (Some(pid), Some(did)) = (peer_id, diagram_id) {
            let mut rooms_w = rooms.write().await;
            if let Some(room) = rooms_w.get_mut(&did) {
                room.broadcast.leave(&pid).await;

                let left_msg = SessionMessage::user_left(pid, &did);
                let _ = room.broadcast.publish(&left_msg);

                // Last peer out: write shared state back, drop the room
                if room.broadcast.peer_count().await == 0 {
                    if let (Some(ref registry), Some(token)) =
                        (&registry, did.strip_prefix(SHARED_ID_PREFIX))
                    {
                        match registry.touch(token, &room.store.data()) {
                            Ok(_) => log::info!("Wrote session state back for token {token}"),
                            Err(RegistryError::NotFound(_)) => {
                                log::debug!("No share entry for {token}, skipping write-back")
                            }
                            Err(e) => {
                                log::error!("Failed to write back session state for {token}: {e}")
                            }
                        }
                    }

                    rooms_w.remove(&did);
                    log::info!("Room {did} removed (empty)");
                }
            }

            let mut s = stats.write().await;
            s.active_rooms = rooms_w.len();
        }

        Ok(())
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Get the token registry (if a shared store is configured).
    pub fn registry(&self) -> Option<&Arc<ShareTokenRegistry>> {
        self.registry.as_ref()
    }
}

/// Validate a join credential.
///
/// Share tokens are resolved against the registry when one is configured.
/// Bearer credentials are checked for presence only; their verification
/// belongs to the backend that issued them.
fn validate_credential(
    registry: Option<&ShareTokenRegistry>,
    credential: &Credential,
) -> Result<(), ProtocolError> {
    match credential {
        Credential::Bearer(token) => {
            if token.is_empty() {
                Err(ProtocolError::Unauthorized(
                    "empty bearer credential".to_string(),
                ))
            } else {
                Ok(())
            }
        }
        Credential::ShareToken(token) => match registry {
            Some(registry) => registry
                .resolve(token)
                .map(|_| ())
                .map_err(|e| ProtocolError::Unauthorized(e.to_string())),
            None => {
                if token.is_empty() {
                    Err(ProtocolError::Unauthorized("empty share token".to_string()))
                } else {
                    Ok(())
                }
            }
        },
    }
}

/// Seed a new room's document, from the registry snapshot when shared.
fn seed_diagram(registry: Option<&ShareTokenRegistry>, diagram_id: &str) -> Diagram {
    if let (Some(registry), Some(token)) = (registry, diagram_id.strip_prefix(SHARED_ID_PREFIX)) {
        if let Ok(entry) = registry.resolve(token) {
            let mut diagram = Diagram::new(diagram_id);
            diagram.data = entry.diagram_data;
            return diagram;
        }
    }
    Diagram::new(diagram_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.max_peers_per_room, 100);
        assert_eq!(config.broadcast_capacity, 256);
        assert!(config.shared_store_path.is_none());
    }

    #[test]
    fn test_server_creation() {
        let server = SessionServer::with_defaults();
        assert_eq!(server.bind_addr(), "127.0.0.1:9090");
        assert!(server.registry().is_none());
    }

    #[test]
    fn test_server_custom_config() {
        let config = ServerConfig {
            bind_addr: "0.0.0.0:8080".to_string(),
            max_peers_per_room: 50,
            broadcast_capacity: 512,
            shared_store_path: None,
        };
        let server = SessionServer::new(config).unwrap();
        assert_eq!(server.bind_addr(), "0.0.0.0:8080");
    }

    #[test]
    fn test_server_with_shared_store() {
        let dir = tempfile::tempdir().unwrap();
        let server =
            SessionServer::with_shared_store("127.0.0.1:0", dir.path().join("db")).unwrap();
        assert!(server.registry().is_some());
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = SessionServer::with_defaults();
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.total_messages, 0);
        assert_eq!(stats.active_rooms, 0);
    }

    #[test]
    fn test_validate_bearer_credential() {
        assert!(validate_credential(None, &Credential::Bearer("jwt".into())).is_ok());
        assert!(matches!(
            validate_credential(None, &Credential::Bearer(String::new())),
            Err(ProtocolError::Unauthorized(_))
        ));
    }

    #[test]
    fn test_validate_share_token_against_registry() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            SharedStore::open(SharedStoreConfig::for_testing(dir.path().join("db"))).unwrap(),
        );
        let registry = ShareTokenRegistry::new(store);
        let token = registry
            .issue("d-1", &umlflow_core::DiagramData::default())
            .unwrap();

        assert!(validate_credential(
            Some(&registry),
            &Credential::ShareToken(token)
        )
        .is_ok());
        assert!(matches!(
            validate_credential(Some(&registry), &Credential::ShareToken("NOPE0000".into())),
            Err(ProtocolError::Unauthorized(_))
        ));
    }

    #[test]
    fn test_seed_diagram_from_registry() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            SharedStore::open(SharedStoreConfig::for_testing(dir.path().join("db"))).unwrap(),
        );
        let registry = ShareTokenRegistry::new(store);

        let mut data = umlflow_core::DiagramData::default();
        data.classes.push(umlflow_core::UmlClass::new(
            "c1",
            "User",
            umlflow_core::Point::new(1.0, 2.0),
        ));
        let token = registry.issue("d-1", &data).unwrap();

        let seeded = seed_diagram(Some(&registry), &format!("shared-{token}"));
        assert_eq!(seeded.data, data);

        let fresh = seed_diagram(Some(&registry), "d-unshared");
        assert!(fresh.data.classes.is_empty());
    }
}
