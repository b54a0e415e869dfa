//! WebSocket session channel for live diagram collaboration.
//!
//! Lifecycle per document session:
//! ```text
//! Disconnected ──connect()──▶ Connecting ──join sent──▶ Joined
//!                                                          │
//!                                              presence received
//!                                                          ▼
//!      Closed ◀──leave() / connection lost──────────── Active
//! ```
//!
//! A channel is opened only when the user explicitly opts into
//! collaboration, never merely because a document was opened. Leaving
//! emits the leave message best-effort before teardown and clears all
//! remote cursor state for the session. A leave before the join
//! completed is a no-op, not an error.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex, RwLock};
use umlflow_core::{DiagramPatch, Point};
use uuid::Uuid;

use crate::protocol::{
    Credential, MessageType, Participant, ProtocolError, SessionMessage,
};

/// Minimum interval between outbound cursor updates.
const CURSOR_THROTTLE: Duration = Duration::from_millis(50);

/// Channel connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// No channel open (initial).
    Disconnected,
    /// Socket opening, join not yet announced.
    Connecting,
    /// Join announced, waiting for the presence roster.
    Joined,
    /// Bidirectional patch/cursor exchange.
    Active,
    /// Left or lost; terminal for this session.
    Closed,
}

/// Ephemeral per-peer cursor, removed when the peer leaves.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteCursor {
    pub peer_id: Uuid,
    pub name: String,
    pub position: Point,
}

/// Events emitted by the session channel.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Presence roster received; the session is now active
    Active(Vec<Participant>),
    /// Received a typed patch from a remote peer
    RemotePatch { peer_id: Uuid, patch: DiagramPatch },
    /// A remote peer moved their cursor
    CursorUpdate(RemoteCursor),
    /// A participant joined the session
    UserJoined(Participant),
    /// A participant left the session
    UserLeft(Uuid),
    /// The channel closed (left or connection lost)
    Closed,
}

/// The session channel.
///
/// Manages a WebSocket connection to the session server for one diagram,
/// carrying join/leave, presence, cursor, and patch traffic.
pub struct SessionChannel {
    /// Our participant identity
    participant: Participant,

    /// Diagram this session targets
    diagram_id: String,

    /// Connection state
    state: Arc<RwLock<ChannelState>>,

    /// Remote cursors, keyed by peer id
    cursors: Arc<RwLock<HashMap<Uuid, RemoteCursor>>>,

    /// Known participants, keyed by peer id
    peers: Arc<RwLock<HashMap<Uuid, Participant>>>,

    /// Last outbound cursor send, for throttling
    last_cursor_sent: Mutex<Option<Instant>>,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<SessionEvent>>,

    /// Event sender (held by the reader task)
    event_tx: mpsc::Sender<SessionEvent>,

    /// Server URL
    server_url: String,
}

impl SessionChannel {
    /// Create a channel for one diagram session. Does not connect.
    pub fn new(
        participant: Participant,
        diagram_id: impl Into<String>,
        server_url: impl Into<String>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            participant,
            diagram_id: diagram_id.into(),
            state: Arc::new(RwLock::new(ChannelState::Disconnected)),
            cursors: Arc::new(RwLock::new(HashMap::new())),
            peers: Arc::new(RwLock::new(HashMap::new())),
            last_cursor_sent: Mutex::new(None),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            server_url: server_url.into(),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.event_rx.take()
    }

    /// Connect and announce the join.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages.
    /// The session becomes `Active` once the presence roster arrives.
    pub async fn connect(&mut self, credential: Credential) -> Result<(), ProtocolError> {
        {
            let mut state = self.state.write().await;
            if *state != ChannelState::Disconnected {
                return Err(ProtocolError::ConnectionClosed);
            }
            *state = ChannelState::Connecting;
        }

        let url = format!("{}/{}", self.server_url, self.diagram_id);
        let ws_stream = match tokio_tungstenite::connect_async(&url).await {
            Ok((stream, _)) => stream,
            Err(e) => {
                log::warn!("Session connect to {url} failed: {e}");
                *self.state.write().await = ChannelState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        self.outgoing_tx = Some(out_tx);
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer
                    .send(tokio_tungstenite::tungstenite::Message::Binary(data.into()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        // Announce the join
        let join = SessionMessage::join(&self.diagram_id, &self.participant, credential);
        let encoded = join.encode()?;
        if let Some(ref tx) = self.outgoing_tx {
            tx.send(encoded)
                .await
                .map_err(|_| ProtocolError::ConnectionClosed)?;
        }
        *self.state.write().await = ChannelState::Joined;

        // Reader task: decode inbound messages into session events
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let cursors = self.cursors.clone();
        let peers = self.peers.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(tokio_tungstenite::tungstenite::Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        let session_msg = match SessionMessage::decode(&bytes) {
                            Ok(m) => m,
                            Err(e) => {
                                log::debug!("Dropping undecodable session message: {e}");
                                continue;
                            }
                        };
                        // The server never echoes a frame back to its
                        // sender, so everything that arrives is remote
                        let event = match session_msg.msg_type {
                            MessageType::Presence => match session_msg.roster() {
                                Ok(roster) => {
                                    {
                                        let mut known = peers.write().await;
                                        for p in &roster {
                                            known.insert(p.peer_id, p.clone());
                                        }
                                    }
                                    *state.write().await = ChannelState::Active;
                                    Some(SessionEvent::Active(roster))
                                }
                                Err(_) => None,
                            },
                            MessageType::Patch => session_msg
                                .diagram_patch()
                                .ok()
                                .map(|patch| SessionEvent::RemotePatch {
                                    peer_id: session_msg.peer_id,
                                    patch,
                                }),
                            MessageType::Cursor => match session_msg.cursor_position() {
                                Ok(position) => {
                                    let name = peers
                                        .read()
                                        .await
                                        .get(&session_msg.peer_id)
                                        .map(|p| p.name.clone())
                                        .unwrap_or_default();
                                    let cursor = RemoteCursor {
                                        peer_id: session_msg.peer_id,
                                        name,
                                        position,
                                    };
                                    cursors
                                        .write()
                                        .await
                                        .insert(session_msg.peer_id, cursor.clone());
                                    Some(SessionEvent::CursorUpdate(cursor))
                                }
                                Err(_) => None,
                            },
                            MessageType::UserJoined => match session_msg.participant() {
                                Ok(p) => {
                                    peers.write().await.insert(p.peer_id, p.clone());
                                    Some(SessionEvent::UserJoined(p))
                                }
                                Err(_) => None,
                            },
                            MessageType::UserLeft => {
                                peers.write().await.remove(&session_msg.peer_id);
                                cursors.write().await.remove(&session_msg.peer_id);
                                Some(SessionEvent::UserLeft(session_msg.peer_id))
                            }
                            _ => None,
                        };

                        if let Some(evt) = event {
                            let _ = event_tx.send(evt).await;
                        }
                    }
                    Ok(tokio_tungstenite::tungstenite::Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection over: clear ephemeral state
            cursors.write().await.clear();
            peers.write().await.clear();
            *state.write().await = ChannelState::Closed;
            let _ = event_tx.send(SessionEvent::Closed).await;
        });

        Ok(())
    }

    /// Broadcast a patch to the session.
    pub async fn send_patch(&self, patch: &DiagramPatch) -> Result<(), ProtocolError> {
        let state = *self.state.read().await;
        if !matches!(state, ChannelState::Joined | ChannelState::Active) {
            return Err(ProtocolError::ConnectionClosed);
        }

        let msg = SessionMessage::patch(self.participant.peer_id, &self.diagram_id, patch)?;
        let encoded = msg.encode()?;
        if let Some(ref tx) = self.outgoing_tx {
            tx.send(encoded)
                .await
                .map_err(|_| ProtocolError::ConnectionClosed)?;
        }
        Ok(())
    }

    /// Send a cursor position update.
    ///
    /// Silently dropped while not active, and rate-limited so mouse
    /// movement does not flood the channel.
    pub async fn send_cursor(&self, position: Point) -> Result<(), ProtocolError> {
        let state = *self.state.read().await;
        if state != ChannelState::Active {
            return Ok(());
        }

        {
            let mut last = self.last_cursor_sent.lock().await;
            if let Some(sent) = *last {
                if sent.elapsed() < CURSOR_THROTTLE {
                    return Ok(());
                }
            }
            *last = Some(Instant::now());
        }

        let msg = SessionMessage::cursor(self.participant.peer_id, &self.diagram_id, position);
        let encoded = msg.encode()?;
        if let Some(ref tx) = self.outgoing_tx {
            tx.send(encoded)
                .await
                .map_err(|_| ProtocolError::ConnectionClosed)?;
        }
        Ok(())
    }

    /// Leave the session.
    ///
    /// Emits the leave message best-effort before tearing the channel
    /// down; it does not wait for acknowledgment. Calling leave before
    /// the join completed (or after close) is a no-op.
    pub async fn leave(&mut self) {
        let prior = {
            let mut state = self.state.write().await;
            let prior = *state;
            if matches!(prior, ChannelState::Joined | ChannelState::Active) {
                *state = ChannelState::Closed;
            }
            prior
        };
        if !matches!(prior, ChannelState::Joined | ChannelState::Active) {
            log::debug!("Leave on {:?} channel ignored", prior);
            return;
        }

        let msg = SessionMessage::leave(self.participant.peer_id, &self.diagram_id);
        if let (Ok(encoded), Some(tx)) = (msg.encode(), self.outgoing_tx.take()) {
            let _ = tx.send(encoded).await;
            // Dropping the sender closes the writer task and the socket.
        }

        self.cursors.write().await.clear();
        self.peers.write().await.clear();
    }

    /// Get the current channel state.
    pub async fn state(&self) -> ChannelState {
        *self.state.read().await
    }

    /// Get our participant identity.
    pub fn participant(&self) -> &Participant {
        &self.participant
    }

    /// Get the diagram id this channel targets.
    pub fn diagram_id(&self) -> &str {
        &self.diagram_id
    }

    /// Snapshot of remote cursors currently known to the session.
    pub async fn remote_cursors(&self) -> Vec<RemoteCursor> {
        self.cursors.read().await.values().cloned().collect()
    }

    /// Snapshot of participants currently known to the session.
    pub async fn participants(&self) -> Vec<Participant> {
        self.peers.read().await.values().cloned().collect()
    }
}
