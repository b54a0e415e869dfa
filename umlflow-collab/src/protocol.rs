//! Binary protocol for diagram session synchronization.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬────────────┬──────────┐
//! │ msg_type │ peer_id   │ diagram_id │ payload  │
//! │ 1 byte   │ 16 bytes  │ variable   │ variable │
//! └──────────┴───────────┴────────────┴──────────┘
//! ```
//!
//! Every message carries the sender's peer id and the diagram it targets;
//! the payload encoding varies by message type. Patches are typed
//! [`DiagramPatch`] values, not opaque CRDT updates, so receivers apply
//! them idempotently against their own document store.

use serde::{Deserialize, Serialize};
use umlflow_core::{DiagramPatch, Point};
use uuid::Uuid;

/// Message types for the session protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Join a diagram session (carries participant info + credential)
    Join = 1,
    /// Leave the current session
    Leave = 2,
    /// Typed diagram patch
    Patch = 3,
    /// Cursor position update
    Cursor = 4,
    /// Full participant roster (server → joining peer)
    Presence = 5,
    /// A participant joined
    UserJoined = 6,
    /// A participant left
    UserLeft = 7,
}

/// Credential presented when joining a session.
///
/// Owned diagrams authenticate with the backend bearer token; diagrams
/// opened via a share link authenticate with the share token itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Credential {
    Bearer(String),
    ShareToken(String),
}

/// Participant identity with display metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Participant {
    pub peer_id: Uuid,
    pub name: String,
    /// RGBA color for remote cursor rendering
    pub color: [f32; 4],
}

impl Participant {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), name)
    }

    /// Create with explicit peer_id (for testing)
    pub fn with_id(peer_id: Uuid, name: impl Into<String>) -> Self {
        // Stable color from peer_id hash
        let hash = peer_id.as_u128();
        let r = (hash & 0xFF) as f32 / 255.0;
        let g = ((hash >> 8) & 0xFF) as f32 / 255.0;
        let b = ((hash >> 16) & 0xFF) as f32 / 255.0;
        Self {
            peer_id,
            name: name.into(),
            color: [r, g, b, 1.0],
        }
    }
}

/// Join payload: who is joining and how they authenticate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub participant: Participant,
    pub credential: Credential,
}

/// Top-level protocol message.
///
/// Serialized with bincode for minimal overhead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMessage {
    pub msg_type: MessageType,
    pub peer_id: Uuid,
    pub diagram_id: String,
    /// Message payload (varies by msg_type)
    pub payload: Vec<u8>,
}

impl SessionMessage {
    /// Create a join message.
    pub fn join(
        diagram_id: impl Into<String>,
        participant: &Participant,
        credential: Credential,
    ) -> Self {
        let request = JoinRequest {
            participant: participant.clone(),
            credential,
        };
        let payload = bincode::serde::encode_to_vec(&request, bincode::config::standard())
            .unwrap_or_default();
        Self {
            msg_type: MessageType::Join,
            peer_id: participant.peer_id,
            diagram_id: diagram_id.into(),
            payload,
        }
    }

    /// Create a leave message.
    pub fn leave(peer_id: Uuid, diagram_id: impl Into<String>) -> Self {
        Self {
            msg_type: MessageType::Leave,
            peer_id,
            diagram_id: diagram_id.into(),
            payload: Vec::new(),
        }
    }

    /// Create a patch message.
    pub fn patch(
        peer_id: Uuid,
        diagram_id: impl Into<String>,
        patch: &DiagramPatch,
    ) -> Result<Self, ProtocolError> {
        let payload = bincode::serde::encode_to_vec(patch, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        Ok(Self {
            msg_type: MessageType::Patch,
            peer_id,
            diagram_id: diagram_id.into(),
            payload,
        })
    }

    /// Create a cursor update message.
    pub fn cursor(peer_id: Uuid, diagram_id: impl Into<String>, position: Point) -> Self {
        let payload = bincode::serde::encode_to_vec(&position, bincode::config::standard())
            .unwrap_or_default();
        Self {
            msg_type: MessageType::Cursor,
            peer_id,
            diagram_id: diagram_id.into(),
            payload,
        }
    }

    /// Create a presence roster message (server → joining peer).
    pub fn presence(
        diagram_id: impl Into<String>,
        roster: &[Participant],
    ) -> Result<Self, ProtocolError> {
        let payload = bincode::serde::encode_to_vec(roster, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        Ok(Self {
            msg_type: MessageType::Presence,
            peer_id: Uuid::nil(),
            diagram_id: diagram_id.into(),
            payload,
        })
    }

    /// Create a user joined notification.
    pub fn user_joined(diagram_id: impl Into<String>, participant: &Participant) -> Self {
        let payload = bincode::serde::encode_to_vec(participant, bincode::config::standard())
            .unwrap_or_default();
        Self {
            msg_type: MessageType::UserJoined,
            peer_id: participant.peer_id,
            diagram_id: diagram_id.into(),
            payload,
        }
    }

    /// Create a user left notification.
    pub fn user_left(peer_id: Uuid, diagram_id: impl Into<String>) -> Self {
        Self {
            msg_type: MessageType::UserLeft,
            peer_id,
            diagram_id: diagram_id.into(),
            payload: Vec::new(),
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }

    /// Parse join payload.
    pub fn join_request(&self) -> Result<JoinRequest, ProtocolError> {
        if self.msg_type != MessageType::Join {
            return Err(ProtocolError::InvalidMessageType);
        }
        Self::decode_payload(&self.payload)
    }

    /// Parse patch payload.
    pub fn diagram_patch(&self) -> Result<DiagramPatch, ProtocolError> {
        if self.msg_type != MessageType::Patch {
            return Err(ProtocolError::InvalidMessageType);
        }
        Self::decode_payload(&self.payload)
    }

    /// Parse cursor payload.
    pub fn cursor_position(&self) -> Result<Point, ProtocolError> {
        if self.msg_type != MessageType::Cursor {
            return Err(ProtocolError::InvalidMessageType);
        }
        Self::decode_payload(&self.payload)
    }

    /// Parse presence roster payload.
    pub fn roster(&self) -> Result<Vec<Participant>, ProtocolError> {
        if self.msg_type != MessageType::Presence {
            return Err(ProtocolError::InvalidMessageType);
        }
        Self::decode_payload(&self.payload)
    }

    /// Parse user joined payload.
    pub fn participant(&self) -> Result<Participant, ProtocolError> {
        if self.msg_type != MessageType::UserJoined {
            return Err(ProtocolError::InvalidMessageType);
        }
        Self::decode_payload(&self.payload)
    }

    fn decode_payload<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
        let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(value)
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidMessageType,
    Unauthorized(String),
    ConnectionClosed,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidMessageType => write!(f, "Invalid message type"),
            Self::Unauthorized(reason) => write!(f, "Unauthorized: {reason}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;
    use umlflow_core::UmlClass;

    #[test]
    fn test_join_roundtrip() {
        let participant = Participant::new("Alice");
        let msg = SessionMessage::join(
            "shared-AB12CD34",
            &participant,
            Credential::ShareToken("AB12CD34".to_string()),
        );
        let decoded = SessionMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.msg_type, MessageType::Join);
        assert_eq!(decoded.diagram_id, "shared-AB12CD34");
        let request = decoded.join_request().unwrap();
        assert_eq!(request.participant.name, "Alice");
        assert_eq!(
            request.credential,
            Credential::ShareToken("AB12CD34".to_string())
        );
    }

    #[test]
    fn test_patch_roundtrip() {
        let peer = Uuid::new_v4();
        let patch = DiagramPatch::CreateClass {
            class: UmlClass::new("c1", "Order", Point::new(10.0, 20.0)),
        };

        let msg = SessionMessage::patch(peer, "d-1", &patch).unwrap();
        let decoded = SessionMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.msg_type, MessageType::Patch);
        assert_eq!(decoded.peer_id, peer);
        assert_eq!(decoded.diagram_patch().unwrap(), patch);
    }

    #[test]
    fn test_cursor_roundtrip() {
        let peer = Uuid::new_v4();
        let msg = SessionMessage::cursor(peer, "d-1", Point::new(100.5, 200.25));
        let decoded = SessionMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.msg_type, MessageType::Cursor);
        assert_eq!(decoded.cursor_position().unwrap(), Point::new(100.5, 200.25));
    }

    #[test]
    fn test_presence_roundtrip() {
        let roster = vec![Participant::new("Alice"), Participant::new("Bob")];
        let msg = SessionMessage::presence("d-1", &roster).unwrap();
        let decoded = SessionMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.msg_type, MessageType::Presence);
        assert_eq!(decoded.roster().unwrap(), roster);
    }

    #[test]
    fn test_user_joined_roundtrip() {
        let participant = Participant::new("Carol");
        let msg = SessionMessage::user_joined("d-1", &participant);
        let decoded = SessionMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.msg_type, MessageType::UserJoined);
        assert_eq!(decoded.participant().unwrap(), participant);
    }

    #[test]
    fn test_user_left_roundtrip() {
        let peer = Uuid::new_v4();
        let msg = SessionMessage::user_left(peer, "d-1");
        let decoded = SessionMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.msg_type, MessageType::UserLeft);
        assert_eq!(decoded.peer_id, peer);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_leave_roundtrip() {
        let peer = Uuid::new_v4();
        let msg = SessionMessage::leave(peer, "d-1");
        let decoded = SessionMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.msg_type, MessageType::Leave);
        assert_eq!(decoded.diagram_id, "d-1");
    }

    #[test]
    fn test_participant_stable_color() {
        let id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        let p1 = Participant::with_id(id, "Test");
        let p2 = Participant::with_id(id, "Test");

        // Same peer_id always produces same color
        assert_eq!(p1.color, p2.color);
    }

    #[test]
    fn test_invalid_message_type_error() {
        let msg = SessionMessage::leave(Uuid::new_v4(), "d-1");
        assert!(msg.join_request().is_err());
        assert!(msg.diagram_patch().is_err());
        assert!(msg.cursor_position().is_err());
        assert!(msg.roster().is_err());
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(SessionMessage::decode(&garbage).is_err());
    }

    #[test]
    fn test_message_type_values() {
        assert_eq!(MessageType::Join as u8, 1);
        assert_eq!(MessageType::Leave as u8, 2);
        assert_eq!(MessageType::Patch as u8, 3);
        assert_eq!(MessageType::Cursor as u8, 4);
        assert_eq!(MessageType::Presence as u8, 5);
        assert_eq!(MessageType::UserJoined as u8, 6);
        assert_eq!(MessageType::UserLeft as u8, 7);
    }
}
