//! Per-room fan-out of encoded session frames.
//!
//! One broadcast channel per diagram session. Every frame carries the
//! originating peer id, so subscribers drop their own echoes by comparing
//! ids instead of decoding the payload. Slow subscribers lag and lose the
//! oldest frames rather than stalling the rest of the room.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{Participant, ProtocolError, SessionMessage};

/// An encoded message together with the peer it came from.
#[derive(Debug, Clone)]
pub struct RoomFrame {
    pub sender: Uuid,
    pub bytes: Arc<Vec<u8>>,
}

/// Fan-out hub for one diagram session.
pub struct BroadcastGroup {
    tx: broadcast::Sender<RoomFrame>,
    roster: RwLock<HashMap<Uuid, Participant>>,
    frames_sent: AtomicU64,
}

impl BroadcastGroup {
    /// Create a group buffering up to `capacity` frames per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            roster: RwLock::new(HashMap::new()),
            frames_sent: AtomicU64::new(0),
        }
    }

    /// Register a participant and subscribe them to the room's frames.
    pub async fn join(&self, participant: Participant) -> broadcast::Receiver<RoomFrame> {
        self.roster
            .write()
            .await
            .insert(participant.peer_id, participant);
        self.tx.subscribe()
    }

    /// Drop a participant from the roster.
    ///
    /// Their receiver keeps draining buffered frames until dropped.
    pub async fn leave(&self, peer_id: &Uuid) -> Option<Participant> {
        self.roster.write().await.remove(peer_id)
    }

    /// Fan pre-encoded bytes out, attributed to `sender`.
    ///
    /// Returns how many subscribers the frame reached; zero when the
    /// room has no listeners.
    pub fn send(&self, sender: Uuid, bytes: Arc<Vec<u8>>) -> usize {
        let delivered = self.tx.send(RoomFrame { sender, bytes }).unwrap_or(0);
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        delivered
    }

    /// Encode a protocol message and fan it out under its own peer id.
    pub fn publish(&self, msg: &SessionMessage) -> Result<usize, ProtocolError> {
        let encoded = msg.encode()?;
        Ok(self.send(msg.peer_id, Arc::new(encoded)))
    }

    pub async fn peer_count(&self) -> usize {
        self.roster.read().await.len()
    }

    /// Everyone currently in the room.
    pub async fn roster(&self) -> Vec<Participant> {
        self.roster.read().await.values().cloned().collect()
    }

    /// Total frames pushed through this group.
    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }
}
