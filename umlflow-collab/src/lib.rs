//! # umlflow-collab — Collaborative session synchronizer for UML diagrams
//!
//! Keeps a shared class diagram converged across peers over two paths:
//! a live WebSocket session carrying typed patches, and a fallback
//! poller replaying whole-document snapshots from a shared store when
//! no channel is available.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────┐     WebSocket      ┌───────────────┐
//! │ SessionChannel │ ◄─────────────────► │ SessionServer │
//! │ (per user)     │    Binary Proto     │ (central)     │
//! └──────┬─────────┘                     └──────┬────────┘
//!        │                                      │
//!        ▼                                      ▼
//! ┌────────────────┐                    ┌───────────────┐
//! │ DocumentStore  │                    │ DocumentStore │
//! │ (local)        │                    │ (authority)   │
//! └──────┬─────────┘                    └──────┬────────┘
//!        │                                     │
//!   ┌────┴─────┐                       ┌───────┴───────┐
//!   │ Autosave │                       │ BroadcastGroup│
//!   │ (REST)   │                       │ (fan-out)     │
//!   └──────────┘                       └───────────────┘
//!        │
//!        ▼
//! ┌────────────────┐    3s interval    ┌───────────────┐
//! │ FallbackPoller │ ◄───────────────── │ SharedStore   │
//! │ (shared- only) │                    │ (RocksDB)     │
//! └────────────────┘                    └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Binary wire protocol (bincode-encoded SessionMessage)
//! - [`channel`] — Client session channel with explicit lifecycle
//! - [`broadcast`] — Room fan-out of sender-attributed frames
//! - [`server`] — WebSocket session server
//! - [`registry`] — Share-token issue/resolve/join with 24h TTL
//! - [`poller`] — Snapshot fallback sync for shared diagrams
//! - [`autosave`] — Debounced full-document persistence
//! - [`backend`] / [`rest`] — REST persistence seam
//! - [`storage`] — RocksDB shared store (tokens, directory, backups)

pub mod autosave;
pub mod backend;
pub mod broadcast;
pub mod channel;
pub mod poller;
pub mod protocol;
pub mod registry;
pub mod rest;
pub mod server;
pub mod storage;

// Re-exports for convenience
pub use autosave::{Autosave, AutosaveConfig, SaveOutcome};
pub use backend::{ApiError, DiagramBackend, InMemoryBackend};
pub use broadcast::{BroadcastGroup, RoomFrame};
pub use channel::{ChannelState, RemoteCursor, SessionChannel, SessionEvent};
pub use poller::{FallbackPoller, POLL_INTERVAL};
pub use protocol::{
    Credential, JoinRequest, MessageType, Participant, ProtocolError, SessionMessage,
};
pub use registry::{RegistryError, ShareTokenRegistry, TOKEN_LEN, TOKEN_TTL_SECS};
pub use rest::{RestBackend, RestClient};
pub use server::{ServerConfig, ServerStats, SessionServer};
pub use storage::{ShareEntry, SharedStore, SharedStoreConfig, StoreError};
