//! Shared out-of-band store for cross-client discovery.
//!
//! Architecture:
//! ```text
//! ┌──────────────┐   issue/resolve   ┌──────────────┐
//! │ ShareToken   │ ────────────────► │ SharedStore  │
//! │ Registry     │                   │ (RocksDB)    │
//! └──────┬───────┘                   └──────┬───────┘
//!        │                                  │ column families
//!        ▼                                  ▼
//! ┌──────────────┐    ┌─────────────────────────────────────┐
//! │ FallbackSync │    │ CF "tokens"    — per-token snapshots │
//! │ Poller       │    │ CF "directory" — global token index  │
//! └──────────────┘    │ CF "backups"   — timestamped copies  │
//!                     └─────────────────────────────────────┘
//! ```
//!
//! The store is a multi-writer, multi-reader shared resource with no
//! transactional guarantee: entry writes are whole-value overwrites, so
//! two simultaneous shares of the same token can clobber each other.
//! This is an accepted limitation of snapshot-based fallback sync.

pub mod rocks;

pub use rocks::{ShareEntry, SharedStore, SharedStoreConfig, StoreError};
