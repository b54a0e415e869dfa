//! Share-token registry: short human-typable tokens for diagram sessions.
//!
//! A token is issued against a whole-document snapshot and indexed in the
//! shared store's global directory, so any client instance can resolve it
//! without the issuing client being online. Tokens expire 24 hours after
//! issue; the sweep runs lazily at document-load time and purges expired
//! entries rather than relying on a background job.

use std::sync::Arc;
use std::time::SystemTime;

use umlflow_core::{Diagram, DiagramData, SHARED_ID_PREFIX};
use uuid::Uuid;

use crate::storage::{ShareEntry, SharedStore, StoreError};

/// Token lifetime before expiry.
pub const TOKEN_TTL_SECS: u64 = 24 * 60 * 60;

/// Generated token length in characters.
pub const TOKEN_LEN: usize = 8;

/// Attempts before giving up on finding an unused token.
const MAX_COLLISION_RETRIES: usize = 8;

/// Registry errors.
#[derive(Debug)]
pub enum RegistryError {
    /// No entry exists for the token
    NotFound(String),
    /// Entry exists but is inactive or past its TTL
    Expired(String),
    /// Could not find an unused token after bounded retries
    TokenSpaceExhausted,
    /// Underlying store failure
    Store(StoreError),
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound(token) => write!(f, "Share token not found: {token}"),
            Self::Expired(token) => write!(f, "Share token expired: {token}"),
            Self::TokenSpaceExhausted => write!(f, "Could not generate an unused share token"),
            Self::Store(e) => write!(f, "Share store error: {e}"),
        }
    }
}

impl std::error::Error for RegistryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Store(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StoreError> for RegistryError {
    fn from(e: StoreError) -> Self {
        RegistryError::Store(e)
    }
}

/// Seconds since the Unix epoch.
pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// The share-token registry.
///
/// Issues tokens against diagram snapshots, resolves them across client
/// instances, and purges expired entries at load time.
pub struct ShareTokenRegistry {
    store: Arc<SharedStore>,
}

impl ShareTokenRegistry {
    pub fn new(store: Arc<SharedStore>) -> Self {
        Self { store }
    }

    /// Issue a token for a diagram snapshot.
    ///
    /// Tokens are generated client-side with no central allocator, so a
    /// collision with an existing live entry is rejected and regenerated,
    /// bounded by a retry limit.
    pub fn issue(&self, diagram_id: &str, data: &DiagramData) -> Result<String, RegistryError> {
        self.issue_at(diagram_id, data, now_secs())
    }

    /// Issue with an explicit clock (for TTL tests).
    pub fn issue_at(
        &self,
        diagram_id: &str,
        data: &DiagramData,
        now: u64,
    ) -> Result<String, RegistryError> {
        for _ in 0..MAX_COLLISION_RETRIES {
            let token = generate_token();
            if self.store.contains(&token)? {
                log::debug!("Share token collision on {token}, regenerating");
                continue;
            }

            let entry = ShareEntry {
                token: token.clone(),
                diagram_id: diagram_id.to_string(),
                diagram_data: data.clone(),
                shared_at: now,
                is_active: true,
                last_updated: now * 1000,
            };
            self.store.put_entry(&entry)?;
            log::info!("Issued share token {token} for diagram {diagram_id}");
            return Ok(token);
        }
        Err(RegistryError::TokenSpaceExhausted)
    }

    /// Resolve a token to its entry.
    ///
    /// Tokens are case-normalized before lookup. An entry that is inactive
    /// or at/past its TTL resolves to `Expired`, a missing one to `NotFound`.
    pub fn resolve(&self, token: &str) -> Result<ShareEntry, RegistryError> {
        self.resolve_at(token, now_secs())
    }

    /// Resolve with an explicit clock (for TTL tests).
    pub fn resolve_at(&self, token: &str, now: u64) -> Result<ShareEntry, RegistryError> {
        let token = normalize_token(token);
        let entry = match self.store.get_entry(&token) {
            Ok(entry) => entry,
            Err(StoreError::NotFound(_)) => return Err(RegistryError::NotFound(token)),
            Err(e) => return Err(e.into()),
        };

        if !entry.is_active || is_expired(&entry, now) {
            return Err(RegistryError::Expired(token));
        }
        Ok(entry)
    }

    /// Join a shared session: materialize a local diagram from the token.
    ///
    /// The returned diagram's id carries the shared-session marker, which
    /// makes it subject to the fallback sync poller.
    pub fn join(&self, token: &str) -> Result<Diagram, RegistryError> {
        self.join_at(token, now_secs())
    }

    /// Join with an explicit clock (for TTL tests).
    pub fn join_at(&self, token: &str, now: u64) -> Result<Diagram, RegistryError> {
        let entry = self.resolve_at(token, now)?;
        Ok(Diagram {
            id: format!("{SHARED_ID_PREFIX}{}", entry.token),
            version: 1,
            data: entry.diagram_data,
        })
    }

    /// Revoke a token so it can no longer be resolved.
    pub fn revoke(&self, token: &str) -> Result<(), RegistryError> {
        let token = normalize_token(token);
        let mut entry = match self.store.get_entry(&token) {
            Ok(entry) => entry,
            Err(StoreError::NotFound(_)) => return Err(RegistryError::NotFound(token)),
            Err(e) => return Err(e.into()),
        };
        entry.is_active = false;
        self.store.put_entry(&entry)?;
        Ok(())
    }

    /// Overwrite a token's snapshot and bump its last-updated stamp.
    ///
    /// Used by autosave and the session server to propagate edits of a
    /// shared diagram into the out-of-band store.
    pub fn touch(&self, token: &str, data: &DiagramData) -> Result<u64, RegistryError> {
        self.touch_at(token, data, now_millis())
    }

    /// Touch with an explicit clock (for poller tests).
    pub fn touch_at(
        &self,
        token: &str,
        data: &DiagramData,
        now_millis: u64,
    ) -> Result<u64, RegistryError> {
        let token = normalize_token(token);
        let mut entry = match self.store.get_entry(&token) {
            Ok(entry) => entry,
            Err(StoreError::NotFound(_)) => return Err(RegistryError::NotFound(token)),
            Err(e) => return Err(e.into()),
        };
        entry.diagram_data = data.clone();
        entry.last_updated = now_millis;
        self.store.put_entry(&entry)?;
        Ok(now_millis)
    }

    /// Purge expired and inactive entries. Returns the number removed.
    ///
    /// Runs at document-load time rather than on a timer.
    pub fn sweep(&self) -> Result<usize, RegistryError> {
        self.sweep_at(now_secs())
    }

    /// Sweep with an explicit clock (for TTL tests).
    pub fn sweep_at(&self, now: u64) -> Result<usize, RegistryError> {
        let mut purged = 0;
        for token in self.store.list_tokens()? {
            let entry = match self.store.get_entry(&token) {
                Ok(entry) => entry,
                // Directory can reference a token whose entry was clobbered
                Err(StoreError::NotFound(_)) => {
                    self.store.remove_entry(&token)?;
                    purged += 1;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            if !entry.is_active || is_expired(&entry, now) {
                self.store.remove_entry(&token)?;
                purged += 1;
            }
        }
        if purged > 0 {
            log::info!("Swept {purged} expired share tokens");
        }
        Ok(purged)
    }

    /// Direct access to the underlying store.
    pub fn store(&self) -> &Arc<SharedStore> {
        &self.store
    }
}

fn is_expired(entry: &ShareEntry, now: u64) -> bool {
    now.saturating_sub(entry.shared_at) >= TOKEN_TTL_SECS
}

fn normalize_token(token: &str) -> String {
    token.trim().to_ascii_uppercase()
}

/// Generate an 8-character uppercase alphanumeric token from UUID entropy.
fn generate_token() -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let entropy = Uuid::new_v4().as_u128();
    (0..TOKEN_LEN)
        .map(|i| {
            let idx = ((entropy >> (i * 8)) & 0xFF) as usize % ALPHABET.len();
            ALPHABET[idx] as char
        })
        .collect()
}
