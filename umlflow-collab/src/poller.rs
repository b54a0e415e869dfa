//! Fallback synchronization over the shared store.
//!
//! When no session channel is live, shared diagrams still converge by
//! polling the out-of-band share entry on a fixed period. The poller
//! compares the entry's last-updated stamp against the last value it
//! saw and, only on change, replaces the entire local document with the
//! stored snapshot. Whole-document replace, not patch application:
//! deliberately coarse, because this path must work as the only sync
//! mechanism when no channel exists.
//!
//! Only diagrams whose id carries the shared marker are ever polled.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use umlflow_core::{DocumentStore, SHARED_ID_PREFIX};

use crate::registry::{RegistryError, ShareTokenRegistry};

/// Fixed polling period.
pub const POLL_INTERVAL: Duration = Duration::from_secs(3);

/// The fallback sync poller for one shared diagram.
pub struct FallbackPoller {
    store: Arc<RwLock<DocumentStore>>,
    registry: Arc<ShareTokenRegistry>,
    token: String,
    interval: Duration,
    /// Last observed last-updated stamp (millis)
    last_seen: AtomicU64,
    /// Set while a session channel is active
    paused: AtomicBool,
}

impl FallbackPoller {
    /// Create a poller for the document in `store`.
    ///
    /// Returns `None` for diagrams without the shared marker; those are
    /// never subject to fallback sync.
    pub async fn new(
        store: Arc<RwLock<DocumentStore>>,
        registry: Arc<ShareTokenRegistry>,
    ) -> Option<Arc<Self>> {
        Self::with_interval(store, registry, POLL_INTERVAL).await
    }

    /// Create with an explicit period (for tests).
    pub async fn with_interval(
        store: Arc<RwLock<DocumentStore>>,
        registry: Arc<ShareTokenRegistry>,
        interval: Duration,
    ) -> Option<Arc<Self>> {
        let token = {
            let doc = store.read().await;
            match doc.diagram_id().strip_prefix(SHARED_ID_PREFIX) {
                Some(token) => token.to_string(),
                None => {
                    log::debug!("Diagram {} is not shared, no fallback sync", doc.diagram_id());
                    return None;
                }
            }
        };

        // Seed from the entry's current stamp so the first poll already
        // adopts anything written after this point. Starting at zero would
        // let a write landing before the first tick record its stamp
        // without ever being applied.
        let last_seen = match registry.resolve(&token) {
            Ok(entry) => entry.last_updated,
            Err(_) => 0,
        };

        Some(Arc::new(Self {
            store,
            registry,
            token,
            interval,
            last_seen: AtomicU64::new(last_seen),
            paused: AtomicBool::new(false),
        }))
    }

    /// Pause polling while a live channel carries the session.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    /// Resume polling after the channel closes.
    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// The share token this poller watches.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Run the polling loop until the token disappears or expires.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            if self.is_paused() {
                continue;
            }

            match self.poll_once().await {
                Ok(true) => log::debug!("Fallback sync applied snapshot for {}", self.token),
                Ok(false) => {}
                Err(RegistryError::NotFound(_)) | Err(RegistryError::Expired(_)) => {
                    log::warn!("Share token {} gone, stopping fallback sync", self.token);
                    break;
                }
                Err(e) => log::error!("Fallback sync for {} failed: {e}", self.token),
            }
        }
    }

    /// One poll cycle. Returns whether the local document was replaced.
    ///
    /// The replace does not mark the document dirty: snapshot adoption
    /// is not a local edit and must not trigger an autosave cycle.
    pub async fn poll_once(&self) -> Result<bool, RegistryError> {
        let entry = self.registry.resolve(&self.token)?;

        let seen = self.last_seen.load(Ordering::SeqCst);
        if entry.last_updated <= seen {
            return Ok(false);
        }
        self.last_seen.store(entry.last_updated, Ordering::SeqCst);

        self.store.write().await.replace(entry.diagram_data);
        Ok(true)
    }
}
