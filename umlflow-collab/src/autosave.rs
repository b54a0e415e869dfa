//! Debounced autosave of the full document to the backend.
//!
//! Every local mutation notifies the saver; a save fires only after a
//! fixed quiet period with no further mutations, and a newer mutation
//! supersedes the pending one. The save serializes the whole document,
//! never a patch. At most one request is in flight: the worker awaits
//! the current save before starting the next debounce cycle.
//!
//! Failure policy is lossy but simple: a failed or timed-out save is
//! logged and surfaced through the outcome channel, with no automatic
//! retry and no rollback of in-memory state. The next mutation's
//! debounce cycle tries again from the latest state.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use umlflow_core::{DocumentStore, SHARED_ID_PREFIX};

use crate::backend::DiagramBackend;
use crate::registry::{now_millis, ShareTokenRegistry};

/// Autosave configuration.
#[derive(Debug, Clone)]
pub struct AutosaveConfig {
    /// Quiet period after the last mutation before a save fires
    pub quiet_period: Duration,
    /// Per-request timeout; expiry counts as a failed save
    pub request_timeout: Duration,
}

impl Default for AutosaveConfig {
    fn default() -> Self {
        Self {
            quiet_period: Duration::from_secs(2),
            request_timeout: Duration::from_secs(5),
        }
    }
}

/// Result of one save attempt, surfaced to the application.
#[derive(Debug, Clone)]
pub enum SaveOutcome {
    Saved { diagram_id: String, version: u64 },
    Failed { diagram_id: String, error: String },
}

enum Signal {
    Mutated,
    Flush,
}

/// Handle to the autosave worker.
pub struct Autosave {
    signal_tx: mpsc::Sender<Signal>,
    outcome_rx: Option<mpsc::Receiver<SaveOutcome>>,
    task: tokio::task::JoinHandle<()>,
}

impl Autosave {
    /// Spawn the autosave worker for one document.
    ///
    /// When the diagram is shared and a registry is supplied, each
    /// successful save also refreshes the out-of-band share entry and
    /// writes a timestamped backup.
    pub fn spawn(
        store: Arc<RwLock<DocumentStore>>,
        backend: Arc<dyn DiagramBackend>,
        registry: Option<Arc<ShareTokenRegistry>>,
        config: AutosaveConfig,
    ) -> Self {
        let (signal_tx, signal_rx) = mpsc::channel(8);
        let (outcome_tx, outcome_rx) = mpsc::channel(32);

        let task = tokio::spawn(run_loop(store, backend, registry, config, signal_rx, outcome_tx));

        Self {
            signal_tx,
            outcome_rx: Some(outcome_rx),
            task,
        }
    }

    /// Notify the worker of a local mutation.
    ///
    /// Never blocks: a full channel already means a save cycle is due.
    pub fn notify(&self) {
        let _ = self.signal_tx.try_send(Signal::Mutated);
    }

    /// Request an immediate save, skipping the remaining quiet period.
    pub async fn flush(&self) {
        let _ = self.signal_tx.send(Signal::Flush).await;
    }

    /// Take the outcome receiver (can only be called once).
    pub fn take_outcome_rx(&mut self) -> Option<mpsc::Receiver<SaveOutcome>> {
        self.outcome_rx.take()
    }

    /// Stop the worker. Pending mutations are not saved.
    pub fn abort(&self) {
        self.task.abort();
    }
}

async fn run_loop(
    store: Arc<RwLock<DocumentStore>>,
    backend: Arc<dyn DiagramBackend>,
    registry: Option<Arc<ShareTokenRegistry>>,
    config: AutosaveConfig,
    mut signal_rx: mpsc::Receiver<Signal>,
    outcome_tx: mpsc::Sender<SaveOutcome>,
) {
    loop {
        // Block until something changed
        let first = match signal_rx.recv().await {
            Some(signal) => signal,
            None => break,
        };

        let mut immediate = matches!(first, Signal::Flush);
        let mut deadline = Instant::now() + config.quiet_period;

        // Debounce: later mutations supersede the pending save
        while !immediate {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break,
                signal = signal_rx.recv() => match signal {
                    Some(Signal::Mutated) => deadline = Instant::now() + config.quiet_period,
                    Some(Signal::Flush) => immediate = true,
                    None => return,
                },
            }
        }

        // Snapshot the latest state; skip if nothing is actually dirty
        let (diagram_id, data) = {
            let mut doc = store.write().await;
            if !doc.is_dirty() {
                continue;
            }
            doc.clear_dirty();
            (doc.diagram_id().to_string(), doc.data())
        };

        // Awaiting inline keeps at most one request in flight
        let result =
            tokio::time::timeout(config.request_timeout, backend.save_diagram(&diagram_id, &data))
                .await;

        let outcome = match result {
            Ok(Ok(version)) => {
                store.write().await.set_version(version);
                log::debug!("Autosaved {diagram_id} at version {version}");

                if let (Some(ref registry), Some(token)) =
                    (&registry, diagram_id.strip_prefix(SHARED_ID_PREFIX))
                {
                    if let Err(e) = registry.touch(token, &data) {
                        log::warn!("Failed to refresh share entry {token}: {e}");
                    }
                    if let Err(e) = registry.store().save_backup(&diagram_id, &data, now_millis())
                    {
                        log::warn!("Failed to back up {diagram_id}: {e}");
                    }
                }

                SaveOutcome::Saved {
                    diagram_id,
                    version,
                }
            }
            Ok(Err(e)) => {
                log::error!("Autosave of {diagram_id} failed: {e}");
                SaveOutcome::Failed {
                    diagram_id,
                    error: e.to_string(),
                }
            }
            Err(_) => {
                log::error!("Autosave of {diagram_id} timed out");
                SaveOutcome::Failed {
                    diagram_id,
                    error: "request timed out".to_string(),
                }
            }
        };

        let _ = outcome_tx.send(outcome).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use umlflow_core::{Diagram, Point, UmlClass};

    fn test_config() -> AutosaveConfig {
        AutosaveConfig {
            quiet_period: Duration::from_millis(50),
            request_timeout: Duration::from_secs(1),
        }
    }

    async fn setup() -> (Arc<RwLock<DocumentStore>>, Arc<InMemoryBackend>, Autosave) {
        let backend = Arc::new(InMemoryBackend::new());
        backend.insert(Diagram::new("d-1")).await;
        let store = Arc::new(RwLock::new(DocumentStore::new(Diagram::new("d-1"))));
        let autosave = Autosave::spawn(
            store.clone(),
            backend.clone(),
            None,
            test_config(),
        );
        (store, backend, autosave)
    }

    #[tokio::test]
    async fn test_burst_of_edits_saves_once() {
        let (store, backend, mut autosave) = setup().await;
        let mut outcomes = autosave.take_outcome_rx().unwrap();

        // Rapid edits within one quiet period
        for i in 0..5 {
            store
                .write()
                .await
                .add_class(UmlClass::new(format!("c{i}"), "X", Point::default()))
                .unwrap();
            autosave.notify();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let outcome = tokio::time::timeout(Duration::from_secs(2), outcomes.recv())
            .await
            .unwrap()
            .unwrap();
        match outcome {
            SaveOutcome::Saved { diagram_id, version } => {
                assert_eq!(diagram_id, "d-1");
                assert_eq!(version, 2);
            }
            other => panic!("expected Saved, got {other:?}"),
        }

        assert_eq!(backend.save_count(), 1);
        let doc = store.read().await;
        assert_eq!(doc.diagram().version, 2);
        assert!(!doc.is_dirty());
        drop(doc);

        let saved = backend.load_diagram("d-1").await.unwrap();
        assert_eq!(saved.data.classes.len(), 5);
        autosave.abort();
    }

    #[tokio::test]
    async fn test_failed_save_is_surfaced_without_rollback() {
        let (store, backend, mut autosave) = setup().await;
        let mut outcomes = autosave.take_outcome_rx().unwrap();
        backend.set_fail_saves(true);

        store
            .write()
            .await
            .add_class(UmlClass::new("c1", "User", Point::default()))
            .unwrap();
        autosave.notify();

        let outcome = tokio::time::timeout(Duration::from_secs(2), outcomes.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(outcome, SaveOutcome::Failed { .. }));

        // In-memory state survives the failure
        assert_eq!(store.read().await.classes().len(), 1);

        // The next mutation's cycle retries from the latest state
        backend.set_fail_saves(false);
        store
            .write()
            .await
            .add_class(UmlClass::new("c2", "Order", Point::default()))
            .unwrap();
        autosave.notify();

        let outcome = tokio::time::timeout(Duration::from_secs(2), outcomes.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(outcome, SaveOutcome::Saved { .. }));
        let saved = backend.load_diagram("d-1").await.unwrap();
        assert_eq!(saved.data.classes.len(), 2);
        autosave.abort();
    }

    #[tokio::test]
    async fn test_clean_document_not_saved() {
        let (_store, backend, autosave) = setup().await;

        autosave.notify();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(backend.save_count(), 0);
        autosave.abort();
    }

    #[tokio::test]
    async fn test_flush_skips_quiet_period() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.insert(Diagram::new("d-1")).await;
        let store = Arc::new(RwLock::new(DocumentStore::new(Diagram::new("d-1"))));
        let mut autosave = Autosave::spawn(
            store.clone(),
            backend.clone(),
            None,
            AutosaveConfig {
                quiet_period: Duration::from_secs(30),
                request_timeout: Duration::from_secs(1),
            },
        );
        let mut outcomes = autosave.take_outcome_rx().unwrap();

        store
            .write()
            .await
            .add_class(UmlClass::new("c1", "User", Point::default()))
            .unwrap();
        autosave.flush().await;

        let outcome = tokio::time::timeout(Duration::from_secs(2), outcomes.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(outcome, SaveOutcome::Saved { .. }));
        autosave.abort();
    }
}
