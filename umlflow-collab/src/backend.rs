//! Backend persistence seam for diagram load/save.
//!
//! The synchronizer consumes a REST backend but does not own it, so the
//! surface is a trait: [`RestBackend`](crate::rest::RestBackend) talks to
//! the real service, [`InMemoryBackend`] stands in for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;
use umlflow_core::{Diagram, DiagramData};

/// Backend error taxonomy.
#[derive(Debug, Clone)]
pub enum ApiError {
    /// Credential invalid or expired; the user must re-authenticate
    AuthExpired,
    /// Resource absent
    NotFound(String),
    /// Request body rejected by the backend
    ValidationFailed(String),
    /// Request could not complete (transport failure or timeout)
    Network(String),
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AuthExpired => write!(f, "Authentication expired"),
            Self::NotFound(what) => write!(f, "Not found: {what}"),
            Self::ValidationFailed(detail) => write!(f, "Validation failed: {detail}"),
            Self::Network(e) => write!(f, "Network failure: {e}"),
        }
    }
}

impl std::error::Error for ApiError {}

/// Where diagrams are durably persisted.
#[async_trait]
pub trait DiagramBackend: Send + Sync {
    /// Load a diagram by id.
    async fn load_diagram(&self, id: &str) -> Result<Diagram, ApiError>;

    /// Persist the full document, returning the backend-assigned version.
    async fn save_diagram(&self, id: &str, data: &DiagramData) -> Result<u64, ApiError>;
}

/// In-memory backend for tests.
///
/// Versions increment on each save; failures can be injected per-call.
pub struct InMemoryBackend {
    diagrams: Mutex<HashMap<String, Diagram>>,
    save_count: AtomicU64,
    fail_saves: AtomicBool,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self {
            diagrams: Mutex::new(HashMap::new()),
            save_count: AtomicU64::new(0),
            fail_saves: AtomicBool::new(false),
        }
    }

    /// Seed a diagram.
    pub async fn insert(&self, diagram: Diagram) {
        self.diagrams.lock().await.insert(diagram.id.clone(), diagram);
    }

    /// Make subsequent saves fail with a network error.
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    /// Number of save calls that reached the backend.
    pub fn save_count(&self) -> u64 {
        self.save_count.load(Ordering::SeqCst)
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DiagramBackend for InMemoryBackend {
    async fn load_diagram(&self, id: &str) -> Result<Diagram, ApiError> {
        self.diagrams
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| ApiError::NotFound(format!("diagram {id}")))
    }

    async fn save_diagram(&self, id: &str, data: &DiagramData) -> Result<u64, ApiError> {
        self.save_count.fetch_add(1, Ordering::SeqCst);
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(ApiError::Network("injected failure".to_string()));
        }

        let mut diagrams = self.diagrams.lock().await;
        let diagram = diagrams
            .entry(id.to_string())
            .or_insert_with(|| Diagram::new(id));
        diagram.data = data.clone();
        diagram.version += 1;
        Ok(diagram.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use umlflow_core::{Point, UmlClass};

    #[tokio::test]
    async fn test_save_bumps_version() {
        let backend = InMemoryBackend::new();
        backend.insert(Diagram::new("d-1")).await;

        let mut data = DiagramData::default();
        data.classes.push(UmlClass::new("c1", "User", Point::default()));

        let v2 = backend.save_diagram("d-1", &data).await.unwrap();
        assert_eq!(v2, 2);
        let v3 = backend.save_diagram("d-1", &data).await.unwrap();
        assert_eq!(v3, 3);

        let loaded = backend.load_diagram("d-1").await.unwrap();
        assert_eq!(loaded.version, 3);
        assert_eq!(loaded.data, data);
    }

    #[tokio::test]
    async fn test_load_missing_is_not_found() {
        let backend = InMemoryBackend::new();
        assert!(matches!(
            backend.load_diagram("nope").await,
            Err(ApiError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_injected_save_failure() {
        let backend = InMemoryBackend::new();
        backend.set_fail_saves(true);

        let result = backend.save_diagram("d-1", &DiagramData::default()).await;
        assert!(matches!(result, Err(ApiError::Network(_))));
        assert_eq!(backend.save_count(), 1);
    }
}
