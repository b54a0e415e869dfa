//! Document Store — authoritative local copy of a diagram.
//!
//! Local edits go through the typed mutation methods, each of which returns
//! the [`DiagramPatch`] to broadcast to peers. Inbound patches from the
//! session channel go through [`DocumentStore::apply_remote`], which is
//! idempotent: replaying a patch the store has already absorbed changes
//! nothing.
//!
//! Every mutation (local or remote) marks the document dirty; the dirty flag
//! gates the autosave scheduler. The fallback poller's whole-document
//! [`DocumentStore::replace`] does *not* mark dirty — a snapshot pulled from
//! the shared store is already persisted state, not a pending local edit.

use crate::{Association, Diagram, DiagramData, DiagramPatch, Point, UmlClass};

/// Errors from local mutations that violate document invariants.
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentError {
    /// A class with this id already exists.
    DuplicateClass(String),
    /// The referenced class id does not exist.
    UnknownClass(String),
    /// The referenced association id does not exist.
    UnknownAssociation(String),
}

impl std::fmt::Display for DocumentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DocumentError::DuplicateClass(id) => write!(f, "Duplicate class id: {id}"),
            DocumentError::UnknownClass(id) => write!(f, "Unknown class id: {id}"),
            DocumentError::UnknownAssociation(id) => write!(f, "Unknown association id: {id}"),
        }
    }
}

impl std::error::Error for DocumentError {}

/// Holds the authoritative local diagram and applies mutations.
#[derive(Debug, Clone)]
pub struct DocumentStore {
    diagram: Diagram,
    dirty: bool,
}

impl DocumentStore {
    /// Wrap an existing diagram.
    pub fn new(diagram: Diagram) -> Self {
        Self {
            diagram,
            dirty: false,
        }
    }

    pub fn diagram(&self) -> &Diagram {
        &self.diagram
    }

    pub fn diagram_id(&self) -> &str {
        &self.diagram.id
    }

    pub fn classes(&self) -> &[UmlClass] {
        &self.diagram.data.classes
    }

    pub fn associations(&self) -> &[Association] {
        &self.diagram.data.associations
    }

    pub fn class(&self, id: &str) -> Option<&UmlClass> {
        self.diagram.data.classes.iter().find(|c| c.id == id)
    }

    /// Snapshot of the full document payload (for saves and sharing).
    pub fn data(&self) -> DiagramData {
        self.diagram.data.clone()
    }

    /// Whether unsaved mutations exist. Gates autosave.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Clear the dirty flag after a successful save.
    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    /// Record the backend-assigned version after a full save.
    pub fn set_version(&mut self, version: u64) {
        self.diagram.version = version;
    }

    // ─── Local mutations ──────────────────────────────────────────────

    /// Add a class locally. Returns the patch to broadcast.
    pub fn add_class(&mut self, class: UmlClass) -> Result<DiagramPatch, DocumentError> {
        if self.class(&class.id).is_some() {
            return Err(DocumentError::DuplicateClass(class.id));
        }
        let mut class = class;
        class.position = class.position.clamped();
        self.diagram.data.classes.push(class.clone());
        self.dirty = true;
        Ok(DiagramPatch::CreateClass { class })
    }

    /// Move a class locally. Returns the patch to broadcast.
    pub fn move_class(&mut self, id: &str, position: Point) -> Result<DiagramPatch, DocumentError> {
        let position = position.clamped();
        let class = self
            .diagram
            .data
            .classes
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| DocumentError::UnknownClass(id.to_string()))?;
        class.position = position;
        self.dirty = true;
        Ok(DiagramPatch::MoveClass {
            id: id.to_string(),
            position,
        })
    }

    /// Rename a class locally.
    pub fn rename_class(&mut self, id: &str, name: impl Into<String>) -> Result<(), DocumentError> {
        let class = self
            .diagram
            .data
            .classes
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| DocumentError::UnknownClass(id.to_string()))?;
        class.name = name.into();
        self.dirty = true;
        Ok(())
    }

    /// Remove a class locally, cascading association removal.
    /// Returns the patch to broadcast.
    pub fn remove_class(&mut self, id: &str) -> Result<DiagramPatch, DocumentError> {
        if self.class(id).is_none() {
            return Err(DocumentError::UnknownClass(id.to_string()));
        }
        self.delete_class_cascading(id);
        self.dirty = true;
        Ok(DiagramPatch::DeleteClass { id: id.to_string() })
    }

    /// Add an association. Both endpoints must resolve to existing classes.
    pub fn add_association(&mut self, association: Association) -> Result<(), DocumentError> {
        if self.class(&association.from_class_id).is_none() {
            return Err(DocumentError::UnknownClass(association.from_class_id));
        }
        if self.class(&association.to_class_id).is_none() {
            return Err(DocumentError::UnknownClass(association.to_class_id));
        }
        self.diagram.data.associations.push(association);
        self.dirty = true;
        Ok(())
    }

    /// Replace an association by id.
    pub fn update_association(&mut self, association: Association) -> Result<(), DocumentError> {
        let slot = self
            .diagram
            .data
            .associations
            .iter_mut()
            .find(|a| a.id == association.id)
            .ok_or_else(|| DocumentError::UnknownAssociation(association.id.clone()))?;
        *slot = association;
        self.dirty = true;
        Ok(())
    }

    /// Remove an association by id.
    pub fn remove_association(&mut self, id: &str) -> Result<(), DocumentError> {
        let before = self.diagram.data.associations.len();
        self.diagram.data.associations.retain(|a| a.id != id);
        if self.diagram.data.associations.len() == before {
            return Err(DocumentError::UnknownAssociation(id.to_string()));
        }
        self.dirty = true;
        Ok(())
    }

    // ─── Remote application ───────────────────────────────────────────

    /// Apply a patch received from a peer.
    ///
    /// Returns `true` if the patch changed the document, `false` if it was
    /// dropped as a duplicate or targeted a class that no longer exists.
    pub fn apply_remote(&mut self, patch: &DiagramPatch) -> bool {
        let applied = match patch {
            DiagramPatch::CreateClass { class } => {
                if self.class(&class.id).is_some() {
                    log::debug!("Dropping duplicate create for class {}", class.id);
                    false
                } else {
                    let mut class = class.clone();
                    class.position = class.position.clamped();
                    self.diagram.data.classes.push(class);
                    true
                }
            }
            DiagramPatch::MoveClass { id, position } => {
                match self.diagram.data.classes.iter_mut().find(|c| c.id == *id) {
                    Some(class) => {
                        // Last-write-wins: overwrite unconditionally
                        class.position = position.clamped();
                        true
                    }
                    None => {
                        log::debug!("Dropping move for unknown class {id}");
                        false
                    }
                }
            }
            DiagramPatch::DeleteClass { id } => {
                if self.class(id).is_some() {
                    self.delete_class_cascading(id);
                    true
                } else {
                    false
                }
            }
        };
        if applied {
            self.dirty = true;
        }
        applied
    }

    /// Whole-document replacement from a shared-store snapshot.
    ///
    /// Used by the fallback poller: replaces both collections wholesale
    /// rather than applying patches. Positions are re-clamped on the way in.
    pub fn replace(&mut self, mut data: DiagramData) {
        for class in &mut data.classes {
            class.position = class.position.clamped();
        }
        self.diagram.data = data;
    }

    fn delete_class_cascading(&mut self, id: &str) {
        self.diagram.data.classes.retain(|c| c.id != id);
        self.diagram
            .data
            .associations
            .retain(|a| a.from_class_id != id && a.to_class_id != id);
    }
}
