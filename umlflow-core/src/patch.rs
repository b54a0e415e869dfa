//! Typed patch operations — the unit of replication.
//!
//! A patch describes one mutation to the diagram. Patches travel over the
//! session channel and must be safe to apply more than once: the fallback
//! poller and the channel can deliver the same change twice, so duplicate
//! application beyond the first is a no-op (see `DocumentStore::apply_remote`).

use serde::{Deserialize, Serialize};

use crate::{Point, UmlClass};

/// A replicated diagram mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DiagramPatch {
    /// Insert a class. Set-insert keyed by class id — a duplicate create
    /// for an existing id is dropped, not appended.
    CreateClass { class: UmlClass },
    /// Overwrite a class position unconditionally (last-write-wins).
    MoveClass { id: String, position: Point },
    /// Remove a class and cascade removal of its associations.
    DeleteClass { id: String },
}

impl DiagramPatch {
    /// The class id this patch targets.
    pub fn class_id(&self) -> &str {
        match self {
            DiagramPatch::CreateClass { class } => &class.id,
            DiagramPatch::MoveClass { id, .. } => id,
            DiagramPatch::DeleteClass { id } => id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_id_accessor() {
        let create = DiagramPatch::CreateClass {
            class: UmlClass::new("c1", "User", Point::default()),
        };
        let mv = DiagramPatch::MoveClass {
            id: "c2".to_string(),
            position: Point::new(5.0, 5.0),
        };
        let del = DiagramPatch::DeleteClass { id: "c3".to_string() };

        assert_eq!(create.class_id(), "c1");
        assert_eq!(mv.class_id(), "c2");
        assert_eq!(del.class_id(), "c3");
    }
}
