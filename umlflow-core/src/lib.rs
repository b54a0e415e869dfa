//! # umlflow-core — UML class-diagram document model
//!
//! The in-memory representation of a diagram: classes, associations, and the
//! [`DocumentStore`] that owns the authoritative local copy and applies both
//! local edits and remote patches.
//!
//! ## Modules
//!
//! - [`patch`] — Typed patch operations, the unit of replication
//! - [`store`] — Document Store with idempotent remote application

use serde::{Deserialize, Serialize};

pub mod patch;
pub mod store;

pub use patch::DiagramPatch;
pub use store::{DocumentError, DocumentStore};

/// Prefix marking a diagram as joined via a share token.
///
/// Shared diagrams are subject to the fallback sync poller and may
/// authenticate a session channel with the token itself.
pub const SHARED_ID_PREFIX: &str = "shared-";

/// 2D canvas position. Both coordinates are clamped to ≥ 0.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    /// Create a position, clamping negative coordinates to zero.
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }.clamped()
    }

    /// Return a copy with both coordinates clamped to ≥ 0.
    pub fn clamped(self) -> Self {
        Self {
            x: self.x.max(0.0),
            y: self.y.max(0.0),
        }
    }
}

/// A named, typed attribute of a UML class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UmlAttribute {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub attr_type: String,
}

impl UmlAttribute {
    pub fn new(id: impl Into<String>, name: impl Into<String>, attr_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            attr_type: attr_type.into(),
        }
    }
}

/// A UML class node: identity, display name, attributes, canvas position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UmlClass {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub attributes: Vec<UmlAttribute>,
    #[serde(default)]
    pub position: Point,
}

impl UmlClass {
    pub fn new(id: impl Into<String>, name: impl Into<String>, position: Point) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            attributes: Vec::new(),
            position: position.clamped(),
        }
    }
}

/// An association between two classes.
///
/// Both endpoints must reference class ids present in the same diagram;
/// deleting a class cascades deletion of its associations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Association {
    pub id: String,
    pub from_class_id: String,
    pub to_class_id: String,
    #[serde(default)]
    pub from_multiplicity: String,
    #[serde(default)]
    pub to_multiplicity: String,
    /// Optional association-class payload (class id or inline name).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub association_class: Option<String>,
}

/// The opaque JSON payload exchanged with the backend and the shared store:
/// `{ "classes": [...], "associations": [...] }`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DiagramData {
    #[serde(default)]
    pub classes: Vec<UmlClass>,
    #[serde(default)]
    pub associations: Vec<Association>,
}

impl DiagramData {
    /// A small seeded diagram: two related classes with attributes.
    ///
    /// Handy as a non-empty starting document in demos and tests.
    pub fn example() -> Self {
        let mut user = UmlClass::new("class-user", "User", Point::new(100.0, 100.0));
        user.attributes.push(UmlAttribute::new("attr-user-id", "id", "Int"));
        user.attributes.push(UmlAttribute::new("attr-user-name", "name", "String"));

        let mut product = UmlClass::new("class-product", "Product", Point::new(400.0, 100.0));
        product.attributes.push(UmlAttribute::new("attr-product-id", "id", "Int"));
        product.attributes.push(UmlAttribute::new("attr-product-price", "price", "Float"));

        Self {
            classes: vec![user, product],
            associations: vec![Association {
                id: "assoc-purchases".to_string(),
                from_class_id: "class-user".to_string(),
                to_class_id: "class-product".to_string(),
                from_multiplicity: "1".to_string(),
                to_multiplicity: "*".to_string(),
                association_class: None,
            }],
        }
    }
}

/// Aggregate root: a diagram with backend-assigned version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagram {
    /// String identifier; a `shared-` prefix marks shared provenance.
    pub id: String,
    /// Monotonic version set by the backend on each full save.
    pub version: u64,
    #[serde(default)]
    pub data: DiagramData,
}

impl Diagram {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: 1,
            data: DiagramData::default(),
        }
    }

    /// Whether this diagram was materialized from a share token.
    pub fn is_shared(&self) -> bool {
        self.id.starts_with(SHARED_ID_PREFIX)
    }

    /// The share token embedded in a shared diagram id, if any.
    pub fn share_token(&self) -> Option<&str> {
        self.id.strip_prefix(SHARED_ID_PREFIX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_point_clamps_negative_coordinates() {
        let p = Point::new(-5.0, 12.0);
        assert_eq!(p, Point { x: 0.0, y: 12.0 });

        let q = Point { x: -1.0, y: -1.0 }.clamped();
        assert_eq!(q, Point { x: 0.0, y: 0.0 });
    }

    #[test]
    fn test_shared_id_detection() {
        let shared = Diagram::new("shared-AB12CD34");
        assert!(shared.is_shared());
        assert_eq!(shared.share_token(), Some("AB12CD34"));

        let owned = Diagram::new("d-42");
        assert!(!owned.is_shared());
        assert_eq!(owned.share_token(), None);
    }

    #[test]
    fn test_diagram_data_json_shape() {
        let mut data = DiagramData::default();
        let mut class = UmlClass::new("c1", "User", Point::new(10.0, 20.0));
        class.attributes.push(UmlAttribute::new("a1", "email", "String"));
        data.classes.push(class);
        data.associations.push(Association {
            id: "as1".to_string(),
            from_class_id: "c1".to_string(),
            to_class_id: "c1".to_string(),
            from_multiplicity: "1".to_string(),
            to_multiplicity: "*".to_string(),
            association_class: None,
        });

        let json = serde_json::to_value(&data).unwrap();
        // Wire format must match the backend payload shape
        assert_eq!(json["classes"][0]["attributes"][0]["type"], "String");
        assert_eq!(json["associations"][0]["fromClassId"], "c1");
        assert_eq!(json["associations"][0]["toClassId"], "c1");

        let back: DiagramData = serde_json::from_value(json).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn test_example_diagram_is_well_formed() {
        let data = DiagramData::example();
        assert_eq!(data.classes.len(), 2);
        for assoc in &data.associations {
            assert!(data.classes.iter().any(|c| c.id == assoc.from_class_id));
            assert!(data.classes.iter().any(|c| c.id == assoc.to_class_id));
        }
    }

    #[test]
    fn test_diagram_data_tolerates_missing_fields() {
        let data: DiagramData = serde_json::from_str(r#"{"classes": []}"#).unwrap();
        assert!(data.associations.is_empty());

        let class: UmlClass = serde_json::from_str(r#"{"id": "c1", "name": "Order"}"#).unwrap();
        assert!(class.attributes.is_empty());
        assert_eq!(class.position, Point::default());
    }
}
