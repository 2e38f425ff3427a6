//! Index definitions: composite, mixed, and vertex-centric relation indexes.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::schema::defs::{Cardinality, ConsistencyModifier, EdgeLabelDef, PropertyKeyDef};
use crate::types::{
    Direction, EdgeLabelId, ElementKind, IndexId, PropKeyId, Result, SortOrder, TramaError,
    VertexLabelId,
};

/// How a mixed-index field is materialized in the backing service.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default, Serialize, Deserialize)]
pub enum FieldMapping {
    /// Backend default for the field type.
    #[default]
    Default,
    /// Tokenized full-text field.
    Text,
    /// Untokenized exact-match field.
    Exact,
    /// Both tokenized and exact representations.
    TextAndExact,
}

/// Per-field parameter of a mixed index.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub enum FieldParam {
    /// Field mapping selection.
    Mapping(FieldMapping),
    /// Backend-specific parameter passed through opaquely.
    Custom {
        /// Parameter name.
        name: String,
        /// Parameter value.
        value: String,
    },
}

/// One indexed field with its parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IndexField {
    /// The indexed property key.
    pub key: PropKeyId,
    /// Parameters; empty for composite indexes.
    pub params: SmallVec<[FieldParam; 2]>,
}

impl IndexField {
    /// Field without parameters.
    pub fn plain(key: PropKeyId) -> Self {
        IndexField {
            key,
            params: SmallVec::new(),
        }
    }
}

/// Label an index is constrained to.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
pub enum LabelConstraint {
    /// Only vertices with this label are indexed.
    Vertex(VertexLabelId),
    /// Only edges with this label are indexed.
    Edge(EdgeLabelId),
}

/// Relation type a vertex-centric index is scoped to.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
pub enum RelationBase {
    /// Incident edges of one label.
    EdgeLabel(EdgeLabelId),
    /// Instances of one multi-valued property key.
    PropertyKey(PropKeyId),
}

/// What kind of index a definition describes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum IndexKind {
    /// Exact-match index encoded in the store's own key space.
    Composite {
        /// At most one element per key tuple. Vertex element kind only.
        unique: bool,
    },
    /// Index delegated to a named external index service.
    Mixed {
        /// Name of the backing index service.
        backing: String,
    },
    /// Index over one vertex's incident relations, ordered by sort keys.
    Relation {
        /// The relation type being indexed.
        base: RelationBase,
        /// Indexed side, relative to the anchor vertex.
        direction: Direction,
        /// Native iteration order of the sort keys.
        order: SortOrder,
    },
}

/// Declared secondary index.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IndexDefinition {
    /// Numeric id, stable across renames.
    pub id: IndexId,
    /// Index name, unique among all schema elements.
    pub name: String,
    /// Composite, mixed, or relation.
    pub kind: IndexKind,
    /// Kind of element the index covers.
    pub element: ElementKind,
    /// Indexed fields. For relation indexes these are the sort keys in
    /// declared order.
    pub fields: SmallVec<[IndexField; 4]>,
    /// Optional label restriction.
    pub constraint: Option<LabelConstraint>,
    /// Concurrent-write policy. Only composite indexes may carry `Lock`;
    /// `Fork` never applies to an index.
    #[serde(default)]
    pub consistency: ConsistencyModifier,
}

impl IndexDefinition {
    /// Whether this is a composite index.
    pub fn is_composite(&self) -> bool {
        matches!(self.kind, IndexKind::Composite { .. })
    }

    /// Whether this is a mixed index.
    pub fn is_mixed(&self) -> bool {
        matches!(self.kind, IndexKind::Mixed { .. })
    }

    /// Whether this is a vertex-centric relation index.
    pub fn is_relation(&self) -> bool {
        matches!(self.kind, IndexKind::Relation { .. })
    }

    /// Whether the index enforces key uniqueness.
    pub fn unique(&self) -> bool {
        matches!(self.kind, IndexKind::Composite { unique: true })
    }

    /// Backing service name for mixed indexes.
    pub fn backing_service(&self) -> Option<&str> {
        match &self.kind {
            IndexKind::Mixed { backing } => Some(backing),
            _ => None,
        }
    }

    /// Keys carrying a lifecycle status for this index.
    pub fn field_keys(&self) -> impl Iterator<Item = PropKeyId> + '_ {
        self.fields.iter().map(|f| f.key)
    }

    /// Position of `key` among the indexed fields.
    pub fn field_position(&self, key: PropKeyId) -> Option<usize> {
        self.fields.iter().position(|f| f.key == key)
    }

    /// Whether the index applies to elements restricted by `label`.
    pub fn admits_label(&self, label: Option<LabelConstraint>) -> bool {
        match self.constraint {
            None => true,
            Some(own) => label == Some(own),
        }
    }

    /// Definition-time validation of structural invariants shared by all
    /// index kinds plus the kind-specific rules.
    pub fn validate(
        &self,
        edge_label: impl Fn(EdgeLabelId) -> Option<EdgeLabelDef>,
        prop_key: impl Fn(PropKeyId) -> Option<PropertyKeyDef>,
    ) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(TramaError::Invalid("index name must not be blank"));
        }
        if self.fields.is_empty() {
            return Err(TramaError::SchemaViolation(format!(
                "index {} must declare at least one field",
                self.name
            )));
        }
        let mut seen: SmallVec<[PropKeyId; 4]> = SmallVec::new();
        for field in &self.fields {
            if seen.contains(&field.key) {
                return Err(TramaError::SchemaViolation(format!(
                    "index {} lists field {} twice",
                    self.name, field.key
                )));
            }
            seen.push(field.key);
        }
        match self.consistency {
            ConsistencyModifier::Default => {}
            ConsistencyModifier::Lock if self.is_composite() => {}
            ConsistencyModifier::Lock => {
                return Err(TramaError::SchemaViolation(format!(
                    "only composite indexes take locks; {} is not one",
                    self.name
                )));
            }
            ConsistencyModifier::Fork => {
                return Err(TramaError::SchemaViolation(format!(
                    "index {} cannot fork; forking applies to relation types",
                    self.name
                )));
            }
        }
        match &self.kind {
            IndexKind::Composite { unique } => {
                if self.fields.iter().any(|f| !f.params.is_empty()) {
                    return Err(TramaError::SchemaViolation(format!(
                        "composite index {} cannot carry field parameters",
                        self.name
                    )));
                }
                if *unique && self.element != ElementKind::Vertex {
                    return Err(TramaError::SchemaViolation(format!(
                        "unique index {} must index vertices",
                        self.name
                    )));
                }
                Ok(())
            }
            IndexKind::Mixed { backing } => {
                if backing.trim().is_empty() {
                    return Err(TramaError::Invalid(
                        "mixed index requires a backing service name",
                    ));
                }
                Ok(())
            }
            IndexKind::Relation {
                base, direction, ..
            } => self.validate_relation(*base, *direction, edge_label, prop_key),
        }
    }

    fn validate_relation(
        &self,
        base: RelationBase,
        direction: Direction,
        edge_label: impl Fn(EdgeLabelId) -> Option<EdgeLabelDef>,
        prop_key: impl Fn(PropKeyId) -> Option<PropertyKeyDef>,
    ) -> Result<()> {
        if self.constraint.is_some() {
            return Err(TramaError::SchemaViolation(format!(
                "relation index {} is scoped by its relation type, not a label constraint",
                self.name
            )));
        }
        match base {
            RelationBase::EdgeLabel(label_id) => {
                if self.element != ElementKind::Edge {
                    return Err(TramaError::SchemaViolation(format!(
                        "relation index {} on an edge label must index edges",
                        self.name
                    )));
                }
                let label = edge_label(label_id).ok_or(TramaError::NotFound)?;
                if label.multiplicity.is_unique(direction) {
                    return Err(TramaError::SchemaViolation(format!(
                        "label {} admits at most one edge per vertex in the indexed \
                         direction, nothing to sort",
                        label.name
                    )));
                }
                for field in &self.fields {
                    if label.signature.contains(&field.key) {
                        return Err(TramaError::SchemaViolation(format!(
                            "sort key {} of index {} overlaps the signature of label {}",
                            field.key, self.name, label.name
                        )));
                    }
                }
                Ok(())
            }
            RelationBase::PropertyKey(key_id) => {
                if self.element != ElementKind::Property {
                    return Err(TramaError::SchemaViolation(format!(
                        "relation index {} on a property key must index properties",
                        self.name
                    )));
                }
                if direction != Direction::Out {
                    return Err(TramaError::SchemaViolation(format!(
                        "relation index {} on a property key is always outgoing",
                        self.name
                    )));
                }
                let key = prop_key(key_id).ok_or(TramaError::NotFound)?;
                if key.cardinality == Cardinality::Single {
                    return Err(TramaError::SchemaViolation(format!(
                        "property key {} holds at most one value per vertex, nothing to sort",
                        key.name
                    )));
                }
                if self.fields.iter().any(|f| f.key == key_id) {
                    return Err(TramaError::SchemaViolation(format!(
                        "index {} cannot use its own base key {} as a sort key",
                        self.name, key.name
                    )));
                }
                Ok(())
            }
        }
    }
}
