//! Core identifier and error types shared across the crate.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::schema::{SchemaAction, SchemaStatus};

pub mod value;

pub use value::{GeoShape, PropType, Value};

/// Identifier of a vertex.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize,
)]
pub struct VertexId(pub u64);

/// Identifier of an edge. Stable for the lifetime of the edge; a forked
/// relation receives a fresh identifier.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize,
)]
pub struct EdgeId(pub u64);

/// Identifier of a single vertex-property instance.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize,
)]
pub struct PropertyId(pub u64);

/// Identifier of a property key definition.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize,
)]
pub struct PropKeyId(pub u32);

/// Identifier of an edge label definition.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize,
)]
pub struct EdgeLabelId(pub u32);

/// Identifier of a vertex label definition.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize,
)]
pub struct VertexLabelId(pub u32);

/// Identifier of an index definition.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize,
)]
pub struct IndexId(pub u32);

/// Monotonically increasing version of the published schema catalog.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, Serialize, Deserialize,
)]
pub struct SchemaVersion(pub u64);

/// Identifier of one open store instance, unique within a deployment.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct InstanceId(pub String);

/// Identifier of any indexable graph element.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize,
)]
pub enum ElementId {
    /// A vertex.
    Vertex(VertexId),
    /// An edge.
    Edge(EdgeId),
    /// A vertex-property instance.
    Property(PropertyId),
}

/// Kind of element an index or query targets.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
pub enum ElementKind {
    /// Vertices.
    Vertex,
    /// Edges.
    Edge,
    /// Vertex-property instances.
    Property,
}

impl ElementId {
    /// Kind of the identified element.
    pub fn kind(&self) -> ElementKind {
        match self {
            ElementId::Vertex(_) => ElementKind::Vertex,
            ElementId::Edge(_) => ElementKind::Edge,
            ElementId::Property(_) => ElementKind::Property,
        }
    }

    /// Raw numeric identifier, independent of kind.
    pub fn raw(&self) -> u64 {
        match self {
            ElementId::Vertex(v) => v.0,
            ElementId::Edge(e) => e.0,
            ElementId::Property(p) => p.0,
        }
    }
}

/// Direction of an edge relative to an anchor vertex.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub enum Direction {
    /// Edge leaves the anchor vertex.
    Out,
    /// Edge arrives at the anchor vertex.
    In,
    /// Either orientation.
    Both,
}

impl Direction {
    /// Whether an incident edge matches this direction; `outgoing` is true
    /// when the anchor vertex is the edge's out-vertex.
    pub fn admits(&self, outgoing: bool) -> bool {
        match self {
            Direction::Out => outgoing,
            Direction::In => !outgoing,
            Direction::Both => true,
        }
    }
}

/// Requested sort direction.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
pub enum SortOrder {
    /// Ascending.
    Asc,
    /// Descending.
    Desc,
}

/// Error taxonomy for store, schema, planner, and commit operations.
#[derive(thiserror::Error, Debug)]
pub enum TramaError {
    /// A write or definition would break a declared schema constraint.
    #[error("schema violation: {0}")]
    SchemaViolation(String),
    /// A lifecycle action was requested from a status it does not apply to.
    #[error("{action} not applicable to an index with status {status}")]
    InvalidLifecycleTransition {
        /// The rejected action.
        action: SchemaAction,
        /// The status the index field held when the action was requested.
        status: SchemaStatus,
    },
    /// A competing transaction holds or took the contended resource.
    #[error("lock conflict: {0}")]
    LockConflict(String),
    /// Strict index mode is configured and no index covers the query.
    #[error("query requires a full scan but index usage is forced")]
    PlannerFallbackRejected,
    /// An external key-value or index service failed.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(&'static str),
    /// Caller-supplied argument is unusable.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// Persisted state failed to decode.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// The referenced element or definition does not exist.
    #[error("not found")]
    NotFound,
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, TramaError>;

impl fmt::Display for VertexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for PropertyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for PropKeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for IndexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElementId::Vertex(v) => write!(f, "v{}", v.0),
            ElementId::Edge(e) => write!(f, "e{}", e.0),
            ElementId::Property(p) => write!(f, "p{}", p.0),
        }
    }
}

impl From<&str> for InstanceId {
    fn from(value: &str) -> Self {
        InstanceId(value.to_owned())
    }
}

impl From<String> for InstanceId {
    fn from(value: String) -> Self {
        InstanceId(value)
    }
}

impl From<u32> for PropKeyId {
    fn from(value: u32) -> Self {
        PropKeyId(value)
    }
}

impl From<PropKeyId> for u32 {
    fn from(value: PropKeyId) -> Self {
        value.0
    }
}

impl From<u32> for IndexId {
    fn from(value: u32) -> Self {
        IndexId(value)
    }
}

impl From<IndexId> for u32 {
    fn from(value: IndexId) -> Self {
        value.0
    }
}

impl From<VertexId> for ElementId {
    fn from(value: VertexId) -> Self {
        ElementId::Vertex(value)
    }
}

impl From<EdgeId> for ElementId {
    fn from(value: EdgeId) -> Self {
        ElementId::Edge(value)
    }
}

impl From<PropertyId> for ElementId {
    fn from(value: PropertyId) -> Self {
        ElementId::Property(value)
    }
}
