//! Typed definitions for property keys, edge labels, and vertex labels.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::types::{Direction, EdgeLabelId, PropKeyId, PropType, VertexLabelId};

/// How many values a property key admits per vertex.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
pub enum Cardinality {
    /// At most one value.
    Single,
    /// Any number of values, duplicates allowed.
    List,
    /// Any number of distinct values.
    Set,
}

impl Cardinality {
    /// Equivalent edge multiplicity used by the constraint checks.
    pub fn multiplicity(&self) -> Multiplicity {
        match self {
            Cardinality::Single => Multiplicity::Many2One,
            Cardinality::Set => Multiplicity::Simple,
            Cardinality::List => Multiplicity::Multi,
        }
    }
}

/// Edge multiplicity constraint.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
pub enum Multiplicity {
    /// Unconstrained.
    Multi,
    /// At most one edge of this label between any vertex pair.
    Simple,
    /// At most one incoming edge of this label per vertex.
    One2Many,
    /// At most one outgoing edge of this label per vertex.
    Many2One,
    /// At most one edge of this label per vertex in either direction.
    One2One,
}

impl Multiplicity {
    /// Whether any constraint applies at all.
    pub fn is_constrained(&self) -> bool {
        !matches!(self, Multiplicity::Multi)
    }

    /// Whether a constraint applies when approaching from `direction`.
    pub fn is_constrained_in(&self, direction: Direction) -> bool {
        match direction {
            Direction::Both => self.is_constrained(),
            _ => match self {
                Multiplicity::Multi => false,
                Multiplicity::Simple => true,
                _ => self.is_unique(direction),
            },
        }
    }

    /// Whether at most one edge may exist per vertex on the given side.
    pub fn is_unique(&self, direction: Direction) -> bool {
        match direction {
            Direction::In => matches!(self, Multiplicity::One2Many | Multiplicity::One2One),
            Direction::Out => matches!(self, Multiplicity::Many2One | Multiplicity::One2One),
            Direction::Both => matches!(self, Multiplicity::One2One),
        }
    }
}

/// Concurrent-write policy attached to a relation type or composite index.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default, Serialize, Deserialize)]
pub enum ConsistencyModifier {
    /// Last writer wins; conflicts arbitrated by the backend.
    #[default]
    Default,
    /// Exclusive lock on the affected key before modification.
    Lock,
    /// Concurrent updates fork a new relation instance instead of mutating
    /// in place.
    Fork,
}

/// Definition of a property key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PropertyKeyDef {
    /// Numeric id, stable across renames.
    pub id: PropKeyId,
    /// Current name, unique among all schema elements.
    pub name: String,
    /// Declared value type; every stored value must match it.
    pub data_type: PropType,
    /// Values admitted per vertex.
    pub cardinality: Cardinality,
    /// Concurrent-write policy.
    pub consistency: ConsistencyModifier,
}

impl PropertyKeyDef {
    /// Whether the key is schema-constrained, i.e. its implied multiplicity
    /// restricts concurrent writes. Fork consistency is illegal on such keys.
    pub fn is_constrained(&self) -> bool {
        self.cardinality.multiplicity().is_constrained()
    }
}

/// Definition of an edge label.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EdgeLabelDef {
    /// Numeric id, stable across renames.
    pub id: EdgeLabelId,
    /// Current name, unique among all schema elements.
    pub name: String,
    /// Multiplicity constraint.
    pub multiplicity: Multiplicity,
    /// Keys whose values are stored inline with every edge of this label.
    /// Disjoint from any relation-index sort key on the label.
    pub signature: SmallVec<[PropKeyId; 4]>,
    /// Concurrent-write policy.
    pub consistency: ConsistencyModifier,
}

impl EdgeLabelDef {
    /// Whether the label is schema-constrained. Fork consistency is illegal
    /// on such labels.
    pub fn is_constrained(&self) -> bool {
        self.multiplicity.is_constrained()
    }
}

/// Definition of a vertex label.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VertexLabelDef {
    /// Numeric id, stable across renames.
    pub id: VertexLabelId,
    /// Current name, unique among all schema elements.
    pub name: String,
}
