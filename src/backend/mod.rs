//! Collaborator interfaces: the shared key-value store and external index
//! services. Concrete wire and storage formats live behind these traits;
//! the crate ships in-memory implementations in [`memory`].

use rustc_hash::FxHashSet;
use serde::Serialize;
use smallvec::SmallVec;

use crate::query::condition::Op;
use crate::types::{ElementId, PropType, Result, SortOrder, Value};

pub mod codec;
pub mod memory;

/// Atomicity guard evaluated together with a write batch. Used by the
/// consistency enforcer on backends with optimistic locking.
#[derive(Clone, Debug)]
pub enum Guard {
    /// The exact key must be absent.
    Absent(Vec<u8>),
    /// No key carrying this prefix may exist.
    AbsentPrefix(Vec<u8>),
    /// The key must currently hold exactly this value.
    Equals(Vec<u8>, Vec<u8>),
}

/// Capability flags of a key-value backend.
#[derive(Clone, Copy, Debug)]
pub struct KvFeatures {
    /// Whether the backend checks [`Guard`]s atomically with a batch. When
    /// false, callers must serialize conflicting writers with locks instead.
    pub optimistic_locking: bool,
}

/// Shared ordered key-value store.
///
/// One instance is shared by every store instance of a deployment; batches
/// are atomic and immediately visible to all of them.
pub trait KvStore: Send + Sync {
    /// Point read.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// All pairs whose key starts with `prefix`, in ascending key order.
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Applies puts and deletes atomically. Every guard is verified under
    /// the same critical section; any failed guard aborts the whole batch
    /// with a lock conflict.
    fn apply(
        &self,
        puts: Vec<(Vec<u8>, Vec<u8>)>,
        deletes: Vec<Vec<u8>>,
        guards: &[Guard],
    ) -> Result<()>;

    /// Capability flags consulted by the consistency enforcer.
    fn features(&self) -> KvFeatures;
}

/// One field written to or removed from an external index document.
#[derive(Clone, Debug)]
pub struct IndexEntry {
    /// Registered field name.
    pub field: String,
    /// Field value.
    pub value: Value,
}

/// All index changes for one element in one mixed index.
#[derive(Clone, Debug)]
pub struct IndexMutation {
    /// Mixed index name within the provider.
    pub index: String,
    /// The element whose document changes.
    pub element: ElementId,
    /// Fields to add or overwrite.
    pub additions: Vec<IndexEntry>,
    /// Fields to drop.
    pub deletions: Vec<IndexEntry>,
    /// Drop the whole document after applying deletions.
    pub delete_all: bool,
}

/// One field predicate delegated to an index service.
#[derive(Clone, Debug, Serialize)]
pub struct FieldCondition {
    /// Registered field name.
    pub field: String,
    /// Operator. Never `NotIn`; the planner keeps that residual.
    pub op: Op,
    /// Operand values; one for scalar operators, many for `In`.
    pub values: SmallVec<[Value; 2]>,
}

/// Query folded for one backing index: a conjunction of field conditions
/// with optional order and pagination.
#[derive(Clone, Debug, Default, Serialize)]
pub struct ProviderQuery {
    /// ANDed conditions.
    pub conditions: Vec<FieldCondition>,
    /// Requested result order.
    pub orders: Vec<(String, SortOrder)>,
    /// Skip this many results.
    pub offset: usize,
    /// Stop after this many results.
    pub limit: Option<usize>,
}

/// Operator support matrix and feature flags of one index service, reported
/// as plain data so the planner can reason about eligibility without
/// calling into the backend.
#[derive(Clone, Debug)]
pub struct IndexCapabilities {
    /// Whether query results honor the requested order natively.
    pub supports_ordering: bool,
    /// Whether timestamps keep nanosecond precision. Without it the planner
    /// refuses to delegate exact timestamp matches.
    pub supports_nanosecond_precision: bool,
    /// Whether the service evaluates shape-contains-shape predicates.
    pub supports_geo_contains: bool,
    supported: FxHashSet<(PropType, Op)>,
}

impl IndexCapabilities {
    /// Matrix of a typical document index service: equality and set
    /// membership on all scalar types, ranges on orderable types, text
    /// predicates on strings, overlap predicates on shapes.
    pub fn standard() -> Self {
        let mut supported = FxHashSet::default();
        let scalar = [
            PropType::Bool,
            PropType::Int,
            PropType::Float,
            PropType::String,
            PropType::Timestamp,
        ];
        for ty in scalar {
            for op in [Op::Eq, Op::Neq, Op::In] {
                supported.insert((ty, op));
            }
        }
        for ty in [PropType::Int, PropType::Float, PropType::Timestamp, PropType::String] {
            for op in [Op::Lt, Op::Lte, Op::Gt, Op::Gte] {
                supported.insert((ty, op));
            }
        }
        for op in [Op::TextContains, Op::TextPrefix] {
            supported.insert((PropType::String, op));
        }
        for op in [Op::GeoWithin, Op::GeoIntersect, Op::GeoDisjoint, Op::GeoContains] {
            supported.insert((PropType::Geo, op));
        }
        IndexCapabilities {
            supports_ordering: true,
            supports_nanosecond_precision: true,
            supports_geo_contains: true,
            supported,
        }
    }

    /// Whether the service can evaluate `op` against fields of type `ty`.
    pub fn supports(&self, ty: PropType, op: Op) -> bool {
        if op == Op::GeoContains && !self.supports_geo_contains {
            return false;
        }
        self.supported.contains(&(ty, op))
    }

    /// Removes one operator from the matrix.
    pub fn without_op(mut self, ty: PropType, op: Op) -> Self {
        self.supported.remove(&(ty, op));
        self
    }

    /// Overrides the native-ordering flag.
    pub fn with_ordering(mut self, supported: bool) -> Self {
        self.supports_ordering = supported;
        self
    }

    /// Overrides the nanosecond-precision flag.
    pub fn with_nanosecond_precision(mut self, supported: bool) -> Self {
        self.supports_nanosecond_precision = supported;
        self
    }

    /// Overrides the geo-contains flag.
    pub fn with_geo_contains(mut self, supported: bool) -> Self {
        self.supports_geo_contains = supported;
        self
    }
}

/// External index service backing one or more mixed indexes.
pub trait IndexProvider: Send + Sync {
    /// Service name referenced by mixed index definitions.
    fn name(&self) -> &str;

    /// Capability flags; stable for the lifetime of the service.
    fn capabilities(&self) -> IndexCapabilities;

    /// Declares a field of a mixed index before any mutation references it.
    fn register(&self, index: &str, field: &str, ty: PropType) -> Result<()>;

    /// Applies document mutations. Called after the store commit succeeds;
    /// mixed indexes are eventually consistent with the store.
    fn mutate(&self, mutations: Vec<IndexMutation>) -> Result<()>;

    /// Runs one folded conjunction, returning matching element ids. The
    /// result honors `orders` only when `supports_ordering` is set.
    fn query(&self, index: &str, query: &ProviderQuery) -> Result<Vec<ElementId>>;

    /// Drops every document of one mixed index.
    fn drop_index(&self, index: &str) -> Result<()>;
}
