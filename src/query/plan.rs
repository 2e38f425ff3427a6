//! Executable plans: which indexes answer which conditions, what remains to
//! be filtered in memory, and how well the plan fits the query.

use serde::Serialize;
use smallvec::SmallVec;
use xxhash_rust::xxh64::xxh64;

use crate::backend::ProviderQuery;
use crate::schema::SchemaSnapshot;
use crate::types::{IndexId, Value};

/// How one chosen index is consulted at execution time.
#[derive(Clone, Debug, Serialize)]
pub enum IndexAccess {
    /// Exact-match lookups against a composite index, one tuple of field
    /// values per point lookup. An `In` condition expands into several
    /// tuples.
    Composite {
        /// Chosen index.
        index: IndexId,
        /// Lookup tuples in the index's field order.
        covers: Vec<Vec<Value>>,
    },
    /// One folded query against a mixed index's backing service. All
    /// conditions this index absorbs travel in the same query.
    Mixed {
        /// Chosen index.
        index: IndexId,
        /// The folded provider query.
        query: ProviderQuery,
    },
}

impl IndexAccess {
    /// The index this access consults.
    pub fn index(&self) -> IndexId {
        match self {
            IndexAccess::Composite { index, .. } => *index,
            IndexAccess::Mixed { index, .. } => *index,
        }
    }
}

/// One chosen index and the conjunction positions it answers.
#[derive(Clone, Debug, Serialize)]
pub struct Subquery {
    /// The index retrieval.
    pub access: IndexAccess,
    /// Positions into the planned conjunction covered by this retrieval.
    pub covered: SmallVec<[usize; 4]>,
}

/// The planner's output for one conjunction: subquery retrievals whose
/// results are intersected, plus everything the executor must still do.
#[derive(Clone, Debug, Serialize)]
pub struct QueryPlan {
    /// Index retrievals to intersect. Empty means a full element scan.
    pub subqueries: Vec<Subquery>,
    /// Conjunction positions re-checked in memory on every candidate.
    pub residual: Vec<usize>,
    /// True when index results need no further filtering.
    pub fitted: bool,
    /// True when results come back in the requested order without an
    /// in-memory sort.
    pub ordered: bool,
    /// The conjunction is unsatisfiable; execution returns nothing.
    pub no_results: bool,
}

impl QueryPlan {
    /// Plan for an unsatisfiable conjunction.
    pub fn none() -> Self {
        QueryPlan {
            subqueries: Vec::new(),
            residual: Vec::new(),
            fitted: true,
            ordered: true,
            no_results: true,
        }
    }

    /// Whether execution must walk every element of the target kind.
    pub fn is_full_scan(&self) -> bool {
        self.subqueries.is_empty() && !self.no_results
    }

    /// Whether the plan consults the given index.
    pub fn uses_index(&self, index: IndexId) -> bool {
        self.subqueries.iter().any(|s| s.access.index() == index)
    }

    /// Stable hash of the plan shape, logged so repeated queries can be
    /// correlated across traces.
    pub fn fingerprint(&self) -> u64 {
        let encoded = serde_json::to_vec(self).unwrap_or_default();
        xxh64(&encoded, 0)
    }

    /// Human-readable rendering with index names resolved against a
    /// schema snapshot.
    pub fn explain(&self, schema: &SchemaSnapshot) -> PlanExplain {
        let steps = self
            .subqueries
            .iter()
            .map(|s| {
                let id = s.access.index();
                let name = schema
                    .index(id)
                    .map(|def| def.name.clone())
                    .unwrap_or_else(|| format!("#{id}"));
                match &s.access {
                    IndexAccess::Composite { covers, .. } => StepExplain {
                        index: name,
                        kind: "composite",
                        backing: None,
                        lookups: covers.len(),
                        conditions: s.covered.len(),
                    },
                    IndexAccess::Mixed { query, .. } => StepExplain {
                        index: name,
                        kind: "mixed",
                        backing: schema
                            .index(id)
                            .and_then(|def| def.backing_service().map(str::to_string)),
                        lookups: 1,
                        conditions: query.conditions.len(),
                    },
                }
            })
            .collect();
        PlanExplain {
            steps,
            residual_conditions: self.residual.len(),
            fitted: self.fitted,
            ordered: self.ordered,
            no_results: self.no_results,
            fingerprint: format!("{:016x}", self.fingerprint()),
        }
    }
}

/// Serializable rendering of a plan.
#[derive(Debug, Serialize)]
pub struct PlanExplain {
    /// One entry per chosen index, in execution order.
    pub steps: Vec<StepExplain>,
    /// How many conditions remain as in-memory filters.
    pub residual_conditions: usize,
    /// See [`QueryPlan::fitted`].
    pub fitted: bool,
    /// See [`QueryPlan::ordered`].
    pub ordered: bool,
    /// See [`QueryPlan::no_results`].
    pub no_results: bool,
    /// Hex form of [`QueryPlan::fingerprint`].
    pub fingerprint: String,
}

/// One rendered subquery.
#[derive(Debug, Serialize)]
pub struct StepExplain {
    /// Index name, or `#id` if the definition has been dropped since.
    pub index: String,
    /// `"composite"` or `"mixed"`.
    pub kind: &'static str,
    /// Backing service for mixed indexes.
    pub backing: Option<String>,
    /// Point lookups a composite access performs.
    pub lookups: usize,
    /// Conditions the access absorbs.
    pub conditions: usize,
}
