//! Vertex-scoped planning: answering edge and property queries anchored at
//! one vertex with the relation indexes declared on their label or key.

use tracing::trace;

use crate::query::condition::{Condition, Op};
use crate::schema::{IndexDefinition, IndexKind, RelationBase, SchemaSnapshot};
use crate::types::{Direction, IndexId, Result, SortOrder, TramaError, Value};

/// A query over the relations of one base type incident to an anchor
/// vertex: edges of one label in one direction, or the instances of one
/// multi-valued property key.
#[derive(Clone, Debug)]
pub struct RelationQuery {
    /// Edge label or property key the relations belong to.
    pub base: RelationBase,
    /// Edge direction relative to the anchor. Property instances always
    /// hang off their vertex, so property queries use `Out`.
    pub direction: Direction,
    /// Conditions over sort-key and other relation properties.
    pub conditions: Vec<Condition>,
    /// Requested order over relation properties.
    pub orders: Vec<(crate::types::PropKeyId, SortOrder)>,
    /// Optional result cap.
    pub limit: Option<usize>,
}

impl RelationQuery {
    /// Unfiltered query over all relations of `base` in `direction`.
    pub fn all(base: RelationBase, direction: Direction) -> Self {
        RelationQuery {
            base,
            direction,
            conditions: Vec::new(),
            orders: Vec::new(),
            limit: None,
        }
    }
}

/// Plan for one vertex-scoped query.
#[derive(Clone, Debug)]
pub struct RelationPlan {
    /// Relation index to scan, or `None` for a plain adjacency walk.
    pub index: Option<IndexId>,
    /// Leading sort-key values pinned by equality, in declared order. The
    /// scan range narrows to entries carrying exactly these values.
    pub prefix_values: Vec<Value>,
    /// Condition positions re-checked in memory on every relation.
    pub residual: Vec<usize>,
    /// True when the pinned prefix answers every condition.
    pub fitted: bool,
    /// True when iteration order already satisfies the requested order.
    pub ordered: bool,
    /// Walk the index range backwards to honor a descending declaration.
    pub scan_reverse: bool,
    /// The query is unsatisfiable.
    pub no_results: bool,
}

impl RelationPlan {
    fn adjacency_scan(query: &RelationQuery) -> Self {
        RelationPlan {
            index: None,
            prefix_values: Vec::new(),
            residual: (0..query.conditions.len()).collect(),
            fitted: query.conditions.is_empty(),
            ordered: query.orders.is_empty(),
            scan_reverse: false,
            no_results: false,
        }
    }

    fn none() -> Self {
        RelationPlan {
            index: None,
            prefix_values: Vec::new(),
            residual: Vec::new(),
            fitted: true,
            ordered: true,
            scan_reverse: false,
            no_results: true,
        }
    }
}

struct RelationCandidate<'a> {
    def: &'a IndexDefinition,
    declared_order: SortOrder,
    prefix_values: Vec<Value>,
    covered: Vec<usize>,
    ordered: bool,
}

/// Plans vertex-scoped queries against the relation indexes in a snapshot.
pub struct RelationPlanner<'a> {
    schema: &'a SchemaSnapshot,
}

impl<'a> RelationPlanner<'a> {
    /// Planner over `schema`.
    pub fn new(schema: &'a SchemaSnapshot) -> Self {
        RelationPlanner { schema }
    }

    /// Plans one vertex-scoped query.
    pub fn plan(&self, query: &RelationQuery) -> Result<RelationPlan> {
        if let RelationBase::PropertyKey(_) = query.base {
            if query.direction != Direction::Out {
                return Err(TramaError::Invalid(
                    "property instances carry no direction",
                ));
            }
        }
        if query
            .conditions
            .iter()
            .any(|c| c.op == Op::In && c.values.is_empty())
        {
            return Ok(RelationPlan::none());
        }

        let mut best: Option<RelationCandidate<'a>> = None;
        for def in self.schema.relation_indexes(query.base) {
            if !self.schema.index_readable(def) {
                continue;
            }
            let Some(candidate) = self.candidate(def, query) else {
                continue;
            };
            let better = match &best {
                None => true,
                Some(cur) => {
                    let by_cover = candidate.covered.len().cmp(&cur.covered.len());
                    let by_order = candidate.ordered.cmp(&cur.ordered);
                    by_cover
                        .then(by_order)
                        .then_with(|| cur.def.name.cmp(&candidate.def.name))
                        .is_gt()
                }
            };
            if better {
                best = Some(candidate);
            }
        }

        let Some(pick) = best else {
            return Ok(RelationPlan::adjacency_scan(query));
        };
        // An index that neither narrows the scan nor provides the order
        // adds nothing over the adjacency list.
        if pick.covered.is_empty() && !(pick.ordered && !query.orders.is_empty()) {
            return Ok(RelationPlan::adjacency_scan(query));
        }

        let covered: Vec<usize> = pick.covered;
        let residual: Vec<usize> = (0..query.conditions.len())
            .filter(|p| !covered.contains(p))
            .collect();
        let plan = RelationPlan {
            index: Some(pick.def.id),
            prefix_values: pick.prefix_values,
            fitted: residual.is_empty(),
            ordered: query.orders.is_empty() || pick.ordered,
            scan_reverse: pick.declared_order == SortOrder::Desc,
            residual,
            no_results: false,
        };
        trace!(
            index = %pick.def.name,
            prefix = plan.prefix_values.len(),
            fitted = plan.fitted,
            ordered = plan.ordered,
            "planner.relation"
        );
        Ok(plan)
    }

    /// Evaluates one relation index: how long an equality prefix the
    /// conditions pin, and whether its declared order serves the query.
    fn candidate(
        &self,
        def: &'a IndexDefinition,
        query: &RelationQuery,
    ) -> Option<RelationCandidate<'a>> {
        let IndexKind::Relation {
            direction: declared_direction,
            order: declared_order,
            ..
        } = &def.kind
        else {
            return None;
        };
        if !direction_admits(*declared_direction, query.direction) {
            return None;
        }

        let mut prefix_values = Vec::new();
        let mut covered = Vec::new();
        for field in &def.fields {
            let Some(pos) = query
                .conditions
                .iter()
                .position(|c| c.key == field.key && c.op == Op::Eq)
            else {
                break;
            };
            prefix_values.push(query.conditions[pos].values[0].clone());
            covered.push(pos);
        }

        // The requested order must be the next declared sort keys, in
        // sequence, each in the index's declared direction. A Both-direction
        // retrieval merges two disjoint scans and loses the native order.
        let remaining: Vec<_> = def.fields.iter().skip(prefix_values.len()).collect();
        let ordered = query.direction != Direction::Both
            && !query.orders.is_empty()
            && query.orders.len() <= remaining.len()
            && query.orders.iter().enumerate().all(|(i, (key, order))| {
                remaining[i].key == *key && order == declared_order
            });

        Some(RelationCandidate {
            def,
            declared_order: *declared_order,
            prefix_values,
            covered,
            ordered,
        })
    }
}

/// Whether an index declared for `declared` serves a query in `requested`.
fn direction_admits(declared: Direction, requested: Direction) -> bool {
    declared == Direction::Both || declared == requested
}
