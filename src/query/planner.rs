//! Graph-query planning: picks the index set that answers a conjunction,
//! folds per-service work into single retrievals, and reports how much
//! filtering and sorting the executor still owes.

use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use tracing::trace;

use crate::backend::{FieldCondition, IndexCapabilities, ProviderQuery};
use crate::query::condition::{Op, PredicateSet};
use crate::query::plan::{IndexAccess, QueryPlan, Subquery};
use crate::schema::{IndexDefinition, SchemaSnapshot, SchemaStatus};
use crate::types::{ElementKind, IndexId, PropKeyId, PropType, Result, TramaError, Value};

/// Plans graph queries against one pinned schema snapshot.
///
/// Capability profiles are plain data collected from the wired index
/// services up front, so planning never calls into a backend.
pub struct QueryPlanner<'a> {
    schema: &'a SchemaSnapshot,
    capabilities: &'a FxHashMap<String, IndexCapabilities>,
    force_index_usage: bool,
}

enum CandidateAccess {
    Composite {
        covers: Vec<Vec<Value>>,
        all_equal: bool,
    },
    Mixed,
}

struct Candidate<'a> {
    def: &'a IndexDefinition,
    /// Conjunction positions this index can absorb.
    positions: SmallVec<[usize; 4]>,
    access: CandidateAccess,
}

impl<'a> QueryPlanner<'a> {
    /// Planner over `schema` consulting the given service capabilities.
    pub fn new(
        schema: &'a SchemaSnapshot,
        capabilities: &'a FxHashMap<String, IndexCapabilities>,
        force_index_usage: bool,
    ) -> Self {
        QueryPlanner {
            schema,
            capabilities,
            force_index_usage,
        }
    }

    /// Plans one conjunction over elements of `element` kind.
    ///
    /// Fails with [`TramaError::PlannerFallbackRejected`] when the plan
    /// degenerates to a full scan and the store is configured to insist on
    /// index-backed answers.
    pub fn plan(&self, element: ElementKind, predicates: &PredicateSet) -> Result<QueryPlan> {
        // An empty IN list is unsatisfiable; never consult a backend.
        if predicates
            .conditions
            .iter()
            .any(|c| c.op == Op::In && c.values.is_empty())
        {
            return Ok(QueryPlan::none());
        }

        let candidates = self.candidates(element, predicates);

        // A unique composite fully pinned by equality identifies at most
        // one element and always wins outright.
        if let Some(pick) = candidates
            .iter()
            .filter(|c| {
                c.def.unique()
                    && matches!(c.access, CandidateAccess::Composite { all_equal: true, .. })
            })
            .min_by(|a, b| a.def.name.cmp(&b.def.name))
        {
            let plan = self.emit(predicates, std::slice::from_ref(&pick));
            trace!(
                index = %pick.def.name,
                fitted = plan.fitted,
                "planner.unique_shortcircuit"
            );
            return Ok(plan);
        }

        // Greedy cover: repeatedly take the candidate absorbing the most
        // still-uncovered conditions.
        let mut chosen: Vec<&Candidate<'a>> = Vec::new();
        let mut covered: FxHashSet<usize> = FxHashSet::default();
        let mut services: FxHashSet<&str> = FxHashSet::default();
        loop {
            let mut best: Option<(&Candidate<'a>, usize)> = None;
            for cand in &candidates {
                if chosen.iter().any(|c| c.def.id == cand.def.id) {
                    continue;
                }
                let gain = cand
                    .positions
                    .iter()
                    .filter(|p| !covered.contains(p))
                    .count();
                if gain == 0 {
                    continue;
                }
                let better = match best {
                    None => true,
                    Some((cur, cur_gain)) => prefer(cand, gain, cur, cur_gain, &services),
                };
                if better {
                    best = Some((cand, gain));
                }
            }
            let Some((pick, _)) = best else { break };
            covered.extend(pick.positions.iter().copied());
            if let Some(service) = pick.def.backing_service() {
                services.insert(service);
            }
            chosen.push(pick);
        }

        if chosen.is_empty() && self.force_index_usage {
            return Err(TramaError::PlannerFallbackRejected);
        }

        let plan = self.emit(predicates, &chosen);
        trace!(
            subqueries = plan.subqueries.len(),
            residual = plan.residual.len(),
            fitted = plan.fitted,
            ordered = plan.ordered,
            fingerprint = plan.fingerprint(),
            "planner.plan"
        );
        Ok(plan)
    }

    fn candidates(&self, element: ElementKind, predicates: &PredicateSet) -> Vec<Candidate<'a>> {
        let mut out = Vec::new();
        for def in self.schema.graph_indexes(element) {
            if !def.admits_label(predicates.label) {
                continue;
            }
            let candidate = if def.is_composite() {
                self.composite_candidate(def, predicates)
            } else {
                self.mixed_candidate(def, predicates)
            };
            if let Some(candidate) = candidate {
                out.push(candidate);
            }
        }
        out
    }

    /// A composite index is usable only when every declared field carries
    /// an equality or value-list condition; `In` expands into one point
    /// lookup per listed value.
    fn composite_candidate(
        &self,
        def: &'a IndexDefinition,
        predicates: &PredicateSet,
    ) -> Option<Candidate<'a>> {
        if !self.schema.index_readable(def) {
            return None;
        }
        let mut positions: SmallVec<[usize; 4]> = SmallVec::new();
        let mut per_field: Vec<Vec<Value>> = Vec::with_capacity(def.fields.len());
        let mut all_equal = true;
        for field in &def.fields {
            let eq = predicates
                .conditions
                .iter()
                .position(|c| c.key == field.key && c.op == Op::Eq);
            let pos = eq.or_else(|| {
                predicates
                    .conditions
                    .iter()
                    .position(|c| c.key == field.key && c.op == Op::In)
            })?;
            let cond = &predicates.conditions[pos];
            if cond.op == Op::In {
                all_equal = false;
                let mut values: Vec<Value> = Vec::with_capacity(cond.values.len());
                for v in &cond.values {
                    if !values.contains(v) {
                        values.push(v.clone());
                    }
                }
                per_field.push(values);
            } else {
                per_field.push(vec![cond.values[0].clone()]);
            }
            if !positions.contains(&pos) {
                positions.push(pos);
            }
        }
        Some(Candidate {
            def,
            positions,
            access: CandidateAccess::Composite {
                covers: cross_product(&per_field),
                all_equal,
            },
        })
    }

    /// A mixed index absorbs any condition on one of its enabled fields
    /// whose operator the backing service supports.
    fn mixed_candidate(
        &self,
        def: &'a IndexDefinition,
        predicates: &PredicateSet,
    ) -> Option<Candidate<'a>> {
        let caps = self.capabilities.get(def.backing_service()?)?;
        let mut positions: SmallVec<[usize; 4]> = SmallVec::new();
        for (pos, cond) in predicates.conditions.iter().enumerate() {
            if def.field_position(cond.key).is_none() {
                continue;
            }
            if self.schema.index_status(def.id, cond.key) != Some(SchemaStatus::Enabled) {
                continue;
            }
            if !cond.op.delegable() {
                continue;
            }
            let Some(key_def) = self.schema.prop_key(cond.key) else {
                continue;
            };
            if !caps.supports(key_def.data_type, cond.op) {
                continue;
            }
            // Exact matches on truncated timestamps silently miss rows, so
            // services storing less than nanosecond precision only get the
            // range operators.
            if key_def.data_type == PropType::Timestamp
                && cond.op.exactness_sensitive()
                && !caps.supports_nanosecond_precision
            {
                continue;
            }
            positions.push(pos);
        }
        if positions.is_empty() {
            return None;
        }
        Some(Candidate {
            def,
            positions,
            access: CandidateAccess::Mixed,
        })
    }

    /// Builds the final plan from the chosen candidates.
    fn emit(&self, predicates: &PredicateSet, chosen: &[&Candidate<'a>]) -> QueryPlan {
        let covered: FxHashSet<usize> = chosen
            .iter()
            .flat_map(|c| c.positions.iter().copied())
            .collect();
        let residual: Vec<usize> = (0..predicates.conditions.len())
            .filter(|p| !covered.contains(p))
            .collect();
        let label_satisfied = predicates.label.is_none()
            || chosen.iter().any(|c| c.def.constraint == predicates.label);
        let fitted = !chosen.is_empty() && residual.is_empty() && label_satisfied;

        let orderer = self.orderer(predicates, chosen);
        let ordered = predicates.orders.is_empty() || orderer.is_some();

        // With nothing left to filter and a natively ordered stream, the
        // result cap travels to the service.
        let push_limit = fitted && ordered && chosen.len() == 1;

        let subqueries = chosen
            .iter()
            .map(|cand| {
                let mut positions = cand.positions.clone();
                positions.sort_unstable();
                let access = match &cand.access {
                    CandidateAccess::Composite { covers, .. } => IndexAccess::Composite {
                        index: cand.def.id,
                        covers: covers.clone(),
                    },
                    CandidateAccess::Mixed => {
                        let mut query = ProviderQuery::default();
                        for &pos in &positions {
                            let cond = &predicates.conditions[pos];
                            query.conditions.push(FieldCondition {
                                field: self.field_name(cond.key),
                                op: cond.op,
                                values: cond.values.clone(),
                            });
                        }
                        if orderer == Some(cand.def.id) {
                            query.orders = predicates
                                .orders
                                .iter()
                                .map(|(key, order)| (self.field_name(*key), *order))
                                .collect();
                        }
                        if push_limit {
                            query.limit = predicates.limit;
                        }
                        IndexAccess::Mixed {
                            index: cand.def.id,
                            query,
                        }
                    }
                };
                Subquery {
                    access,
                    covered: positions,
                }
            })
            .collect();

        QueryPlan {
            subqueries,
            residual,
            fitted,
            ordered,
            no_results: false,
        }
    }

    /// Which chosen index, if any, returns results already in the
    /// requested order. Intersections of several retrievals never do.
    fn orderer(&self, predicates: &PredicateSet, chosen: &[&Candidate<'a>]) -> Option<IndexId> {
        if predicates.orders.is_empty() || chosen.len() != 1 {
            return None;
        }
        let def = chosen[0].def;
        if !def.is_mixed() {
            return None;
        }
        let caps = self.capabilities.get(def.backing_service()?)?;
        if !caps.supports_ordering {
            return None;
        }
        let all_declared = predicates.orders.iter().all(|(key, _)| {
            def.field_position(*key).is_some()
                && self.schema.index_status(def.id, *key) == Some(SchemaStatus::Enabled)
        });
        all_declared.then_some(def.id)
    }

    fn field_name(&self, key: PropKeyId) -> String {
        self.schema
            .prop_key(key)
            .map(|def| def.name.clone())
            .unwrap_or_else(|| key.to_string())
    }
}

/// Strict preference used to break greedy-cover ties: more coverage,
/// composite over mixed, a service already consulted over a new one, then
/// name for determinism.
fn prefer(
    a: &Candidate<'_>,
    a_gain: usize,
    b: &Candidate<'_>,
    b_gain: usize,
    services: &FxHashSet<&str>,
) -> bool {
    if a_gain != b_gain {
        return a_gain > b_gain;
    }
    let a_composite = a.def.is_composite();
    let b_composite = b.def.is_composite();
    if a_composite != b_composite {
        return a_composite;
    }
    let extra_service = |c: &Candidate<'_>| {
        c.def
            .backing_service()
            .map_or(0usize, |s| usize::from(!services.contains(s)))
    };
    let a_extra = extra_service(a);
    let b_extra = extra_service(b);
    if a_extra != b_extra {
        return a_extra < b_extra;
    }
    a.def.name < b.def.name
}

/// Cartesian product of per-field value lists, in field order.
fn cross_product(per_field: &[Vec<Value>]) -> Vec<Vec<Value>> {
    let mut covers: Vec<Vec<Value>> = vec![Vec::new()];
    for values in per_field {
        let mut next = Vec::with_capacity(covers.len() * values.len());
        for prefix in &covers {
            for value in values {
                let mut tuple = prefix.clone();
                tuple.push(value.clone());
                next.push(tuple);
            }
        }
        covers = next;
    }
    covers
}

#[cfg(test)]
mod tests {
    use smallvec::smallvec;

    use super::*;
    use crate::query::condition::Condition;
    use crate::schema::{Cardinality, ConsistencyModifier, IndexField, IndexKind, PropertyKeyDef};
    use crate::types::SortOrder;

    const UID: PropKeyId = PropKeyId(1);
    const TEXT: PropKeyId = PropKeyId(2);
    const AGE: PropKeyId = PropKeyId(3);

    fn key(id: PropKeyId, name: &str, ty: PropType) -> PropertyKeyDef {
        PropertyKeyDef {
            id,
            name: name.to_string(),
            data_type: ty,
            cardinality: Cardinality::Single,
            consistency: ConsistencyModifier::Default,
        }
    }

    fn snapshot() -> SchemaSnapshot {
        let mut snap = SchemaSnapshot::default();
        snap.insert_prop_key(key(UID, "uid", PropType::Int))
            .expect("key");
        snap.insert_prop_key(key(TEXT, "text", PropType::String))
            .expect("key");
        snap.insert_prop_key(key(AGE, "age", PropType::Int))
            .expect("key");
        snap.insert_index(IndexDefinition {
            id: IndexId(1),
            name: "by_uid".to_string(),
            kind: IndexKind::Composite { unique: true },
            element: ElementKind::Vertex,
            fields: smallvec![IndexField::plain(UID)],
            constraint: None,
            consistency: ConsistencyModifier::Default,
        })
        .expect("index");
        snap.set_status(IndexId(1), UID, SchemaStatus::Enabled);
        snap.insert_index(IndexDefinition {
            id: IndexId(2),
            name: "search".to_string(),
            kind: IndexKind::Mixed {
                backing: "lucene".to_string(),
            },
            element: ElementKind::Vertex,
            fields: smallvec![IndexField::plain(TEXT), IndexField::plain(AGE)],
            constraint: None,
            consistency: ConsistencyModifier::Default,
        })
        .expect("index");
        snap.set_status(IndexId(2), TEXT, SchemaStatus::Enabled);
        snap.set_status(IndexId(2), AGE, SchemaStatus::Enabled);
        snap
    }

    fn caps() -> FxHashMap<String, IndexCapabilities> {
        let mut map = FxHashMap::default();
        map.insert(
            "lucene".to_string(),
            IndexCapabilities::standard().with_ordering(true),
        );
        map
    }

    fn conj(conditions: Vec<Condition>) -> PredicateSet {
        PredicateSet {
            conditions,
            ..PredicateSet::default()
        }
    }

    #[test]
    fn unique_equality_shortcircuits_over_everything_else() {
        let snap = snapshot();
        let caps = caps();
        let planner = QueryPlanner::new(&snap, &caps, false);
        let plan = planner
            .plan(
                ElementKind::Vertex,
                &conj(vec![
                    Condition::new(UID, Op::Eq, Value::Int(42)),
                    Condition::new(AGE, Op::Gt, Value::Int(5)),
                ]),
            )
            .expect("plan");
        assert_eq!(plan.subqueries.len(), 1);
        assert!(plan.uses_index(IndexId(1)));
        assert_eq!(plan.residual, vec![1]);
        assert!(!plan.fitted);
    }

    #[test]
    fn conditions_on_one_mixed_index_fold_into_one_query() {
        let snap = snapshot();
        let caps = caps();
        let planner = QueryPlanner::new(&snap, &caps, false);
        let plan = planner
            .plan(
                ElementKind::Vertex,
                &conj(vec![
                    Condition::new(TEXT, Op::TextContains, Value::from("ducks")),
                    Condition::new(AGE, Op::Gte, Value::Int(10)),
                ]),
            )
            .expect("plan");
        assert_eq!(plan.subqueries.len(), 1);
        match &plan.subqueries[0].access {
            IndexAccess::Mixed { query, .. } => assert_eq!(query.conditions.len(), 2),
            other => panic!("expected a mixed access, got {other:?}"),
        }
        assert!(plan.fitted);
    }

    #[test]
    fn not_in_stays_residual_even_with_an_index_present() {
        let snap = snapshot();
        let caps = caps();
        let planner = QueryPlanner::new(&snap, &caps, false);
        let plan = planner
            .plan(
                ElementKind::Vertex,
                &conj(vec![Condition::membership(
                    AGE,
                    Op::NotIn,
                    vec![Value::Int(1)],
                )]),
            )
            .expect("plan");
        assert!(plan.is_full_scan());
        assert_eq!(plan.residual, vec![0]);
        assert!(!plan.fitted);
    }

    #[test]
    fn empty_in_list_returns_no_results_plan() {
        let snap = snapshot();
        let caps = caps();
        let planner = QueryPlanner::new(&snap, &caps, false);
        let plan = planner
            .plan(
                ElementKind::Vertex,
                &conj(vec![Condition::membership(UID, Op::In, vec![])]),
            )
            .expect("plan");
        assert!(plan.no_results);
    }

    #[test]
    fn forced_index_usage_rejects_full_scans() {
        let snap = snapshot();
        let caps = caps();
        let planner = QueryPlanner::new(&snap, &caps, true);
        let err = planner
            .plan(
                ElementKind::Vertex,
                &conj(vec![Condition::membership(
                    AGE,
                    Op::NotIn,
                    vec![Value::Int(1)],
                )]),
            )
            .expect_err("full scan must be rejected");
        assert!(matches!(err, TramaError::PlannerFallbackRejected));
    }

    #[test]
    fn in_condition_expands_into_point_lookups() {
        let mut snap = snapshot();
        snap.insert_index(IndexDefinition {
            id: IndexId(3),
            name: "by_age".to_string(),
            kind: IndexKind::Composite { unique: false },
            element: ElementKind::Vertex,
            fields: smallvec![IndexField::plain(AGE)],
            constraint: None,
            consistency: ConsistencyModifier::Default,
        })
        .expect("index");
        snap.set_status(IndexId(3), AGE, SchemaStatus::Enabled);
        let caps = caps();
        let planner = QueryPlanner::new(&snap, &caps, false);
        let plan = planner
            .plan(
                ElementKind::Vertex,
                &conj(vec![Condition::membership(
                    AGE,
                    Op::In,
                    vec![Value::Int(1), Value::Int(2), Value::Int(1)],
                )]),
            )
            .expect("plan");
        match &plan.subqueries[0].access {
            IndexAccess::Composite { covers, .. } => assert_eq!(covers.len(), 2),
            other => panic!("expected a composite access, got {other:?}"),
        }
        assert!(plan.fitted);
    }

    #[test]
    fn timestamp_equality_needs_nanosecond_precision() {
        let mut snap = snapshot();
        snap.insert_prop_key(key(PropKeyId(9), "seen_at", PropType::Timestamp))
            .expect("key");
        snap.insert_index(IndexDefinition {
            id: IndexId(4),
            name: "by_time".to_string(),
            kind: IndexKind::Mixed {
                backing: "coarse".to_string(),
            },
            element: ElementKind::Vertex,
            fields: smallvec![IndexField::plain(PropKeyId(9))],
            constraint: None,
            consistency: ConsistencyModifier::Default,
        })
        .expect("index");
        snap.set_status(IndexId(4), PropKeyId(9), SchemaStatus::Enabled);
        let mut caps = caps();
        caps.insert(
            "coarse".to_string(),
            IndexCapabilities::standard().with_nanosecond_precision(false),
        );
        let planner = QueryPlanner::new(&snap, &caps, false);

        let eq = planner
            .plan(
                ElementKind::Vertex,
                &conj(vec![Condition::new(
                    PropKeyId(9),
                    Op::Eq,
                    Value::Timestamp(1_000),
                )]),
            )
            .expect("plan");
        assert!(eq.is_full_scan());

        let range = planner
            .plan(
                ElementKind::Vertex,
                &conj(vec![Condition::new(
                    PropKeyId(9),
                    Op::Gt,
                    Value::Timestamp(1_000),
                )]),
            )
            .expect("plan");
        assert!(range.uses_index(IndexId(4)));
    }

    #[test]
    fn single_mixed_orderer_marks_the_plan_ordered() {
        let snap = snapshot();
        let caps = caps();
        let planner = QueryPlanner::new(&snap, &caps, false);
        let mut predicates = conj(vec![Condition::new(
            TEXT,
            Op::TextContains,
            Value::from("ducks"),
        )]);
        predicates.orders.push((AGE, SortOrder::Desc));
        predicates.limit = Some(10);
        let plan = planner
            .plan(ElementKind::Vertex, &predicates)
            .expect("plan");
        assert!(plan.ordered);
        match &plan.subqueries[0].access {
            IndexAccess::Mixed { query, .. } => {
                assert_eq!(query.orders.len(), 1);
                assert_eq!(query.limit, Some(10));
            }
            other => panic!("expected a mixed access, got {other:?}"),
        }
    }

    #[test]
    fn composite_index_never_orders() {
        let snap = snapshot();
        let caps = caps();
        let planner = QueryPlanner::new(&snap, &caps, false);
        let mut predicates = conj(vec![Condition::new(UID, Op::Eq, Value::Int(1))]);
        predicates.orders.push((AGE, SortOrder::Asc));
        let plan = planner
            .plan(ElementKind::Vertex, &predicates)
            .expect("plan");
        assert!(plan.uses_index(IndexId(1)));
        assert!(!plan.ordered);
    }

    #[test]
    fn registered_index_is_not_consulted() {
        let mut snap = snapshot();
        snap.set_status(IndexId(1), UID, SchemaStatus::Registered);
        let caps = caps();
        let planner = QueryPlanner::new(&snap, &caps, false);
        let plan = planner
            .plan(
                ElementKind::Vertex,
                &conj(vec![Condition::new(UID, Op::Eq, Value::Int(42))]),
            )
            .expect("plan");
        assert!(plan.is_full_scan());
    }

    #[test]
    fn label_constrained_index_serves_only_matching_queries() {
        use crate::schema::LabelConstraint;
        use crate::types::VertexLabelId;

        let mut snap = snapshot();
        snap.insert_index(IndexDefinition {
            id: IndexId(5),
            name: "person_age".to_string(),
            kind: IndexKind::Composite { unique: false },
            element: ElementKind::Vertex,
            fields: smallvec![IndexField::plain(AGE)],
            constraint: Some(LabelConstraint::Vertex(VertexLabelId(7))),
            consistency: ConsistencyModifier::Default,
        })
        .expect("index");
        snap.set_status(IndexId(5), AGE, SchemaStatus::Enabled);
        let caps = caps();
        let planner = QueryPlanner::new(&snap, &caps, false);

        let unlabeled = planner
            .plan(
                ElementKind::Vertex,
                &conj(vec![Condition::new(AGE, Op::Eq, Value::Int(3))]),
            )
            .expect("plan");
        assert!(!unlabeled.uses_index(IndexId(5)));

        let labeled = PredicateSet {
            conditions: vec![Condition::new(AGE, Op::Eq, Value::Int(3))],
            label: Some(LabelConstraint::Vertex(VertexLabelId(7))),
            ..PredicateSet::default()
        };
        let plan = planner
            .plan(ElementKind::Vertex, &labeled)
            .expect("plan");
        assert!(plan.uses_index(IndexId(5)));
        assert!(plan.fitted);
    }
}
