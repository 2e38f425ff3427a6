//! Runs planned queries against a transaction.
//!
//! Index retrievals see committed state only. Hits the transaction has
//! staged are re-read through the overlay and staged elements are folded in
//! under full condition evaluation, so a transaction always observes its own
//! writes. Residual conditions, label restrictions, ordering, and limits are
//! applied in memory after retrieval.

use std::cmp::Ordering;

use rustc_hash::FxHashSet;
use smallvec::SmallVec;
use tracing::trace;

use crate::backend::codec::{self, keyspace, ord};
use crate::backend::ProviderQuery;
use crate::query::condition::{Condition, PredicateSet};
use crate::query::plan::{IndexAccess, QueryPlan};
use crate::query::relation::{RelationPlan, RelationPlanner, RelationQuery};
use crate::schema::RelationBase;
use crate::txn::consistency::ElementView;
use crate::txn::{EdgeRecord, PropertyRecord, Transaction, VertexRecord};
use crate::types::{
    Direction, EdgeId, EdgeLabelId, ElementId, IndexId, PropKeyId, Result, SortOrder, TramaError,
    Value, VertexId,
};

/// Vertices matching `predicates` under `plan`.
pub(crate) fn vertices(
    txn: &Transaction,
    predicates: &PredicateSet,
    plan: &QueryPlan,
) -> Result<Vec<VertexRecord>> {
    if plan.no_results {
        return Ok(Vec::new());
    }
    let every: Vec<usize> = (0..predicates.conditions.len()).collect();
    let mut out: Vec<VertexRecord> = Vec::new();
    let mut overlay_added = false;

    if plan.is_full_scan() {
        for record in txn.scan_vertices()? {
            let view = ElementView::Vertex(&record);
            if label_admits(predicates, &view) && satisfies(&predicates.conditions, &every, &view) {
                out.push(record);
            }
        }
    } else {
        for id in retrieve(txn, plan)? {
            let ElementId::Vertex(vertex) = id else {
                continue;
            };
            if txn.writes().vertices.contains_key(&vertex) {
                // The staged version is merged below under full evaluation.
                continue;
            }
            let Some(record) = txn.vertex(vertex)? else {
                continue;
            };
            let view = ElementView::Vertex(&record);
            if label_admits(predicates, &view)
                && satisfies(&predicates.conditions, &plan.residual, &view)
            {
                out.push(record);
            }
        }
        let mut staged: Vec<&VertexRecord> = txn.writes().vertices.values().flatten().collect();
        staged.sort_by_key(|r| r.id);
        for record in staged {
            let view = ElementView::Vertex(record);
            if label_admits(predicates, &view) && satisfies(&predicates.conditions, &every, &view) {
                out.push(record.clone());
                overlay_added = true;
            }
        }
    }

    let need_sort = !predicates.orders.is_empty() && (!plan.ordered || overlay_added);
    sort_and_limit(&mut out, &predicates.orders, predicates.limit, need_sort, |r, k| {
        ElementView::Vertex(r).values(k)
    });
    trace!(results = out.len(), "query.vertices");
    Ok(out)
}

/// Edges matching `predicates` under `plan`.
pub(crate) fn edges(
    txn: &Transaction,
    predicates: &PredicateSet,
    plan: &QueryPlan,
) -> Result<Vec<EdgeRecord>> {
    if plan.no_results {
        return Ok(Vec::new());
    }
    let every: Vec<usize> = (0..predicates.conditions.len()).collect();
    let mut out: Vec<EdgeRecord> = Vec::new();
    let mut overlay_added = false;

    if plan.is_full_scan() {
        for record in txn.scan_edges()? {
            let view = ElementView::Edge(&record);
            if label_admits(predicates, &view) && satisfies(&predicates.conditions, &every, &view) {
                out.push(record);
            }
        }
    } else {
        for id in retrieve(txn, plan)? {
            let ElementId::Edge(edge) = id else {
                continue;
            };
            if txn.writes().edges.contains_key(&edge) {
                continue;
            }
            let Some(record) = txn.edge(edge)? else {
                continue;
            };
            if record.superseded {
                continue;
            }
            let view = ElementView::Edge(&record);
            if label_admits(predicates, &view)
                && satisfies(&predicates.conditions, &plan.residual, &view)
            {
                out.push(record);
            }
        }
        let mut staged: Vec<&EdgeRecord> = txn
            .writes()
            .edges
            .values()
            .flatten()
            .filter(|e| !e.superseded)
            .collect();
        staged.sort_by_key(|r| r.id);
        for record in staged {
            let view = ElementView::Edge(record);
            if label_admits(predicates, &view) && satisfies(&predicates.conditions, &every, &view) {
                out.push(record.clone());
                overlay_added = true;
            }
        }
    }

    let need_sort = !predicates.orders.is_empty() && (!plan.ordered || overlay_added);
    sort_and_limit(&mut out, &predicates.orders, predicates.limit, need_sort, |r, k| {
        ElementView::Edge(r).values(k)
    });
    trace!(results = out.len(), "query.edges");
    Ok(out)
}

/// Property instances matching `predicates` under `plan`, paired with their
/// owning vertex. Conditions and orders apply to instance meta properties.
pub(crate) fn properties(
    txn: &Transaction,
    predicates: &PredicateSet,
    plan: &QueryPlan,
) -> Result<Vec<(VertexId, PropertyRecord)>> {
    if predicates.label.is_some() {
        return Err(TramaError::Invalid(
            "property queries take no label restriction",
        ));
    }
    if plan.no_results {
        return Ok(Vec::new());
    }
    let every: Vec<usize> = (0..predicates.conditions.len()).collect();
    let mut out: Vec<(VertexId, PropertyRecord)> = Vec::new();
    let mut overlay_added = false;

    if plan.is_full_scan() {
        for record in txn.scan_vertices()? {
            for instance in &record.properties {
                let view = ElementView::Property(instance);
                if satisfies(&predicates.conditions, &every, &view) {
                    out.push((record.id, instance.clone()));
                }
            }
        }
    } else {
        for id in retrieve(txn, plan)? {
            let ElementId::Property(prop) = id else {
                continue;
            };
            let Some(vertex) = txn.property_owner(prop)? else {
                continue;
            };
            if txn.writes().vertices.contains_key(&vertex) {
                continue;
            }
            let Some(record) = txn.vertex(vertex)? else {
                continue;
            };
            let Some(instance) = record.property(prop) else {
                continue;
            };
            let view = ElementView::Property(instance);
            if satisfies(&predicates.conditions, &plan.residual, &view) {
                out.push((vertex, instance.clone()));
            }
        }
        let mut staged: Vec<&VertexRecord> = txn.writes().vertices.values().flatten().collect();
        staged.sort_by_key(|r| r.id);
        for record in staged {
            for instance in &record.properties {
                let view = ElementView::Property(instance);
                if satisfies(&predicates.conditions, &every, &view) {
                    out.push((record.id, instance.clone()));
                    overlay_added = true;
                }
            }
        }
    }

    let need_sort = !predicates.orders.is_empty() && (!plan.ordered || overlay_added);
    sort_and_limit(&mut out, &predicates.orders, predicates.limit, need_sort, |r, k| {
        ElementView::Property(&r.1).values(k)
    });
    trace!(results = out.len(), "query.properties");
    Ok(out)
}

/// Edges of one label incident to `vertex`, retrieved through the best
/// relation index or an adjacency walk.
pub(crate) fn relation_edges(
    txn: &Transaction,
    vertex: VertexId,
    query: &RelationQuery,
) -> Result<Vec<EdgeRecord>> {
    let RelationBase::EdgeLabel(label) = query.base else {
        return Err(TramaError::Invalid("query base must be an edge label"));
    };
    let plan = RelationPlanner::new(txn.schema()).plan(query)?;
    if plan.no_results {
        return Ok(Vec::new());
    }
    let every: Vec<usize> = (0..query.conditions.len()).collect();
    let mut out: Vec<EdgeRecord> = Vec::new();
    let mut overlay_added = false;
    let mut seen: FxHashSet<EdgeId> = FxHashSet::default();

    let committed: Vec<EdgeId> = match plan.index {
        Some(index) => indexed_relation_ids(txn, index, vertex, query.direction, &plan)?
            .into_iter()
            .filter_map(|id| match id {
                ElementId::Edge(edge) => Some(edge),
                _ => None,
            })
            .collect(),
        None => adjacency_ids(txn, vertex, label, query.direction)?,
    };
    for id in committed {
        if txn.writes().edges.contains_key(&id) {
            continue;
        }
        if !seen.insert(id) {
            continue;
        }
        let Some(record) = txn.edge(id)? else {
            continue;
        };
        if record.superseded {
            continue;
        }
        let view = ElementView::Edge(&record);
        if satisfies(&query.conditions, &plan.residual, &view) {
            out.push(record);
        }
    }

    let mut staged: Vec<&EdgeRecord> = txn
        .writes()
        .edges
        .values()
        .flatten()
        .filter(|e| !e.superseded && e.label == label && anchored(e, vertex, query.direction))
        .collect();
    staged.sort_by_key(|r| r.id);
    for record in staged {
        if !seen.insert(record.id) {
            continue;
        }
        let view = ElementView::Edge(record);
        if satisfies(&query.conditions, &every, &view) {
            out.push(record.clone());
            overlay_added = true;
        }
    }

    let need_sort = !query.orders.is_empty() && (!plan.ordered || overlay_added);
    sort_and_limit(&mut out, &query.orders, query.limit, need_sort, |r, k| {
        ElementView::Edge(r).values(k)
    });
    trace!(
        results = out.len(),
        indexed = plan.index.is_some(),
        "query.relation_edges"
    );
    Ok(out)
}

/// Instances of one property key on `vertex`, retrieved through the best
/// relation index or straight off the vertex record.
pub(crate) fn relation_properties(
    txn: &Transaction,
    vertex: VertexId,
    query: &RelationQuery,
) -> Result<Vec<PropertyRecord>> {
    let RelationBase::PropertyKey(base) = query.base else {
        return Err(TramaError::Invalid("query base must be a property key"));
    };
    let plan = RelationPlanner::new(txn.schema()).plan(query)?;
    if plan.no_results {
        return Ok(Vec::new());
    }
    let Some(record) = txn.vertex(vertex)? else {
        return Ok(Vec::new());
    };
    let every: Vec<usize> = (0..query.conditions.len()).collect();
    let mut out: Vec<PropertyRecord> = Vec::new();
    // A staged record diverges from what the index reflects, so staged
    // vertices are evaluated entirely in memory.
    let staged = txn.writes().vertices.contains_key(&vertex);
    let mut indexed_order = false;

    match plan.index {
        Some(index) if !staged => {
            for id in indexed_relation_ids(txn, index, vertex, Direction::Out, &plan)? {
                let ElementId::Property(prop) = id else {
                    continue;
                };
                let Some(instance) = record.property(prop) else {
                    continue;
                };
                let view = ElementView::Property(instance);
                if satisfies(&query.conditions, &plan.residual, &view) {
                    out.push(instance.clone());
                }
            }
            indexed_order = plan.ordered;
        }
        _ => {
            for instance in record.properties.iter().filter(|p| p.key == base) {
                let view = ElementView::Property(instance);
                if satisfies(&query.conditions, &every, &view) {
                    out.push(instance.clone());
                }
            }
        }
    }

    let need_sort = !query.orders.is_empty() && !indexed_order;
    sort_and_limit(&mut out, &query.orders, query.limit, need_sort, |r, k| {
        ElementView::Property(r).values(k)
    });
    trace!(
        results = out.len(),
        indexed = plan.index.is_some(),
        "query.relation_properties"
    );
    Ok(out)
}

/// Runs every subquery and intersects their id lists.
fn retrieve(txn: &Transaction, plan: &QueryPlan) -> Result<Vec<ElementId>> {
    let mut lists: Vec<Vec<ElementId>> = Vec::with_capacity(plan.subqueries.len());
    for sub in &plan.subqueries {
        lists.push(match &sub.access {
            IndexAccess::Composite { index, covers } => composite_lookup(txn, *index, covers)?,
            IndexAccess::Mixed { index, query } => mixed_lookup(txn, *index, query)?,
        });
    }
    if lists.len() == 1 {
        // A single retrieval keeps the backing service's native order.
        return Ok(lists.pop().unwrap_or_default());
    }
    for list in &mut lists {
        list.sort_unstable();
        list.dedup();
    }
    Ok(intersect_sorted(&lists))
}

/// Scans the composite entries of every covering value tuple.
fn composite_lookup(
    txn: &Transaction,
    index: IndexId,
    covers: &[Vec<Value>],
) -> Result<Vec<ElementId>> {
    let kv = txn.backend().kv();
    let mut ids: Vec<ElementId> = Vec::new();
    for tuple in covers {
        let encoded = codec::encode_composite_tuple(tuple);
        let hash = codec::composite_hash(&encoded);
        let prefix = keyspace::composite_value_prefix(index, hash, &encoded);
        for (key, _) in kv.scan_prefix(&prefix)? {
            ids.push(keyspace::entry_element(&key)?);
        }
    }
    // Multi-valued keys can satisfy several covers with one element.
    ids.sort_unstable();
    ids.dedup();
    Ok(ids)
}

/// Delegates one subquery to the index service backing a mixed index.
fn mixed_lookup(
    txn: &Transaction,
    index: IndexId,
    query: &ProviderQuery,
) -> Result<Vec<ElementId>> {
    let def = txn
        .schema()
        .index(index)
        .ok_or(TramaError::Corruption("plan references an unknown index"))?;
    let backing = def
        .backing_service()
        .ok_or(TramaError::Corruption("mixed retrieval over a non-mixed index"))?;
    let provider = txn
        .backend()
        .provider(backing)
        .ok_or(TramaError::BackendUnavailable(
            "index service not wired to this backend",
        ))?;
    provider.query(&def.name, query)
}

/// K-way intersection of sorted, deduplicated id lists. Every cursor chases
/// the current maximum head; ids present in all lists are emitted.
fn intersect_sorted(lists: &[Vec<ElementId>]) -> Vec<ElementId> {
    let mut out = Vec::new();
    if lists.is_empty() || lists.iter().any(|l| l.is_empty()) {
        return out;
    }
    let mut cursors = vec![0usize; lists.len()];
    'outer: loop {
        let mut target = lists[0][cursors[0]];
        let mut all_equal = true;
        for (i, list) in lists.iter().enumerate().skip(1) {
            let head = list[cursors[i]];
            if head != target {
                all_equal = false;
                if head > target {
                    target = head;
                }
            }
        }
        if all_equal {
            out.push(target);
            for (i, list) in lists.iter().enumerate() {
                cursors[i] += 1;
                if cursors[i] >= list.len() {
                    break 'outer;
                }
            }
        } else {
            for (i, list) in lists.iter().enumerate() {
                while list[cursors[i]] < target {
                    cursors[i] += 1;
                    if cursors[i] >= list.len() {
                        break 'outer;
                    }
                }
            }
        }
    }
    out
}

/// Entry ids of one relation index range, narrowed to the plan's pinned
/// prefix and walked backwards for descending declarations.
fn indexed_relation_ids(
    txn: &Transaction,
    index: IndexId,
    vertex: VertexId,
    direction: Direction,
    plan: &RelationPlan,
) -> Result<Vec<ElementId>> {
    let kv = txn.backend().kv();
    let pinned = ord::encode_values(&plan.prefix_values);
    let dirs: &[Direction] = match direction {
        Direction::Out => &[Direction::Out],
        Direction::In => &[Direction::In],
        Direction::Both => &[Direction::Out, Direction::In],
    };
    let mut ids: Vec<ElementId> = Vec::new();
    for dir in dirs {
        let mut prefix = keyspace::relation_prefix(index, vertex, *dir);
        prefix.extend_from_slice(&pinned);
        let mut range: Vec<ElementId> = Vec::new();
        for (key, _) in kv.scan_prefix(&prefix)? {
            range.push(keyspace::entry_element(&key)?);
        }
        if plan.scan_reverse {
            range.reverse();
        }
        ids.extend(range);
    }
    Ok(ids)
}

/// Edge ids from the adjacency rows of one label around `vertex`.
fn adjacency_ids(
    txn: &Transaction,
    vertex: VertexId,
    label: EdgeLabelId,
    direction: Direction,
) -> Result<Vec<EdgeId>> {
    let kv = txn.backend().kv();
    let dirs: &[Direction] = match direction {
        Direction::Out => &[Direction::Out],
        Direction::In => &[Direction::In],
        Direction::Both => &[Direction::Out, Direction::In],
    };
    let mut ids: Vec<EdgeId> = Vec::new();
    for dir in dirs {
        for (key, _) in kv.scan_prefix(&keyspace::adjacency_label_prefix(vertex, *dir, label.0))? {
            ids.push(keyspace::adjacency_edge(&key)?);
        }
    }
    Ok(ids)
}

fn anchored(record: &EdgeRecord, vertex: VertexId, direction: Direction) -> bool {
    (record.out_v == vertex && direction.admits(true))
        || (record.in_v == vertex && direction.admits(false))
}

fn satisfies(conditions: &[Condition], positions: &[usize], view: &ElementView<'_>) -> bool {
    positions.iter().all(|&pos| {
        let cond = &conditions[pos];
        cond.evaluate(&view.values(cond.key))
    })
}

fn label_admits(predicates: &PredicateSet, view: &ElementView<'_>) -> bool {
    match predicates.label {
        None => true,
        Some(constraint) => view.label() == Some(constraint),
    }
}

/// Sorts in memory when retrieval order does not already match, then caps
/// the result. Elements missing an order key sort last.
fn sort_and_limit<T>(
    records: &mut Vec<T>,
    orders: &[(PropKeyId, SortOrder)],
    limit: Option<usize>,
    need_sort: bool,
    key_values: impl Fn(&T, PropKeyId) -> SmallVec<[Value; 2]>,
) {
    if need_sort && !orders.is_empty() {
        records.sort_by(|a, b| {
            for (key, order) in orders {
                let av = key_values(a, *key);
                let bv = key_values(b, *key);
                let ord = match (av.first(), bv.first()) {
                    (Some(a), Some(b)) => match order {
                        SortOrder::Asc => a.cmp(b),
                        SortOrder::Desc => b.cmp(a),
                    },
                    (Some(_), None) => Ordering::Less,
                    (None, Some(_)) => Ordering::Greater,
                    (None, None) => Ordering::Equal,
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        });
    }
    if let Some(limit) = limit {
        records.truncate(limit);
    }
}
