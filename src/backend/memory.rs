//! In-memory reference backends: a [`KvStore`] over a guarded `BTreeMap` and
//! an [`IndexProvider`] that evaluates provider queries over stored documents.
//!
//! Both live behind the same traits a persistent deployment would implement,
//! so every other module treats them as opaque services.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::ops::Bound;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::query::condition;
use crate::types::{ElementId, PropType, Result, SortOrder, TramaError, Value};

use super::{
    Guard, IndexCapabilities, IndexMutation, IndexProvider, KvFeatures, KvStore, ProviderQuery,
};

/// Ordered key-value store held entirely in memory.
///
/// `apply` verifies all guards and installs the batch under one lock, which
/// gives the same atomicity a transactional backend provides.
pub struct MemoryKv {
    map: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
    optimistic: bool,
}

impl MemoryKv {
    /// Store that advertises optimistic locking support.
    pub fn new() -> Self {
        MemoryKv {
            map: Mutex::new(BTreeMap::new()),
            optimistic: true,
        }
    }

    /// Store that reports no optimistic locking, forcing callers onto the
    /// pessimistic path.
    pub fn without_optimistic_locking() -> Self {
        MemoryKv {
            map: Mutex::new(BTreeMap::new()),
            optimistic: false,
        }
    }
}

impl Default for MemoryKv {
    fn default() -> Self {
        MemoryKv::new()
    }
}

fn guard_holds(map: &BTreeMap<Vec<u8>, Vec<u8>>, guard: &Guard) -> bool {
    match guard {
        Guard::Absent(key) => !map.contains_key(key),
        Guard::AbsentPrefix(prefix) => map
            .range::<[u8], _>((Bound::Included(prefix.as_slice()), Bound::Unbounded))
            .next()
            .map_or(true, |(k, _)| !k.starts_with(prefix.as_slice())),
        Guard::Equals(key, expected) => map.get(key).map(Vec::as_slice) == Some(expected.as_slice()),
    }
}

impl KvStore for MemoryKv {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.map.lock().get(key).cloned())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let map = self.map.lock();
        Ok(map
            .range::<[u8], _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn apply(
        &self,
        puts: Vec<(Vec<u8>, Vec<u8>)>,
        deletes: Vec<Vec<u8>>,
        guards: &[Guard],
    ) -> Result<()> {
        let mut map = self.map.lock();
        for guard in guards {
            if !guard_holds(&map, guard) {
                return Err(TramaError::LockConflict(
                    "write guard no longer holds".to_string(),
                ));
            }
        }
        trace!(puts = puts.len(), deletes = deletes.len(), "kv.apply");
        for key in deletes {
            map.remove(&key);
        }
        for (key, value) in puts {
            map.insert(key, value);
        }
        Ok(())
    }

    fn features(&self) -> KvFeatures {
        KvFeatures {
            optimistic_locking: self.optimistic,
        }
    }
}

type Document = FxHashMap<String, Vec<Value>>;

#[derive(Default)]
struct ProviderState {
    /// Registered (index, field) pairs with their declared types.
    fields: FxHashMap<String, FxHashMap<String, PropType>>,
    /// Documents per index, keyed by element for deterministic iteration.
    docs: FxHashMap<String, BTreeMap<ElementId, Document>>,
}

/// Index service that stores documents in memory and evaluates provider
/// queries directly over them.
pub struct MemoryIndexProvider {
    name: String,
    capabilities: IndexCapabilities,
    state: Mutex<ProviderState>,
}

impl MemoryIndexProvider {
    /// Full-featured service: native ordering, nanosecond timestamps and
    /// geo containment.
    pub fn new(name: impl Into<String>) -> Self {
        MemoryIndexProvider::with_capabilities(
            name,
            IndexCapabilities::standard()
                .with_ordering(true)
                .with_nanosecond_precision(true)
                .with_geo_contains(true),
        )
    }

    /// Service with an explicit capability profile, used to exercise
    /// planner eligibility rules.
    pub fn with_capabilities(name: impl Into<String>, capabilities: IndexCapabilities) -> Self {
        MemoryIndexProvider {
            name: name.into(),
            capabilities,
            state: Mutex::new(ProviderState::default()),
        }
    }
}

impl IndexProvider for MemoryIndexProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> IndexCapabilities {
        self.capabilities.clone()
    }

    fn register(&self, index: &str, field: &str, ty: PropType) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let fields = state.fields.entry(index.to_string()).or_default();
        if let Some(existing) = fields.get(field) {
            if *existing != ty {
                return Err(TramaError::Invalid(
                    "field already registered with a different type",
                ));
            }
        }
        fields.insert(field.to_string(), ty);
        state.docs.entry(index.to_string()).or_default();
        trace!(service = %self.name, index, field, "index.register");
        Ok(())
    }

    fn mutate(&self, mutations: Vec<IndexMutation>) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        for mutation in mutations {
            let registered = state
                .fields
                .get(&mutation.index)
                .ok_or(TramaError::Invalid("index not registered with this service"))?;
            for entry in mutation.additions.iter().chain(mutation.deletions.iter()) {
                if !registered.contains_key(&entry.field) {
                    return Err(TramaError::Invalid("field not registered with this index"));
                }
            }
            let docs = state
                .docs
                .get_mut(&mutation.index)
                .ok_or(TramaError::Invalid("index not registered with this service"))?;
            if mutation.delete_all {
                docs.remove(&mutation.element);
                if mutation.additions.is_empty() {
                    continue;
                }
            }
            let doc = docs.entry(mutation.element).or_default();
            if !mutation.delete_all {
                for entry in mutation.deletions {
                    if let Some(values) = doc.get_mut(&entry.field) {
                        values.retain(|v| v != &entry.value);
                        if values.is_empty() {
                            doc.remove(&entry.field);
                        }
                    }
                }
            }
            for entry in mutation.additions {
                let values = doc.entry(entry.field).or_default();
                if !values.contains(&entry.value) {
                    values.push(entry.value);
                }
            }
            if doc.is_empty() {
                docs.remove(&mutation.element);
            }
        }
        Ok(())
    }

    fn query(&self, index: &str, query: &ProviderQuery) -> Result<Vec<ElementId>> {
        let guard = self.state.lock();
        let registered = guard
            .fields
            .get(index)
            .ok_or(TramaError::Invalid("index not registered with this service"))?;
        for cond in &query.conditions {
            let ty = registered
                .get(&cond.field)
                .ok_or(TramaError::Invalid("field not registered with this index"))?;
            if !self.capabilities.supports(*ty, cond.op) {
                return Err(TramaError::Invalid(
                    "operator not supported by this index service",
                ));
            }
        }
        if !query.orders.is_empty() && !self.capabilities.supports_ordering {
            return Err(TramaError::Invalid(
                "ordering not supported by this index service",
            ));
        }
        let empty = BTreeMap::new();
        let docs = guard.docs.get(index).unwrap_or(&empty);
        let mut hits: Vec<(&ElementId, &Document)> = docs
            .iter()
            .filter(|(_, doc)| {
                query.conditions.iter().all(|cond| {
                    let values = doc.get(&cond.field).map(Vec::as_slice).unwrap_or(&[]);
                    condition::evaluate_any(cond.op, &cond.values, values)
                })
            })
            .collect();
        if !query.orders.is_empty() {
            hits.sort_by(|(a_id, a_doc), (b_id, b_doc)| {
                for (field, order) in &query.orders {
                    let a = a_doc.get(field).and_then(|v| v.first());
                    let b = b_doc.get(field).and_then(|v| v.first());
                    // Elements without the sort field always sort last.
                    let ord = match (a, b) {
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
                a_id.cmp(b_id)
            });
        }
        trace!(service = %self.name, index, hits = hits.len(), "index.query");
        let iter = hits.into_iter().map(|(id, _)| *id).skip(query.offset);
        Ok(match query.limit {
            Some(limit) => iter.take(limit).collect(),
            None => iter.collect(),
        })
    }

    fn drop_index(&self, index: &str) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.fields.remove(index);
        state.docs.remove(index);
        trace!(service = %self.name, index, "index.drop");
        Ok(())
    }
}
