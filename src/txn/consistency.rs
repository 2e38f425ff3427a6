//! Commit-time enforcement of consistency modifiers, uniqueness, and edge
//! multiplicity.
//!
//! A commit runs in phases: fork rewriting, relation sort-key validation,
//! batch planning (records, adjacency, locators, index entries), lock
//! acquisition, committed-state validation under those locks, one atomic
//! key-value batch, and finally deferred mutations against external index
//! services. Pessimistic protection comes from the shared lock manager for
//! `Lock`-modified types and indexes; backends with optimistic locking
//! additionally receive absence guards checked atomically by the batch.

use std::collections::BTreeMap;

use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use tracing::{trace, warn};

use crate::backend::codec::{self, keyspace, ord};
use crate::backend::{Guard, IndexEntry, IndexMutation, KvStore};
use crate::schema::{
    ConsistencyModifier, IndexDefinition, IndexKind, LabelConstraint, Multiplicity, RelationBase,
    SchemaSnapshot,
};
use crate::store::{Backend, StoreConfig};
use crate::txn::{decode_record, encode_record, EdgeRecord, PropertyRecord, VertexRecord, WriteSet};
use crate::types::{
    Direction, EdgeId, EdgeLabelId, ElementId, ElementKind, IndexId, PropKeyId, PropertyId, Result,
    TramaError, Value, VertexId,
};

const LOCK_PROPERTY: u8 = 0x01;
const LOCK_EDGE: u8 = 0x02;
const LOCK_UNIQUE: u8 = 0x03;

/// Applies a transaction's staged writes to the shared store.
pub(crate) fn commit(
    backend: &Backend,
    config: &StoreConfig,
    schema: &SchemaSnapshot,
    mut writes: WriteSet,
) -> Result<()> {
    let kv = backend.kv();

    let mut vertex_pre: FxHashMap<VertexId, Option<VertexRecord>> = FxHashMap::default();
    for &id in writes.vertices.keys() {
        let pre = match kv.get(&keyspace::vertex_key(id))? {
            Some(raw) => Some(decode_record(&raw)?),
            None => None,
        };
        vertex_pre.insert(id, pre);
    }
    let mut edge_pre: FxHashMap<EdgeId, Option<EdgeRecord>> = FxHashMap::default();
    for &id in writes.edges.keys() {
        let pre = match kv.get(&keyspace::edge_key(id))? {
            Some(raw) => Some(decode_record(&raw)?),
            None => None,
        };
        edge_pre.insert(id, pre);
    }

    fork_updates(backend, schema, &mut writes, &mut edge_pre)?;
    check_relation_sort_keys(schema, &writes)?;

    let mut batch = Batch::default();
    for (&id, post) in &writes.vertices {
        let pre = vertex_pre.get(&id).and_then(Option::as_ref);
        plan_vertex(schema, id, pre, post.as_ref(), &mut batch)?;
    }
    for (&id, post) in &writes.edges {
        let pre = edge_pre.get(&id).and_then(Option::as_ref);
        plan_edge(schema, id, pre, post.as_ref(), &mut batch)?;
    }
    batch.puts.push((
        keyspace::element_counter_key(),
        backend.id_watermark().to_be_bytes().to_vec(),
    ));

    let locks = lock_tuples(schema, config, &writes, &vertex_pre, &edge_pre, &batch);
    let _held = backend.locks().acquire(locks, config.lock_timeout)?;

    if config.verify_uniqueness {
        verify_uniqueness(kv, &batch)?;
    }
    let adjacency_guards = verify_multiplicity(kv, schema, &writes, &edge_pre)?;

    let mut guards: Vec<Guard> = Vec::new();
    if kv.features().optimistic_locking {
        if config.verify_uniqueness {
            guards.extend(unique_guards(&batch));
        }
        guards.extend(adjacency_guards);
    }

    let Batch {
        puts,
        deletes,
        providers,
        ..
    } = batch;
    let applied = puts.len() + deletes.len();
    kv.apply(puts, deletes, &guards)?;

    // External services only after the store batch, so a rejected commit
    // never leaves documents behind.
    for (backing, mutations) in providers {
        let count = mutations.len();
        match backend.provider(&backing) {
            Some(provider) => {
                if let Err(err) = provider.mutate(mutations) {
                    warn!(service = %backing, error = %err, "index.mutate_deferred");
                }
            }
            None => warn!(service = %backing, mutations = count, "index.service_missing"),
        }
    }

    trace!(
        vertices = writes.vertices.len(),
        edges = writes.edges.len(),
        applied,
        "txn.commit"
    );
    Ok(())
}

/// Planned key-value batch plus everything validation needs to know about
/// it.
#[derive(Default)]
struct Batch {
    puts: Vec<(Vec<u8>, Vec<u8>)>,
    deletes: Vec<Vec<u8>>,
    unique: Vec<UniqueClaim>,
    providers: BTreeMap<String, Vec<IndexMutation>>,
    composite_removed: FxHashSet<Vec<u8>>,
}

/// One value tuple a staged element claims in a unique index.
struct UniqueClaim {
    index: IndexId,
    name: String,
    locking: bool,
    hash: u64,
    tuple: Vec<u8>,
    element: ElementId,
}

/// Rewrites staged in-place updates of committed fork-labeled edges into a
/// fresh edge plus a superseded marker on the original.
fn fork_updates(
    backend: &Backend,
    schema: &SchemaSnapshot,
    writes: &mut WriteSet,
    edge_pre: &mut FxHashMap<EdgeId, Option<EdgeRecord>>,
) -> Result<()> {
    let forked: Vec<EdgeId> = writes
        .edges
        .iter()
        .filter_map(|(&id, post)| {
            let post = post.as_ref()?;
            let pre = edge_pre.get(&id)?.as_ref()?;
            if pre.superseded || post == pre {
                return None;
            }
            let label = schema.edge_label(post.label)?;
            (label.consistency == ConsistencyModifier::Fork).then_some(id)
        })
        .collect();
    for id in forked {
        let Some(Some(updated)) = writes.edges.remove(&id) else {
            continue;
        };
        let Some(Some(original)) = edge_pre.get(&id).cloned() else {
            continue;
        };
        let fresh = EdgeId(backend.next_id());
        trace!(original = id.0, fresh = fresh.0, "txn.fork");
        writes.edges.insert(
            fresh,
            Some(EdgeRecord {
                id: fresh,
                ..updated
            }),
        );
        edge_pre.insert(fresh, None);
        let mut tombstone = original;
        tombstone.superseded = true;
        writes.edges.insert(id, Some(tombstone));
    }
    Ok(())
}

/// Every maintained relation index requires its sort keys on each staged
/// relation; entries with holes would be unreachable by prefix scans.
fn check_relation_sort_keys(schema: &SchemaSnapshot, writes: &WriteSet) -> Result<()> {
    for post in writes.edges.values().flatten() {
        if post.superseded {
            continue;
        }
        for def in schema.relation_indexes(RelationBase::EdgeLabel(post.label)) {
            if !writes_maintained(schema, def) {
                continue;
            }
            for key in def.field_keys() {
                if post.value(key).is_none() {
                    return Err(missing_sort_key(schema, def, key));
                }
            }
        }
    }
    for post in writes.vertices.values().flatten() {
        for instance in &post.properties {
            for def in schema.relation_indexes(RelationBase::PropertyKey(instance.key)) {
                if !writes_maintained(schema, def) {
                    continue;
                }
                for key in def.field_keys() {
                    if instance.meta_value(key).is_none() {
                        return Err(missing_sort_key(schema, def, key));
                    }
                }
            }
        }
    }
    Ok(())
}

fn missing_sort_key(schema: &SchemaSnapshot, def: &IndexDefinition, key: PropKeyId) -> TramaError {
    let key_name = schema
        .prop_key(key)
        .map(|d| d.name.clone())
        .unwrap_or_else(|| key.to_string());
    TramaError::SchemaViolation(format!(
        "index {} requires sort key {} on every new relation",
        def.name, key_name
    ))
}

fn writes_maintained(schema: &SchemaSnapshot, def: &IndexDefinition) -> bool {
    def.field_keys()
        .all(|key| schema.field_writes_maintained(def.id, key))
}

/// Uniform view over the three element shapes for index-entry planning.
/// Reused by the reindex job so backfilled entries are byte-identical to
/// the ones commit would have written.
pub(crate) enum ElementView<'a> {
    Absent,
    Vertex(&'a VertexRecord),
    Edge(&'a EdgeRecord),
    Property(&'a PropertyRecord),
}

impl ElementView<'_> {
    pub(crate) fn live(&self) -> bool {
        match self {
            ElementView::Absent => false,
            ElementView::Edge(e) => !e.superseded,
            _ => true,
        }
    }

    pub(crate) fn values(&self, key: PropKeyId) -> SmallVec<[Value; 2]> {
        match self {
            ElementView::Absent => SmallVec::new(),
            ElementView::Vertex(r) => r.values(key).cloned().collect(),
            ElementView::Edge(r) => r.value(key).cloned().into_iter().collect(),
            ElementView::Property(p) => p.meta_value(key).cloned().into_iter().collect(),
        }
    }

    pub(crate) fn label(&self) -> Option<LabelConstraint> {
        match self {
            ElementView::Vertex(r) => r.label.map(LabelConstraint::Vertex),
            ElementView::Edge(r) => Some(LabelConstraint::Edge(r.label)),
            _ => None,
        }
    }
}

fn plan_vertex(
    schema: &SchemaSnapshot,
    id: VertexId,
    pre: Option<&VertexRecord>,
    post: Option<&VertexRecord>,
    batch: &mut Batch,
) -> Result<()> {
    match post {
        Some(record) => batch
            .puts
            .push((keyspace::vertex_key(id), encode_record(record)?)),
        None => batch.deletes.push(keyspace::vertex_key(id)),
    }

    let pre_ids: FxHashSet<PropertyId> = pre
        .into_iter()
        .flat_map(|r| r.properties.iter().map(|p| p.id))
        .collect();
    let post_ids: FxHashSet<PropertyId> = post
        .into_iter()
        .flat_map(|r| r.properties.iter().map(|p| p.id))
        .collect();
    for pid in post_ids.difference(&pre_ids) {
        batch.puts.push((
            keyspace::prop_locator_key(*pid),
            id.0.to_be_bytes().to_vec(),
        ));
    }
    for pid in pre_ids.difference(&post_ids) {
        batch.deletes.push(keyspace::prop_locator_key(*pid));
    }

    let old = pre.map_or(ElementView::Absent, ElementView::Vertex);
    let new = post.map_or(ElementView::Absent, ElementView::Vertex);
    for def in schema.graph_indexes(ElementKind::Vertex) {
        plan_graph_index(schema, def, ElementId::Vertex(id), &old, &new, batch)?;
    }

    // Property instances are indexable elements of their own.
    let pre_by_id: FxHashMap<PropertyId, &PropertyRecord> = pre
        .into_iter()
        .flat_map(|r| r.properties.iter().map(|p| (p.id, p)))
        .collect();
    let post_by_id: FxHashMap<PropertyId, &PropertyRecord> = post
        .into_iter()
        .flat_map(|r| r.properties.iter().map(|p| (p.id, p)))
        .collect();
    let mut touched: Vec<PropertyId> = pre_by_id.keys().chain(post_by_id.keys()).copied().collect();
    touched.sort_unstable();
    touched.dedup();
    for pid in touched {
        let old_inst = pre_by_id
            .get(&pid)
            .copied()
            .map_or(ElementView::Absent, ElementView::Property);
        let new_inst = post_by_id
            .get(&pid)
            .copied()
            .map_or(ElementView::Absent, ElementView::Property);
        for def in schema.graph_indexes(ElementKind::Property) {
            plan_graph_index(schema, def, ElementId::Property(pid), &old_inst, &new_inst, batch)?;
        }
    }

    plan_property_relations(schema, id, pre, post, batch);
    Ok(())
}

fn plan_edge(
    schema: &SchemaSnapshot,
    id: EdgeId,
    pre: Option<&EdgeRecord>,
    post: Option<&EdgeRecord>,
    batch: &mut Batch,
) -> Result<()> {
    match post {
        Some(record) => batch
            .puts
            .push((keyspace::edge_key(id), encode_record(record)?)),
        None => batch.deletes.push(keyspace::edge_key(id)),
    }

    // Adjacency rows exist for any stored record, superseded included, so
    // cascading deletes still find forked originals.
    match (pre, post) {
        (None, Some(record)) => {
            for (vertex, dir) in [(record.out_v, Direction::Out), (record.in_v, Direction::In)] {
                batch.puts.push((
                    keyspace::adjacency_key(vertex, dir, record.label.0, id),
                    Vec::new(),
                ));
            }
        }
        (Some(record), None) => {
            for (vertex, dir) in [(record.out_v, Direction::Out), (record.in_v, Direction::In)] {
                batch
                    .deletes
                    .push(keyspace::adjacency_key(vertex, dir, record.label.0, id));
            }
        }
        _ => {}
    }

    let old = pre.map_or(ElementView::Absent, ElementView::Edge);
    let new = post.map_or(ElementView::Absent, ElementView::Edge);
    for def in schema.graph_indexes(ElementKind::Edge) {
        plan_graph_index(schema, def, ElementId::Edge(id), &old, &new, batch)?;
    }

    if let Some(label) = post.or(pre).map(|r| r.label) {
        for def in schema.relation_indexes(RelationBase::EdgeLabel(label)) {
            plan_edge_relation(schema, def, id, pre, post, batch);
        }
    }
    Ok(())
}

fn plan_graph_index(
    schema: &SchemaSnapshot,
    def: &IndexDefinition,
    element: ElementId,
    old: &ElementView<'_>,
    new: &ElementView<'_>,
    batch: &mut Batch,
) -> Result<()> {
    let old_admitted = old.live() && def.admits_label(old.label());
    let new_admitted = new.live() && def.admits_label(new.label());
    if !old_admitted && !new_admitted {
        return Ok(());
    }
    match &def.kind {
        IndexKind::Composite { unique } => {
            if !writes_maintained(schema, def) {
                return Ok(());
            }
            let old_tuples = if old_admitted {
                composite_tuples(def, old)
            } else {
                FxHashSet::default()
            };
            let new_tuples = if new_admitted {
                composite_tuples(def, new)
            } else {
                FxHashSet::default()
            };
            for tuple in old_tuples.difference(&new_tuples) {
                let hash = codec::composite_hash(tuple);
                let key = keyspace::composite_entry_key(def.id, hash, tuple, element);
                batch.composite_removed.insert(key.clone());
                batch.deletes.push(key);
            }
            for tuple in new_tuples.difference(&old_tuples) {
                let hash = codec::composite_hash(tuple);
                batch.puts.push((
                    keyspace::composite_entry_key(def.id, hash, tuple, element),
                    Vec::new(),
                ));
                if *unique {
                    batch.unique.push(UniqueClaim {
                        index: def.id,
                        name: def.name.clone(),
                        locking: def.consistency == ConsistencyModifier::Lock,
                        hash,
                        tuple: tuple.clone(),
                        element,
                    });
                }
            }
        }
        IndexKind::Mixed { backing } => {
            let mut additions: Vec<IndexEntry> = Vec::new();
            let mut deletions: Vec<IndexEntry> = Vec::new();
            for field in &def.fields {
                if !schema.field_writes_maintained(def.id, field.key) {
                    continue;
                }
                let Some(key_def) = schema.prop_key(field.key) else {
                    continue;
                };
                let old_values = if old_admitted {
                    old.values(field.key)
                } else {
                    SmallVec::new()
                };
                let new_values = if new_admitted {
                    new.values(field.key)
                } else {
                    SmallVec::new()
                };
                for value in new_values.iter().filter(|v| !old_values.contains(v)) {
                    additions.push(IndexEntry {
                        field: key_def.name.clone(),
                        value: value.clone(),
                    });
                }
                for value in old_values.iter().filter(|v| !new_values.contains(v)) {
                    deletions.push(IndexEntry {
                        field: key_def.name.clone(),
                        value: value.clone(),
                    });
                }
            }
            let delete_all = old_admitted && !new_admitted;
            if delete_all || !additions.is_empty() || !deletions.is_empty() {
                batch
                    .providers
                    .entry(backing.clone())
                    .or_default()
                    .push(IndexMutation {
                        index: def.name.clone(),
                        element,
                        additions,
                        deletions: if delete_all { Vec::new() } else { deletions },
                        delete_all,
                    });
            }
        }
        IndexKind::Relation { .. } => {}
    }
    Ok(())
}

/// Byte images of every key tuple the element contributes to a composite
/// index. Elements missing any indexed field contribute nothing.
pub(crate) fn composite_tuples(def: &IndexDefinition, view: &ElementView<'_>) -> FxHashSet<Vec<u8>> {
    let mut out = FxHashSet::default();
    let mut per_field: Vec<SmallVec<[Value; 2]>> = Vec::with_capacity(def.fields.len());
    for field in &def.fields {
        let values = view.values(field.key);
        if values.is_empty() {
            return out;
        }
        per_field.push(values);
    }
    let mut tuples: Vec<Vec<Value>> = vec![Vec::new()];
    for values in &per_field {
        let mut next = Vec::with_capacity(tuples.len() * values.len());
        for tuple in &tuples {
            for value in values {
                let mut grown = tuple.clone();
                grown.push(value.clone());
                next.push(grown);
            }
        }
        tuples = next;
    }
    for tuple in tuples {
        out.insert(codec::encode_composite_tuple(&tuple));
    }
    out
}

fn plan_edge_relation(
    schema: &SchemaSnapshot,
    def: &IndexDefinition,
    id: EdgeId,
    pre: Option<&EdgeRecord>,
    post: Option<&EdgeRecord>,
    batch: &mut Batch,
) {
    if !writes_maintained(schema, def) {
        return;
    }
    let element = ElementId::Edge(id);
    let old_keys: FxHashSet<Vec<u8>> = pre
        .map(|r| edge_relation_keys(def, r, element))
        .unwrap_or_default()
        .into_iter()
        .collect();
    let new_keys: FxHashSet<Vec<u8>> = post
        .map(|r| edge_relation_keys(def, r, element))
        .unwrap_or_default()
        .into_iter()
        .collect();
    for key in old_keys.difference(&new_keys) {
        batch.deletes.push(key.clone());
    }
    for key in new_keys.difference(&old_keys) {
        batch.puts.push((key.clone(), Vec::new()));
    }
}

pub(crate) fn edge_relation_keys(
    def: &IndexDefinition,
    record: &EdgeRecord,
    element: ElementId,
) -> Vec<Vec<u8>> {
    if record.superseded {
        return Vec::new();
    }
    let IndexKind::Relation { direction, .. } = &def.kind else {
        return Vec::new();
    };
    let mut sort_values: Vec<Value> = Vec::with_capacity(def.fields.len());
    for field in &def.fields {
        match record.value(field.key) {
            Some(v) => sort_values.push(v.clone()),
            // Relations written before the index existed carry no entry
            // until a reindex backfills them.
            None => return Vec::new(),
        }
    }
    let sort_bytes = ord::encode_values(&sort_values);
    let mut anchors: SmallVec<[(VertexId, Direction); 2]> = SmallVec::new();
    match direction {
        Direction::Out => anchors.push((record.out_v, Direction::Out)),
        Direction::In => anchors.push((record.in_v, Direction::In)),
        Direction::Both => {
            anchors.push((record.out_v, Direction::Out));
            anchors.push((record.in_v, Direction::In));
        }
    }
    anchors
        .into_iter()
        .map(|(vertex, dir)| keyspace::relation_entry_key(def.id, vertex, dir, &sort_bytes, element))
        .collect()
}

fn plan_property_relations(
    schema: &SchemaSnapshot,
    vertex: VertexId,
    pre: Option<&VertexRecord>,
    post: Option<&VertexRecord>,
    batch: &mut Batch,
) {
    for def in schema.indexes() {
        let IndexKind::Relation {
            base: RelationBase::PropertyKey(base_key),
            ..
        } = def.kind
        else {
            continue;
        };
        if !writes_maintained(schema, def) {
            continue;
        }
        let old_keys = property_relation_keys(def, base_key, vertex, pre);
        let new_keys = property_relation_keys(def, base_key, vertex, post);
        for key in old_keys.difference(&new_keys) {
            batch.deletes.push(key.clone());
        }
        for key in new_keys.difference(&old_keys) {
            batch.puts.push((key.clone(), Vec::new()));
        }
    }
}

pub(crate) fn property_relation_keys(
    def: &IndexDefinition,
    base_key: PropKeyId,
    vertex: VertexId,
    record: Option<&VertexRecord>,
) -> FxHashSet<Vec<u8>> {
    let mut out = FxHashSet::default();
    let Some(record) = record else {
        return out;
    };
    'instances: for instance in record.properties.iter().filter(|p| p.key == base_key) {
        let mut sort_values: Vec<Value> = Vec::with_capacity(def.fields.len());
        for field in &def.fields {
            match instance.meta_value(field.key) {
                Some(v) => sort_values.push(v.clone()),
                None => continue 'instances,
            }
        }
        out.insert(keyspace::relation_entry_key(
            def.id,
            vertex,
            Direction::Out,
            &ord::encode_values(&sort_values),
            ElementId::Property(instance.id),
        ));
    }
    out
}

fn property_lock(vertex: VertexId, key: PropKeyId) -> Vec<u8> {
    let mut out = Vec::with_capacity(13);
    out.push(LOCK_PROPERTY);
    out.extend_from_slice(&vertex.0.to_be_bytes());
    out.extend_from_slice(&key.0.to_be_bytes());
    out
}

fn edge_lock(label: EdgeLabelId, vertex: VertexId) -> Vec<u8> {
    let mut out = Vec::with_capacity(13);
    out.push(LOCK_EDGE);
    out.extend_from_slice(&label.0.to_be_bytes());
    out.extend_from_slice(&vertex.0.to_be_bytes());
    out
}

fn unique_lock(index: IndexId, tuple: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(5 + tuple.len());
    out.push(LOCK_UNIQUE);
    out.extend_from_slice(&index.0.to_be_bytes());
    out.extend_from_slice(tuple);
    out
}

/// Lock tuples for `Lock`-modified property keys, edge labels, and unique
/// indexes touched by this batch.
fn lock_tuples(
    schema: &SchemaSnapshot,
    config: &StoreConfig,
    writes: &WriteSet,
    vertex_pre: &FxHashMap<VertexId, Option<VertexRecord>>,
    edge_pre: &FxHashMap<EdgeId, Option<EdgeRecord>>,
    batch: &Batch,
) -> Vec<Vec<u8>> {
    let mut keys: Vec<Vec<u8>> = Vec::new();
    for (&id, post) in &writes.vertices {
        let pre = vertex_pre.get(&id).and_then(Option::as_ref);
        for key in changed_keys(pre, post.as_ref()) {
            let locking = schema
                .prop_key(key)
                .is_some_and(|d| d.consistency == ConsistencyModifier::Lock);
            if locking {
                keys.push(property_lock(id, key));
            }
        }
    }
    for (&id, post) in &writes.edges {
        let pre = edge_pre.get(&id).and_then(Option::as_ref);
        let post = post.as_ref();
        if pre == post {
            continue;
        }
        let Some(record) = post.or(pre) else {
            continue;
        };
        let locking = schema
            .edge_label(record.label)
            .is_some_and(|d| d.consistency == ConsistencyModifier::Lock);
        if locking {
            keys.push(edge_lock(record.label, record.out_v));
            keys.push(edge_lock(record.label, record.in_v));
        }
    }
    if config.verify_uniqueness {
        for claim in &batch.unique {
            if claim.locking {
                keys.push(unique_lock(claim.index, &claim.tuple));
            }
        }
    }
    keys
}

/// Property keys whose value set differs between the two images.
fn changed_keys(pre: Option<&VertexRecord>, post: Option<&VertexRecord>) -> Vec<PropKeyId> {
    let mut keys: Vec<PropKeyId> = Vec::new();
    let all = pre
        .into_iter()
        .flat_map(|r| r.properties.iter().map(|p| p.key))
        .chain(
            post.into_iter()
                .flat_map(|r| r.properties.iter().map(|p| p.key)),
        );
    for key in all {
        if !keys.contains(&key) {
            keys.push(key);
        }
    }
    keys.retain(|&key| {
        let old: Vec<&PropertyRecord> = pre
            .map(|r| r.properties.iter().filter(|p| p.key == key).collect())
            .unwrap_or_default();
        let new: Vec<&PropertyRecord> = post
            .map(|r| r.properties.iter().filter(|p| p.key == key).collect())
            .unwrap_or_default();
        old != new
    });
    keys
}

/// Checks every claimed unique tuple against the batch itself and against
/// committed entries, skipping entries this batch removes.
fn verify_uniqueness(kv: &dyn KvStore, batch: &Batch) -> Result<()> {
    let mut seen: FxHashMap<(IndexId, &[u8]), ElementId> = FxHashMap::default();
    for claim in &batch.unique {
        match seen.get(&(claim.index, claim.tuple.as_slice())) {
            Some(&holder) if holder != claim.element => {
                return Err(duplicate_value(&claim.name, holder));
            }
            Some(_) => {}
            None => {
                seen.insert((claim.index, claim.tuple.as_slice()), claim.element);
            }
        }
    }
    for claim in &batch.unique {
        let prefix = keyspace::composite_value_prefix(claim.index, claim.hash, &claim.tuple);
        for (key, _) in kv.scan_prefix(&prefix)? {
            if batch.composite_removed.contains(&key) {
                continue;
            }
            let holder = keyspace::entry_element(&key)?;
            if holder != claim.element {
                return Err(duplicate_value(&claim.name, holder));
            }
        }
    }
    Ok(())
}

fn duplicate_value(index: &str, holder: ElementId) -> TramaError {
    TramaError::SchemaViolation(format!(
        "unique index {index} already holds this value (element {holder})"
    ))
}

/// Validates constrained edge labels against committed adjacency. Returns
/// absence guards for the uniquely-constrained prefixes observed empty,
/// usable on optimistic backends.
fn verify_multiplicity(
    kv: &dyn KvStore,
    schema: &SchemaSnapshot,
    writes: &WriteSet,
    edge_pre: &FxHashMap<EdgeId, Option<EdgeRecord>>,
) -> Result<Vec<Guard>> {
    let mut guards: Vec<Guard> = Vec::new();
    for (&id, post) in &writes.edges {
        let Some(record) = post else {
            continue;
        };
        if record.superseded {
            continue;
        }
        if edge_pre.get(&id).is_some_and(|p| p.is_some()) {
            // Only fresh edges can introduce a violation; endpoints and
            // labels are immutable.
            continue;
        }
        let Some(label) = schema.edge_label(record.label) else {
            continue;
        };
        if !label.multiplicity.is_constrained() {
            continue;
        }
        let mut sides: SmallVec<[(VertexId, Direction, Option<VertexId>); 2]> = SmallVec::new();
        match label.multiplicity {
            Multiplicity::Simple => {
                sides.push((record.out_v, Direction::Out, Some(record.in_v)));
            }
            Multiplicity::Many2One => sides.push((record.out_v, Direction::Out, None)),
            Multiplicity::One2Many => sides.push((record.in_v, Direction::In, None)),
            Multiplicity::One2One => {
                sides.push((record.out_v, Direction::Out, None));
                sides.push((record.in_v, Direction::In, None));
            }
            Multiplicity::Multi => {}
        }
        for (vertex, dir, pair) in sides {
            let (survivors, raw_empty) =
                surviving_label_edges(kv, writes, vertex, dir, record.label, id)?;
            let conflict = match pair {
                Some(far_end) => survivors.iter().any(|r| r.endpoint(opposite(dir)) == far_end),
                None => !survivors.is_empty(),
            };
            if conflict {
                return Err(TramaError::SchemaViolation(format!(
                    "edge label {} admits no further edge between these endpoints",
                    label.name
                )));
            }
            // A pair-specific absence is not expressible as a prefix, so
            // Simple gets no guard.
            if pair.is_none() && raw_empty {
                guards.push(Guard::AbsentPrefix(keyspace::adjacency_label_prefix(
                    vertex,
                    dir,
                    record.label.0,
                )));
            }
        }
    }
    Ok(guards)
}

/// Committed live edges of one label at `vertex`, excluding edges deleted
/// or superseded by this batch and the edge under validation itself.
fn surviving_label_edges(
    kv: &dyn KvStore,
    writes: &WriteSet,
    vertex: VertexId,
    dir: Direction,
    label: EdgeLabelId,
    this_edge: EdgeId,
) -> Result<(Vec<EdgeRecord>, bool)> {
    let prefix = keyspace::adjacency_label_prefix(vertex, dir, label.0);
    let mut raw_empty = true;
    let mut survivors: Vec<EdgeRecord> = Vec::new();
    for (key, _) in kv.scan_prefix(&prefix)? {
        raw_empty = false;
        let other = keyspace::adjacency_edge(&key)?;
        if other == this_edge {
            continue;
        }
        match writes.edges.get(&other) {
            Some(None) => continue,
            Some(Some(staged)) if staged.superseded => continue,
            _ => {}
        }
        let Some(raw) = kv.get(&keyspace::edge_key(other))? else {
            continue;
        };
        let record: EdgeRecord = decode_record(&raw)?;
        if record.superseded {
            continue;
        }
        survivors.push(record);
    }
    Ok((survivors, raw_empty))
}

fn opposite(dir: Direction) -> Direction {
    match dir {
        Direction::Out => Direction::In,
        Direction::In => Direction::Out,
        Direction::Both => Direction::Both,
    }
}

/// Absence guards for claimed unique tuples. Skipped when this batch also
/// removes entries under the same value prefix, since those rows would
/// trip the guard before the deletes apply.
fn unique_guards(batch: &Batch) -> Vec<Guard> {
    batch
        .unique
        .iter()
        .filter_map(|claim| {
            let prefix = keyspace::composite_value_prefix(claim.index, claim.hash, &claim.tuple);
            let removed_under_prefix = batch
                .composite_removed
                .iter()
                .any(|key| key.starts_with(&prefix));
            (!removed_under_prefix).then(|| Guard::AbsentPrefix(prefix))
        })
        .collect()
}
