//! Transactions: reads pinned to one schema snapshot, an overlay of staged
//! writes with read-your-writes visibility, and commit through the
//! consistency enforcer.

use std::collections::BTreeMap;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tracing::trace;

use crate::backend::codec::keyspace;
use crate::query::builder::GraphQuery;
use crate::query::executor;
use crate::query::relation::RelationQuery;
use crate::schema::{Cardinality, EdgeLabelDef, PropertyKeyDef, RelationBase, SchemaSnapshot};
use crate::store::{Backend, StoreConfig};
use crate::types::{
    Direction, EdgeId, EdgeLabelId, PropKeyId, PropertyId, Result, SchemaVersion, TramaError,
    Value, VertexId, VertexLabelId,
};

pub mod consistency;
pub mod locks;

/// One property instance attached to a vertex. Instances have their own
/// identity so multi-valued keys and meta-properties stay addressable.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PropertyRecord {
    /// Instance id, unique across the store.
    pub id: PropertyId,
    /// Declared key.
    pub key: PropKeyId,
    /// The value.
    pub value: Value,
    /// Meta-properties on the instance, one value per key.
    pub meta: SmallVec<[(PropKeyId, Value); 2]>,
}

impl PropertyRecord {
    /// Meta-property value for `key`.
    pub fn meta_value(&self, key: PropKeyId) -> Option<&Value> {
        self.meta.iter().find(|(k, _)| *k == key).map(|(_, v)| v)
    }
}

/// Stored vertex with its property instances inline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VertexRecord {
    /// Vertex id.
    pub id: VertexId,
    /// Optional label.
    pub label: Option<VertexLabelId>,
    /// Property instances in insertion order.
    pub properties: Vec<PropertyRecord>,
}

impl VertexRecord {
    /// All values held for `key`.
    pub fn values(&self, key: PropKeyId) -> impl Iterator<Item = &Value> {
        self.properties
            .iter()
            .filter(move |p| p.key == key)
            .map(|p| &p.value)
    }

    /// The property instance with the given id.
    pub fn property(&self, id: PropertyId) -> Option<&PropertyRecord> {
        self.properties.iter().find(|p| p.id == id)
    }
}

/// Stored edge. A forked edge keeps its record with `superseded` set so
/// readers skip it without disturbing its identity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EdgeRecord {
    /// Edge id. A fork allocates a fresh one.
    pub id: EdgeId,
    /// Edge label.
    pub label: EdgeLabelId,
    /// Tail vertex.
    pub out_v: VertexId,
    /// Head vertex.
    pub in_v: VertexId,
    /// Edge properties, one value per key.
    pub properties: SmallVec<[(PropKeyId, Value); 4]>,
    /// Tombstone set when a fork replaced this edge.
    pub superseded: bool,
}

impl EdgeRecord {
    /// Property value for `key`.
    pub fn value(&self, key: PropKeyId) -> Option<&Value> {
        self.properties
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v)
    }

    /// Endpoint on the given side.
    pub fn endpoint(&self, dir: Direction) -> VertexId {
        match dir {
            Direction::Out => self.out_v,
            Direction::In => self.in_v,
            Direction::Both => self.out_v,
        }
    }

    fn touches(&self, v: VertexId) -> bool {
        self.out_v == v || self.in_v == v
    }
}

/// Staged writes of one transaction. `None` marks a deletion.
#[derive(Default)]
pub(crate) struct WriteSet {
    pub(crate) vertices: FxHashMap<VertexId, Option<VertexRecord>>,
    pub(crate) edges: FxHashMap<EdgeId, Option<EdgeRecord>>,
}

impl WriteSet {
    pub(crate) fn is_empty(&self) -> bool {
        self.vertices.is_empty() && self.edges.is_empty()
    }
}

/// One transaction over the store.
///
/// Reads see the schema snapshot taken at begin plus this transaction's own
/// staged writes, never another transaction's uncommitted state. Dropping
/// the transaction discards the overlay; only [`Transaction::commit`] makes
/// it visible.
pub struct Transaction {
    backend: Backend,
    config: StoreConfig,
    schema: Arc<SchemaSnapshot>,
    writes: WriteSet,
}

impl Transaction {
    pub(crate) fn new(backend: Backend, config: StoreConfig, schema: Arc<SchemaSnapshot>) -> Self {
        Transaction {
            backend,
            config,
            schema,
            writes: WriteSet::default(),
        }
    }

    /// The schema snapshot this transaction is pinned to.
    pub fn schema(&self) -> &SchemaSnapshot {
        &self.schema
    }

    /// Version of the pinned snapshot.
    pub fn schema_version(&self) -> SchemaVersion {
        self.schema.version()
    }

    pub(crate) fn backend(&self) -> &Backend {
        &self.backend
    }

    pub(crate) fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub(crate) fn schema_arc(&self) -> Arc<SchemaSnapshot> {
        Arc::clone(&self.schema)
    }

    pub(crate) fn writes(&self) -> &WriteSet {
        &self.writes
    }

    // ---- vertices ----

    /// Creates a vertex, optionally under a declared label.
    pub fn add_vertex(&mut self, label: Option<&str>) -> Result<VertexId> {
        let label = match label {
            None => None,
            Some(name) => Some(
                self.schema
                    .vertex_label_by_name(name)
                    .ok_or_else(|| {
                        TramaError::SchemaViolation(format!("unknown vertex label {name}"))
                    })?
                    .id,
            ),
        };
        let id = VertexId(self.backend.next_id());
        self.writes.vertices.insert(
            id,
            Some(VertexRecord {
                id,
                label,
                properties: Vec::new(),
            }),
        );
        Ok(id)
    }

    /// Reads a vertex through the overlay.
    pub fn vertex(&self, id: VertexId) -> Result<Option<VertexRecord>> {
        if let Some(staged) = self.writes.vertices.get(&id) {
            return Ok(staged.clone());
        }
        self.committed_vertex(id)
    }

    /// Deletes a vertex together with its incident edges.
    pub fn remove_vertex(&mut self, id: VertexId) -> Result<()> {
        if self.vertex(id)?.is_none() {
            return Err(TramaError::NotFound);
        }
        for edge in self.incident_edges(id)? {
            self.writes.edges.insert(edge, None);
        }
        self.writes.vertices.insert(id, None);
        Ok(())
    }

    // ---- vertex properties ----

    /// Adds a property instance to a vertex, honoring the key's declared
    /// cardinality: `Single` replaces, `Set` deduplicates by value, `List`
    /// appends.
    pub fn add_property(&mut self, vertex: VertexId, key: &str, value: Value) -> Result<PropertyId> {
        let key_def = self.resolve_prop_key(key)?;
        check_value_type(&key_def, &value)?;
        let cardinality = key_def.cardinality;
        let key_id = key_def.id;
        let id = PropertyId(self.backend.next_id());
        let record = self.staged_vertex_mut(vertex)?;
        match cardinality {
            Cardinality::Single => {
                record.properties.retain(|p| p.key != key_id);
            }
            Cardinality::Set => {
                if let Some(existing) = record
                    .properties
                    .iter()
                    .find(|p| p.key == key_id && p.value == value)
                {
                    return Ok(existing.id);
                }
            }
            Cardinality::List => {}
        }
        record.properties.push(PropertyRecord {
            id,
            key: key_id,
            value,
            meta: SmallVec::new(),
        });
        Ok(id)
    }

    /// Sets a meta-property on one property instance. Meta values are
    /// single per key.
    pub fn set_property_meta(
        &mut self,
        vertex: VertexId,
        property: PropertyId,
        key: &str,
        value: Value,
    ) -> Result<()> {
        let key_def = self.resolve_prop_key(key)?;
        check_value_type(&key_def, &value)?;
        let key_id = key_def.id;
        let record = self.staged_vertex_mut(vertex)?;
        let instance = record
            .properties
            .iter_mut()
            .find(|p| p.id == property)
            .ok_or(TramaError::NotFound)?;
        if let Some(slot) = instance.meta.iter_mut().find(|(k, _)| *k == key_id) {
            slot.1 = value;
        } else {
            instance.meta.push((key_id, value));
        }
        Ok(())
    }

    /// Removes one property instance.
    pub fn remove_property(&mut self, vertex: VertexId, property: PropertyId) -> Result<()> {
        let record = self.staged_vertex_mut(vertex)?;
        let before = record.properties.len();
        record.properties.retain(|p| p.id != property);
        if record.properties.len() == before {
            return Err(TramaError::NotFound);
        }
        Ok(())
    }

    // ---- edges ----

    /// Creates an edge between two live vertices. Violations of the
    /// label's multiplicity that are visible inside this transaction fail
    /// here; conflicts with concurrent transactions fail at commit.
    pub fn add_edge(&mut self, label: &str, out_v: VertexId, in_v: VertexId) -> Result<EdgeId> {
        let label_def = self
            .schema
            .edge_label_by_name(label)
            .ok_or_else(|| TramaError::SchemaViolation(format!("unknown edge label {label}")))?
            .clone();
        if self.vertex(out_v)?.is_none() || self.vertex(in_v)?.is_none() {
            return Err(TramaError::NotFound);
        }
        self.check_staged_multiplicity(&label_def, out_v, in_v)?;
        let id = EdgeId(self.backend.next_id());
        self.writes.edges.insert(
            id,
            Some(EdgeRecord {
                id,
                label: label_def.id,
                out_v,
                in_v,
                properties: SmallVec::new(),
                superseded: false,
            }),
        );
        Ok(id)
    }

    /// Reads an edge through the overlay.
    pub fn edge(&self, id: EdgeId) -> Result<Option<EdgeRecord>> {
        if let Some(staged) = self.writes.edges.get(&id) {
            return Ok(staged.clone());
        }
        self.committed_edge(id)
    }

    /// Sets an edge property, replacing any previous value for the key.
    pub fn set_edge_property(&mut self, edge: EdgeId, key: &str, value: Value) -> Result<()> {
        let key_def = self.resolve_prop_key(key)?;
        check_value_type(&key_def, &value)?;
        let key_id = key_def.id;
        let record = self.staged_edge_mut(edge)?;
        if let Some(slot) = record.properties.iter_mut().find(|(k, _)| *k == key_id) {
            slot.1 = value;
        } else {
            record.properties.push((key_id, value));
        }
        Ok(())
    }

    /// Removes an edge property.
    pub fn remove_edge_property(&mut self, edge: EdgeId, key: &str) -> Result<()> {
        let key_id = self.resolve_prop_key(key)?.id;
        let record = self.staged_edge_mut(edge)?;
        let before = record.properties.len();
        record.properties.retain(|(k, _)| *k != key_id);
        if record.properties.len() == before {
            return Err(TramaError::NotFound);
        }
        Ok(())
    }

    /// Deletes an edge.
    pub fn remove_edge(&mut self, id: EdgeId) -> Result<()> {
        if self.edge(id)?.is_none() {
            return Err(TramaError::NotFound);
        }
        self.writes.edges.insert(id, None);
        Ok(())
    }

    // ---- queries ----

    /// Starts a graph query against this transaction's snapshot.
    pub fn query(&self) -> GraphQuery<'_> {
        GraphQuery::new(self)
    }

    /// Edges of one label incident to `vertex`, planned against the
    /// relation indexes declared on the label.
    pub fn edges_of(&self, vertex: VertexId, query: &RelationQuery) -> Result<Vec<EdgeRecord>> {
        if !matches!(query.base, RelationBase::EdgeLabel(_)) {
            return Err(TramaError::Invalid("query base must be an edge label"));
        }
        executor::relation_edges(self, vertex, query)
    }

    /// Property instances of one multi-valued key on `vertex`, ordered per
    /// the relation indexes declared on the key.
    pub fn properties_of(
        &self,
        vertex: VertexId,
        query: &RelationQuery,
    ) -> Result<Vec<PropertyRecord>> {
        if !matches!(query.base, RelationBase::PropertyKey(_)) {
            return Err(TramaError::Invalid("query base must be a property key"));
        }
        executor::relation_properties(self, vertex, query)
    }

    // ---- lifecycle ----

    /// Commits the overlay through the consistency enforcer. Either every
    /// staged write lands atomically or none does.
    pub fn commit(self) -> Result<()> {
        if self.writes.is_empty() {
            return Ok(());
        }
        consistency::commit(&self.backend, &self.config, &self.schema, self.writes)
    }

    /// Discards the overlay. Equivalent to dropping the transaction.
    pub fn rollback(self) {
        trace!(
            vertices = self.writes.vertices.len(),
            edges = self.writes.edges.len(),
            "txn.rollback"
        );
    }

    // ---- internals ----

    fn resolve_prop_key(&self, name: &str) -> Result<PropertyKeyDef> {
        self.schema
            .prop_key_by_name(name)
            .cloned()
            .ok_or_else(|| TramaError::SchemaViolation(format!("unknown property key {name}")))
    }

    fn committed_vertex(&self, id: VertexId) -> Result<Option<VertexRecord>> {
        match self.backend.kv().get(&keyspace::vertex_key(id))? {
            Some(raw) => Ok(Some(decode_record(&raw)?)),
            None => Ok(None),
        }
    }

    fn committed_edge(&self, id: EdgeId) -> Result<Option<EdgeRecord>> {
        match self.backend.kv().get(&keyspace::edge_key(id))? {
            Some(raw) => Ok(Some(decode_record(&raw)?)),
            None => Ok(None),
        }
    }

    fn staged_vertex_mut(&mut self, id: VertexId) -> Result<&mut VertexRecord> {
        if !self.writes.vertices.contains_key(&id) {
            let committed = self.committed_vertex(id)?.ok_or(TramaError::NotFound)?;
            self.writes.vertices.insert(id, Some(committed));
        }
        match self.writes.vertices.get_mut(&id) {
            Some(Some(record)) => Ok(record),
            _ => Err(TramaError::NotFound),
        }
    }

    fn staged_edge_mut(&mut self, id: EdgeId) -> Result<&mut EdgeRecord> {
        if !self.writes.edges.contains_key(&id) {
            let committed = self.committed_edge(id)?.ok_or(TramaError::NotFound)?;
            self.writes.edges.insert(id, Some(committed));
        }
        match self.writes.edges.get_mut(&id) {
            Some(Some(record)) => Ok(record),
            _ => Err(TramaError::NotFound),
        }
    }

    /// Multiplicity conflicts detectable without leaving the overlay.
    fn check_staged_multiplicity(
        &self,
        label: &EdgeLabelDef,
        out_v: VertexId,
        in_v: VertexId,
    ) -> Result<()> {
        if !label.multiplicity.is_constrained() {
            return Ok(());
        }
        for staged in self.writes.edges.values().flatten() {
            if staged.label != label.id || staged.superseded {
                continue;
            }
            let conflict = match label.multiplicity {
                crate::schema::Multiplicity::Simple => {
                    staged.out_v == out_v && staged.in_v == in_v
                }
                crate::schema::Multiplicity::Many2One => staged.out_v == out_v,
                crate::schema::Multiplicity::One2Many => staged.in_v == in_v,
                crate::schema::Multiplicity::One2One => {
                    staged.out_v == out_v || staged.in_v == in_v
                }
                crate::schema::Multiplicity::Multi => false,
            };
            if conflict {
                return Err(TramaError::SchemaViolation(format!(
                    "edge label {} admits no further edge between these endpoints",
                    label.name
                )));
            }
        }
        Ok(())
    }

    /// All live edge ids touching `vertex`, committed and staged.
    pub(crate) fn incident_edges(&self, vertex: VertexId) -> Result<Vec<EdgeId>> {
        let mut ids: Vec<EdgeId> = Vec::new();
        for dir in [Direction::Out, Direction::In] {
            for (key, _) in self
                .backend
                .kv()
                .scan_prefix(&keyspace::adjacency_prefix(vertex, dir))?
            {
                ids.push(keyspace::adjacency_edge(&key)?);
            }
        }
        for (id, staged) in &self.writes.edges {
            match staged {
                Some(edge) if edge.touches(vertex) => ids.push(*id),
                _ => {}
            }
        }
        ids.sort_unstable();
        ids.dedup();
        // Drop edges deleted in this transaction.
        ids.retain(|id| !matches!(self.writes.edges.get(id), Some(None)));
        Ok(ids)
    }

    /// Every live vertex visible to this transaction, ordered by id.
    pub(crate) fn scan_vertices(&self) -> Result<Vec<VertexRecord>> {
        let mut merged: BTreeMap<VertexId, VertexRecord> = BTreeMap::new();
        for (_, raw) in self.backend.kv().scan_prefix(&keyspace::vertex_prefix())? {
            let record: VertexRecord = decode_record(&raw)?;
            merged.insert(record.id, record);
        }
        for (id, staged) in &self.writes.vertices {
            match staged {
                Some(record) => {
                    merged.insert(*id, record.clone());
                }
                None => {
                    merged.remove(id);
                }
            }
        }
        Ok(merged.into_values().collect())
    }

    /// Every live, non-superseded edge visible to this transaction,
    /// ordered by id.
    pub(crate) fn scan_edges(&self) -> Result<Vec<EdgeRecord>> {
        let mut merged: BTreeMap<EdgeId, EdgeRecord> = BTreeMap::new();
        for (_, raw) in self.backend.kv().scan_prefix(&keyspace::edge_prefix())? {
            let record: EdgeRecord = decode_record(&raw)?;
            merged.insert(record.id, record);
        }
        for (id, staged) in &self.writes.edges {
            match staged {
                Some(record) => {
                    merged.insert(*id, record.clone());
                }
                None => {
                    merged.remove(id);
                }
            }
        }
        Ok(merged
            .into_values()
            .filter(|edge| !edge.superseded)
            .collect())
    }

    /// The vertex owning a property instance, if the instance is live.
    pub(crate) fn property_owner(&self, property: PropertyId) -> Result<Option<VertexId>> {
        // Staged vertices may carry instances the locator table has not
        // seen yet.
        for (id, staged) in &self.writes.vertices {
            if let Some(record) = staged {
                if record.property(property).is_some() {
                    return Ok(Some(*id));
                }
            }
        }
        match self
            .backend
            .kv()
            .get(&keyspace::prop_locator_key(property))?
        {
            Some(raw) => {
                let vertex = VertexId(crate::backend::codec::decode_u64(&raw)?);
                // The overlay may have deleted the vertex or the instance.
                match self.vertex(vertex)? {
                    Some(record) if record.property(property).is_some() => Ok(Some(vertex)),
                    _ => Ok(None),
                }
            }
            None => Ok(None),
        }
    }
}

fn check_value_type(key: &PropertyKeyDef, value: &Value) -> Result<()> {
    if value.prop_type() != key.data_type {
        return Err(TramaError::SchemaViolation(format!(
            "property {} expects {} values",
            key.name, key.data_type
        )));
    }
    Ok(())
}

pub(crate) fn encode_record<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|_| TramaError::Corruption("element record not encodable"))
}

pub(crate) fn decode_record<T: serde::de::DeserializeOwned>(raw: &[u8]) -> Result<T> {
    serde_json::from_slice(raw).map_err(|_| TramaError::Corruption("element record not decodable"))
}
