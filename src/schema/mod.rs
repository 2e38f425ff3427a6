//! Schema catalog: typed definitions, index registry, and per-field index
//! lifecycle statuses.
//!
//! The catalog persists every definition in the shared key-value store and
//! publishes an immutable [`SchemaSnapshot`] behind an `Arc`. Transactions
//! pin the snapshot current at their start; schema mutations build a new
//! snapshot and publish it atomically, so readers never observe a torn
//! catalog. Other instances pick up changes when they reload.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::backend::codec::keyspace;
use crate::backend::KvStore;
use crate::types::{
    EdgeLabelId, ElementKind, IndexId, PropKeyId, Result, SchemaVersion, TramaError,
    VertexLabelId,
};

pub mod defs;
pub mod index;
pub mod status;

pub use defs::{
    Cardinality, ConsistencyModifier, EdgeLabelDef, Multiplicity, PropertyKeyDef, VertexLabelDef,
};
pub use index::{
    FieldMapping, FieldParam, IndexDefinition, IndexField, IndexKind, LabelConstraint,
    RelationBase,
};
pub use status::{SchemaAction, SchemaStatus};

/// Identifier of any named schema element.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum SchemaId {
    /// A property key.
    PropKey(PropKeyId),
    /// An edge label.
    EdgeLabel(EdgeLabelId),
    /// A vertex label.
    VertexLabel(VertexLabelId),
    /// An index.
    Index(IndexId),
}

/// Immutable view of the whole schema at one version.
#[derive(Clone, Debug, Default)]
pub struct SchemaSnapshot {
    version: SchemaVersion,
    prop_keys: FxHashMap<PropKeyId, PropertyKeyDef>,
    edge_labels: FxHashMap<EdgeLabelId, EdgeLabelDef>,
    vertex_labels: FxHashMap<VertexLabelId, VertexLabelDef>,
    indexes: FxHashMap<IndexId, IndexDefinition>,
    names: FxHashMap<String, SchemaId>,
    statuses: FxHashMap<(IndexId, PropKeyId), SchemaStatus>,
}

impl SchemaSnapshot {
    /// Version this snapshot was published at.
    pub fn version(&self) -> SchemaVersion {
        self.version
    }

    /// Property key definition by id.
    pub fn prop_key(&self, id: PropKeyId) -> Option<&PropertyKeyDef> {
        self.prop_keys.get(&id)
    }

    /// Edge label definition by id.
    pub fn edge_label(&self, id: EdgeLabelId) -> Option<&EdgeLabelDef> {
        self.edge_labels.get(&id)
    }

    /// Vertex label definition by id.
    pub fn vertex_label(&self, id: VertexLabelId) -> Option<&VertexLabelDef> {
        self.vertex_labels.get(&id)
    }

    /// Index definition by id.
    pub fn index(&self, id: IndexId) -> Option<&IndexDefinition> {
        self.indexes.get(&id)
    }

    /// Schema element by name, if any.
    pub fn by_name(&self, name: &str) -> Option<SchemaId> {
        self.names.get(name).copied()
    }

    /// Property key definition by name.
    pub fn prop_key_by_name(&self, name: &str) -> Option<&PropertyKeyDef> {
        match self.by_name(name)? {
            SchemaId::PropKey(id) => self.prop_key(id),
            _ => None,
        }
    }

    /// Edge label definition by name.
    pub fn edge_label_by_name(&self, name: &str) -> Option<&EdgeLabelDef> {
        match self.by_name(name)? {
            SchemaId::EdgeLabel(id) => self.edge_label(id),
            _ => None,
        }
    }

    /// Vertex label definition by name.
    pub fn vertex_label_by_name(&self, name: &str) -> Option<&VertexLabelDef> {
        match self.by_name(name)? {
            SchemaId::VertexLabel(id) => self.vertex_label(id),
            _ => None,
        }
    }

    /// Index definition by name.
    pub fn index_by_name(&self, name: &str) -> Option<&IndexDefinition> {
        match self.by_name(name)? {
            SchemaId::Index(id) => self.index(id),
            _ => None,
        }
    }

    /// All index definitions, unordered.
    pub fn indexes(&self) -> impl Iterator<Item = &IndexDefinition> {
        self.indexes.values()
    }

    /// All declared property keys, in no particular order.
    pub fn prop_keys(&self) -> impl Iterator<Item = &PropertyKeyDef> {
        self.prop_keys.values()
    }

    /// All declared edge labels, in no particular order.
    pub fn edge_labels(&self) -> impl Iterator<Item = &EdgeLabelDef> {
        self.edge_labels.values()
    }

    /// All declared vertex labels, in no particular order.
    pub fn vertex_labels(&self) -> impl Iterator<Item = &VertexLabelDef> {
        self.vertex_labels.values()
    }

    /// Graph indexes (composite and mixed) covering `element`.
    pub fn graph_indexes(
        &self,
        element: ElementKind,
    ) -> impl Iterator<Item = &IndexDefinition> {
        self.indexes
            .values()
            .filter(move |def| !def.is_relation() && def.element == element)
    }

    /// Relation indexes declared on `base`.
    pub fn relation_indexes(
        &self,
        base: RelationBase,
    ) -> impl Iterator<Item = &IndexDefinition> {
        self.indexes.values().filter(move |def| {
            matches!(&def.kind, IndexKind::Relation { base: b, .. } if *b == base)
        })
    }

    /// Lifecycle status of one indexed field.
    pub fn index_status(&self, index: IndexId, field: PropKeyId) -> Option<SchemaStatus> {
        self.statuses.get(&(index, field)).copied()
    }

    /// Whether every field of the index has reached `Enabled`.
    pub fn index_readable(&self, def: &IndexDefinition) -> bool {
        def.field_keys()
            .all(|key| self.index_status(def.id, key).is_some_and(|s| s.readable()))
    }

    /// Whether writes are still maintained for the given field.
    pub fn field_writes_maintained(&self, index: IndexId, field: PropKeyId) -> bool {
        self.index_status(index, field)
            .is_some_and(|s| s.writes_maintained())
    }

    pub(crate) fn set_version(&mut self, version: SchemaVersion) {
        self.version = version;
    }

    fn claim_name(&mut self, name: &str, id: SchemaId) -> Result<()> {
        if self.names.contains_key(name) {
            return Err(TramaError::SchemaViolation(format!(
                "schema name {name} already in use"
            )));
        }
        self.names.insert(name.to_owned(), id);
        Ok(())
    }

    pub(crate) fn insert_prop_key(&mut self, def: PropertyKeyDef) -> Result<()> {
        self.claim_name(&def.name, SchemaId::PropKey(def.id))?;
        self.prop_keys.insert(def.id, def);
        Ok(())
    }

    pub(crate) fn insert_edge_label(&mut self, def: EdgeLabelDef) -> Result<()> {
        self.claim_name(&def.name, SchemaId::EdgeLabel(def.id))?;
        self.edge_labels.insert(def.id, def);
        Ok(())
    }

    pub(crate) fn insert_vertex_label(&mut self, def: VertexLabelDef) -> Result<()> {
        self.claim_name(&def.name, SchemaId::VertexLabel(def.id))?;
        self.vertex_labels.insert(def.id, def);
        Ok(())
    }

    pub(crate) fn insert_index(&mut self, def: IndexDefinition) -> Result<()> {
        self.claim_name(&def.name, SchemaId::Index(def.id))?;
        self.indexes.insert(def.id, def);
        Ok(())
    }

    pub(crate) fn set_status(
        &mut self,
        index: IndexId,
        field: PropKeyId,
        status: SchemaStatus,
    ) {
        self.statuses.insert((index, field), status);
    }

    /// Renames an element in place keeping its numeric id.
    pub(crate) fn rename(&mut self, id: SchemaId, new_name: &str) -> Result<()> {
        if new_name.trim().is_empty() {
            return Err(TramaError::Invalid("schema name must not be blank"));
        }
        if self.names.contains_key(new_name) {
            return Err(TramaError::SchemaViolation(format!(
                "schema name {new_name} already in use"
            )));
        }
        let old = match id {
            SchemaId::PropKey(k) => {
                let def = self.prop_keys.get_mut(&k).ok_or(TramaError::NotFound)?;
                std::mem::replace(&mut def.name, new_name.to_owned())
            }
            SchemaId::EdgeLabel(l) => {
                let def = self.edge_labels.get_mut(&l).ok_or(TramaError::NotFound)?;
                std::mem::replace(&mut def.name, new_name.to_owned())
            }
            SchemaId::VertexLabel(l) => {
                let def = self.vertex_labels.get_mut(&l).ok_or(TramaError::NotFound)?;
                std::mem::replace(&mut def.name, new_name.to_owned())
            }
            SchemaId::Index(i) => {
                let def = self.indexes.get_mut(&i).ok_or(TramaError::NotFound)?;
                std::mem::replace(&mut def.name, new_name.to_owned())
            }
        };
        self.names.remove(&old);
        self.names.insert(new_name.to_owned(), id);
        Ok(())
    }

    pub(crate) fn update_prop_key(&mut self, def: PropertyKeyDef) {
        self.prop_keys.insert(def.id, def);
    }

    pub(crate) fn update_edge_label(&mut self, def: EdgeLabelDef) {
        self.edge_labels.insert(def.id, def);
    }

    pub(crate) fn update_index(&mut self, def: IndexDefinition) {
        self.indexes.insert(def.id, def);
    }
}

#[derive(Default)]
struct CatalogMetrics {
    reloads: AtomicU64,
    publishes: AtomicU64,
}

/// Counters describing catalog activity since open.
#[derive(Clone, Copy, Debug, Default)]
pub struct CatalogMetricsSnapshot {
    /// Snapshot rebuilds from the shared store.
    pub reloads: u64,
    /// Locally published snapshot versions.
    pub publishes: u64,
}

/// Shared, versioned schema catalog of one store instance.
pub struct SchemaCatalog {
    kv: Arc<dyn KvStore>,
    current: RwLock<Arc<SchemaSnapshot>>,
    metrics: CatalogMetrics,
}

impl SchemaCatalog {
    /// Opens the catalog, loading all persisted definitions.
    pub fn open(kv: Arc<dyn KvStore>) -> Result<Self> {
        let snapshot = load_snapshot(kv.as_ref())?;
        debug!(version = snapshot.version().0, "catalog.open");
        Ok(SchemaCatalog {
            kv,
            current: RwLock::new(Arc::new(snapshot)),
            metrics: CatalogMetrics::default(),
        })
    }

    /// Currently published snapshot.
    pub fn snapshot(&self) -> Arc<SchemaSnapshot> {
        Arc::clone(&self.current.read())
    }

    /// Re-reads the shared store and publishes whatever is persisted there.
    /// Returns the fresh snapshot.
    pub fn reload(&self) -> Result<Arc<SchemaSnapshot>> {
        let snapshot = Arc::new(load_snapshot(self.kv.as_ref())?);
        self.metrics.reloads.fetch_add(1, Ordering::Relaxed);
        trace!(version = snapshot.version().0, "catalog.reload");
        *self.current.write() = Arc::clone(&snapshot);
        Ok(snapshot)
    }

    /// Counters for tests and diagnostics.
    pub fn metrics_snapshot(&self) -> CatalogMetricsSnapshot {
        CatalogMetricsSnapshot {
            reloads: self.metrics.reloads.load(Ordering::Relaxed),
            publishes: self.metrics.publishes.load(Ordering::Relaxed),
        }
    }

    /// Persists `next` with a bumped version and publishes it locally.
    ///
    /// `changes` lists the kv keys and payloads to write besides the version
    /// counter. The caller must hold the management lock so that version
    /// allocation is not raced by another schema writer.
    pub(crate) fn commit_snapshot(
        &self,
        mut next: SchemaSnapshot,
        mut changes: Vec<(Vec<u8>, Vec<u8>)>,
    ) -> Result<Arc<SchemaSnapshot>> {
        let version = SchemaVersion(persisted_version(self.kv.as_ref())?.0 + 1);
        next.set_version(version);
        changes.push((
            keyspace::schema_version_key(),
            version.0.to_be_bytes().to_vec(),
        ));
        self.kv.apply(changes, Vec::new(), &[])?;
        let snapshot = Arc::new(next);
        *self.current.write() = Arc::clone(&snapshot);
        self.metrics.publishes.fetch_add(1, Ordering::Relaxed);
        debug!(version = version.0, "catalog.publish");
        Ok(snapshot)
    }

    /// Durably flips one (index, field) status and publishes the result.
    /// Caller must hold the management lock.
    pub(crate) fn commit_status(
        &self,
        index: IndexId,
        field: PropKeyId,
        status: SchemaStatus,
    ) -> Result<Arc<SchemaSnapshot>> {
        // Rebuild from persisted state so a stale local snapshot cannot
        // resurrect overwritten definitions.
        let mut next = load_snapshot(self.kv.as_ref())?;
        if next.index(index).is_none() {
            return Err(TramaError::NotFound);
        }
        next.set_status(index, field, status);
        let changes = vec![(
            keyspace::index_status_key(index, field),
            encode_json(&status)?,
        )];
        trace!(index = index.0, field = field.0, %status, "catalog.status");
        self.commit_snapshot(next, changes)
    }

    /// Version currently persisted in the shared store, regardless of what
    /// this instance has published locally.
    pub fn persisted_version(&self) -> Result<SchemaVersion> {
        persisted_version(self.kv.as_ref())
    }
}

fn load_snapshot(kv: &dyn KvStore) -> Result<SchemaSnapshot> {
    let mut snapshot = SchemaSnapshot::default();
    snapshot.set_version(persisted_version(kv)?);

    for (_, raw) in kv.scan_prefix(&keyspace::schema_def_prefix(keyspace::DEF_PROP_KEY))? {
        let def: PropertyKeyDef = decode_json(&raw)?;
        snapshot.insert_prop_key(def)?;
    }
    for (_, raw) in kv.scan_prefix(&keyspace::schema_def_prefix(keyspace::DEF_EDGE_LABEL))? {
        let def: EdgeLabelDef = decode_json(&raw)?;
        snapshot.insert_edge_label(def)?;
    }
    for (_, raw) in kv.scan_prefix(&keyspace::schema_def_prefix(keyspace::DEF_VERTEX_LABEL))? {
        let def: VertexLabelDef = decode_json(&raw)?;
        snapshot.insert_vertex_label(def)?;
    }
    for (_, raw) in kv.scan_prefix(&keyspace::schema_def_prefix(keyspace::DEF_INDEX))? {
        let def: IndexDefinition = decode_json(&raw)?;
        snapshot.insert_index(def)?;
    }
    for (key, raw) in kv.scan_prefix(&[keyspace::PREFIX_INDEX_STATUS])? {
        let (index, field) = keyspace::decode_index_status_key(&key)?;
        let status: SchemaStatus = decode_json(&raw)?;
        snapshot.set_status(index, field, status);
    }
    Ok(snapshot)
}

fn persisted_version(kv: &dyn KvStore) -> Result<SchemaVersion> {
    match kv.get(&keyspace::schema_version_key())? {
        Some(raw) => {
            let bytes: [u8; 8] = raw
                .as_slice()
                .try_into()
                .map_err(|_| TramaError::Corruption("schema version payload truncated"))?;
            Ok(SchemaVersion(u64::from_be_bytes(bytes)))
        }
        None => Ok(SchemaVersion(0)),
    }
}

pub(crate) fn encode_json<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|_| TramaError::Corruption("schema record not encodable"))
}

pub(crate) fn decode_json<T: serde::de::DeserializeOwned>(raw: &[u8]) -> Result<T> {
    serde_json::from_slice(raw).map_err(|_| TramaError::Corruption("schema record not decodable"))
}
