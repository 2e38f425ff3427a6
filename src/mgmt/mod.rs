//! Schema management transactions.
//!
//! A [`ManagementTx`] stages definitions and lifecycle transitions against a
//! private copy of the current snapshot and commits them as one new schema
//! version. Management transactions are serialized cluster-wide through a
//! dedicated lock key in the shared store; data transactions never touch
//! that key. Lifecycle actions that need cluster convergence or bulk work
//! come back from [`ManagementTx::commit`] as [`JobHandle`]s.

use std::mem;

use rustc_hash::FxHashSet;
use smallvec::{smallvec, SmallVec};
use tracing::{debug, info};

use crate::backend::codec::keyspace;
use crate::schema::{
    encode_json, Cardinality, ConsistencyModifier, EdgeLabelDef, FieldMapping, FieldParam,
    IndexDefinition, IndexField, IndexKind, LabelConstraint, Multiplicity, PropertyKeyDef,
    RelationBase, SchemaAction, SchemaId, SchemaSnapshot, SchemaStatus, VertexLabelDef,
};
use crate::store::Store;
use crate::txn::locks::{self, LockGuard};
use crate::types::{
    Direction, EdgeLabelId, ElementKind, IndexId, PropKeyId, PropType, Result, SortOrder,
    TramaError, VertexLabelId,
};

pub mod jobs;
pub mod registry;
pub(crate) mod watcher;

pub use jobs::{JobHandle, JobMetrics, JobState};
pub use watcher::RegistrationReport;

use jobs::{JobContext, JobTask, PendingJob};

/// A mixed-index field to declare with its backing service at commit.
struct MixedFieldReg {
    backing: String,
    index: String,
    field: String,
    data_type: PropType,
}

/// Exclusive schema transaction of one store.
///
/// Holds the cluster-wide management lock for its whole lifetime, so at most
/// one schema writer is active at a time. Dropping without [`commit`]
/// discards every staged change and fails queued jobs.
///
/// [`commit`]: ManagementTx::commit
pub struct ManagementTx<'a> {
    store: &'a Store,
    snapshot: SchemaSnapshot,
    changes: Vec<(Vec<u8>, Vec<u8>)>,
    jobs: Vec<PendingJob>,
    mixed_regs: Vec<MixedFieldReg>,
    fresh_keys: FxHashSet<PropKeyId>,
    fresh_edge_labels: FxHashSet<EdgeLabelId>,
    fresh_vertex_labels: FxHashSet<VertexLabelId>,
    next_prop_key: u32,
    next_edge_label: u32,
    next_vertex_label: u32,
    next_index: u32,
    _guard: LockGuard<'a>,
}

impl<'a> ManagementTx<'a> {
    pub(crate) fn begin(store: &'a Store) -> Result<ManagementTx<'a>> {
        let guard = store
            .backend()
            .locks()
            .acquire(vec![locks::management_key()], store.config().lock_timeout)?;
        // Rebuild from persisted state under the lock so staged changes are
        // based on what every earlier management commit actually wrote.
        let snapshot = (*store.catalog().reload()?).clone();
        let next_prop_key = snapshot.prop_keys().map(|d| d.id.0 + 1).max().unwrap_or(1);
        let next_edge_label = snapshot
            .edge_labels()
            .map(|d| d.id.0 + 1)
            .max()
            .unwrap_or(1);
        let next_vertex_label = snapshot
            .vertex_labels()
            .map(|d| d.id.0 + 1)
            .max()
            .unwrap_or(1);
        let next_index = snapshot.indexes().map(|d| d.id.0 + 1).max().unwrap_or(1);
        debug!(version = snapshot.version().0, "mgmt.begin");
        Ok(ManagementTx {
            store,
            snapshot,
            changes: Vec::new(),
            jobs: Vec::new(),
            mixed_regs: Vec::new(),
            fresh_keys: FxHashSet::default(),
            fresh_edge_labels: FxHashSet::default(),
            fresh_vertex_labels: FxHashSet::default(),
            next_prop_key,
            next_edge_label,
            next_vertex_label,
            next_index,
            _guard: guard,
        })
    }

    /// The staged view: committed schema plus everything declared in this
    /// transaction so far.
    pub fn snapshot(&self) -> &SchemaSnapshot {
        &self.snapshot
    }

    /// Starts declaring a property key with `Single` cardinality and
    /// `Default` consistency.
    pub fn make_property_key(&mut self, name: &str, data_type: PropType) -> PropertyKeyBuilder<'_, 'a> {
        PropertyKeyBuilder {
            tx: self,
            name: name.to_owned(),
            data_type,
            cardinality: Cardinality::Single,
            consistency: ConsistencyModifier::Default,
        }
    }

    /// Starts declaring an edge label with `Multi` multiplicity and
    /// `Default` consistency.
    pub fn make_edge_label(&mut self, name: &str) -> EdgeLabelBuilder<'_, 'a> {
        EdgeLabelBuilder {
            tx: self,
            name: name.to_owned(),
            multiplicity: Multiplicity::Multi,
            signature: SmallVec::new(),
            consistency: ConsistencyModifier::Default,
        }
    }

    /// Declares a vertex label.
    pub fn make_vertex_label(&mut self, name: &str) -> Result<VertexLabelId> {
        if name.trim().is_empty() {
            return Err(TramaError::Invalid("schema name must not be blank"));
        }
        let id = VertexLabelId(self.next_vertex_label);
        let def = VertexLabelDef {
            id,
            name: name.to_owned(),
        };
        self.snapshot.insert_vertex_label(def.clone())?;
        self.stage_def(keyspace::DEF_VERTEX_LABEL, id.0, &def)?;
        self.fresh_vertex_labels.insert(id);
        self.next_vertex_label += 1;
        Ok(id)
    }

    /// Starts declaring a composite or mixed index over `element`s.
    pub fn build_index(&mut self, name: &str, element: ElementKind) -> IndexBuilder<'_, 'a> {
        IndexBuilder {
            tx: self,
            name: name.to_owned(),
            element,
            fields: SmallVec::new(),
            unique: false,
            constraint: None,
        }
    }

    /// Declares a vertex-centric index over incident edges of `label`,
    /// ordered by `sort_keys`.
    pub fn build_edge_index(
        &mut self,
        name: &str,
        label: EdgeLabelId,
        direction: Direction,
        order: SortOrder,
        sort_keys: &[PropKeyId],
    ) -> Result<IndexId> {
        let kind = IndexKind::Relation {
            base: RelationBase::EdgeLabel(label),
            direction,
            order,
        };
        let fields = sort_keys.iter().map(|k| IndexField::plain(*k)).collect();
        self.finish_index(name.to_owned(), kind, ElementKind::Edge, fields, None)
    }

    /// Declares a vertex-centric index over instances of the multi-valued
    /// property `key`, ordered by `sort_keys`.
    pub fn build_property_index(
        &mut self,
        name: &str,
        key: PropKeyId,
        order: SortOrder,
        sort_keys: &[PropKeyId],
    ) -> Result<IndexId> {
        let kind = IndexKind::Relation {
            base: RelationBase::PropertyKey(key),
            direction: Direction::Out,
            order,
        };
        let fields = sort_keys.iter().map(|k| IndexField::plain(*k)).collect();
        self.finish_index(name.to_owned(), kind, ElementKind::Property, fields, None)
    }

    /// Requests a lifecycle transition on every field of the named index.
    ///
    /// Fields already at (or past) the action's target are skipped; a field
    /// in any other status the action does not apply to fails the whole
    /// request with no state change. Actions that backfill, purge, or wait
    /// on the cluster run as a background job after commit; `Enable` and
    /// `Disable` are staged like any other schema change.
    pub fn update_index(&mut self, name: &str, action: SchemaAction) -> Result<()> {
        let def = match self.snapshot.index_by_name(name) {
            Some(def) => def.clone(),
            None => return Err(TramaError::NotFound),
        };
        let noop = noop_statuses(action);
        let mut actionable: Vec<PropKeyId> = Vec::new();
        for key in def.field_keys() {
            let status = self
                .snapshot
                .index_status(def.id, key)
                .unwrap_or(SchemaStatus::Installed);
            if noop.contains(&status) {
                continue;
            }
            if !action.applies_to(status) {
                return Err(TramaError::InvalidLifecycleTransition { action, status });
            }
            actionable.push(key);
        }
        if actionable.is_empty() {
            debug!(index = name, %action, "mgmt.action_noop");
            return Ok(());
        }
        match action {
            SchemaAction::EnableIndex => {
                for key in actionable {
                    self.stage_status(def.id, key, SchemaStatus::Enabled)?;
                }
            }
            SchemaAction::DisableIndex => {
                for key in actionable {
                    self.stage_status(def.id, key, SchemaStatus::Disabled)?;
                }
            }
            SchemaAction::RegisterIndex => {
                self.queue_job(&def.name, SchemaAction::RegisterIndex, JobTask::RegisterGate, def.id);
            }
            SchemaAction::Reindex => {
                self.queue_job(&def.name, SchemaAction::Reindex, JobTask::Reindex, def.id);
            }
            SchemaAction::RemoveIndex => {
                self.queue_job(&def.name, SchemaAction::RemoveIndex, JobTask::Remove, def.id);
            }
        }
        Ok(())
    }

    /// Changes the concurrent-write policy of a relation type or index.
    ///
    /// `Fork` is rejected on schema-constrained relation types and on any
    /// index; `Lock` is rejected on indexes that are not composite.
    pub fn set_consistency(&mut self, name: &str, consistency: ConsistencyModifier) -> Result<()> {
        match self.snapshot.by_name(name).ok_or(TramaError::NotFound)? {
            SchemaId::PropKey(id) => {
                let mut def = self.snapshot.prop_key(id).ok_or(TramaError::NotFound)?.clone();
                def.consistency = consistency;
                check_key_consistency(&def)?;
                self.stage_def(keyspace::DEF_PROP_KEY, id.0, &def)?;
                self.snapshot.update_prop_key(def);
            }
            SchemaId::EdgeLabel(id) => {
                let mut def = self
                    .snapshot
                    .edge_label(id)
                    .ok_or(TramaError::NotFound)?
                    .clone();
                def.consistency = consistency;
                check_label_consistency(&def)?;
                self.stage_def(keyspace::DEF_EDGE_LABEL, id.0, &def)?;
                self.snapshot.update_edge_label(def);
            }
            SchemaId::Index(id) => {
                let mut def = self.snapshot.index(id).ok_or(TramaError::NotFound)?.clone();
                def.consistency = consistency;
                self.validate_index(&def)?;
                self.stage_def(keyspace::DEF_INDEX, id.0, &def)?;
                self.snapshot.update_index(def);
            }
            SchemaId::VertexLabel(_) => {
                return Err(TramaError::SchemaViolation(format!(
                    "vertex label {name} carries no consistency modifier"
                )));
            }
        }
        Ok(())
    }

    /// Renames any schema element. The numeric id is stable, so indexes and
    /// stored data are unaffected.
    pub fn rename(&mut self, old: &str, new: &str) -> Result<()> {
        let id = self.snapshot.by_name(old).ok_or(TramaError::NotFound)?;
        self.snapshot.rename(id, new)?;
        match id {
            SchemaId::PropKey(k) => {
                let def = self.snapshot.prop_key(k).ok_or(TramaError::NotFound)?.clone();
                self.stage_def(keyspace::DEF_PROP_KEY, k.0, &def)?;
            }
            SchemaId::EdgeLabel(l) => {
                let def = self
                    .snapshot
                    .edge_label(l)
                    .ok_or(TramaError::NotFound)?
                    .clone();
                self.stage_def(keyspace::DEF_EDGE_LABEL, l.0, &def)?;
            }
            SchemaId::VertexLabel(l) => {
                let def = self
                    .snapshot
                    .vertex_label(l)
                    .ok_or(TramaError::NotFound)?
                    .clone();
                self.stage_def(keyspace::DEF_VERTEX_LABEL, l.0, &def)?;
            }
            SchemaId::Index(i) => {
                let def = self.snapshot.index(i).ok_or(TramaError::NotFound)?.clone();
                self.stage_def(keyspace::DEF_INDEX, i.0, &def)?;
            }
        }
        Ok(())
    }

    /// Publishes every staged change as one new schema version and starts
    /// the queued background jobs.
    ///
    /// Jobs run on their own threads after the management lock is released;
    /// the returned handles observe their progress and outcome.
    pub fn commit(mut self) -> Result<Vec<JobHandle>> {
        // Declare mixed-index fields first: registration with the service is
        // idempotent, and failing here leaves the schema untouched.
        for reg in &self.mixed_regs {
            let provider = self.store.backend().provider(&reg.backing).ok_or(
                TramaError::BackendUnavailable("index service not wired to this backend"),
            )?;
            provider.register(&reg.index, &reg.field, reg.data_type)?;
        }
        let snapshot = mem::take(&mut self.snapshot);
        let changes = mem::take(&mut self.changes);
        let jobs = mem::take(&mut self.jobs);
        let published = self.store.catalog().commit_snapshot(snapshot, changes)?;
        let version = published.version();
        // Acknowledge our own version, or the registration gates of the jobs
        // we are about to start would wait on this very instance.
        self.store
            .registry()
            .ack_version(self.store.instance_id(), version)?;
        info!(version = version.0, jobs = jobs.len(), "mgmt.commit");
        let ctx = JobContext {
            backend: self.store.backend().clone(),
            catalog: self.store.catalog_arc(),
            registry: self.store.registry().clone(),
            config: self.store.config().clone(),
            version,
        };
        // Jobs reacquire the management lock; release it before they start.
        drop(self);
        Ok(jobs
            .into_iter()
            .map(|job| jobs::spawn(job, ctx.clone()))
            .collect())
    }

    fn finish_index(
        &mut self,
        name: String,
        kind: IndexKind,
        element: ElementKind,
        fields: SmallVec<[IndexField; 4]>,
        constraint: Option<LabelConstraint>,
    ) -> Result<IndexId> {
        let id = IndexId(self.next_index);
        let def = IndexDefinition {
            id,
            name,
            kind,
            element,
            fields,
            constraint,
            consistency: ConsistencyModifier::Default,
        };
        self.validate_index(&def)?;
        let statuses = self.creation_statuses(&def);
        let register = statuses.iter().any(|(_, s)| *s == SchemaStatus::Installed);
        self.snapshot.insert_index(def.clone())?;
        self.stage_def(keyspace::DEF_INDEX, id.0, &def)?;
        for (key, status) in statuses {
            self.stage_status(id, key, status)?;
        }
        if let IndexKind::Mixed { backing } = &def.kind {
            for field in &def.fields {
                if let Some(key) = self.snapshot.prop_key(field.key) {
                    let reg = MixedFieldReg {
                        backing: backing.clone(),
                        index: def.name.clone(),
                        field: key.name.clone(),
                        data_type: key.data_type,
                    };
                    self.mixed_regs.push(reg);
                }
            }
        }
        if register {
            self.queue_job(&def.name, SchemaAction::RegisterIndex, JobTask::RegisterGate, id);
        }
        self.next_index += 1;
        Ok(id)
    }

    fn validate_index(&self, def: &IndexDefinition) -> Result<()> {
        let snapshot = &self.snapshot;
        def.validate(
            |id| snapshot.edge_label(id).cloned(),
            |id| snapshot.prop_key(id).cloned(),
        )?;
        for key in def.field_keys() {
            if snapshot.prop_key(key).is_none() {
                return Err(TramaError::SchemaViolation(format!(
                    "index {} references an undeclared property key",
                    def.name
                )));
            }
        }
        match def.constraint {
            Some(LabelConstraint::Vertex(label)) => {
                if snapshot.vertex_label(label).is_none() {
                    return Err(TramaError::SchemaViolation(format!(
                        "index {} is constrained to an undeclared vertex label",
                        def.name
                    )));
                }
                if def.element != ElementKind::Vertex {
                    return Err(TramaError::SchemaViolation(format!(
                        "index {} constrains a vertex label but does not cover vertices",
                        def.name
                    )));
                }
            }
            Some(LabelConstraint::Edge(label)) => {
                if snapshot.edge_label(label).is_none() {
                    return Err(TramaError::SchemaViolation(format!(
                        "index {} is constrained to an undeclared edge label",
                        def.name
                    )));
                }
                if def.element != ElementKind::Edge {
                    return Err(TramaError::SchemaViolation(format!(
                        "index {} constrains an edge label but does not cover edges",
                        def.name
                    )));
                }
            }
            None => {}
        }
        Ok(())
    }

    /// Initial per-field statuses of a freshly declared index.
    ///
    /// A field over a key declared in this same transaction can be enabled
    /// immediately: no data predates it and no instance can write it before
    /// seeing this commit. Everything else starts `Installed` and goes
    /// through the registration gate.
    fn creation_statuses(&self, def: &IndexDefinition) -> Vec<(PropKeyId, SchemaStatus)> {
        match &def.kind {
            IndexKind::Composite { .. } => {
                let fresh_constraint = match def.constraint {
                    Some(LabelConstraint::Vertex(l)) => self.fresh_vertex_labels.contains(&l),
                    Some(LabelConstraint::Edge(l)) => self.fresh_edge_labels.contains(&l),
                    None => false,
                };
                let enabled = fresh_constraint
                    || def.field_keys().any(|k| self.fresh_keys.contains(&k));
                let status = if enabled {
                    SchemaStatus::Enabled
                } else {
                    SchemaStatus::Installed
                };
                def.field_keys().map(|k| (k, status)).collect()
            }
            IndexKind::Mixed { .. } => def
                .field_keys()
                .map(|k| {
                    let status = if self.fresh_keys.contains(&k) {
                        SchemaStatus::Enabled
                    } else {
                        SchemaStatus::Installed
                    };
                    (k, status)
                })
                .collect(),
            IndexKind::Relation { base, .. } => {
                let fresh = match base {
                    RelationBase::EdgeLabel(l) => self.fresh_edge_labels.contains(l),
                    RelationBase::PropertyKey(k) => self.fresh_keys.contains(k),
                };
                let status = if fresh {
                    SchemaStatus::Enabled
                } else {
                    SchemaStatus::Installed
                };
                def.field_keys().map(|k| (k, status)).collect()
            }
        }
    }

    fn queue_job(&mut self, name: &str, action: SchemaAction, task: JobTask, index: IndexId) {
        debug!(index = name, %action, "mgmt.queue_job");
        self.jobs.push(PendingJob {
            handle: JobHandle::new(name, action),
            task,
            index,
        });
    }

    fn stage_def<T: serde::Serialize>(&mut self, kind: u8, id: u32, def: &T) -> Result<()> {
        self.changes
            .push((keyspace::schema_def_key(kind, id), encode_json(def)?));
        Ok(())
    }

    fn stage_status(&mut self, index: IndexId, field: PropKeyId, status: SchemaStatus) -> Result<()> {
        self.snapshot.set_status(index, field, status);
        self.changes
            .push((keyspace::index_status_key(index, field), encode_json(&status)?));
        Ok(())
    }
}

impl Drop for ManagementTx<'_> {
    fn drop(&mut self) {
        for job in &self.jobs {
            job.handle.abandon();
        }
    }
}

/// Statuses an action silently skips because the field is already at or past
/// its target. Mixed-status indexes arise from the fresh-key fast path, so a
/// blanket transition over all fields must tolerate them.
fn noop_statuses(action: SchemaAction) -> &'static [SchemaStatus] {
    match action {
        SchemaAction::RegisterIndex => &[SchemaStatus::Registered, SchemaStatus::Enabled],
        SchemaAction::EnableIndex => &[SchemaStatus::Enabled],
        SchemaAction::Reindex => &[],
        SchemaAction::DisableIndex => &[SchemaStatus::Disabled],
        SchemaAction::RemoveIndex => &[SchemaStatus::Removed],
    }
}

fn check_key_consistency(def: &PropertyKeyDef) -> Result<()> {
    if def.consistency == ConsistencyModifier::Fork && def.is_constrained() {
        return Err(TramaError::SchemaViolation(format!(
            "property key {} is cardinality-constrained and cannot fork",
            def.name
        )));
    }
    Ok(())
}

fn check_label_consistency(def: &EdgeLabelDef) -> Result<()> {
    if def.consistency == ConsistencyModifier::Fork && def.is_constrained() {
        return Err(TramaError::SchemaViolation(format!(
            "edge label {} is multiplicity-constrained and cannot fork",
            def.name
        )));
    }
    Ok(())
}

/// Builder for a property key declaration.
pub struct PropertyKeyBuilder<'m, 'a> {
    tx: &'m mut ManagementTx<'a>,
    name: String,
    data_type: PropType,
    cardinality: Cardinality,
    consistency: ConsistencyModifier,
}

impl PropertyKeyBuilder<'_, '_> {
    /// Values admitted per vertex; defaults to `Single`.
    pub fn cardinality(mut self, cardinality: Cardinality) -> Self {
        self.cardinality = cardinality;
        self
    }

    /// Concurrent-write policy; defaults to `Default`.
    pub fn consistency(mut self, consistency: ConsistencyModifier) -> Self {
        self.consistency = consistency;
        self
    }

    /// Declares the key.
    pub fn make(self) -> Result<PropKeyId> {
        if self.name.trim().is_empty() {
            return Err(TramaError::Invalid("schema name must not be blank"));
        }
        let id = PropKeyId(self.tx.next_prop_key);
        let def = PropertyKeyDef {
            id,
            name: self.name,
            data_type: self.data_type,
            cardinality: self.cardinality,
            consistency: self.consistency,
        };
        check_key_consistency(&def)?;
        self.tx.snapshot.insert_prop_key(def.clone())?;
        self.tx.stage_def(keyspace::DEF_PROP_KEY, id.0, &def)?;
        self.tx.fresh_keys.insert(id);
        self.tx.next_prop_key += 1;
        Ok(id)
    }
}

/// Builder for an edge label declaration.
pub struct EdgeLabelBuilder<'m, 'a> {
    tx: &'m mut ManagementTx<'a>,
    name: String,
    multiplicity: Multiplicity,
    signature: SmallVec<[PropKeyId; 4]>,
    consistency: ConsistencyModifier,
}

impl EdgeLabelBuilder<'_, '_> {
    /// Multiplicity constraint; defaults to `Multi`.
    pub fn multiplicity(mut self, multiplicity: Multiplicity) -> Self {
        self.multiplicity = multiplicity;
        self
    }

    /// Keys stored inline with every edge of this label.
    pub fn signature(mut self, keys: &[PropKeyId]) -> Self {
        self.signature.extend_from_slice(keys);
        self
    }

    /// Concurrent-write policy; defaults to `Default`.
    pub fn consistency(mut self, consistency: ConsistencyModifier) -> Self {
        self.consistency = consistency;
        self
    }

    /// Declares the label.
    pub fn make(self) -> Result<EdgeLabelId> {
        if self.name.trim().is_empty() {
            return Err(TramaError::Invalid("schema name must not be blank"));
        }
        let mut seen: SmallVec<[PropKeyId; 4]> = SmallVec::new();
        for key in &self.signature {
            if self.tx.snapshot.prop_key(*key).is_none() {
                return Err(TramaError::SchemaViolation(format!(
                    "edge label {} signature references an undeclared property key",
                    self.name
                )));
            }
            if seen.contains(key) {
                return Err(TramaError::SchemaViolation(format!(
                    "edge label {} lists signature key {} twice",
                    self.name, key
                )));
            }
            seen.push(*key);
        }
        let id = EdgeLabelId(self.tx.next_edge_label);
        let def = EdgeLabelDef {
            id,
            name: self.name,
            multiplicity: self.multiplicity,
            signature: self.signature,
            consistency: self.consistency,
        };
        check_label_consistency(&def)?;
        self.tx.snapshot.insert_edge_label(def.clone())?;
        self.tx.stage_def(keyspace::DEF_EDGE_LABEL, id.0, &def)?;
        self.tx.fresh_edge_labels.insert(id);
        self.tx.next_edge_label += 1;
        Ok(id)
    }
}

/// Builder for a composite or mixed index declaration.
pub struct IndexBuilder<'m, 'a> {
    tx: &'m mut ManagementTx<'a>,
    name: String,
    element: ElementKind,
    fields: SmallVec<[IndexField; 4]>,
    unique: bool,
    constraint: Option<LabelConstraint>,
}

impl IndexBuilder<'_, '_> {
    /// Adds an indexed field.
    pub fn key(mut self, key: PropKeyId) -> Self {
        self.fields.push(IndexField::plain(key));
        self
    }

    /// Adds an indexed field with an explicit mapping. Mixed indexes only.
    pub fn key_mapped(mut self, key: PropKeyId, mapping: FieldMapping) -> Self {
        self.fields.push(IndexField {
            key,
            params: smallvec![FieldParam::Mapping(mapping)],
        });
        self
    }

    /// Enforces at most one element per key tuple. Composite vertex indexes
    /// only.
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Restricts the index to vertices with `label`.
    pub fn only_vertex_label(mut self, label: VertexLabelId) -> Self {
        self.constraint = Some(LabelConstraint::Vertex(label));
        self
    }

    /// Restricts the index to edges with `label`.
    pub fn only_edge_label(mut self, label: EdgeLabelId) -> Self {
        self.constraint = Some(LabelConstraint::Edge(label));
        self
    }

    /// Declares the index as composite, stored in the graph's own key space.
    pub fn composite(self) -> Result<IndexId> {
        let kind = IndexKind::Composite { unique: self.unique };
        self.tx
            .finish_index(self.name, kind, self.element, self.fields, self.constraint)
    }

    /// Declares the index as mixed, delegated to the named index service.
    pub fn mixed(self, backing: &str) -> Result<IndexId> {
        if self.unique {
            return Err(TramaError::SchemaViolation(format!(
                "mixed index {} cannot enforce uniqueness",
                self.name
            )));
        }
        if self.tx.store.backend().provider(backing).is_none() {
            return Err(TramaError::BackendUnavailable(
                "index service not wired to this backend",
            ));
        }
        let kind = IndexKind::Mixed {
            backing: backing.to_owned(),
        };
        self.tx
            .finish_index(self.name, kind, self.element, self.fields, self.constraint)
    }
}
