//! Background schema jobs: registration gates, reindex backfills, and
//! index removals.
//!
//! Jobs are prepared while a management transaction stages its changes and
//! started only after commit has released the management lock; each job
//! reacquires that lock for the status flips it performs, so job work is
//! serialized with any other schema writer. Progress and the terminal
//! outcome are observable through [`JobHandle`].

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::backend::codec::{self, keyspace};
use crate::backend::{IndexEntry, IndexMutation, IndexProvider, KvStore};
use crate::mgmt::registry::InstanceRegistry;
use crate::mgmt::watcher;
use crate::schema::{
    IndexDefinition, IndexKind, RelationBase, SchemaAction, SchemaCatalog, SchemaSnapshot,
    SchemaStatus,
};
use crate::store::{Backend, StoreConfig};
use crate::txn::consistency::{
    composite_tuples, edge_relation_keys, property_relation_keys, ElementView,
};
use crate::txn::locks;
use crate::txn::{decode_record, EdgeRecord, VertexRecord};
use crate::types::{
    EdgeLabelId, ElementId, ElementKind, IndexId, PropKeyId, Result, SchemaVersion, TramaError,
};

/// Batch size of backfill and purge writes.
const JOB_CHUNK: usize = 512;

/// Lifecycle of one background schema job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobState {
    /// Prepared but not started yet.
    Pending,
    /// Thread running.
    Running,
    /// Finished; metrics are final.
    Succeeded,
    /// Finished with the contained error.
    Failed(String),
}

impl JobState {
    /// Whether the job will make no further progress.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed(_))
    }
}

/// Work counters of one background job.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct JobMetrics {
    /// Index entries written by a backfill.
    pub records_added: u64,
    /// Index entries removed by a purge.
    pub records_deleted: u64,
}

struct JobProgress {
    state: JobState,
    metrics: JobMetrics,
}

struct JobShared {
    index: String,
    action: SchemaAction,
    progress: Mutex<JobProgress>,
    done: Condvar,
}

/// Observer handle of one background schema job. Clones share the same
/// underlying job.
#[derive(Clone)]
pub struct JobHandle {
    shared: Arc<JobShared>,
}

impl JobHandle {
    pub(crate) fn new(index: &str, action: SchemaAction) -> Self {
        JobHandle {
            shared: Arc::new(JobShared {
                index: index.to_owned(),
                action,
                progress: Mutex::new(JobProgress {
                    state: JobState::Pending,
                    metrics: JobMetrics::default(),
                }),
                done: Condvar::new(),
            }),
        }
    }

    /// Name of the index the job operates on.
    pub fn index(&self) -> &str {
        &self.shared.index
    }

    /// The lifecycle action that queued the job.
    pub fn action(&self) -> SchemaAction {
        self.shared.action
    }

    /// Current state.
    pub fn state(&self) -> JobState {
        self.shared.progress.lock().state.clone()
    }

    /// Counters so far; final once the state is terminal.
    pub fn metrics(&self) -> JobMetrics {
        self.shared.progress.lock().metrics
    }

    /// Blocks until the job reaches a terminal state or `timeout` elapses,
    /// returning the state observed when the wait ended.
    pub fn wait(&self, timeout: Duration) -> JobState {
        let deadline = Instant::now() + timeout;
        let mut progress = self.shared.progress.lock();
        while !progress.state.is_terminal() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            if self
                .shared
                .done
                .wait_for(&mut progress, deadline - now)
                .timed_out()
            {
                break;
            }
        }
        progress.state.clone()
    }

    fn begin(&self) {
        self.shared.progress.lock().state = JobState::Running;
    }

    fn record(&self, added: u64, deleted: u64) {
        let mut progress = self.shared.progress.lock();
        progress.metrics.records_added += added;
        progress.metrics.records_deleted += deleted;
    }

    fn finish(&self, result: &Result<()>) {
        let mut progress = self.shared.progress.lock();
        progress.state = match result {
            Ok(()) => JobState::Succeeded,
            Err(err) => JobState::Failed(err.to_string()),
        };
        drop(progress);
        self.shared.done.notify_all();
    }

    /// Fails a job that was queued but never started. No effect once the
    /// job is running or finished.
    pub(crate) fn abandon(&self) {
        let mut progress = self.shared.progress.lock();
        if progress.state == JobState::Pending {
            progress.state =
                JobState::Failed("management transaction was dropped before commit".to_owned());
            drop(progress);
            self.shared.done.notify_all();
        }
    }
}

/// What a queued job does once started.
pub(crate) enum JobTask {
    /// Wait for cluster acknowledgement, then flip `Installed` fields to
    /// `Registered`.
    RegisterGate,
    /// Rebuild all entries from committed data, then enable every field.
    Reindex,
    /// Disable, purge all entries, then retire every field.
    Remove,
}

/// A job queued by a management transaction, started after its commit.
pub(crate) struct PendingJob {
    pub handle: JobHandle,
    pub task: JobTask,
    pub index: IndexId,
}

/// Everything a job thread needs, cloned out of the owning store.
#[derive(Clone)]
pub(crate) struct JobContext {
    pub backend: Backend,
    pub catalog: Arc<SchemaCatalog>,
    pub registry: InstanceRegistry,
    pub config: StoreConfig,
    /// Version of the schema commit that queued the job.
    pub version: SchemaVersion,
}

/// Starts the job thread. The caller must have released the management
/// lock; every task reacquires it.
pub(crate) fn spawn(job: PendingJob, ctx: JobContext) -> JobHandle {
    let handle = job.handle.clone();
    let runner = job.handle;
    thread::spawn(move || {
        runner.begin();
        info!(index = %runner.index(), action = %runner.action(), "job.start");
        let result = match job.task {
            JobTask::RegisterGate => run_register_gate(&ctx, job.index),
            JobTask::Reindex => run_reindex(&ctx, &runner, job.index),
            JobTask::Remove => run_removal(&ctx, &runner, job.index),
        };
        match &result {
            Ok(()) => info!(index = %runner.index(), action = %runner.action(), "job.done"),
            Err(err) => {
                warn!(index = %runner.index(), action = %runner.action(), error = %err, "job.failed");
            }
        }
        runner.finish(&result);
    });
    handle
}

fn run_register_gate(ctx: &JobContext, index: IndexId) -> Result<()> {
    let gate = watcher::await_version(
        &ctx.registry,
        ctx.version,
        ctx.config.registration_timeout,
        ctx.config.registration_poll_interval,
    )?;
    if !gate.converged {
        return Err(TramaError::BackendUnavailable(
            "schema version was not acknowledged by every open instance",
        ));
    }
    let _held = ctx
        .backend
        .locks()
        .acquire(vec![locks::management_key()], ctx.config.lock_timeout)?;
    let snapshot = ctx.catalog.reload()?;
    let def = snapshot.index(index).ok_or(TramaError::NotFound)?.clone();
    for key in def.field_keys() {
        match snapshot.index_status(index, key) {
            Some(SchemaStatus::Installed) | Some(SchemaStatus::Disabled) => {
                ctx.catalog
                    .commit_status(index, key, SchemaStatus::Registered)?;
            }
            _ => {}
        }
    }
    ack_own(ctx);
    Ok(())
}

fn run_reindex(ctx: &JobContext, handle: &JobHandle, index: IndexId) -> Result<()> {
    let _held = ctx
        .backend
        .locks()
        .acquire(vec![locks::management_key()], ctx.config.lock_timeout)?;
    let mut snapshot = ctx.catalog.reload()?;
    let def = snapshot.index(index).ok_or(TramaError::NotFound)?.clone();

    // Disabled fields stopped being write-maintained; restore that and wait
    // for the cluster to notice, or writes landing mid-backfill would be
    // lost again.
    let mut flipped = false;
    for key in def.field_keys() {
        if snapshot.index_status(index, key) == Some(SchemaStatus::Disabled) {
            snapshot = ctx
                .catalog
                .commit_status(index, key, SchemaStatus::Registered)?;
            flipped = true;
        }
    }
    if flipped {
        ack_own(ctx);
        let gate = watcher::await_version(
            &ctx.registry,
            snapshot.version(),
            ctx.config.registration_timeout,
            ctx.config.registration_poll_interval,
        )?;
        if !gate.converged {
            return Err(TramaError::BackendUnavailable(
                "schema version was not acknowledged by every open instance",
            ));
        }
    }

    match &def.kind {
        IndexKind::Composite { .. } => backfill_composite(ctx, handle, &def)?,
        IndexKind::Mixed { backing } => backfill_mixed(ctx, handle, &snapshot, &def, backing)?,
        IndexKind::Relation { base, .. } => match base {
            RelationBase::EdgeLabel(label) => backfill_edge_relation(ctx, handle, &def, *label)?,
            RelationBase::PropertyKey(key) => backfill_property_relation(ctx, handle, &def, *key)?,
        },
    }

    for key in def.field_keys() {
        if snapshot.index_status(index, key) == Some(SchemaStatus::Registered) {
            ctx.catalog
                .commit_status(index, key, SchemaStatus::Enabled)?;
        }
    }
    ack_own(ctx);
    Ok(())
}

fn run_removal(ctx: &JobContext, handle: &JobHandle, index: IndexId) -> Result<()> {
    let _held = ctx
        .backend
        .locks()
        .acquire(vec![locks::management_key()], ctx.config.lock_timeout)?;
    let mut snapshot = ctx.catalog.reload()?;
    let def = snapshot.index(index).ok_or(TramaError::NotFound)?.clone();

    // Stop write maintenance everywhere before purging, or concurrent
    // commits would re-create entries behind the purge.
    let mut flipped = false;
    for key in def.field_keys() {
        if matches!(
            snapshot.index_status(index, key),
            Some(SchemaStatus::Registered) | Some(SchemaStatus::Enabled)
        ) {
            snapshot = ctx
                .catalog
                .commit_status(index, key, SchemaStatus::Disabled)?;
            flipped = true;
        }
    }
    if flipped {
        ack_own(ctx);
        let gate = watcher::await_version(
            &ctx.registry,
            snapshot.version(),
            ctx.config.registration_timeout,
            ctx.config.registration_poll_interval,
        )?;
        if !gate.converged {
            return Err(TramaError::BackendUnavailable(
                "schema version was not acknowledged by every open instance",
            ));
        }
    }

    match &def.kind {
        IndexKind::Composite { .. } => {
            purge_prefix(ctx, handle, &keyspace::composite_index_prefix(index))?;
        }
        IndexKind::Relation { .. } => {
            purge_prefix(ctx, handle, &keyspace::relation_index_prefix(index))?;
        }
        IndexKind::Mixed { backing } => match ctx.backend.provider(backing) {
            Some(provider) => provider.drop_index(&def.name)?,
            None => warn!(service = %backing, "index.service_missing"),
        },
    }

    for key in def.field_keys() {
        ctx.catalog.commit_status(index, key, SchemaStatus::Removed)?;
    }
    ack_own(ctx);
    Ok(())
}

/// Acknowledges the locally published schema version for the instance that
/// runs the job. Best-effort; the instance may have closed mid-job.
fn ack_own(ctx: &JobContext) {
    let version = ctx.catalog.snapshot().version();
    if let Err(err) = ctx
        .registry
        .ack_version(&ctx.config.instance_id, version)
    {
        debug!(error = %err, "job.ack_skipped");
    }
}

/// Applies `visit` to every committed live element of the given kind.
fn for_each_element(
    kv: &dyn KvStore,
    kind: ElementKind,
    mut visit: impl FnMut(ElementId, &ElementView<'_>) -> Result<()>,
) -> Result<()> {
    match kind {
        ElementKind::Vertex => {
            for (_, raw) in kv.scan_prefix(&keyspace::vertex_prefix())? {
                let record: VertexRecord = decode_record(&raw)?;
                visit(ElementId::Vertex(record.id), &ElementView::Vertex(&record))?;
            }
        }
        ElementKind::Edge => {
            for (_, raw) in kv.scan_prefix(&keyspace::edge_prefix())? {
                let record: EdgeRecord = decode_record(&raw)?;
                if record.superseded {
                    continue;
                }
                visit(ElementId::Edge(record.id), &ElementView::Edge(&record))?;
            }
        }
        ElementKind::Property => {
            for (_, raw) in kv.scan_prefix(&keyspace::vertex_prefix())? {
                let record: VertexRecord = decode_record(&raw)?;
                for instance in &record.properties {
                    visit(
                        ElementId::Property(instance.id),
                        &ElementView::Property(instance),
                    )?;
                }
            }
        }
    }
    Ok(())
}

fn backfill_composite(ctx: &JobContext, handle: &JobHandle, def: &IndexDefinition) -> Result<()> {
    let mut puts: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
    for_each_element(ctx.backend.kv(), def.element, |element, view| {
        if !def.admits_label(view.label()) {
            return Ok(());
        }
        for tuple in composite_tuples(def, view) {
            let hash = codec::composite_hash(&tuple);
            puts.push((
                keyspace::composite_entry_key(def.id, hash, &tuple, element),
                Vec::new(),
            ));
        }
        if puts.len() >= JOB_CHUNK {
            flush_puts(ctx, handle, &mut puts)?;
        }
        Ok(())
    })?;
    flush_puts(ctx, handle, &mut puts)
}

fn backfill_mixed(
    ctx: &JobContext,
    handle: &JobHandle,
    snapshot: &SchemaSnapshot,
    def: &IndexDefinition,
    backing: &str,
) -> Result<()> {
    let provider = ctx
        .backend
        .provider(backing)
        .ok_or(TramaError::BackendUnavailable(
            "index service not wired to this backend",
        ))?;
    // Field registration is idempotent; repeating it covers services that
    // lost their declarations since the index was created.
    for field in &def.fields {
        if let Some(key_def) = snapshot.prop_key(field.key) {
            provider.register(&def.name, &key_def.name, key_def.data_type)?;
        }
    }
    let mut batch: Vec<IndexMutation> = Vec::new();
    for_each_element(ctx.backend.kv(), def.element, |element, view| {
        if !def.admits_label(view.label()) {
            return Ok(());
        }
        let mut additions: Vec<IndexEntry> = Vec::new();
        for field in &def.fields {
            let Some(key_def) = snapshot.prop_key(field.key) else {
                continue;
            };
            for value in view.values(field.key) {
                additions.push(IndexEntry {
                    field: key_def.name.clone(),
                    value,
                });
            }
        }
        if additions.is_empty() {
            return Ok(());
        }
        batch.push(IndexMutation {
            index: def.name.clone(),
            element,
            additions,
            deletions: Vec::new(),
            delete_all: false,
        });
        if batch.len() >= JOB_CHUNK {
            flush_mutations(provider.as_ref(), handle, &mut batch)?;
        }
        Ok(())
    })?;
    flush_mutations(provider.as_ref(), handle, &mut batch)
}

fn backfill_edge_relation(
    ctx: &JobContext,
    handle: &JobHandle,
    def: &IndexDefinition,
    label: EdgeLabelId,
) -> Result<()> {
    let kv = ctx.backend.kv();
    let mut puts: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
    let mut skipped = 0u64;
    for (_, raw) in kv.scan_prefix(&keyspace::edge_prefix())? {
        let record: EdgeRecord = decode_record(&raw)?;
        if record.label != label || record.superseded {
            continue;
        }
        let keys = edge_relation_keys(def, &record, ElementId::Edge(record.id));
        if keys.is_empty() {
            // Edges written before the sort keys existed stay unindexed.
            skipped += 1;
            continue;
        }
        for key in keys {
            puts.push((key, Vec::new()));
        }
        if puts.len() >= JOB_CHUNK {
            flush_puts(ctx, handle, &mut puts)?;
        }
    }
    flush_puts(ctx, handle, &mut puts)?;
    if skipped > 0 {
        warn!(index = %def.name, skipped, "job.reindex_missing_sort_keys");
    }
    Ok(())
}

fn backfill_property_relation(
    ctx: &JobContext,
    handle: &JobHandle,
    def: &IndexDefinition,
    base: PropKeyId,
) -> Result<()> {
    let kv = ctx.backend.kv();
    let mut puts: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
    for (_, raw) in kv.scan_prefix(&keyspace::vertex_prefix())? {
        let record: VertexRecord = decode_record(&raw)?;
        for key in property_relation_keys(def, base, record.id, Some(&record)) {
            puts.push((key, Vec::new()));
        }
        if puts.len() >= JOB_CHUNK {
            flush_puts(ctx, handle, &mut puts)?;
        }
    }
    flush_puts(ctx, handle, &mut puts)
}

fn flush_puts(
    ctx: &JobContext,
    handle: &JobHandle,
    puts: &mut Vec<(Vec<u8>, Vec<u8>)>,
) -> Result<()> {
    if puts.is_empty() {
        return Ok(());
    }
    let added = puts.len() as u64;
    ctx.backend
        .kv()
        .apply(std::mem::take(puts), Vec::new(), &[])?;
    handle.record(added, 0);
    Ok(())
}

fn flush_mutations(
    provider: &dyn IndexProvider,
    handle: &JobHandle,
    batch: &mut Vec<IndexMutation>,
) -> Result<()> {
    if batch.is_empty() {
        return Ok(());
    }
    let added: u64 = batch.iter().map(|m| m.additions.len() as u64).sum();
    provider.mutate(std::mem::take(batch))?;
    handle.record(added, 0);
    Ok(())
}

fn purge_prefix(ctx: &JobContext, handle: &JobHandle, prefix: &[u8]) -> Result<()> {
    let kv = ctx.backend.kv();
    let mut deletes: Vec<Vec<u8>> = Vec::new();
    for (key, _) in kv.scan_prefix(prefix)? {
        deletes.push(key);
        if deletes.len() >= JOB_CHUNK {
            let count = deletes.len() as u64;
            kv.apply(Vec::new(), std::mem::take(&mut deletes), &[])?;
            handle.record(0, count);
        }
    }
    if !deletes.is_empty() {
        let count = deletes.len() as u64;
        kv.apply(Vec::new(), deletes, &[])?;
        handle.record(0, count);
    }
    Ok(())
}
