//! Store facade: the shared backend bundle, instance lifecycle, and
//! transaction entry points.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tracing::{debug, info};

use crate::backend::codec::{decode_u64, keyspace};
use crate::backend::memory::{MemoryIndexProvider, MemoryKv};
use crate::backend::{IndexCapabilities, IndexProvider, KvStore};
use crate::mgmt::registry::InstanceRegistry;
use crate::mgmt::{watcher, ManagementTx, RegistrationReport};
use crate::schema::{SchemaCatalog, SchemaSnapshot};
use crate::txn::locks::LockManager;
use crate::txn::Transaction;
use crate::types::{InstanceId, Result, SchemaVersion};

pub mod config;

pub use config::StoreConfig;

/// Collaborators shared by every store instance of one deployment: the
/// key-value store, the registered index services, the lock service, and
/// the element id allocator. Cloning is cheap and clones share state, so
/// instances opened from the same backend interlock correctly.
#[derive(Clone)]
pub struct Backend {
    inner: Arc<BackendInner>,
}

struct BackendInner {
    kv: Arc<dyn KvStore>,
    providers: FxHashMap<String, Arc<dyn IndexProvider>>,
    capabilities: FxHashMap<String, IndexCapabilities>,
    locks: LockManager,
    ids: AtomicU64,
}

impl Backend {
    /// Bundles externally created collaborators. Capabilities are sampled
    /// once per provider at bundle time.
    pub fn new(kv: Arc<dyn KvStore>, providers: Vec<Arc<dyn IndexProvider>>) -> Self {
        let mut by_name: FxHashMap<String, Arc<dyn IndexProvider>> = FxHashMap::default();
        let mut capabilities: FxHashMap<String, IndexCapabilities> = FxHashMap::default();
        for provider in providers {
            capabilities.insert(provider.name().to_owned(), provider.capabilities());
            by_name.insert(provider.name().to_owned(), provider);
        }
        Backend {
            inner: Arc::new(BackendInner {
                kv,
                providers: by_name,
                capabilities,
                locks: LockManager::new(),
                ids: AtomicU64::new(0),
            }),
        }
    }

    /// In-memory backend with a single index service named `"memory"`.
    pub fn in_memory() -> Self {
        Backend::new(
            Arc::new(MemoryKv::new()),
            vec![Arc::new(MemoryIndexProvider::new("memory"))],
        )
    }

    /// In-memory backend whose key-value store rejects guards, forcing the
    /// purely pessimistic commit path.
    pub fn in_memory_pessimistic() -> Self {
        Backend::new(
            Arc::new(MemoryKv::without_optimistic_locking()),
            vec![Arc::new(MemoryIndexProvider::new("memory"))],
        )
    }

    /// The shared key-value store.
    pub fn kv(&self) -> &dyn KvStore {
        self.inner.kv.as_ref()
    }

    pub(crate) fn kv_arc(&self) -> Arc<dyn KvStore> {
        Arc::clone(&self.inner.kv)
    }

    /// The index service registered under `name`.
    pub fn provider(&self, name: &str) -> Option<&Arc<dyn IndexProvider>> {
        self.inner.providers.get(name)
    }

    /// Capability declarations of every registered index service.
    pub fn capabilities(&self) -> &FxHashMap<String, IndexCapabilities> {
        &self.inner.capabilities
    }

    pub(crate) fn locks(&self) -> &LockManager {
        &self.inner.locks
    }

    /// Allocates one element id.
    pub(crate) fn next_id(&self) -> u64 {
        self.inner.ids.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Highest id handed out so far; persisted with every commit.
    pub(crate) fn id_watermark(&self) -> u64 {
        self.inner.ids.load(Ordering::Relaxed)
    }

    fn raise_id_floor(&self, floor: u64) {
        self.inner.ids.fetch_max(floor, Ordering::Relaxed);
    }
}

/// One open store instance over a shared backend.
///
/// Opening registers the instance in the shared registry; [`Store::close`]
/// deregisters it. Every [`Transaction`] pins the schema snapshot current
/// at begin; [`Store::refresh_schema`] republishes the shared catalog and
/// acknowledges its version, which is what schema-change gates on other
/// instances wait for.
pub struct Store {
    backend: Backend,
    config: StoreConfig,
    catalog: Arc<SchemaCatalog>,
    registry: InstanceRegistry,
}

impl Store {
    /// Opens an instance on `backend` and registers it.
    pub fn open(backend: Backend, config: StoreConfig) -> Result<Self> {
        if let Some(raw) = backend.kv().get(&keyspace::element_counter_key())? {
            backend.raise_id_floor(decode_u64(&raw)?);
        }
        let catalog = Arc::new(SchemaCatalog::open(backend.kv_arc())?);
        let registry = InstanceRegistry::new(backend.kv_arc());
        let version = catalog.snapshot().version();
        registry.register(&config.instance_id, version)?;
        info!(instance = %config.instance_id, version = version.0, "store.open");
        Ok(Store {
            backend,
            config,
            catalog,
            registry,
        })
    }

    /// Identifier this instance registered under.
    pub fn instance_id(&self) -> &InstanceId {
        &self.config.instance_id
    }

    /// The configuration this instance was opened with.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// The shared backend bundle.
    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    /// The schema catalog of this instance.
    pub fn catalog(&self) -> &SchemaCatalog {
        &self.catalog
    }

    /// The shared instance registry.
    pub fn registry(&self) -> &InstanceRegistry {
        &self.registry
    }

    /// Begins a transaction pinned to the currently published snapshot.
    pub fn begin(&self) -> Result<Transaction> {
        Ok(Transaction::new(
            self.backend.clone(),
            self.config.clone(),
            self.catalog.snapshot(),
        ))
    }

    /// Opens a management transaction. Schema writers are serialized
    /// through the shared lock service; the returned handle holds that
    /// lock until committed or dropped.
    pub fn manage(&self) -> Result<ManagementTx<'_>> {
        ManagementTx::begin(self)
    }

    /// Reloads the shared catalog, publishes it locally, and acknowledges
    /// the persisted version in the registry.
    pub fn refresh_schema(&self) -> Result<Arc<SchemaSnapshot>> {
        let snapshot = self.catalog.reload()?;
        self.registry
            .ack_version(&self.config.instance_id, snapshot.version())?;
        debug!(
            instance = %self.config.instance_id,
            version = snapshot.version().0,
            "store.refresh"
        );
        Ok(snapshot)
    }

    /// Blocks until every field of `index` reaches REGISTERED (or better) on
    /// every open instance, or until `timeout` passes. A timeout is reported
    /// through [`RegistrationReport::succeeded`], not as an error.
    pub fn await_registered(&self, index: &str, timeout: Duration) -> Result<RegistrationReport> {
        watcher::await_index_registered(
            &self.catalog,
            &self.registry,
            index,
            timeout,
            self.config.registration_poll_interval,
        )
    }

    /// Expels another instance's registration record. For crashed instances
    /// that can no longer acknowledge schema versions and would otherwise
    /// stall every registration gate.
    pub fn force_close_instance(&self, target: &InstanceId) -> Result<()> {
        self.registry
            .force_close(&self.config.instance_id, target)
    }

    pub(crate) fn catalog_arc(&self) -> Arc<SchemaCatalog> {
        Arc::clone(&self.catalog)
    }

    /// Version currently acknowledged by this instance.
    pub fn acked_version(&self) -> SchemaVersion {
        self.catalog.snapshot().version()
    }

    /// Deregisters the instance.
    pub fn close(self) -> Result<()> {
        self.registry.close(&self.config.instance_id)?;
        info!(instance = %self.config.instance_id, "store.close");
        Ok(())
    }
}
