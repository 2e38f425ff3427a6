//! Shared registry of open store instances.
//!
//! Every [`crate::store::Store`] registers itself under its instance id when
//! it opens and removes the row when it closes. Rows carry the highest
//! schema version the instance has acknowledged; the registration gate polls
//! them to decide when a schema change has propagated to the whole cluster.
//! A row left behind by a crashed process can be expelled with
//! [`InstanceRegistry::force_close`].

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backend::codec::keyspace;
use crate::backend::KvStore;
use crate::types::{InstanceId, Result, SchemaVersion, TramaError};

/// One open instance as recorded in the shared store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegistrationRecord {
    /// Instance id, unique across the deployment.
    pub id: InstanceId,
    /// Highest schema version the instance has applied locally.
    pub acked: SchemaVersion,
    /// Wall-clock registration time, milliseconds since the Unix epoch.
    pub registered_ms: u64,
}

/// Handle over the instance rows of the shared store.
#[derive(Clone)]
pub struct InstanceRegistry {
    kv: Arc<dyn KvStore>,
}

impl InstanceRegistry {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        InstanceRegistry { kv }
    }

    /// Registers an opening instance. Fails when a row with the same id is
    /// already present; a stale row must be expelled with
    /// [`InstanceRegistry::force_close`] first.
    pub fn register(&self, id: &InstanceId, acked: SchemaVersion) -> Result<()> {
        let key = keyspace::registry_key(&id.0);
        if self.kv.get(&key)?.is_some() {
            return Err(TramaError::Invalid(
                "an instance with this id is already open",
            ));
        }
        let record = RegistrationRecord {
            id: id.clone(),
            acked,
            registered_ms: now_ms(),
        };
        self.kv.apply(vec![(key, encode(&record)?)], Vec::new(), &[])?;
        info!(instance = %record.id, version = acked.0, "registry.register");
        Ok(())
    }

    /// Records that `id` has applied schema version `version`. Acks never
    /// move backwards.
    pub fn ack_version(&self, id: &InstanceId, version: SchemaVersion) -> Result<()> {
        let key = keyspace::registry_key(&id.0);
        let raw = self.kv.get(&key)?.ok_or(TramaError::NotFound)?;
        let mut record: RegistrationRecord = decode(&raw)?;
        if record.acked >= version {
            return Ok(());
        }
        record.acked = version;
        self.kv.apply(vec![(key, encode(&record)?)], Vec::new(), &[])?;
        debug!(instance = %record.id, version = version.0, "registry.ack");
        Ok(())
    }

    /// All registered instances, ordered by id.
    pub fn open_instances(&self) -> Result<Vec<RegistrationRecord>> {
        let mut rows = Vec::new();
        for (_, raw) in self.kv.scan_prefix(&keyspace::registry_prefix())? {
            rows.push(decode(&raw)?);
        }
        rows.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(rows)
    }

    /// Removes the row of a cleanly closing instance. Idempotent.
    pub fn close(&self, id: &InstanceId) -> Result<()> {
        let key = keyspace::registry_key(&id.0);
        if self.kv.get(&key)?.is_none() {
            return Ok(());
        }
        self.kv.apply(Vec::new(), vec![key], &[])?;
        info!(instance = %id, "registry.close");
        Ok(())
    }

    /// Expels the row of an instance that did not shut down cleanly. The
    /// caller must be certain the process behind it is gone; an expelled
    /// instance that is still alive will miss registration gates.
    pub fn force_close(&self, current: &InstanceId, target: &InstanceId) -> Result<()> {
        if target == current {
            return Err(TramaError::Invalid(
                "cannot force-close the current instance",
            ));
        }
        let key = keyspace::registry_key(&target.0);
        if self.kv.get(&key)?.is_none() {
            return Err(TramaError::NotFound);
        }
        self.kv.apply(Vec::new(), vec![key], &[])?;
        warn!(instance = %target, by = %current, "registry.force_close");
        Ok(())
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

fn encode(record: &RegistrationRecord) -> Result<Vec<u8>> {
    serde_json::to_vec(record)
        .map_err(|_| TramaError::Corruption("registration record not encodable"))
}

fn decode(raw: &[u8]) -> Result<RegistrationRecord> {
    serde_json::from_slice(raw)
        .map_err(|_| TramaError::Corruption("registration record not decodable"))
}
