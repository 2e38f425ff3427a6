//! Polling gates over the instance registry and index lifecycle statuses.
//!
//! Schema changes only become safe to act on once every open instance has
//! acknowledged them. [`await_version`] is the building block background
//! jobs use for that; [`await_index_registered`] is the user-facing wait
//! for an index to leave `Installed` on every field.

use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::mgmt::registry::InstanceRegistry;
use crate::schema::{SchemaCatalog, SchemaStatus};
use crate::types::{InstanceId, PropKeyId, Result, SchemaVersion, TramaError};

/// Outcome of one [`await_version`] poll loop.
pub(crate) struct VersionGate {
    /// Whether every open instance acknowledged the version in time.
    pub converged: bool,
    /// Instances still behind when polling stopped. Empty on convergence.
    pub lagging: Vec<InstanceId>,
}

/// Polls the registry until every open instance has acknowledged `version`
/// or `timeout` elapses. Instances registering mid-wait are included; a
/// force-closed instance stops being waited on.
pub(crate) fn await_version(
    registry: &InstanceRegistry,
    version: SchemaVersion,
    timeout: Duration,
    poll: Duration,
) -> Result<VersionGate> {
    let deadline = Instant::now() + timeout;
    loop {
        let lagging: Vec<InstanceId> = registry
            .open_instances()?
            .into_iter()
            .filter(|row| row.acked < version)
            .map(|row| row.id)
            .collect();
        if lagging.is_empty() {
            debug!(version = version.0, "watcher.converged");
            return Ok(VersionGate {
                converged: true,
                lagging,
            });
        }
        let now = Instant::now();
        if now >= deadline {
            warn!(version = version.0, lagging = lagging.len(), "watcher.timeout");
            return Ok(VersionGate {
                converged: false,
                lagging,
            });
        }
        thread::sleep(poll.min(deadline - now));
    }
}

/// Outcome of [`crate::store::Store::await_registered`].
#[derive(Clone, Debug)]
pub struct RegistrationReport {
    /// Whether every field reached `Registered` or `Enabled` in time.
    pub succeeded: bool,
    /// Time spent polling.
    pub elapsed: Duration,
    /// Final observed status per indexed field.
    pub statuses: Vec<(PropKeyId, SchemaStatus)>,
    /// Instances that had not acknowledged the latest schema version when
    /// polling stopped, the usual reason a registration stalls. Empty on
    /// success.
    pub missing: Vec<InstanceId>,
}

/// Polls persisted statuses until every field of the named index is
/// `Registered` or `Enabled`. A deadline is reported, never raised as an
/// error; only an unknown index name or a backend failure is.
pub(crate) fn await_index_registered(
    catalog: &SchemaCatalog,
    registry: &InstanceRegistry,
    index: &str,
    timeout: Duration,
    poll: Duration,
) -> Result<RegistrationReport> {
    let started = Instant::now();
    let deadline = started + timeout;
    loop {
        let snapshot = catalog.reload()?;
        let def = snapshot.index_by_name(index).ok_or(TramaError::NotFound)?;
        let statuses: Vec<(PropKeyId, SchemaStatus)> = def
            .field_keys()
            .map(|key| {
                let status = snapshot
                    .index_status(def.id, key)
                    .unwrap_or(SchemaStatus::Installed);
                (key, status)
            })
            .collect();
        let registered = statuses.iter().all(|(_, status)| {
            matches!(status, SchemaStatus::Registered | SchemaStatus::Enabled)
        });
        if registered {
            debug!(index, "watcher.registered");
            return Ok(RegistrationReport {
                succeeded: true,
                elapsed: started.elapsed(),
                statuses,
                missing: Vec::new(),
            });
        }
        let now = Instant::now();
        if now >= deadline {
            let version = snapshot.version();
            let missing = registry
                .open_instances()?
                .into_iter()
                .filter(|row| row.acked < version)
                .map(|row| row.id)
                .collect();
            warn!(index, "watcher.registration_timeout");
            return Ok(RegistrationReport {
                succeeded: false,
                elapsed: started.elapsed(),
                statuses,
                missing,
            });
        }
        thread::sleep(poll.min(deadline - now));
    }
}
