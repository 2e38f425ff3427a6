//! Store configuration.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::types::InstanceId;

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

fn default_instance_id() -> InstanceId {
    InstanceId(format!(
        "trama-{}-{}",
        std::process::id(),
        NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed)
    ))
}

/// Behavioral knobs of one store instance.
///
/// Built fluently and handed to [`Store::open`](crate::store::Store::open):
///
/// ```
/// use trama::store::StoreConfig;
/// use std::time::Duration;
///
/// let config = StoreConfig::default()
///     .instance_id("replica-a")
///     .lock_timeout(Duration::from_millis(250))
///     .force_index_usage(true);
/// # let _ = config;
/// ```
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Identifier this instance registers under. Must be unique among open
    /// instances sharing a backend.
    pub instance_id: InstanceId,
    /// Reject query plans that would fall back to a full scan.
    pub force_index_usage: bool,
    /// How long a committer waits for conflicting locks before giving up.
    pub lock_timeout: Duration,
    /// Poll interval of the registration watcher.
    pub registration_poll_interval: Duration,
    /// How long background schema jobs wait for every open instance to
    /// acknowledge a schema version before failing.
    pub registration_timeout: Duration,
    /// Validate unique indexes at commit. Bulk loads of pre-validated data
    /// may disable this.
    pub verify_uniqueness: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            instance_id: default_instance_id(),
            force_index_usage: false,
            lock_timeout: Duration::from_secs(10),
            registration_poll_interval: Duration::from_millis(500),
            registration_timeout: Duration::from_secs(60),
            verify_uniqueness: true,
        }
    }
}

impl StoreConfig {
    /// Sets the instance identifier.
    pub fn instance_id(mut self, id: impl Into<InstanceId>) -> Self {
        self.instance_id = id.into();
        self
    }

    /// Rejects plans that would fall back to a full scan.
    pub fn force_index_usage(mut self, force: bool) -> Self {
        self.force_index_usage = force;
        self
    }

    /// Sets the lock wait deadline used at commit.
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Sets how often the registration watcher re-reads the registry.
    pub fn registration_poll_interval(mut self, interval: Duration) -> Self {
        self.registration_poll_interval = interval;
        self
    }

    /// Sets the acknowledgement deadline of background schema jobs.
    pub fn registration_timeout(mut self, timeout: Duration) -> Self {
        self.registration_timeout = timeout;
        self
    }

    /// Toggles commit-time unique index validation.
    pub fn verify_uniqueness(mut self, verify: bool) -> Self {
        self.verify_uniqueness = verify;
        self
    }
}
