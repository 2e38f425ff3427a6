//! In-process exclusive locks keyed by opaque byte tuples. One table is
//! shared by every store instance wired to the same backend, standing in
//! for the distributed lock service a remote deployment would use.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashSet;
use tracing::trace;

use crate::types::{Result, TramaError};

/// Key serializing all schema-mutating transactions.
pub(crate) fn management_key() -> Vec<u8> {
    vec![0xFF]
}

/// Exclusive byte-keyed lock table.
///
/// Acquisition is all-or-nothing: a waiter holds no key until every
/// requested key is free, so overlapping acquisitions cannot deadlock.
#[derive(Debug)]
pub struct LockManager {
    held: Mutex<FxHashSet<Vec<u8>>>,
    released: Condvar,
}

impl LockManager {
    /// Empty table.
    pub fn new() -> Self {
        LockManager {
            held: Mutex::new(FxHashSet::default()),
            released: Condvar::new(),
        }
    }

    /// Acquires every key, blocking until all are free or `timeout`
    /// elapses. Times out with [`TramaError::LockConflict`]; callers are
    /// expected to retry the whole transaction.
    pub fn acquire(&self, mut keys: Vec<Vec<u8>>, timeout: Duration) -> Result<LockGuard<'_>> {
        keys.sort();
        keys.dedup();
        if keys.is_empty() {
            return Ok(LockGuard {
                manager: self,
                keys,
            });
        }
        let deadline = Instant::now() + timeout;
        let mut held = self.held.lock();
        loop {
            if keys.iter().all(|k| !held.contains(k)) {
                for key in &keys {
                    held.insert(key.clone());
                }
                trace!(keys = keys.len(), "locks.acquire");
                return Ok(LockGuard {
                    manager: self,
                    keys,
                });
            }
            if self.released.wait_until(&mut held, deadline).timed_out() {
                if keys.iter().all(|k| !held.contains(k)) {
                    for key in &keys {
                        held.insert(key.clone());
                    }
                    return Ok(LockGuard {
                        manager: self,
                        keys,
                    });
                }
                return Err(TramaError::LockConflict(
                    "timed out waiting for a conflicting transaction".to_string(),
                ));
            }
        }
    }

    /// How many keys are currently held, for diagnostics.
    pub fn held_count(&self) -> usize {
        self.held.lock().len()
    }
}

impl Default for LockManager {
    fn default() -> Self {
        LockManager::new()
    }
}

/// Keys held until drop.
#[derive(Debug)]
pub struct LockGuard<'a> {
    manager: &'a LockManager,
    keys: Vec<Vec<u8>>,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if self.keys.is_empty() {
            return;
        }
        let mut held = self.manager.held.lock();
        for key in &self.keys {
            held.remove(key);
        }
        drop(held);
        self.manager.released.notify_all();
    }
}
