//! Per-name / per-ID lock set.
//!
//! Two independent instances are used by the controller/node services:
//! `VolumeLocks` keyed by VolumeID, `VolumeNameLocks` keyed by RequestName.
//! `try_acquire` is non-blocking; a contended key returns `false`, which
//! callers translate into `DriverError::AlreadyInProgress` at the wire layer.

use std::collections::HashSet;
use std::hash::Hash;

use parking_lot::Mutex;

use crate::error::{DriverError, DriverResult};

/// A set of keyed, non-blocking mutual-exclusion locks.
pub struct LockSet<K> {
    held: Mutex<HashSet<K>>,
}

impl<K: Eq + Hash + Clone + std::fmt::Display> LockSet<K> {
    pub fn new() -> Self {
        LockSet {
            held: Mutex::new(HashSet::new()),
        }
    }

    /// Attempts to acquire `key`. Returns `true` if acquired, `false` if
    /// already held by another in-flight operation.
    pub fn try_acquire(&self, key: K) -> bool {
        self.held.lock().insert(key)
    }

    pub fn release(&self, key: &K) {
        self.held.lock().remove(key);
    }

    /// Convenience wrapper matching the wire-layer contract:
    /// a contended key surfaces as `AlreadyInProgress` (-> CSI Aborted).
    pub fn acquire_or_abort(&self, key: K) -> DriverResult<LockGuard<'_, K>> {
        if self.try_acquire(key.clone()) {
            Ok(LockGuard { set: self, key })
        } else {
            Err(DriverError::AlreadyInProgress {
                key: key.to_string(),
            })
        }
    }
}

impl<K: Eq + Hash + Clone + std::fmt::Display> Default for LockSet<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard that releases its key when dropped.
pub struct LockGuard<'a, K: Eq + Hash + Clone + std::fmt::Display> {
    set: &'a LockSet<K>,
    key: K,
}

impl<'a, K: Eq + Hash + Clone + std::fmt::Display> Drop for LockGuard<'a, K> {
    fn drop(&mut self) {
        self.set.release(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_acquire_excludes_concurrent_holder() {
        let locks: LockSet<String> = LockSet::new();
        assert!(locks.try_acquire("req-y".to_string()));
        assert!(!locks.try_acquire("req-y".to_string()));
    }

    #[test]
    fn release_allows_reacquire() {
        let locks: LockSet<String> = LockSet::new();
        assert!(locks.try_acquire("req-y".to_string()));
        locks.release(&"req-y".to_string());
        assert!(locks.try_acquire("req-y".to_string()));
    }

    #[test]
    fn guard_releases_on_drop() {
        let locks: LockSet<String> = LockSet::new();
        {
            let _guard = locks.acquire_or_abort("vol-1".to_string()).unwrap();
            assert!(locks.acquire_or_abort("vol-1".to_string()).is_err());
        }
        assert!(locks.try_acquire("vol-1".to_string()));
    }

    #[test]
    fn different_keys_do_not_contend() {
        let locks: LockSet<String> = LockSet::new();
        assert!(locks.try_acquire("vol-1".to_string()));
        assert!(locks.try_acquire("vol-2".to_string()));
    }
}
