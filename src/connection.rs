//! Cluster connection pool.
//!
//! Reference-counted, garbage-collected pool of connections to Ceph
//! clusters, keyed by `(monitors, user, key)`. `ceph_client.rs` holds a
//! single connection handle per `CephClient` built from `(user_id,
//! config_file)`; this generalizes that into a pool that owns many such
//! handles and hands out borrowed references for the duration of one RPC.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::DriverResult;

/// Default idle expiry before a zero-refcount connection is swept.
pub const DEFAULT_EXPIRY: Duration = Duration::from_secs(10 * 60);

/// A live connection to a single Ceph cluster. Does not hold a real librados
/// handle (that library is an external, opaque collaborator);
/// it is the logical "we are authenticated against this cluster" token that
/// every OMAP/command operation is scoped under.
#[derive(Debug)]
pub struct ClusterConnection {
    pub monitors: Vec<String>,
    pub user: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ConnectionKey {
    monitors: Vec<String>,
    user: String,
    key_digest: u64,
}

impl ConnectionKey {
    fn new(monitors: &[String], user: &str, key_material: &str) -> Self {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key_material.hash(&mut hasher);
        ConnectionKey {
            monitors: monitors.to_vec(),
            user: user.to_string(),
            key_digest: hasher.finish(),
        }
    }
}

struct PoolEntry {
    conn: Arc<ClusterConnection>,
    in_use: usize,
    last_used: Instant,
}

/// Reference-counted, swept pool of [`ClusterConnection`]s.
///
/// `Get` increments the in-use counter and returns a handle; `Put` (done
/// implicitly by dropping [`PooledConnection`]) decrements it. A periodic
/// sweep disposes entries whose counter is zero and whose idle time exceeds
/// `expiry`.
pub struct ConnectionPool {
    entries: Mutex<HashMap<ConnectionKey, PoolEntry>>,
    expiry: Duration,
}

impl ConnectionPool {
    pub fn new() -> Self {
        ConnectionPool {
            entries: Mutex::new(HashMap::new()),
            expiry: DEFAULT_EXPIRY,
        }
    }

    pub fn with_expiry(expiry: Duration) -> Self {
        ConnectionPool {
            entries: Mutex::new(HashMap::new()),
            expiry,
        }
    }

    /// Gets (creating if absent) a connection for `(monitors, user, key)`,
    /// incrementing its in-use counter. The returned guard decrements the
    /// counter on drop.
    pub fn get(
        self: &Arc<Self>,
        monitors: &[String],
        user: &str,
        key_material: &str,
    ) -> DriverResult<PooledConnection> {
        let key = ConnectionKey::new(monitors, user, key_material);
        let mut entries = self.entries.lock();
        let entry = entries.entry(key.clone()).or_insert_with(|| PoolEntry {
            conn: Arc::new(ClusterConnection {
                monitors: monitors.to_vec(),
                user: user.to_string(),
            }),
            in_use: 0,
            last_used: Instant::now(),
        });
        entry.in_use += 1;
        entry.last_used = Instant::now();
        let conn = entry.conn.clone();
        drop(entries);
        Ok(PooledConnection {
            pool: self.clone(),
            key,
            conn,
        })
    }

    fn put(&self, key: &ConnectionKey) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(key) {
            entry.in_use = entry.in_use.saturating_sub(1);
            entry.last_used = Instant::now();
        }
    }

    /// Disposes entries whose in-use counter is zero and whose idle time
    /// exceeds `self.expiry`. Intended to be called from a periodic task.
    pub fn sweep_expired(&self, now: Instant) {
        let mut entries = self.entries.lock();
        entries.retain(|_, entry| entry.in_use > 0 || now.duration_since(entry.last_used) < self.expiry);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Pool shutdown panics if any entry still has in-use references — this
    /// is an invariant violation, not a recoverable error.
    pub fn shutdown(&self) {
        let entries = self.entries.lock();
        let busy: Vec<_> = entries.iter().filter(|(_, e)| e.in_use > 0).collect();
        assert!(
            busy.is_empty(),
            "connection pool shutdown with {} entries still in use",
            busy.len()
        );
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new()
    }
}

/// A borrowed connection handle. The pool is the sole owner; this type only
/// borrows for the duration of one RPC, recasting the
/// source's cyclic VolumeOptions↔connection reference.
pub struct PooledConnection {
    pool: Arc<ConnectionPool>,
    key: ConnectionKey,
    conn: Arc<ClusterConnection>,
}

impl std::ops::Deref for PooledConnection {
    type Target = ClusterConnection;
    fn deref(&self) -> &ClusterConnection {
        &self.conn
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.pool.put(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_reuses_entry_for_same_key() {
        let pool = Arc::new(ConnectionPool::new());
        let a = pool.get(&["10.0.0.1:6789".into()], "admin", "AQD==").unwrap();
        let b = pool.get(&["10.0.0.1:6789".into()], "admin", "AQD==").unwrap();
        assert_eq!(pool.len(), 1);
        assert!(Arc::ptr_eq(
            &(a.conn.clone() as Arc<ClusterConnection>),
            &(b.conn.clone() as Arc<ClusterConnection>)
        ));
    }

    #[test]
    fn different_key_material_yields_distinct_entries() {
        let pool = Arc::new(ConnectionPool::new());
        let _a = pool.get(&["10.0.0.1:6789".into()], "admin", "keyA").unwrap();
        let _b = pool.get(&["10.0.0.1:6789".into()], "admin", "keyB").unwrap();
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn sweep_disposes_idle_zero_refcount_entries() {
        let pool = Arc::new(ConnectionPool::with_expiry(Duration::from_millis(0)));
        {
            let _a = pool.get(&["10.0.0.1:6789".into()], "admin", "keyA").unwrap();
        }
        assert_eq!(pool.len(), 1);
        pool.sweep_expired(Instant::now() + Duration::from_millis(1));
        assert_eq!(pool.len(), 0);
    }

    #[test]
    fn shutdown_panics_if_entry_still_in_use() {
        let pool = Arc::new(ConnectionPool::new());
        let _held = pool.get(&["10.0.0.1:6789".into()], "admin", "keyA").unwrap();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| pool.shutdown()));
        assert!(result.is_err());
    }
}
