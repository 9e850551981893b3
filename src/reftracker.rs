//! Reference tracker for shared snapshot-backed read-only volumes.
//!
//! A "shallow" RO volume doesn't copy its backing snapshot; it only bumps a
//! reference count recorded on the snapshot's own OMAP so `DeleteVolume`
//! knows whether it's safe to let the snapshot itself be reaped. Two kinds
//! of reference exist: `Normal` (a real RO volume bound to the snapshot) and
//! `Mask` (a placeholder held while a fan-out operation is mid-flight, so a
//! concurrent delete can't drop the count to zero under it).

use crate::error::{DriverError, DriverResult};
use crate::executor::CephExecutor;
use crate::omap::{ObjectRef, OmapStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefKind {
    Normal,
    Mask,
}

impl RefKind {
    fn key_prefix(self) -> &'static str {
        match self {
            RefKind::Normal => "csi.ref.",
            RefKind::Mask => "csi.mask.",
        }
    }
}

pub struct RefTracker {
    omap: OmapStore,
}

impl Default for RefTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl RefTracker {
    pub fn new() -> Self {
        RefTracker { omap: OmapStore::new() }
    }

    /// Substitutes a non-default executor, e.g. a fake backend in tests.
    pub fn with_executor(executor: CephExecutor) -> Self {
        RefTracker { omap: OmapStore::with_executor(executor) }
    }

    /// Adds a reference of `kind` keyed by `ref_id` against `snapshot_obj`'s
    /// OMAP. Idempotent: adding the same `(kind, ref_id)` twice is a no-op,
    /// since the key itself carries no count, only presence.
    pub async fn add(&self, snapshot_obj: &ObjectRef, kind: RefKind, ref_id: &str) -> DriverResult<()> {
        let key = format!("{}{}", kind.key_prefix(), ref_id);
        self.omap.set_key(snapshot_obj, &key, "1").await
    }

    /// Removes a reference. Missing is not an error (mirrors `OmapStore`'s
    /// `remove_key` semantics): a retried `DeleteVolume` after a crash must
    /// succeed even if the ref was already dropped.
    pub async fn remove(&self, snapshot_obj: &ObjectRef, kind: RefKind, ref_id: &str) -> DriverResult<()> {
        let key = format!("{}{}", kind.key_prefix(), ref_id);
        self.omap.remove_key(snapshot_obj, &key).await
    }

    /// Total outstanding references of any kind. `DeleteVolume`/snapshot GC
    /// consults this before tearing down the backing snapshot object.
    pub async fn count(&self, snapshot_obj: &ObjectRef) -> DriverResult<usize> {
        match self.omap.list_keys_with_prefix(snapshot_obj, "csi.ref.").await {
            Ok(refs) => {
                let masks = match self.omap.list_keys_with_prefix(snapshot_obj, "csi.mask.").await {
                    Ok(m) => m,
                    Err(DriverError::ObjectNotFound(_)) => Vec::new(),
                    Err(e) => return Err(e),
                };
                Ok(refs.len() + masks.len())
            }
            Err(DriverError::ObjectNotFound(_)) => Ok(0),
            Err(e) => Err(e),
        }
    }

    /// True if no normal or mask references remain, i.e. the backing
    /// snapshot is safe to garbage-collect.
    pub async fn is_unreferenced(&self, snapshot_obj: &ObjectRef) -> DriverResult<bool> {
        Ok(self.count(snapshot_obj).await? == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_and_mask_use_distinct_prefixes() {
        assert_eq!(RefKind::Normal.key_prefix(), "csi.ref.");
        assert_eq!(RefKind::Mask.key_prefix(), "csi.mask.");
        assert_ne!(RefKind::Normal.key_prefix(), RefKind::Mask.key_prefix());
    }

    #[tokio::test]
    async fn snapshot_stays_referenced_until_last_ref_drops() {
        let backend = std::sync::Arc::new(crate::fake_backend::FakeCephBackend::new());
        let executor = CephExecutor::with_runner(backend.clone());
        let tracker = RefTracker::with_executor(executor.clone());
        let omap = OmapStore::with_executor(executor);
        let snapshot_obj = ObjectRef::new("cephfs_metadata".to_string(), "csi.snap.abc".to_string());
        omap.create_object(&snapshot_obj).await.unwrap();

        tracker.add(&snapshot_obj, RefKind::Normal, "clone-1").await.unwrap();
        tracker.add(&snapshot_obj, RefKind::Normal, "clone-2").await.unwrap();
        assert!(!tracker.is_unreferenced(&snapshot_obj).await.unwrap());

        tracker.remove(&snapshot_obj, RefKind::Normal, "clone-1").await.unwrap();
        assert!(!tracker.is_unreferenced(&snapshot_obj).await.unwrap());

        tracker.remove(&snapshot_obj, RefKind::Normal, "clone-2").await.unwrap();
        assert!(tracker.is_unreferenced(&snapshot_obj).await.unwrap());
    }
}
