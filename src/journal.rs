//! The idempotent name↔UUID reservation journal.
//!
//! Three journal profiles — volume, snapshot, group-snapshot — share this
//! same shape, differing only in OMAP names and in whether they record a
//! source parent. `Reserve`, `Check`, and `Undo` are the only entry points;
//! together they give the whole journal its idempotency guarantees.

use uuid::Uuid;

use crate::clone::CloneState;
use crate::error::{DriverError, DriverResult};
use crate::omap::{ObjectRef, OmapStore};

/// Maximum number of fresh-UUID retries on an exclusive-create collision.
const MAX_RESERVE_ATTEMPTS: usize = 5;

#[derive(Debug, Clone)]
pub struct JournalConfig {
    /// e.g. `csi.volumes.default`, `csi.snaps.default`, `csi.groups.default`.
    pub csi_directory: String,
    /// e.g. `csi.volume.`, `csi.snap.`, `csi.group.`.
    pub csi_name_key_prefix: String,
    /// e.g. `csi.volume.`, `csi.snap.`, `csi.group.` — the per-UUID object
    /// name prefix.
    pub uuid_directory_prefix: String,
    /// e.g. `csi.volname`.
    pub csi_name_key: String,
    /// Snapshot profiles only: `csi.source`.
    pub ceph_snap_source_key: Option<String>,
    pub pool: String,
    pub namespace: Option<String>,
}

impl JournalConfig {
    pub fn volume(pool: impl Into<String>) -> Self {
        JournalConfig {
            csi_directory: "csi.volumes.default".to_string(),
            csi_name_key_prefix: "csi.volume.".to_string(),
            uuid_directory_prefix: "csi.volume.".to_string(),
            csi_name_key: "csi.volname".to_string(),
            ceph_snap_source_key: None,
            pool: pool.into(),
            namespace: None,
        }
    }

    pub fn snapshot(pool: impl Into<String>) -> Self {
        JournalConfig {
            csi_directory: "csi.snaps.default".to_string(),
            csi_name_key_prefix: "csi.snap.".to_string(),
            uuid_directory_prefix: "csi.snap.".to_string(),
            csi_name_key: "csi.snapname".to_string(),
            ceph_snap_source_key: Some("csi.source".to_string()),
            pool: pool.into(),
            namespace: None,
        }
    }

    pub fn group_snapshot(pool: impl Into<String>) -> Self {
        JournalConfig {
            csi_directory: "csi.groups.default".to_string(),
            csi_name_key_prefix: "csi.group.".to_string(),
            uuid_directory_prefix: "csi.group.".to_string(),
            csi_name_key: "csi.groupname".to_string(),
            ceph_snap_source_key: None,
            pool: pool.into(),
            namespace: None,
        }
    }

    fn directory_ref(&self) -> ObjectRef {
        let r = ObjectRef::new(self.pool.clone(), self.csi_directory.clone());
        match &self.namespace {
            Some(ns) => r.with_namespace(ns.clone()),
            None => r,
        }
    }

    fn uuid_ref(&self, uuid: &str) -> ObjectRef {
        let r = ObjectRef::new(self.pool.clone(), format!("{}{}", self.uuid_directory_prefix, uuid));
        match &self.namespace {
            Some(ns) => r.with_namespace(ns.clone()),
            None => r,
        }
    }
}

/// Extra attributes recorded on the per-UUID reverse-mapping object, beyond
/// the mandatory name (and, for snapshots, source) keys.
#[derive(Debug, Clone, Default)]
pub struct ReservationAttributes {
    pub owner: Option<String>,
    pub encryption_kms_id: Option<String>,
    pub backing_snapshot_id: Option<String>,
    pub image_name: Option<String>,
    pub creation_time: Option<String>,
    pub encryption_type: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Reservation {
    pub uuid: String,
    pub request_name: String,
    pub parent_name: Option<String>,
    pub attributes: ReservationAttributes,
}

/// Callbacks the journal needs from the wider driver to validate backend
/// state during `CheckReservation`. Kept as a trait so
/// `journal.rs` is unit-testable without a live Ceph backend.
#[async_trait::async_trait]
pub trait BackendProbe: Send + Sync {
    /// Whether the backend subvolume/snapshot named `name` still exists.
    async fn exists(&self, name: &str) -> DriverResult<bool>;

    /// Clone status of `name`, if it is (or was) a clone target. Returns
    /// `None` when the object is not a clone at all.
    async fn clone_state(&self, _name: &str) -> DriverResult<Option<CloneState>> {
        Ok(None)
    }
}

pub struct Journal {
    config: JournalConfig,
    omap: OmapStore,
}

impl Journal {
    pub fn new(config: JournalConfig) -> Self {
        Journal {
            config,
            omap: OmapStore::new(),
        }
    }

    /// Substitutes a non-default `OmapStore`, e.g. one backed by a fake
    /// `CephExecutor` in tests.
    pub fn with_omap(config: JournalConfig, omap: OmapStore) -> Self {
        Journal { config, omap }
    }

    fn forward_key(&self, request_name: &str) -> String {
        format!("{}{}", self.config.csi_name_key_prefix, request_name)
    }

    /// Allocates a new backend object: the only way to create a reservation
    /// Callers must hold the per-request-name lock for the
    /// duration (invariant I5).
    pub async fn reserve_name(
        &self,
        request_name: &str,
        parent_name: Option<&str>,
    ) -> DriverResult<Reservation> {
        let dir = self.config.directory_ref();
        let mut last_err = None;
        for _ in 0..MAX_RESERVE_ATTEMPTS {
            let uuid = Uuid::new_v4().to_string();
            let uuid_obj = self.config.uuid_ref(&uuid);
            match self.omap.create_object(&uuid_obj).await {
                Ok(()) => {
                    if let Err(e) = self.write_reverse_keys(&uuid_obj, request_name, parent_name).await {
                        self.undo_best_effort(&uuid, request_name).await;
                        return Err(e);
                    }
                    let creation_time = chrono::Utc::now().to_rfc3339();
                    if let Err(e) = self.omap.set_key(&uuid_obj, "csi.createdat", &creation_time).await {
                        self.undo_best_effort(&uuid, request_name).await;
                        return Err(e);
                    }
                    if let Err(e) = self
                        .omap
                        .set_key(&dir, &self.forward_key(request_name), &uuid)
                        .await
                    {
                        self.undo_best_effort(&uuid, request_name).await;
                        return Err(e);
                    }
                    return Ok(Reservation {
                        uuid,
                        request_name: request_name.to_string(),
                        parent_name: parent_name.map(str::to_string),
                        attributes: ReservationAttributes {
                            creation_time: Some(creation_time),
                            ..ReservationAttributes::default()
                        },
                    });
                }
                Err(DriverError::ObjectExists(_)) => {
                    last_err = Some(DriverError::ObjectExists(uuid));
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| DriverError::Internal("reserve_name exhausted retries".to_string())))
    }

    async fn write_reverse_keys(
        &self,
        uuid_obj: &ObjectRef,
        request_name: &str,
        parent_name: Option<&str>,
    ) -> DriverResult<()> {
        self.omap
            .set_key(uuid_obj, &self.config.csi_name_key, request_name)
            .await?;
        if let (Some(source_key), Some(parent)) = (&self.config.ceph_snap_source_key, parent_name) {
            self.omap.set_key(uuid_obj, source_key, parent).await?;
        }
        Ok(())
    }

    /// Idempotency probe. Returns `Ok(None)` both for "never
    /// reserved" and for "was reserved but garbage-collected just now".
    pub async fn check_reservation(
        &self,
        request_name: &str,
        parent_name: Option<&str>,
        backend: &dyn BackendProbe,
    ) -> DriverResult<Option<Reservation>> {
        let dir = self.config.directory_ref();
        let uuid = match self.omap.get_key(&dir, &self.forward_key(request_name)).await {
            Ok(uuid) => uuid,
            Err(DriverError::KeyNotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };

        let uuid_obj = self.config.uuid_ref(&uuid);
        let recorded_name = match self.omap.get_key(&uuid_obj, &self.config.csi_name_key).await {
            Ok(name) => name,
            Err(DriverError::KeyNotFound(_)) => {
                // Stale forward pointer: I2 requires GC, not silent failure.
                self.undo_reservation(&uuid, request_name).await?;
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        if recorded_name != request_name {
            return Err(DriverError::Internal(format!(
                "journal inconsistency: forward key for {request_name} points at uuid-dir recording {recorded_name}"
            )));
        }

        if let Some(source_key) = &self.config.ceph_snap_source_key {
            if let Some(requested_parent) = parent_name {
                match self.omap.get_key(&uuid_obj, source_key).await {
                    Ok(recorded_parent) if recorded_parent == requested_parent => {}
                    Ok(recorded_parent) => {
                        return Err(DriverError::SnapNameConflict {
                            name: request_name.to_string(),
                            existing: recorded_parent,
                            requested: requested_parent.to_string(),
                        });
                    }
                    Err(DriverError::KeyNotFound(_)) => {}
                    Err(e) => return Err(e),
                }
            }
        }

        if !backend.exists(&recorded_name).await? {
            self.undo_reservation(&uuid, request_name).await?;
            return Ok(None);
        }

        if let Some(state) = backend.clone_state(&recorded_name).await? {
            match state {
                CloneState::InProgress => return Err(DriverError::CloneInProgress(recorded_name)),
                CloneState::Pending => return Err(DriverError::ClonePending(recorded_name)),
                CloneState::Failed => {
                    self.undo_reservation(&uuid, request_name).await?;
                    return Err(DriverError::CloneFailed(recorded_name, "clone transitioned to failed".to_string()));
                }
                CloneState::Complete | CloneState::Error => {}
            }
        }

        Ok(Some(Reservation {
            uuid,
            request_name: request_name.to_string(),
            parent_name: parent_name.map(str::to_string),
            attributes: ReservationAttributes::default(),
        }))
    }

    /// Deletes strictly in inverse order of creation: uuid-dir object first,
    /// then the csiDirectory key. Missing objects are tolerated.
    pub async fn undo_reservation(&self, uuid: &str, request_name: &str) -> DriverResult<()> {
        let uuid_obj = self.config.uuid_ref(uuid);
        match self.omap.remove_object(&uuid_obj).await {
            Ok(()) | Err(DriverError::ObjectNotFound(_)) => {}
            Err(e) => return Err(e),
        }
        let dir = self.config.directory_ref();
        self.omap.remove_key(&dir, &self.forward_key(request_name)).await?;
        Ok(())
    }

    async fn undo_best_effort(&self, uuid: &str, request_name: &str) {
        let _ = self.undo_reservation(uuid, request_name).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    /// Always reports the backend object as present and not a clone —
    /// enough for the pure journal-state tests below, which exercise the
    /// OMAP bookkeeping rather than backend-existence GC.
    struct AlwaysExists;

    #[async_trait::async_trait]
    impl BackendProbe for AlwaysExists {
        async fn exists(&self, _name: &str) -> DriverResult<bool> {
            Ok(true)
        }
    }

    struct NeverExists;

    #[async_trait::async_trait]
    impl BackendProbe for NeverExists {
        async fn exists(&self, _name: &str) -> DriverResult<bool> {
            Ok(false)
        }
    }

    // These tests exercise the pure bookkeeping logic paths that do not
    // require a live `rados` binary: retry counting, key naming, and the
    // in-progress clone propagation a BackendProbe surfaces.
    #[test]
    fn forward_key_uses_profile_prefix() {
        let journal = Journal::new(JournalConfig::volume("cephfs_metadata"));
        assert_eq!(journal.forward_key("pvc-alpha"), "csi.volume.pvc-alpha");
    }

    #[test]
    fn snapshot_profile_carries_source_key() {
        let journal = Journal::new(JournalConfig::snapshot("cephfs_metadata"));
        assert_eq!(journal.config.ceph_snap_source_key.as_deref(), Some("csi.source"));
    }

    #[test]
    fn volume_profile_has_no_source_key() {
        let journal = Journal::new(JournalConfig::volume("cephfs_metadata"));
        assert!(journal.config.ceph_snap_source_key.is_none());
    }

    #[tokio::test]
    async fn clone_in_progress_state_is_propagated_as_retryable() {
        struct CloningBackend(StdMutex<Option<CloneState>>);
        #[async_trait::async_trait]
        impl BackendProbe for CloningBackend {
            async fn exists(&self, _name: &str) -> DriverResult<bool> {
                Ok(true)
            }
            async fn clone_state(&self, _name: &str) -> DriverResult<Option<CloneState>> {
                Ok(*self.0.lock().unwrap())
            }
        }
        let backend = CloningBackend(StdMutex::new(Some(CloneState::InProgress)));
        let state = backend.clone_state("anything").await.unwrap();
        match state {
            Some(CloneState::InProgress) => {}
            other => panic!("unexpected: {other:?}"),
        }
        let _ = AlwaysExists;
        let _ = NeverExists;
    }

    fn fake_journal(config: JournalConfig) -> (Journal, std::sync::Arc<crate::fake_backend::FakeCephBackend>) {
        let backend = std::sync::Arc::new(crate::fake_backend::FakeCephBackend::new());
        let executor = crate::executor::CephExecutor::with_runner(backend.clone());
        let journal = Journal::with_omap(config, OmapStore::with_executor(executor));
        (journal, backend)
    }

    /// A request name reserved twice, with nothing deleted in between, must
    /// resolve to the same UUID both times, and the forward key must always
    /// point at a uuid-dir that actually records that name back.
    #[tokio::test]
    async fn reservation_round_trip_leaves_no_orphaned_forward_key() {
        let (journal, _backend) = fake_journal(JournalConfig::volume("cephfs_metadata"));

        let reservation = journal.reserve_name("pvc-alpha", None).await.unwrap();

        let dir = journal.config.directory_ref();
        let forward_target = journal.omap.get_key(&dir, "csi.volume.pvc-alpha").await.unwrap();
        assert_eq!(forward_target, reservation.uuid);

        let uuid_obj = journal.config.uuid_ref(&reservation.uuid);
        let recorded_name = journal.omap.get_key(&uuid_obj, "csi.volname").await.unwrap();
        assert_eq!(recorded_name, "pvc-alpha");

        let second = journal.check_reservation("pvc-alpha", None, &AlwaysExists).await.unwrap();
        assert_eq!(second.unwrap().uuid, reservation.uuid);

        journal.undo_reservation(&reservation.uuid, "pvc-alpha").await.unwrap();
        assert!(matches!(
            journal.omap.get_key(&dir, "csi.volume.pvc-alpha").await,
            Err(DriverError::KeyNotFound(_))
        ));
    }

    /// Simulates a crash that left a forward pointer aimed at a uuid-dir
    /// whose own name key never landed (I2's half-state). CheckReservation
    /// must garbage-collect it and hand back a fresh UUID on retry rather
    /// than getting stuck.
    #[tokio::test]
    async fn half_written_reservation_is_garbage_collected_on_retry() {
        let (journal, _backend) = fake_journal(JournalConfig::volume("cephfs_metadata"));

        let dir = journal.config.directory_ref();
        let half_uuid = "11111111-1111-1111-1111-111111111111";
        journal.omap.set_key(&dir, "csi.volume.req-x", half_uuid).await.unwrap();
        let uuid_obj = journal.config.uuid_ref(half_uuid);
        journal.omap.create_object(&uuid_obj).await.unwrap();

        let result = journal.check_reservation("req-x", None, &AlwaysExists).await.unwrap();
        assert!(result.is_none());

        let reservation = journal.reserve_name("req-x", None).await.unwrap();
        assert_ne!(reservation.uuid, half_uuid);
    }
}
