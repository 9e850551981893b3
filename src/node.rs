//! Node service.
//!
//! `NodeStageVolume`/`NodePublishVolume` and their inverses, plus startup
//! recovery of cached mounts. Grounded on `cloudfy-cacsi-driver`'s
//! `csi-node.rs` (tonic NodeService shape, `tokio::fs` usage) and the
//! `openebs-mayastor` CSI node service (access-mode validation, mount
//! idempotence checks before shelling out).

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::ClusterConfigStore;
use crate::connection::ConnectionPool;
use crate::csi_types::{
    AccessType, NodePublishVolumeRequest, NodePublishVolumeResponse, NodeStageVolumeRequest, NodeStageVolumeResponse,
    NodeUnpublishVolumeRequest, NodeUnpublishVolumeResponse, NodeUnstageVolumeRequest, NodeUnstageVolumeResponse,
};
use crate::error::{DriverError, DriverResult};
use crate::executor::CephExecutor;
use crate::identifier::CsiIdentifier;
use crate::locks::LockSet;
use crate::mount_cache::{self, MountCache};
use crate::mounter::{MountRequest, Mounter, MounterKind};
use crate::secrets::{CredentialKind, ScratchSecret};
use crate::volume_options::VolumeOptions;

/// Keys this module smuggles through `MountCacheEntry.secrets` alongside the
/// real CSI secrets, so `remount_one` can rebuild `VolumeOptions` from the
/// cache file alone rather than round-tripping the connection pool and
/// cluster config store at recovery time.
const CACHE_MONITORS_KEY: &str = "__monitors";
const CACHE_ROOT_PATH_KEY: &str = "__rootPath";
const CACHE_FS_NAME_KEY: &str = "__fsName";
const CACHE_SUBVOLUME_GROUP_KEY: &str = "__subvolumeGroup";

pub struct NodeService {
    mounter: Arc<Mounter>,
    mount_cache: Arc<MountCache>,
    volume_locks: LockSet<String>,
    executor: CephExecutor,
    connection_pool: Arc<ConnectionPool>,
    cluster_config: Option<Arc<ClusterConfigStore>>,
    fs_name: String,
    metadata_pool: String,
    subvolume_group: String,
    scratch_dir: PathBuf,
}

impl NodeService {
    pub fn new(
        mounter: Arc<Mounter>,
        mount_cache: Arc<MountCache>,
        executor: CephExecutor,
        fs_name: String,
        metadata_pool: String,
        subvolume_group: String,
        scratch_dir: PathBuf,
    ) -> Self {
        NodeService {
            mounter,
            mount_cache,
            volume_locks: LockSet::new(),
            executor,
            connection_pool: Arc::new(ConnectionPool::new()),
            cluster_config: None,
            fs_name,
            metadata_pool,
            subvolume_group,
            scratch_dir,
        }
    }

    /// Wires in cluster config resolution for volume IDs whose context
    /// doesn't carry its own `monitors`.
    pub fn with_cluster_config(mut self, store: Arc<ClusterConfigStore>) -> Self {
        self.cluster_config = Some(store);
        self
    }

    /// Assembles `VolumeOptions` for a stage request in the precedence a
    /// Kubernetes CSI node plugin sees requests in: a pre-provisioned static
    /// volume's context carries everything already; a pre-versioned ("1.0.0")
    /// legacy context carries raw `monitors` instead of a `clusterID`;
    /// otherwise the volume ID itself is decoded and its cluster resolved.
    async fn resolve_volume_options(&self, req: &NodeStageVolumeRequest) -> DriverResult<VolumeOptions> {
        let static_volume = req.volume_context.get("staticVolume").map(|v| v == "true").unwrap_or(false);
        if static_volume {
            return VolumeOptions::from_static_volume(&req.volume_context);
        }
        if req.volume_context.contains_key("monitors") && !req.volume_context.contains_key("clusterID") {
            return VolumeOptions::from_legacy_context(&req.volume_context);
        }

        let identifier = CsiIdentifier::decode(&req.volume_id)?;
        let monitors = match &self.cluster_config {
            Some(store) => store.get(&identifier.cluster_id)?.monitors,
            None => split_csv(req.volume_context.get("monitors").map(String::as_str).unwrap_or("")),
        };
        let user = provisioning_user(&req.volume_context, &req.secrets)?;
        let key = provisioning_key(&req.volume_context, &req.secrets)?;
        let conn = self.connection_pool.get(&monitors, &user, &key)?;
        let (mut opts, _identifier) = VolumeOptions::from_vol_id(
            &req.volume_id,
            monitors,
            self.fs_name.clone(),
            self.metadata_pool.clone(),
            self.subvolume_group.clone(),
            &conn,
        )?;
        opts.root_path = req.volume_context.get("rootPath").cloned();
        Ok(opts)
    }

    pub async fn node_stage_volume(&self, req: NodeStageVolumeRequest) -> DriverResult<NodeStageVolumeResponse> {
        validate_non_empty(&req.volume_id, "volume_id")?;
        validate_non_empty(&req.staging_target_path, "staging_target_path")?;
        if req.secrets.is_empty() {
            return Err(DriverError::InvalidArgument("secrets must not be empty".to_string()));
        }
        let _guard = self.volume_locks.acquire_or_abort(req.volume_id.clone())?;

        if is_mount_point(&req.staging_target_path).await? {
            tracing::debug!(volume_id = %req.volume_id, "NodeStageVolume: already staged, idempotent return");
            return Ok(NodeStageVolumeResponse);
        }

        let mounter_override = req
            .volume_context
            .get("mounter")
            .map(|s| MounterKind::parse(s))
            .transpose()?;
        let kind = self.mounter.select(mounter_override)?;

        let opts = self.resolve_volume_options(&req).await?;
        let root_path = opts.root_path.clone().unwrap_or_else(|| "/".to_string());
        let provisioning = req.volume_context.get("provisionVolume").map(|v| v == "true").unwrap_or(false);
        let user = provisioning_user(&req.volume_context, &req.secrets)?;
        let key = provisioning_key(&req.volume_context, &req.secrets)?;

        std::fs::create_dir_all(&req.staging_target_path)?;

        // The kernel client reads its secret from a file path
        // (`secretfile=`); FUSE takes the key material inline. The scratch
        // file only needs to survive the mount syscall itself, so it's
        // erased as soon as this block exits.
        let (key_or_keyfile, _scratch): (String, Option<ScratchSecret>) = match kind {
            MounterKind::Fuse => (key.clone(), None),
            MounterKind::Kernel => {
                let credential_kind = if provisioning { CredentialKind::Admin } else { CredentialKind::User };
                let scratch = ScratchSecret::write(&self.scratch_dir, &req.volume_id, &key, credential_kind)?;
                let path = scratch.path().to_string_lossy().into_owned();
                (path, Some(scratch))
            }
        };

        let mount_req = MountRequest {
            mount_point: &req.staging_target_path,
            monitors: &opts.monitors,
            root_path: &root_path,
            user: &user,
            key_or_keyfile: &key_or_keyfile,
            config_path: None,
        };
        self.mounter.mount(kind, &mount_req).await?;

        let mut cache_secrets = req.secrets.clone();
        cache_secrets.insert(CACHE_MONITORS_KEY.to_string(), opts.monitors.join(","));
        cache_secrets.insert(CACHE_ROOT_PATH_KEY.to_string(), root_path);
        cache_secrets.insert(CACHE_FS_NAME_KEY.to_string(), opts.fs_name.clone());
        cache_secrets.insert(CACHE_SUBVOLUME_GROUP_KEY.to_string(), opts.subvolume_group.clone());
        self.mount_cache
            .node_stage_volume(&req.volume_id, &req.staging_target_path, kind, &cache_secrets)?;
        Ok(NodeStageVolumeResponse)
    }

    pub async fn node_publish_volume(&self, req: NodePublishVolumeRequest) -> DriverResult<NodePublishVolumeResponse> {
        validate_non_empty(&req.volume_id, "volume_id")?;
        validate_non_empty(&req.target_path, "target_path")?;
        validate_non_empty(&req.staging_target_path, "staging_target_path")?;
        let _guard = self.volume_locks.acquire_or_abort(req.volume_id.clone())?;

        std::fs::create_dir_all(&req.target_path)?;
        std::fs::set_permissions(&req.target_path, std::fs::Permissions::from_mode(0o750))?;

        if is_mount_point(&req.target_path).await? {
            tracing::debug!(volume_id = %req.volume_id, "NodePublishVolume: already published, idempotent return");
            return Ok(NodePublishVolumeResponse);
        }

        let readonly = req.readonly || req.volume_capability.access_mode.is_readonly();
        let mount_flags = match &req.volume_capability.access_type {
            AccessType::Mount { mount_flags, .. } => mount_flags.clone(),
            AccessType::Block => Vec::new(),
        };
        self.mounter
            .bind_mount(&req.staging_target_path, &req.target_path, readonly, &mount_flags)
            .await?;
        std::fs::set_permissions(&req.target_path, std::fs::Permissions::from_mode(0o777))?;

        self.mount_cache
            .node_publish_volume(&req.volume_id, &req.target_path, readonly)?;
        Ok(NodePublishVolumeResponse)
    }

    pub async fn node_unpublish_volume(&self, req: NodeUnpublishVolumeRequest) -> DriverResult<NodeUnpublishVolumeResponse> {
        validate_non_empty(&req.volume_id, "volume_id")?;
        validate_non_empty(&req.target_path, "target_path")?;
        let _guard = self.volume_locks.acquire_or_abort(req.volume_id.clone())?;

        // Cache bookkeeping is removed before the unmount itself, so a crash
        // mid-unmount cannot leave a stale entry.
        self.mount_cache.node_unpublish_volume(&req.volume_id, &req.target_path)?;
        match self.mounter.unmount(&req.target_path).await {
            Ok(()) => {}
            Err(DriverError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        Ok(NodeUnpublishVolumeResponse)
    }

    pub async fn node_unstage_volume(&self, req: NodeUnstageVolumeRequest) -> DriverResult<NodeUnstageVolumeResponse> {
        validate_non_empty(&req.volume_id, "volume_id")?;
        validate_non_empty(&req.staging_target_path, "staging_target_path")?;
        let _guard = self.volume_locks.acquire_or_abort(req.volume_id.clone())?;

        self.mount_cache.node_unstage_volume(&req.volume_id)?;
        match self.mounter.unmount(&req.staging_target_path).await {
            Ok(()) => {}
            Err(DriverError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        Ok(NodeUnstageVolumeResponse)
    }

    /// Reconstructs every cached mount at node startup: rebuilds the mount,
    /// force-unmounting first if the staging path looks corrupted, then
    /// rebuilds every recorded target path's bind mount. Failures are
    /// counted but never abort the overall recovery pass.
    pub async fn remount_cached_volumes(&self) -> usize {
        let entries = match self.mount_cache.list_all() {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(error = %e, "RemountCachedVolumes: failed to enumerate mount cache");
                return 0;
            }
        };
        let mut failures = 0;
        for entry in entries {
            if let Err(e) = self.remount_one(&entry).await {
                tracing::warn!(volume_id = %entry.volume_id, error = %e, "RemountCachedVolumes: failed to recover entry");
                failures += 1;
            }
        }
        failures
    }

    async fn remount_one(&self, entry: &mount_cache::MountCacheEntry) -> DriverResult<()> {
        let identifier = CsiIdentifier::decode(&entry.volume_id)?;
        let secrets = mount_cache::decode_secrets(&entry.secrets)?;
        let fs_name = secrets.get(CACHE_FS_NAME_KEY).cloned().unwrap_or_else(|| self.fs_name.clone());
        let subvolume_group = secrets
            .get(CACHE_SUBVOLUME_GROUP_KEY)
            .cloned()
            .unwrap_or_else(|| self.subvolume_group.clone());

        if !self.subvolume_still_exists(&fs_name, &identifier.object_uuid, &subvolume_group).await? {
            tracing::warn!(
                volume_id = %entry.volume_id,
                "RemountCachedVolumes: backing subvolume is gone, dropping stale cache entry instead of remounting"
            );
            self.mount_cache.node_unstage_volume(&entry.volume_id)?;
            return Ok(());
        }

        if is_corrupted_mount(&entry.staging_path).await {
            let _ = self.mounter.unmount(&entry.staging_path).await;
        }
        if !is_mount_point(&entry.staging_path).await? {
            let kind = MounterKind::parse(&entry.mounter)?;
            let monitors = split_csv(secrets.get(CACHE_MONITORS_KEY).map(String::as_str).unwrap_or(""));
            let root_path = secrets.get(CACHE_ROOT_PATH_KEY).cloned().unwrap_or_else(|| "/".to_string());
            let user = provisioning_user(&HashMap::new(), &secrets)?;
            let key = provisioning_key(&HashMap::new(), &secrets)?;
            let (key_or_keyfile, _scratch): (String, Option<ScratchSecret>) = match kind {
                MounterKind::Fuse => (key.clone(), None),
                MounterKind::Kernel => {
                    let scratch = ScratchSecret::write(&self.scratch_dir, &entry.volume_id, &key, CredentialKind::Admin)?;
                    let path = scratch.path().to_string_lossy().into_owned();
                    (path, Some(scratch))
                }
            };
            let mount_req = MountRequest {
                mount_point: &entry.staging_path,
                monitors: &monitors,
                root_path: &root_path,
                user: &user,
                key_or_keyfile: &key_or_keyfile,
                config_path: None,
            };
            self.mounter.mount(kind, &mount_req).await?;
        }
        for target in &entry.target_paths {
            if !is_mount_point(&target.path).await? {
                self.mounter.bind_mount(&entry.staging_path, &target.path, target.readonly, &[]).await?;
            }
        }
        Ok(())
    }

    async fn subvolume_still_exists(&self, fs_name: &str, uuid: &str, subvolume_group: &str) -> DriverResult<bool> {
        match self
            .executor
            .run("ceph", &["fs", "subvolume", "info", fs_name, uuid, "--group_name", subvolume_group])
            .await
        {
            Ok(_) => Ok(true),
            Err(DriverError::CommandFailed { stderr, .. }) if stderr.contains("does not exist") => Ok(false),
            Err(e) => Err(e),
        }
    }
}

fn validate_non_empty(value: &str, field: &str) -> DriverResult<()> {
    if value.is_empty() {
        return Err(DriverError::InvalidArgument(format!("{field} must not be empty")));
    }
    Ok(())
}

fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect()
}

fn provisioning_user(context: &HashMap<String, String>, secrets: &HashMap<String, String>) -> DriverResult<String> {
    let provision = context.get("provisionVolume").map(|v| v == "true").unwrap_or(false);
    let key = if provision { "adminID" } else { "userID" };
    secrets
        .get(key)
        .cloned()
        .ok_or_else(|| DriverError::InvalidArgument(format!("missing {key} in secrets")))
}

fn provisioning_key(context: &HashMap<String, String>, secrets: &HashMap<String, String>) -> DriverResult<String> {
    let provision = context.get("provisionVolume").map(|v| v == "true").unwrap_or(false);
    let key = if provision { "adminKey" } else { "userKey" };
    secrets
        .get(key)
        .cloned()
        .ok_or_else(|| DriverError::InvalidArgument(format!("missing {key} in secrets")))
}

/// Checks `/proc/mounts` for an entry at `path`. `ENOENT` on the mounts file
/// itself (non-Linux test environments) is treated as "not mounted".
async fn is_mount_point(path: &str) -> DriverResult<bool> {
    let data = match tokio::fs::read_to_string("/proc/mounts").await {
        Ok(d) => d,
        Err(_) => return Ok(false),
    };
    Ok(data.lines().any(|line| line.split_whitespace().nth(1) == Some(path)))
}

/// Detects the corrupted-mount signatures this driver treats as fatal
/// (ENOTCONN/ESTALE/EIO/EACCES surfacing from a stat of the staging path).
async fn is_corrupted_mount(path: &str) -> bool {
    match tokio::fs::metadata(path).await {
        Ok(_) => false,
        Err(e) => matches!(
            e.raw_os_error(),
            Some(libc::ENOTCONN) | Some(libc::ESTALE) | Some(libc::EIO) | Some(libc::EACCES)
        ),
    }
}
