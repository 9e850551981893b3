//! VolumeOptions assembly.
//!
//! Five constructors resolve the full picture of "what volume is this
//! request talking about" from whatever the orchestrator handed us, in the
//! precedence order CreateVolume/NodeStage/NodeUnstage need: a decoded
//! VolumeID plus journal lookup, a static pre-provisioned volume, a legacy
//! pre-versioned context, a brand-new create request, and — nested inside
//! `NewVolumeOptions` — a backing-snapshot cross-check.
//!
//! Recast from a pointer-holding shape into a plain value type:
//! `VolumeOptions` borrows a connection for the lifetime of one RPC rather
//! than owning or sharing one across requests.

use std::collections::HashMap;

use crate::connection::PooledConnection;
use crate::error::{DriverError, DriverResult};
use crate::identifier::CsiIdentifier;

#[derive(Debug, Clone)]
pub struct VolumeOptions {
    pub cluster_id: String,
    pub monitors: Vec<String>,
    pub fs_name: String,
    pub metadata_pool: String,
    pub pool: Option<String>,
    pub subvolume_group: String,
    pub rados_namespace: Option<String>,
    pub root_path: Option<String>,
    pub static_volume: bool,
    pub provision_volume: bool,
    pub backing_snapshot_id: Option<String>,
    pub mounter: Option<String>,
}

impl VolumeOptions {
    /// `FromVolID`: decode the opaque VolumeID, resolve the owning cluster,
    /// and read back the attributes the journal recorded at create time.
    /// `conn`/`metadata_pool`/`fs_name` are pre-resolved by the caller
    /// (controller/node service), since fetching them is itself a Ceph round
    /// trip this module has no opinion on how to perform.
    pub fn from_vol_id(
        vol_id: &str,
        monitors: Vec<String>,
        fs_name: String,
        metadata_pool: String,
        subvolume_group: String,
        _conn: &PooledConnection,
    ) -> DriverResult<(Self, CsiIdentifier)> {
        let identifier = CsiIdentifier::decode(vol_id)?;
        let opts = VolumeOptions {
            cluster_id: identifier.cluster_id.clone(),
            monitors,
            fs_name,
            metadata_pool,
            pool: None,
            subvolume_group,
            rados_namespace: None,
            root_path: None,
            static_volume: false,
            provision_volume: true,
            backing_snapshot_id: None,
            mounter: None,
        };
        Ok((opts, identifier))
    }

    /// `FromStaticVolume`: `staticVolume=true` in the request context means
    /// no journal lookup happens at all; every field comes straight from the
    /// parameters map.
    pub fn from_static_volume(params: &HashMap<String, String>) -> DriverResult<Self> {
        Ok(VolumeOptions {
            cluster_id: required(params, "clusterID")?,
            monitors: split_monitors(&optional(params, "monitors").unwrap_or_default()),
            fs_name: required(params, "fsName")?,
            metadata_pool: optional(params, "pool").unwrap_or_default(),
            pool: optional(params, "pool"),
            subvolume_group: optional(params, "subvolumeGroup").unwrap_or_else(|| "csi".to_string()),
            rados_namespace: optional(params, "radosNamespace"),
            root_path: optional(params, "rootPath"),
            static_volume: true,
            provision_volume: optional(params, "provisionVolume")
                .map(|v| v == "true")
                .unwrap_or(false),
            backing_snapshot_id: optional(params, "backingSnapshotID"),
            mounter: optional(params, "mounter"),
        })
    }

    /// `FromLegacyContext`: pre-versioned (CSI driver "1.0.0") node contexts
    /// that carry `monitors` directly rather than `clusterID`. Read-only —
    /// nothing in this crate ever writes a new legacy-shaped context, it
    /// only round-trips the ones it's handed.
    pub fn from_legacy_context(params: &HashMap<String, String>) -> DriverResult<Self> {
        let monitors_raw = required(params, "monitors")?;
        Ok(VolumeOptions {
            cluster_id: String::new(),
            monitors: split_monitors(&monitors_raw),
            fs_name: optional(params, "fsName").unwrap_or_default(),
            metadata_pool: optional(params, "pool").unwrap_or_default(),
            pool: optional(params, "pool"),
            subvolume_group: optional(params, "subvolumeGroup").unwrap_or_else(|| "csi".to_string()),
            rados_namespace: None,
            root_path: Some(required(params, "rootPath")?),
            static_volume: true,
            provision_volume: optional(params, "provisionVolume")
                .map(|v| v == "true")
                .unwrap_or(false),
            backing_snapshot_id: optional(params, "backingSnapshotID"),
            mounter: optional(params, "mounter"),
        })
    }

    /// `NewVolumeOptions`: the CreateVolume-request path. Required/optional
    /// semantics per the parameter table below. `pool` is rejected
    /// outright when `backingSnapshot=true`, since a shallow RO volume must
    /// inherit its parent's pool rather than accept an override.
    pub fn new_volume_options(params: &HashMap<String, String>) -> DriverResult<Self> {
        let backing_snapshot = optional(params, "backingSnapshot")
            .map(|v| v == "true")
            .unwrap_or(false);
        if backing_snapshot && params.contains_key("pool") {
            return Err(DriverError::InvalidArgument(
                "pool cannot be set when backingSnapshot=true".to_string(),
            ));
        }
        Ok(VolumeOptions {
            cluster_id: required(params, "clusterID")?,
            monitors: Vec::new(),
            fs_name: required(params, "fsName")?,
            metadata_pool: optional(params, "pool").unwrap_or_default(),
            pool: optional(params, "pool"),
            subvolume_group: optional(params, "subvolumeGroup").unwrap_or_else(|| "csi".to_string()),
            rados_namespace: optional(params, "radosNamespace"),
            root_path: None,
            static_volume: optional(params, "staticVolume").map(|v| v == "true").unwrap_or(false),
            provision_volume: true,
            backing_snapshot_id: optional(params, "backingSnapshotID"),
            mounter: optional(params, "mounter"),
        })
    }

    /// Cross-checks a shallow RO volume's options against the snapshot it's
    /// backed by: `clusterID`, `MetadataPool`, `FsName`, `SubvolumeGroup`
    /// must all match, or the mismatched field is named in the error.
    pub fn populate_from_backing_snapshot(&mut self, parent: &VolumeOptions) -> DriverResult<()> {
        if self.cluster_id.is_empty() {
            self.cluster_id = parent.cluster_id.clone();
        } else if self.cluster_id != parent.cluster_id {
            return Err(mismatch("clusterID", &parent.cluster_id, &self.cluster_id));
        }
        if self.metadata_pool.is_empty() {
            self.metadata_pool = parent.metadata_pool.clone();
        } else if self.metadata_pool != parent.metadata_pool {
            return Err(mismatch("MetadataPool", &parent.metadata_pool, &self.metadata_pool));
        }
        if self.fs_name.is_empty() {
            self.fs_name = parent.fs_name.clone();
        } else if self.fs_name != parent.fs_name {
            return Err(mismatch("FsName", &parent.fs_name, &self.fs_name));
        }
        if self.subvolume_group.is_empty() || self.subvolume_group == "csi" {
            self.subvolume_group = parent.subvolume_group.clone();
        } else if self.subvolume_group != parent.subvolume_group {
            return Err(mismatch("SubvolumeGroup", &parent.subvolume_group, &self.subvolume_group));
        }
        Ok(())
    }

    pub fn validate_mounter(&self) -> DriverResult<()> {
        match self.mounter.as_deref() {
            None | Some("fuse") | Some("kernel") => Ok(()),
            Some(other) => Err(DriverError::InvalidArgument(format!(
                "unsupported mounter {other:?}: must be \"fuse\" or \"kernel\""
            ))),
        }
    }
}

fn mismatch(field: &str, parent: &str, requested: &str) -> DriverError {
    DriverError::InvalidArgument(format!(
        "backing snapshot mismatch on {field}: parent has {parent:?}, request specified {requested:?}"
    ))
}

fn required(params: &HashMap<String, String>, key: &str) -> DriverResult<String> {
    params
        .get(key)
        .filter(|v| !v.is_empty())
        .cloned()
        .ok_or_else(|| DriverError::InvalidArgument(format!("missing required parameter {key:?}")))
}

fn optional(params: &HashMap<String, String>, key: &str) -> Option<String> {
    params.get(key).filter(|v| !v.is_empty()).cloned()
}

fn split_monitors(raw: &str) -> Vec<String> {
    raw.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn new_volume_options_rejects_pool_with_backing_snapshot() {
        let p = params(&[
            ("clusterID", "CID-1"),
            ("fsName", "myfs"),
            ("backingSnapshot", "true"),
            ("pool", "override-pool"),
        ]);
        assert!(matches!(
            VolumeOptions::new_volume_options(&p),
            Err(DriverError::InvalidArgument(_))
        ));
    }

    #[test]
    fn new_volume_options_requires_cluster_id_and_fs_name() {
        let p = params(&[("fsName", "myfs")]);
        assert!(VolumeOptions::new_volume_options(&p).is_err());
    }

    #[test]
    fn from_static_volume_skips_journal_and_uses_parameters_directly() {
        let p = params(&[
            ("clusterID", "CID-1"),
            ("fsName", "myfs"),
            ("rootPath", "/volumes/csi/pvc-alpha"),
        ]);
        let opts = VolumeOptions::from_static_volume(&p).unwrap();
        assert!(opts.static_volume);
        assert_eq!(opts.root_path.as_deref(), Some("/volumes/csi/pvc-alpha"));
    }

    #[test]
    fn from_legacy_context_requires_monitors_and_root_path() {
        let p = params(&[("monitors", "10.0.0.1:6789,10.0.0.2:6789"), ("rootPath", "/a/b")]);
        let opts = VolumeOptions::from_legacy_context(&p).unwrap();
        assert_eq!(opts.monitors, vec!["10.0.0.1:6789".to_string(), "10.0.0.2:6789".to_string()]);
        assert!(opts.static_volume);
    }

    #[test]
    fn populate_from_backing_snapshot_inherits_empty_fields() {
        let parent = VolumeOptions {
            cluster_id: "CID-1".to_string(),
            monitors: vec![],
            fs_name: "myfs".to_string(),
            metadata_pool: "cephfs_metadata".to_string(),
            pool: None,
            subvolume_group: "csi".to_string(),
            rados_namespace: None,
            root_path: None,
            static_volume: false,
            provision_volume: true,
            backing_snapshot_id: None,
            mounter: None,
        };
        let mut child = VolumeOptions {
            cluster_id: String::new(),
            monitors: vec![],
            fs_name: String::new(),
            metadata_pool: String::new(),
            pool: None,
            subvolume_group: String::new(),
            rados_namespace: None,
            root_path: None,
            static_volume: false,
            provision_volume: true,
            backing_snapshot_id: Some("snap-uuid".to_string()),
            mounter: None,
        };
        child.populate_from_backing_snapshot(&parent).unwrap();
        assert_eq!(child.cluster_id, "CID-1");
        assert_eq!(child.fs_name, "myfs");
    }

    #[test]
    fn populate_from_backing_snapshot_rejects_mismatched_fs_name() {
        let parent = VolumeOptions {
            cluster_id: "CID-1".to_string(),
            monitors: vec![],
            fs_name: "myfs".to_string(),
            metadata_pool: "cephfs_metadata".to_string(),
            pool: None,
            subvolume_group: "csi".to_string(),
            rados_namespace: None,
            root_path: None,
            static_volume: false,
            provision_volume: true,
            backing_snapshot_id: None,
            mounter: None,
        };
        let mut child = parent.clone();
        child.fs_name = "otherfs".to_string();
        assert!(child.populate_from_backing_snapshot(&parent).is_err());
    }

    #[test]
    fn validate_mounter_accepts_fuse_and_kernel_only() {
        let mut opts = VolumeOptions::from_static_volume(&params(&[
            ("clusterID", "CID-1"),
            ("fsName", "myfs"),
            ("rootPath", "/a"),
        ]))
        .unwrap();
        opts.mounter = Some("fuse".to_string());
        assert!(opts.validate_mounter().is_ok());
        opts.mounter = Some("nfs".to_string());
        assert!(opts.validate_mounter().is_err());
    }
}
