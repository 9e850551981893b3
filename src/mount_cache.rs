//! On-disk mount cache.
//!
//! One JSON file per volume under `<base>/<driverName>/cephfs-mount-cache-
//! <volID>.json`, so a node restart can recover what was mounted where
//! without re-deriving it from kubelet. Disabled entirely when the base path
//! is empty, matching `ceph_client.rs`'s pattern of treating an empty config
//! value as "feature off" rather than an error.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::{DriverError, DriverResult};
use crate::mounter::MounterKind;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountCacheEntry {
    pub volume_id: String,
    pub staging_path: String,
    pub mounter: String,
    /// Base64-encoded per key and per value, decoded on recovery.
    pub secrets: HashMap<String, String>,
    #[serde(default)]
    pub target_paths: Vec<TargetEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetEntry {
    pub path: String,
    pub readonly: bool,
}

pub struct MountCache {
    /// `None` when the base path was empty — every operation becomes a
    /// silent no-op rather than erroring, so callers don't need a separate
    /// "is caching enabled" branch at every call site.
    dir: Option<PathBuf>,
}

impl MountCache {
    pub fn new(base_path: &str, driver_name: &str) -> Self {
        if base_path.is_empty() {
            return MountCache { dir: None };
        }
        MountCache {
            dir: Some(Path::new(base_path).join(driver_name)),
        }
    }

    fn path_for(&self, vol_id: &str) -> Option<PathBuf> {
        self.dir.as_ref().map(|d| d.join(format!("cephfs-mount-cache-{vol_id}.json")))
    }

    pub fn is_enabled(&self) -> bool {
        self.dir.is_some()
    }

    /// Creates a cache entry for a newly-staged volume. If an entry already
    /// exists for `vol_id` at a different staging path, it is replaced (and
    /// logged); the same path is a no-op warning.
    pub fn node_stage_volume(
        &self,
        vol_id: &str,
        staging_path: &str,
        mounter: MounterKind,
        secrets: &HashMap<String, String>,
    ) -> DriverResult<()> {
        let Some(path) = self.path_for(vol_id) else { return Ok(()) };
        if let Some(existing) = self.read(vol_id)? {
            if existing.staging_path == staging_path {
                tracing::warn!(vol_id, staging_path, "NodeStageVolume: cache entry already present for this path");
                return Ok(());
            }
            tracing::warn!(
                vol_id,
                old = existing.staging_path,
                new = staging_path,
                "NodeStageVolume: replacing cache entry recorded at a different staging path"
            );
        }
        let entry = MountCacheEntry {
            volume_id: vol_id.to_string(),
            staging_path: staging_path.to_string(),
            mounter: format!("{mounter:?}").to_lowercase(),
            secrets: encode_secrets(secrets),
            target_paths: Vec::new(),
        };
        self.write(&path, &entry)
    }

    pub fn node_publish_volume(&self, vol_id: &str, target_path: &str, readonly: bool) -> DriverResult<()> {
        let Some(path) = self.path_for(vol_id) else { return Ok(()) };
        let mut entry = self
            .read(vol_id)?
            .ok_or_else(|| DriverError::NotFound(format!("mount-cache entry for {vol_id}")))?;
        if !entry.target_paths.iter().any(|t| t.path == target_path) {
            entry.target_paths.push(TargetEntry {
                path: target_path.to_string(),
                readonly,
            });
        }
        self.write(&path, &entry)
    }

    /// Removes cache bookkeeping before the unmount itself runs, so a
    /// crashed unmount cannot leave a stale entry pointing at an already-
    /// unpublished path.
    pub fn node_unpublish_volume(&self, vol_id: &str, target_path: &str) -> DriverResult<()> {
        let Some(path) = self.path_for(vol_id) else { return Ok(()) };
        let Some(mut entry) = self.read(vol_id)? else { return Ok(()) };
        entry.target_paths.retain(|t| t.path != target_path);
        self.write(&path, &entry)
    }

    pub fn node_unstage_volume(&self, vol_id: &str) -> DriverResult<()> {
        let Some(path) = self.path_for(vol_id) else { return Ok(()) };
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DriverError::Io(e)),
        }
    }

    pub fn read(&self, vol_id: &str) -> DriverResult<Option<MountCacheEntry>> {
        let Some(path) = self.path_for(vol_id) else { return Ok(None) };
        match std::fs::read_to_string(&path) {
            Ok(data) => {
                let entry: MountCacheEntry = serde_json::from_str(&data).map_err(|source| DriverError::JsonParse {
                    program: format!("mount-cache file {}", path.display()),
                    raw: data,
                    source,
                })?;
                Ok(Some(entry))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(DriverError::Io(e)),
        }
    }

    /// All entries currently on disk, for `RemountCachedVolumes` to iterate
    /// at node startup.
    pub fn list_all(&self) -> DriverResult<Vec<MountCacheEntry>> {
        let Some(dir) = &self.dir else { return Ok(Vec::new()) };
        std::fs::create_dir_all(dir)?;
        let mut out = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if entry.path().extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let data = std::fs::read_to_string(entry.path())?;
            let parsed: MountCacheEntry = serde_json::from_str(&data).map_err(|source| DriverError::JsonParse {
                program: format!("mount-cache file {}", entry.path().display()),
                raw: data,
                source,
            })?;
            out.push(parsed);
        }
        Ok(out)
    }

    fn write(&self, path: &Path, entry: &MountCacheEntry) -> DriverResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_string_pretty(entry).map_err(|source| DriverError::JsonParse {
            program: format!("mount-cache file {}", path.display()),
            raw: String::new(),
            source,
        })?;
        std::fs::write(path, data)?;
        Ok(())
    }
}

fn encode_secrets(secrets: &HashMap<String, String>) -> HashMap<String, String> {
    secrets
        .iter()
        .map(|(k, v)| (BASE64.encode(k), BASE64.encode(v)))
        .collect()
}

/// Decodes a cache entry's secrets map back to plaintext keys/values.
pub fn decode_secrets(encoded: &HashMap<String, String>) -> DriverResult<HashMap<String, String>> {
    let mut out = HashMap::with_capacity(encoded.len());
    for (k, v) in encoded {
        let key = BASE64
            .decode(k)
            .map_err(|e| DriverError::Internal(format!("mount-cache secret key is not valid base64: {e}")))?;
        let value = BASE64
            .decode(v)
            .map_err(|e| DriverError::Internal(format!("mount-cache secret value is not valid base64: {e}")))?;
        out.insert(
            String::from_utf8(key).map_err(|e| DriverError::Internal(e.to_string()))?,
            String::from_utf8(value).map_err(|e| DriverError::Internal(e.to_string()))?,
        );
    }
    Ok(out)
}
