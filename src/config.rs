//! External cluster configuration.
//!
//! A JSON array of `{clusterID, monitors, cephFS: {subvolumeGroup,
//! radosNamespace}}` entries, loaded from a known path. Runtime reload is
//! required; we re-stat the file's mtime on lookup past a debounce interval
//! rather than pulling in a filesystem-watcher crate the retrieval pack
//! shows no precedent for.

use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use parking_lot::RwLock;
use serde::Deserialize;

use crate::error::{DriverError, DriverResult};

#[derive(Debug, Clone, Deserialize)]
pub struct CephFsConfig {
    #[serde(rename = "subvolumeGroup")]
    pub subvolume_group: String,
    #[serde(rename = "radosNamespace", default)]
    pub rados_namespace: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfigEntry {
    #[serde(rename = "clusterID")]
    pub cluster_id: String,
    pub monitors: Vec<String>,
    #[serde(rename = "cephFS")]
    pub cephfs: CephFsConfig,
}

/// Re-readable store of cluster config entries, debounced by mtime.
pub struct ClusterConfigStore {
    path: PathBuf,
    debounce: Duration,
    state: RwLock<State>,
}

struct State {
    entries: Vec<ClusterConfigEntry>,
    loaded_at: SystemTime,
    mtime: Option<SystemTime>,
}

impl ClusterConfigStore {
    pub fn load(path: impl Into<PathBuf>) -> DriverResult<Self> {
        let path = path.into();
        let (entries, mtime) = read_entries(&path)?;
        Ok(ClusterConfigStore {
            path,
            debounce: Duration::from_secs(30),
            state: RwLock::new(State {
                entries,
                loaded_at: SystemTime::now(),
                mtime,
            }),
        })
    }

    /// Looks up a cluster entry by ID, reloading from disk first if the
    /// debounce interval has elapsed and the file's mtime changed.
    pub fn get(&self, cluster_id: &str) -> DriverResult<ClusterConfigEntry> {
        self.maybe_reload()?;
        let state = self.state.read();
        state
            .entries
            .iter()
            .find(|e| e.cluster_id == cluster_id)
            .cloned()
            .ok_or_else(|| DriverError::NotFound(format!("cluster config entry for {cluster_id}")))
    }

    fn maybe_reload(&self) -> DriverResult<()> {
        let should_check = {
            let state = self.state.read();
            state.loaded_at.elapsed().unwrap_or_default() >= self.debounce
        };
        if !should_check {
            return Ok(());
        }
        let (entries, mtime) = read_entries(&self.path)?;
        let mut state = self.state.write();
        if mtime != state.mtime {
            state.entries = entries;
            state.mtime = mtime;
        }
        state.loaded_at = SystemTime::now();
        Ok(())
    }
}

fn read_entries(path: &PathBuf) -> DriverResult<(Vec<ClusterConfigEntry>, Option<SystemTime>)> {
    let data = std::fs::read_to_string(path)?;
    let entries: Vec<ClusterConfigEntry> = serde_json::from_str(&data).map_err(|source| DriverError::JsonParse {
        program: format!("config file {}", path.display()),
        raw: data.clone(),
        source,
    })?;
    let mtime = std::fs::metadata(path).ok().and_then(|m| m.modified().ok());
    Ok((entries, mtime))
}
