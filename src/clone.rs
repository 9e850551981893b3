//! Clone-state polling engine.
//!
//! CephFS clones are asynchronous backend operations; this module turns the
//! raw `ceph fs subvolume snapshot clone status` output into the small state
//! machine `journal.rs` and `controller.rs` branch on. A terminal `failed`
//! status is always purged rather than left around for manual inspection,
//! since nothing in this driver's external-tool model consumes it before the
//! next retry recreates it anyway.

use serde::Deserialize;

use crate::error::{DriverError, DriverResult};
use crate::executor::CephExecutor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloneState {
    Pending,
    InProgress,
    Complete,
    Failed,
    /// Backend reported a status string we don't recognize; treated like
    /// `InProgress` by callers (retry later) but logged loudly.
    Error,
}

impl CloneState {
    fn from_wire(s: &str) -> Self {
        match s {
            "pending" => CloneState::Pending,
            "in-progress" => CloneState::InProgress,
            "complete" => CloneState::Complete,
            "failed" => CloneState::Failed,
            other => {
                tracing::warn!(status = other, "unrecognized clone status string");
                CloneState::Error
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct CloneStatusWire {
    status: CloneStatusInner,
}

#[derive(Debug, Deserialize)]
struct CloneStatusInner {
    state: String,
}

pub struct CloneEngine {
    executor: CephExecutor,
}

impl Default for CloneEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl CloneEngine {
    pub fn new() -> Self {
        CloneEngine {
            executor: CephExecutor::new(),
        }
    }

    /// Substitutes a non-default executor, e.g. a fake backend in tests.
    pub fn with_executor(executor: CephExecutor) -> Self {
        CloneEngine { executor }
    }

    /// Snapshots `subvolume` as `snapshot`, for the transient snapshot a
    /// PVC-to-PVC clone clones from.
    pub async fn create_snapshot(&self, fs_name: &str, subvolume: &str, snapshot: &str, group: Option<&str>) -> DriverResult<()> {
        let mut args = vec!["fs", "subvolume", "snapshot", "create", fs_name, subvolume, snapshot];
        if let Some(g) = group {
            args.push("--group_name");
            args.push(g);
        }
        self.executor.run("ceph", &args).await?;
        Ok(())
    }

    /// Protects a snapshot ahead of cloning it. Tolerated as a no-op on Ceph
    /// releases where snapshot protection is implicit and this command is
    /// rejected outright.
    pub async fn protect_snapshot(&self, fs_name: &str, subvolume: &str, snapshot: &str, group: Option<&str>) {
        let mut args = vec!["fs", "subvolume", "snapshot", "protect", fs_name, subvolume, snapshot];
        if let Some(g) = group {
            args.push("--group_name");
            args.push(g);
        }
        let _ = self.executor.run("ceph", &args).await;
    }

    /// Unprotects and removes the transient snapshot used for a PVC-to-PVC
    /// clone. Best-effort: a stale transient snapshot left behind by this is
    /// harmless litter, not a correctness problem, so failures are logged
    /// rather than propagated.
    pub async fn cleanup_transient_snapshot(&self, fs_name: &str, subvolume: &str, snapshot: &str, group: Option<&str>) {
        let mut unprotect_args = vec!["fs", "subvolume", "snapshot", "unprotect", fs_name, subvolume, snapshot];
        if let Some(g) = group {
            unprotect_args.push("--group_name");
            unprotect_args.push(g);
        }
        let _ = self.executor.run("ceph", &unprotect_args).await;

        let mut rm_args = vec!["fs", "subvolume", "snapshot", "rm", fs_name, subvolume, snapshot];
        if let Some(g) = group {
            rm_args.push("--group_name");
            rm_args.push(g);
        }
        if let Err(e) = self.executor.run("ceph", &rm_args).await {
            tracing::warn!(fs_name, subvolume, snapshot, error = %e, "failed to remove transient clone snapshot, leaving it for manual cleanup");
        }
    }

    /// Starts an async clone of `snapshot` (within `subvolume`/`group`) to
    /// `target`. Idempotent: the backend itself rejects a duplicate clone
    /// start with an error our caller should treat as "already reserved"
    /// (journal.rs's check_reservation path handles that via BackendProbe).
    pub async fn start_clone(
        &self,
        fs_name: &str,
        subvolume: &str,
        snapshot: &str,
        target: &str,
        group: Option<&str>,
        target_group: Option<&str>,
        pool_layout: Option<&str>,
    ) -> DriverResult<()> {
        let mut args = vec![
            "fs",
            "subvolume",
            "snapshot",
            "clone",
            fs_name,
            subvolume,
            snapshot,
            target,
        ];
        if let Some(g) = group {
            args.push("--group_name");
            args.push(g);
        }
        if let Some(tg) = target_group {
            args.push("--target_group_name");
            args.push(tg);
        }
        if let Some(pl) = pool_layout {
            args.push("--pool_layout");
            args.push(pl);
        }
        self.executor.run("ceph", &args).await?;
        Ok(())
    }

    /// Polls clone status for `target`. `Failed` is purged
    /// (best-effort `clone cancel` + subvolume rm) before returning, so
    /// callers never need their own cleanup branch for that state.
    pub async fn poll(
        &self,
        fs_name: &str,
        target: &str,
        target_group: Option<&str>,
    ) -> DriverResult<CloneState> {
        let mut args = vec!["fs", "clone", "status", fs_name, target];
        if let Some(g) = target_group {
            args.push("--group_name");
            args.push(g);
        }
        let wire: CloneStatusWire = self.executor.run_json("ceph", &args).await?;
        let state = CloneState::from_wire(&wire.status.state);
        if state == CloneState::Failed {
            self.purge_failed(fs_name, target, target_group).await?;
        }
        Ok(state)
    }

    async fn purge_failed(&self, fs_name: &str, target: &str, target_group: Option<&str>) -> DriverResult<()> {
        let mut cancel_args = vec!["fs", "clone", "cancel", fs_name, target];
        if let Some(g) = target_group {
            cancel_args.push("--group_name");
            cancel_args.push(g);
        }
        // Cancel may legitimately fail if the clone already finished failing
        // and backend state moved on; we only care that the subvolume itself
        // is gone afterward.
        let _ = self.executor.run("ceph", &cancel_args).await;

        let mut rm_args = vec!["fs", "subvolume", "rm", fs_name, target, "--force"];
        if let Some(g) = target_group {
            rm_args.push("--group_name");
            rm_args.push(g);
        }
        match self.executor.run("ceph", &rm_args).await {
            Ok(_) => Ok(()),
            Err(DriverError::CommandFailed { stderr, .. }) if stderr.contains("No such file or directory") => Ok(()),
            Err(e) => Err(e),
        }
    }
}
