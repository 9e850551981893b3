//! Mount orchestration.
//!
//! Two ways onto a CephFS filesystem — FUSE or the kernel client — probed
//! for availability at driver startup, then selected per-request with a
//! bias toward FUSE when both are available. Grounded on the CSI node
//! services in `other_examples/` (`openebs-mayastor`, `cloudfy-cacsi-driver`)
//! for the shell-out-then-classify mount idiom, adapted to CephFS's two
//! distinct mount paths.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{DriverError, DriverResult};
use crate::executor::CephExecutor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MounterKind {
    Fuse,
    Kernel,
}

impl MounterKind {
    pub fn parse(s: &str) -> DriverResult<Self> {
        match s {
            "fuse" => Ok(MounterKind::Fuse),
            "kernel" => Ok(MounterKind::Kernel),
            other => Err(DriverError::InvalidArgument(format!(
                "unsupported mounter {other:?}: must be \"fuse\" or \"kernel\""
            ))),
        }
    }
}

/// Parameters common to both FUSE and kernel mounts.
pub struct MountRequest<'a> {
    pub mount_point: &'a str,
    pub monitors: &'a [String],
    pub root_path: &'a str,
    pub user: &'a str,
    pub key_or_keyfile: &'a str,
    pub config_path: Option<&'a str>,
}

/// Tracks live FUSE daemon PIDs so `unmount` can reap them, mirroring the
/// a global PID map recast as an explicit, owned field, per the
/// note on eliminating ambient global state.
pub struct Mounter {
    executor: CephExecutor,
    available: Vec<MounterKind>,
    default_mounter: MounterKind,
    fuse_pids: Mutex<HashMap<String, u32>>,
}

impl Mounter {
    /// Probes `ceph-fuse --version` and `mount.ceph` (invoked harmlessly) to
    /// build the available-mounters set. Fails driver startup if neither is
    /// present.
    pub async fn probe(executor: CephExecutor, preferred_default: MounterKind) -> DriverResult<Self> {
        let mut available = Vec::new();
        if executor.run("ceph-fuse", &["--version"]).await.is_ok() {
            available.push(MounterKind::Fuse);
        }
        if executor.run("mount.ceph", &["--help"]).await.is_ok() {
            available.push(MounterKind::Kernel);
        }
        if available.is_empty() {
            return Err(DriverError::Internal(
                "no CephFS mounter available: neither ceph-fuse nor mount.ceph responded".to_string(),
            ));
        }
        let default_mounter = if available.contains(&preferred_default) {
            preferred_default
        } else {
            available[0]
        };
        Ok(Mounter {
            executor,
            available,
            default_mounter,
            fuse_pids: Mutex::new(HashMap::new()),
        })
    }

    /// Request-level override → driver default → first available, biased
    /// toward FUSE when both exist.
    pub fn select(&self, requested: Option<MounterKind>) -> DriverResult<MounterKind> {
        if let Some(kind) = requested {
            if !self.available.contains(&kind) {
                return Err(DriverError::Internal(format!("requested mounter {kind:?} is not available")));
            }
            return Ok(kind);
        }
        if self.available.contains(&self.default_mounter) {
            return Ok(self.default_mounter);
        }
        if self.available.contains(&MounterKind::Fuse) {
            return Ok(MounterKind::Fuse);
        }
        Ok(self.available[0])
    }

    pub async fn mount(&self, kind: MounterKind, req: &MountRequest<'_>) -> DriverResult<()> {
        match kind {
            MounterKind::Fuse => self.mount_fuse(req).await,
            MounterKind::Kernel => self.mount_kernel(req).await,
        }
    }

    async fn mount_fuse(&self, req: &MountRequest<'_>) -> DriverResult<()> {
        let mons = req.monitors.join(",");
        let mut args: Vec<&str> = vec![req.mount_point, "-m", &mons];
        if let Some(cfg) = req.config_path {
            args.push("-c");
            args.push(cfg);
        }
        let key_arg;
        args.push("-n");
        args.push(req.user);
        key_arg = format!("--key={}", req.key_or_keyfile);
        args.push(&key_arg);
        args.push("-r");
        args.push(req.root_path);
        args.push("-o");
        args.push("nonempty");

        let out = self.executor.run("ceph-fuse", &args).await?;
        let stderr = String::from_utf8_lossy(&out.stderr);
        let pid = parse_fuse_start_line(&stderr).ok_or_else(|| {
            DriverError::MountFailed("ceph-fuse did not emit a \"starting fuse\" marker line".to_string())
        })?;
        self.fuse_pids.lock().unwrap().insert(req.mount_point.to_string(), pid);
        Ok(())
    }

    async fn mount_kernel(&self, req: &MountRequest<'_>) -> DriverResult<()> {
        self.executor.run("modprobe", &["ceph"]).await?;
        let mons = req.monitors.join(",");
        let source = format!("{mons}:{}", req.root_path);
        let opts = format!("name={},secretfile={}", req.user, req.key_or_keyfile);
        self.executor
            .run("mount", &["-t", "ceph", &source, req.mount_point, "-o", &opts])
            .await?;
        Ok(())
    }

    /// Composes `{bind, _netdev}` plus `ro` (if readonly) plus any
    /// capability-supplied mount flags (de-duplicated), then does the bind
    /// mount in one `mount -o ...` call.
    pub async fn bind_mount(&self, from: &str, to: &str, readonly: bool, extra_flags: &[String]) -> DriverResult<()> {
        let mut opts = vec!["bind".to_string(), "_netdev".to_string()];
        if readonly {
            opts.push("ro".to_string());
        }
        for flag in extra_flags {
            if !opts.contains(flag) {
                opts.push(flag.clone());
            }
        }
        let opts_joined = opts.join(",");
        self.executor.run("mount", &["-o", &opts_joined, from, to]).await?;
        Ok(())
    }

    /// `umount`, then reap any recorded FUSE daemon PID for this mount point.
    pub async fn unmount(&self, mount_point: &str) -> DriverResult<()> {
        match self.executor.run("umount", &[mount_point]).await {
            Ok(_) => {}
            Err(DriverError::CommandFailed { stderr, .. }) if stderr.contains("not mounted") => {}
            Err(e) => return Err(e),
        }
        let pid = self.fuse_pids.lock().unwrap().remove(mount_point);
        if let Some(pid) = pid {
            tracing::debug!(pid, mount_point, "reaping ceph-fuse daemon");
            reap_pid(pid).await;
        }
        Ok(())
    }

    pub fn available(&self) -> &[MounterKind] {
        &self.available
    }
}

#[cfg(unix)]
async fn reap_pid(pid: u32) {
    use std::process::Command;
    // ceph-fuse double-forks: the daemon we recorded is not our child, so a
    // real wait4() is unavailable to us. Poll `kill(pid, 0)` until it starts
    // failing with ESRCH (process gone) instead of a single liveness check,
    // bounded so a daemon that never exits doesn't hang NodeUnpublish forever.
    for _ in 0..20 {
        let alive = Command::new("kill")
            .args(["-0", &pid.to_string()])
            .status()
            .map(|s| s.success())
            .unwrap_or(false);
        if !alive {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(250)).await;
    }
    tracing::warn!(pid, "ceph-fuse daemon still alive after reap timeout, giving up");
}

#[cfg(not(unix))]
async fn reap_pid(_pid: u32) {}

fn parse_fuse_start_line(stderr: &str) -> Option<u32> {
    for line in stderr.lines() {
        if let Some(rest) = line.strip_prefix("ceph-fuse[") {
            if let Some(end) = rest.find(']') {
                if line.contains("starting fuse") {
                    return rest[..end].parse().ok();
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mounter_kind_parse_rejects_unknown_value() {
        assert!(MounterKind::parse("nfs").is_err());
        assert!(MounterKind::parse("fuse").is_ok());
        assert!(MounterKind::parse("kernel").is_ok());
    }

    #[test]
    fn parse_fuse_start_line_extracts_pid() {
        let stderr = "ceph-fuse[12345]: starting fuse\n";
        assert_eq!(parse_fuse_start_line(stderr), Some(12345));
    }

    #[test]
    fn parse_fuse_start_line_rejects_missing_marker() {
        let stderr = "ceph-fuse[12345]: some other message\n";
        assert_eq!(parse_fuse_start_line(stderr), None);
    }
}
