//! In-memory `rados`/`ceph` simulator for tests.
//!
//! `OmapStore`/`CloneEngine`/`ControllerService` all talk to the cluster
//! exclusively through [`crate::executor::CommandRunner`]; this substitutes
//! that seam with in-memory state so the journal/ref-tracker/controller
//! logic can be exercised without a live cluster. It understands only the
//! argv shapes this crate itself emits — it is not a general `rados`/`ceph`
//! CLI emulator.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::error::{DriverError, DriverResult};
use crate::executor::{CommandRunner, Output};

type ObjectKey = (String, String, String); // (pool, namespace, object)
type SubvolumeKey = (String, String, String); // (fs, group, name)
type SnapshotKey = (String, String, String, String); // (fs, group, subvolume, snapshot)

#[derive(Default)]
struct State {
    omap: HashMap<ObjectKey, HashMap<String, String>>,
    objects: HashSet<ObjectKey>,
    subvolumes: HashSet<SubvolumeKey>,
    snapshots: HashSet<SnapshotKey>,
    clone_state: HashMap<SubvolumeKey, String>,
}

pub struct FakeCephBackend {
    state: Mutex<State>,
}

impl FakeCephBackend {
    pub fn new() -> Self {
        FakeCephBackend { state: Mutex::new(State::default()) }
    }

    pub fn snapshot_exists(&self, fs: &str, group: &str, subvolume: &str, snapshot: &str) -> bool {
        let state = self.state.lock().unwrap();
        state
            .snapshots
            .contains(&(fs.to_string(), group.to_string(), subvolume.to_string(), snapshot.to_string()))
    }

    pub fn subvolume_exists(&self, fs: &str, group: &str, name: &str) -> bool {
        let state = self.state.lock().unwrap();
        state.subvolumes.contains(&(fs.to_string(), group.to_string(), name.to_string()))
    }

    /// Forces the clone status a subsequent `ceph fs clone status` reports
    /// for `target`, so tests can exercise Pending/InProgress/Failed paths
    /// without waiting on a real async clone.
    pub fn set_clone_state(&self, fs: &str, group: &str, target: &str, state: &str) {
        let mut s = self.state.lock().unwrap();
        s.clone_state.insert((fs.to_string(), group.to_string(), target.to_string()), state.to_string());
    }

    fn run_rados(&self, args: &[&str]) -> DriverResult<Output> {
        let (pool, ns, rest) = parse_common(args);
        let mut state = self.state.lock().unwrap();
        let key_of = |obj: &str| (pool.clone(), ns.clone().unwrap_or_default(), obj.to_string());
        match rest.first().copied() {
            Some("create") => {
                let obj = rest[1];
                let k = key_of(obj);
                if state.objects.contains(&k) {
                    return Err(cmd_failed("rados", "error creating object: (17) File exists"));
                }
                state.objects.insert(k.clone());
                state.omap.entry(k).or_default();
                Ok(empty())
            }
            Some("rm") => {
                let obj = rest[1];
                let k = key_of(obj);
                if !state.objects.remove(&k) {
                    return Err(cmd_failed("rados", "error removing object: (2) No such file or directory"));
                }
                state.omap.remove(&k);
                Ok(empty())
            }
            Some("setomapval") => {
                let obj = rest[1];
                let key = rest[2];
                let val = rest.get(3).copied().unwrap_or("");
                let k = key_of(obj);
                state.objects.insert(k.clone());
                state.omap.entry(k).or_default().insert(key.to_string(), val.to_string());
                Ok(empty())
            }
            Some("getomapval") => {
                let obj = rest[1];
                let key = rest[2];
                let k = key_of(obj);
                match state.omap.get(&k).and_then(|m| m.get(key)) {
                    Some(v) => Ok(Output { stdout: v.clone().into_bytes(), stderr: Vec::new() }),
                    None => Err(cmd_failed("rados", "error getting omap value: (2) No such file or directory")),
                }
            }
            Some("listomapkeys") => {
                let obj = rest[1];
                let k = key_of(obj);
                match state.omap.get(&k) {
                    Some(m) => {
                        let mut keys: Vec<&String> = m.keys().collect();
                        keys.sort();
                        let joined = keys.iter().map(|s| s.as_str()).collect::<Vec<_>>().join("\n");
                        Ok(Output { stdout: joined.into_bytes(), stderr: Vec::new() })
                    }
                    None => Err(cmd_failed("rados", "error: (2) No such file or directory")),
                }
            }
            Some("rmomapkey") => {
                let obj = rest[1];
                let key = rest[2];
                let k = key_of(obj);
                if let Some(m) = state.omap.get_mut(&k) {
                    m.remove(key);
                }
                Ok(empty())
            }
            other => Err(cmd_failed("rados", &format!("unsupported fake rados verb {other:?}"))),
        }
    }

    fn run_ceph(&self, args: &[&str]) -> DriverResult<Output> {
        let mut state = self.state.lock().unwrap();
        match args {
            ["fs", "subvolume", "create", fs, name, rest @ ..] => {
                let group = group_name(rest).unwrap_or_default();
                state.subvolumes.insert((fs.to_string(), group, name.to_string()));
                Ok(empty())
            }
            ["fs", "subvolume", "rm", fs, name, rest @ ..] => {
                let group = group_name(rest).unwrap_or_default();
                let force = rest.contains(&"--force");
                let removed = state.subvolumes.remove(&(fs.to_string(), group, name.to_string()));
                if !removed && !force {
                    return Err(cmd_failed("ceph", "Error ENOENT: subvolume does not exist"));
                }
                Ok(empty())
            }
            ["fs", "subvolume", "info", fs, name, rest @ ..] => {
                let group = group_name(rest).unwrap_or_default();
                if state.subvolumes.contains(&(fs.to_string(), group, name.to_string())) {
                    Ok(Output { stdout: b"{}".to_vec(), stderr: Vec::new() })
                } else {
                    Err(cmd_failed("ceph", "Error ENOENT: subvolume does not exist"))
                }
            }
            ["fs", "subvolume", "resize", fs, name, _size, rest @ ..] => {
                let group = group_name(rest).unwrap_or_default();
                if state.subvolumes.contains(&(fs.to_string(), group, name.to_string())) {
                    Ok(empty())
                } else {
                    Err(cmd_failed("ceph", "Error ENOENT: subvolume does not exist"))
                }
            }
            ["fs", "subvolume", "snapshot", "create", fs, subvol, snap, rest @ ..] => {
                let group = group_name(rest).unwrap_or_default();
                state.snapshots.insert((fs.to_string(), group, subvol.to_string(), snap.to_string()));
                Ok(empty())
            }
            ["fs", "subvolume", "snapshot", "rm", fs, subvol, snap, rest @ ..] => {
                let group = group_name(rest).unwrap_or_default();
                if !state
                    .snapshots
                    .remove(&(fs.to_string(), group, subvol.to_string(), snap.to_string()))
                {
                    return Err(cmd_failed("ceph", "Error ENOENT: snapshot does not exist"));
                }
                Ok(empty())
            }
            ["fs", "subvolume", "snapshot", "protect", ..] => Ok(empty()),
            ["fs", "subvolume", "snapshot", "unprotect", ..] => Ok(empty()),
            ["fs", "subvolume", "snapshot", "clone", fs, _subvol, _snap, target, rest @ ..] => {
                let target_group = target_group_name(rest).unwrap_or_default();
                let key = (fs.to_string(), target_group.clone(), target.to_string());
                state.clone_state.entry(key.clone()).or_insert_with(|| "complete".to_string());
                state.subvolumes.insert(key);
                Ok(empty())
            }
            ["fs", "clone", "status", fs, target, rest @ ..] => {
                let group = group_name(rest).unwrap_or_default();
                match state.clone_state.get(&(fs.to_string(), group, target.to_string())) {
                    Some(status) => Ok(Output {
                        stdout: format!(r#"{{"status":{{"state":"{status}"}}}}"#).into_bytes(),
                        stderr: Vec::new(),
                    }),
                    None => Err(cmd_failed("ceph", "Error ENOENT: clone does not exist")),
                }
            }
            ["fs", "clone", "cancel", fs, target, rest @ ..] => {
                let group = group_name(rest).unwrap_or_default();
                state.clone_state.remove(&(fs.to_string(), group, target.to_string()));
                Ok(empty())
            }
            other => Err(cmd_failed("ceph", &format!("unsupported fake ceph invocation {other:?}"))),
        }
    }
}

impl Default for FakeCephBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl CommandRunner for FakeCephBackend {
    async fn run(&self, program: &str, args: &[&str]) -> DriverResult<Output> {
        match program {
            "rados" => self.run_rados(args),
            "ceph" => self.run_ceph(args),
            "ceph-fuse" => self.run_ceph_fuse(args),
            "mount.ceph" => Ok(empty()),
            "modprobe" | "mount" | "umount" => Ok(empty()),
            other => Err(cmd_failed(other, "unsupported fake command")),
        }
    }
}

impl FakeCephBackend {
    /// Mimics enough of `ceph-fuse` to drive `Mounter` in tests: probing
    /// (`--version`) succeeds silently, and an actual mount invocation emits
    /// the "starting fuse" marker line the real daemon prints so
    /// `parse_fuse_start_line` has something to find.
    fn run_ceph_fuse(&self, args: &[&str]) -> DriverResult<Output> {
        if args.contains(&"--version") {
            return Ok(empty());
        }
        Ok(Output {
            stdout: Vec::new(),
            stderr: b"ceph-fuse[4242]: starting fuse\n".to_vec(),
        })
    }
}

fn parse_common<'a>(args: &'a [&'a str]) -> (String, Option<String>, &'a [&'a str]) {
    let mut i = 0;
    let mut pool = String::new();
    let mut ns = None;
    if args.get(i) == Some(&"-p") {
        pool = args[i + 1].to_string();
        i += 2;
    }
    if args.get(i) == Some(&"-N") {
        ns = Some(args[i + 1].to_string());
        i += 2;
    }
    (pool, ns, &args[i..])
}

fn group_name(rest: &[&str]) -> Option<String> {
    rest.windows(2).find(|w| w[0] == "--group_name").map(|w| w[1].to_string())
}

fn target_group_name(rest: &[&str]) -> Option<String> {
    rest.windows(2).find(|w| w[0] == "--target_group_name").map(|w| w[1].to_string())
}

fn cmd_failed(program: &str, stderr: &str) -> DriverError {
    DriverError::CommandFailed {
        program: program.to_string(),
        exit: Some(1),
        stderr: stderr.to_string(),
    }
}

fn empty() -> Output {
    Output { stdout: Vec::new(), stderr: Vec::new() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_then_rm_subvolume_round_trips() {
        let backend = FakeCephBackend::new();
        backend.run("ceph", &["fs", "subvolume", "create", "myfs", "vol-a", "--group_name", "csi"]).await.unwrap();
        assert!(backend.subvolume_exists("myfs", "csi", "vol-a"));
        backend.run("ceph", &["fs", "subvolume", "rm", "myfs", "vol-a", "--group_name", "csi"]).await.unwrap();
        assert!(!backend.subvolume_exists("myfs", "csi", "vol-a"));
    }

    #[tokio::test]
    async fn rados_create_is_exclusive() {
        let backend = FakeCephBackend::new();
        backend.run("rados", &["-p", "pool", "create", "obj"]).await.unwrap();
        let err = backend.run("rados", &["-p", "pool", "create", "obj"]).await.unwrap_err();
        assert!(matches!(err, DriverError::CommandFailed { .. }));
    }
}
