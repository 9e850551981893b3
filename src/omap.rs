//! OMAP primitives.
//!
//! Operations are expressed against a (pool, namespace, object) triple and
//! shelled out through the `rados` CLI via [`CephExecutor`], mirroring the
//! teacher's `cmd.rs` idiom of building a command then classifying its
//! result — adapted here from a mon-command JSON blob to `rados` argv
//! construction, since real OMAP access in this driver's external-tool model
//! goes through the CLI.

use crate::error::{DriverError, DriverResult};
use crate::executor::CephExecutor;

/// Identifies a single RADOS object to operate an OMAP against.
#[derive(Debug, Clone)]
pub struct ObjectRef {
    pub pool: String,
    pub namespace: Option<String>,
    pub object: String,
}

impl ObjectRef {
    pub fn new(pool: impl Into<String>, object: impl Into<String>) -> Self {
        ObjectRef {
            pool: pool.into(),
            namespace: None,
            object: object.into(),
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    fn common_args<'a>(&'a self, buf: &mut Vec<&'a str>) {
        buf.push("-p");
        buf.push(&self.pool);
        if let Some(ns) = &self.namespace {
            buf.push("-N");
            buf.push(ns);
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct OmapStore {
    executor: CephExecutor,
}

impl OmapStore {
    pub fn new() -> Self {
        OmapStore {
            executor: CephExecutor::new(),
        }
    }

    /// Substitutes a non-default executor, e.g. a fake backend in tests.
    pub fn with_executor(executor: CephExecutor) -> Self {
        OmapStore { executor }
    }

    /// Creates `obj` with exclusive semantics: fails with `ObjectExists` if
    /// the object is already present.
    pub async fn create_object(&self, obj: &ObjectRef) -> DriverResult<()> {
        let mut args = Vec::new();
        obj.common_args(&mut args);
        args.push("create");
        args.push(&obj.object);
        match self.executor.run("rados", &args).await {
            Ok(_) => Ok(()),
            Err(DriverError::CommandFailed { stderr, .. }) if stderr.contains("File exists") => {
                Err(DriverError::ObjectExists(obj.object.clone()))
            }
            Err(e) => Err(e),
        }
    }

    /// Removes `obj`. Returns `ObjectNotFound` distinctly; a caller that
    /// wants "missing is fine" should match on that variant explicitly.
    pub async fn remove_object(&self, obj: &ObjectRef) -> DriverResult<()> {
        let mut args = Vec::new();
        obj.common_args(&mut args);
        args.push("rm");
        args.push(&obj.object);
        match self.executor.run("rados", &args).await {
            Ok(_) => Ok(()),
            Err(DriverError::CommandFailed { stderr, .. }) if is_not_found(&stderr) => {
                Err(DriverError::ObjectNotFound(obj.object.clone()))
            }
            Err(e) => Err(e),
        }
    }

    pub async fn set_key(&self, obj: &ObjectRef, key: &str, value: &str) -> DriverResult<()> {
        let mut args = Vec::new();
        obj.common_args(&mut args);
        args.push("setomapval");
        args.push(&obj.object);
        args.push(key);
        args.push(value);
        self.executor.run("rados", &args).await?;
        Ok(())
    }

    /// Missing key is surfaced as `KeyNotFound`, not treated as a command
    /// failure ("missing key is not an error" for removal, but
    /// reads distinguish absence so `journal.rs` can branch on it).
    pub async fn get_key(&self, obj: &ObjectRef, key: &str) -> DriverResult<String> {
        let mut args = Vec::new();
        obj.common_args(&mut args);
        args.push("getomapval");
        args.push(&obj.object);
        args.push(key);
        args.push("-");
        match self.executor.run("rados", &args).await {
            Ok(out) => Ok(String::from_utf8_lossy(&out.stdout).trim_end().to_string()),
            Err(DriverError::CommandFailed { stderr, .. }) if is_not_found(&stderr) => {
                Err(DriverError::KeyNotFound(key.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    /// Lists all OMAP keys on `obj` beginning with `prefix`. Used by
    /// `reftracker.rs` to count outstanding references without maintaining a
    /// separate counter key that could drift from the actual key set.
    pub async fn list_keys_with_prefix(&self, obj: &ObjectRef, prefix: &str) -> DriverResult<Vec<String>> {
        let mut args = Vec::new();
        obj.common_args(&mut args);
        args.push("listomapkeys");
        args.push(&obj.object);
        match self.executor.run("rados", &args).await {
            Ok(out) => Ok(String::from_utf8_lossy(&out.stdout)
                .lines()
                .filter(|line| line.starts_with(prefix))
                .map(str::to_string)
                .collect()),
            Err(DriverError::CommandFailed { stderr, .. }) if is_not_found(&stderr) => {
                Err(DriverError::ObjectNotFound(obj.object.clone()))
            }
            Err(e) => Err(e),
        }
    }

    /// Missing key is not an error.
    pub async fn remove_key(&self, obj: &ObjectRef, key: &str) -> DriverResult<()> {
        let mut args = Vec::new();
        obj.common_args(&mut args);
        args.push("rmomapkey");
        args.push(&obj.object);
        args.push(key);
        match self.executor.run("rados", &args).await {
            Ok(_) => Ok(()),
            Err(DriverError::CommandFailed { stderr, .. }) if is_not_found(&stderr) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

fn is_not_found(stderr: &str) -> bool {
    stderr.contains("No such file or directory") || stderr.contains("ENOENT")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_ref_common_args_include_namespace_when_set() {
        let obj = ObjectRef::new("cephfs_metadata", "csi.volumes.default").with_namespace("csi");
        let mut args = Vec::new();
        obj.common_args(&mut args);
        assert_eq!(args, vec!["-p", "cephfs_metadata", "-N", "csi"]);
    }

    #[test]
    fn object_ref_common_args_omit_namespace_when_unset() {
        let obj = ObjectRef::new("cephfs_metadata", "csi.volumes.default");
        let mut args = Vec::new();
        obj.common_args(&mut args);
        assert_eq!(args, vec!["-p", "cephfs_metadata"]);
    }

    #[test]
    fn is_not_found_matches_common_enoent_phrasing() {
        assert!(is_not_found("error getting omap value: (2) No such file or directory"));
        assert!(!is_not_found("error: permission denied"));
    }
}
