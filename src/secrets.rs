//! Credentials entity.
//!
//! Created from a secrets mapping for the duration of one request; its key
//! material is written to a short-lived scratch file (0600) and erased on
//! scope exit on all paths, via `Drop`.

use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::DriverResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    /// `adminID`+`adminKey`, used for controller operations and
    /// dynamic-provision node operations.
    Admin,
    /// `userID`+`userKey`, used for pre-provisioned node operations.
    User,
}

/// A key file written to a scratch directory, erased on drop.
pub struct ScratchSecret {
    pub id: String,
    pub kind: CredentialKind,
    path: PathBuf,
}

impl ScratchSecret {
    /// Writes `key` to `<scratch_dir>/<id>.keyfile` with mode 0600.
    pub fn write(scratch_dir: &Path, id: &str, key: &str, kind: CredentialKind) -> DriverResult<Self> {
        std::fs::create_dir_all(scratch_dir)?;
        let path = scratch_dir.join(format!("{id}.keyfile"));
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
        }
        file.write_all(key.as_bytes())?;
        Ok(ScratchSecret {
            id: id.to_string(),
            kind,
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchSecret {
    /// Guaranteed release on all exit paths: best-effort removal,
    /// errors are swallowed since there is nothing further to do at drop
    /// time and the scratch directory is itself ephemeral.
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_creates_key_file_with_restricted_mode() {
        let dir = tempfile::tempdir().unwrap();
        let secret = ScratchSecret::write(dir.path(), "client.admin", "AQD/secret==", CredentialKind::Admin).unwrap();
        let contents = std::fs::read_to_string(secret.path()).unwrap();
        assert_eq!(contents, "AQD/secret==");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(secret.path()).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o600);
        }
    }

    #[test]
    fn drop_erases_the_key_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = {
            let secret = ScratchSecret::write(dir.path(), "client.user", "key", CredentialKind::User).unwrap();
            secret.path().to_path_buf()
        };
        assert!(!path.exists());
    }
}
