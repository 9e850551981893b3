//! Ceph command executor.
//!
//! Uniform invocation of external Ceph/RADOS/mount tools. Captures stdout
//! and stderr fully, strips secret-bearing arguments before anything is
//! logged or placed in an error message, and classifies non-zero exits.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use tokio::process::Command;
use tracing::debug;

use crate::error::{DriverError, DriverResult};

pub struct Output {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Runs one external command invocation. `CephExecutor`'s real implementation
/// shells out via `tokio::process::Command`; tests substitute a fake that
/// simulates `rados`/`ceph` without a live cluster, since neither
/// `OmapStore` nor `CephExecutor` otherwise offer a seam to exercise the
/// journal/ref-tracker/controller logic offline.
#[async_trait::async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[&str]) -> DriverResult<Output>;
}

struct ProcessRunner;

#[async_trait::async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, program: &str, args: &[&str]) -> DriverResult<Output> {
        // `kill_on_drop` means a cancelled RPC (the future holding this
        // invocation dropped) takes its external `ceph`/`rados`/`mount`
        // child down with it rather than leaving it to finish orphaned.
        let output = Command::new(program).args(args).kill_on_drop(true).output().await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            return Err(DriverError::CommandFailed {
                program: program.to_string(),
                exit: output.status.code(),
                stderr,
            });
        }

        Ok(Output {
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

/// Runs external commands and scrubs secrets from logs and error text.
///
/// Follows `cmd.rs`'s idiom of building a command, invoking it, and turning
/// non-zero/garbled output into a typed error — generalized here from a
/// single mon-command JSON blob to arbitrary argv invocation of
/// `ceph`/`rados`/`rbd`/`mount`/`ceph-fuse`/etc. Cheap to clone: the runner
/// is held behind an `Arc`, so every clone shares the same underlying
/// process-spawning (or, in tests, simulated) backend.
#[derive(Clone)]
pub struct CephExecutor {
    runner: Arc<dyn CommandRunner>,
}

impl std::fmt::Debug for CephExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CephExecutor").finish_non_exhaustive()
    }
}

impl CephExecutor {
    pub fn new() -> Self {
        CephExecutor { runner: Arc::new(ProcessRunner) }
    }

    /// Substitutes a non-process `CommandRunner`, e.g. a fake backend in
    /// tests.
    pub fn with_runner(runner: Arc<dyn CommandRunner>) -> Self {
        CephExecutor { runner }
    }

    /// Runs `program args...`, returning captured stdout/stderr or a
    /// `CommandFailed` error carrying sanitized args and stderr.
    pub async fn run(&self, program: &str, args: &[&str]) -> DriverResult<Output> {
        let sanitized = sanitize_args(args);
        debug!(program, args = %sanitized.join(" "), "running external command");
        self.runner.run(program, args).await
    }

    /// Like `run`, but unmarshals stdout as JSON into `T`, wrapping parse
    /// errors with the raw buffer for diagnosis.
    pub async fn run_json<T: DeserializeOwned>(&self, program: &str, args: &[&str]) -> DriverResult<T> {
        let output = self.run(program, args).await?;
        let raw = String::from_utf8_lossy(&output.stdout).into_owned();
        serde_json::from_slice(&output.stdout).map_err(|source| DriverError::JsonParse {
            program: program.to_string(),
            raw,
            source,
        })
    }
}

impl Default for CephExecutor {
    fn default() -> Self {
        Self::new()
    }
}

/// Redacts any token matching `--key=...`, `--keyfile=...`, or the value
/// that follows a bare `-k` flag.
fn sanitize_args(args: &[&str]) -> Vec<String> {
    let mut out = Vec::with_capacity(args.len());
    let mut redact_next = false;
    for arg in args {
        if redact_next {
            out.push("***".to_string());
            redact_next = false;
            continue;
        }
        if *arg == "-k" {
            out.push((*arg).to_string());
            redact_next = true;
            continue;
        }
        if let Some(prefix) = ["--key=", "--keyfile=", "--secret="]
            .iter()
            .find(|p| arg.starts_with(**p))
        {
            out.push(format!("{prefix}***"));
            continue;
        }
        out.push((*arg).to_string());
    }
    out
}
