//! Core of a CSI driver for CephFS-backed persistent volumes.
//!
//! This crate is the core: the idempotent name↔UUID reservation journal, the
//! volume lifecycle state machine, node-side mount orchestration, per-request
//! concurrency control, and the reference tracker for shared snapshot-backed
//! read-only volumes. It does not implement a gRPC transport, link against
//! librados, or manage Kubernetes objects — those are bootstrap-layer
//! concerns that sit above this core.
//!
//! Ceph/RADOS state is reached exclusively through external command
//! invocation (`ceph`, `rados`, `ceph-fuse`, `mount`, `mount.ceph`) via
//! [`executor::CephExecutor`], never through a librados binding.

pub mod clone;
pub mod config;
pub mod connection;
pub mod controller;
pub mod csi_types;
pub mod error;
pub mod executor;
#[cfg(test)]
pub mod fake_backend;
pub mod identifier;
pub mod journal;
pub mod locks;
pub mod mount_cache;
pub mod mounter;
pub mod node;
pub mod omap;
pub mod reftracker;
pub mod secrets;
pub mod volume_options;

pub use error::{DriverError, DriverResult};
