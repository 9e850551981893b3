//! CSI v1 wire types.
//!
//! A hand-written mirror of the subset of `csi.v1` protobuf message fields
//! this driver's Controller/Node logic actually consumes — not a
//! `tonic-build`/`prost`-generated client, which belongs to the excluded
//! gRPC transport layer. Keeping these shapes separate
//! from `controller.rs`/`node.rs` lets a real generated crate be swapped in
//! later by replacing just this module.

use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    SingleNodeWriter,
    SingleNodeReaderOnly,
    MultiNodeReaderOnly,
    MultiNodeMultiWriter,
}

impl AccessMode {
    pub fn is_readonly(self) -> bool {
        matches!(self, AccessMode::SingleNodeReaderOnly | AccessMode::MultiNodeReaderOnly)
    }
}

#[derive(Debug, Clone)]
pub enum AccessType {
    Mount { fs_type: String, mount_flags: Vec<String> },
    Block,
}

#[derive(Debug, Clone)]
pub struct VolumeCapability {
    pub access_mode: AccessMode,
    pub access_type: AccessType,
}

#[derive(Debug, Clone, Default)]
pub struct VolumeContentSource {
    pub snapshot_id: Option<String>,
    pub volume_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CreateVolumeRequest {
    pub name: String,
    pub capacity_bytes: i64,
    pub volume_capabilities: Vec<VolumeCapability>,
    pub parameters: HashMap<String, String>,
    pub secrets: HashMap<String, String>,
    pub content_source: Option<VolumeContentSource>,
}

#[derive(Debug, Clone)]
pub struct Volume {
    pub volume_id: String,
    pub capacity_bytes: i64,
    pub volume_context: HashMap<String, String>,
    pub content_source: Option<VolumeContentSource>,
}

#[derive(Debug, Clone)]
pub struct CreateVolumeResponse {
    pub volume: Volume,
}

#[derive(Debug, Clone)]
pub struct DeleteVolumeRequest {
    pub volume_id: String,
    pub secrets: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct DeleteVolumeResponse;

#[derive(Debug, Clone)]
pub struct CreateSnapshotRequest {
    pub source_volume_id: String,
    pub name: String,
    pub parameters: HashMap<String, String>,
    pub secrets: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct Snapshot {
    pub snapshot_id: String,
    pub source_volume_id: String,
    pub ready_to_use: bool,
}

#[derive(Debug, Clone)]
pub struct CreateSnapshotResponse {
    pub snapshot: Snapshot,
}

#[derive(Debug, Clone)]
pub struct DeleteSnapshotRequest {
    pub snapshot_id: String,
    pub secrets: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct DeleteSnapshotResponse;

#[derive(Debug, Clone)]
pub struct NodeStageVolumeRequest {
    pub volume_id: String,
    pub staging_target_path: String,
    pub volume_capability: VolumeCapability,
    pub volume_context: HashMap<String, String>,
    pub secrets: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct NodeStageVolumeResponse;

#[derive(Debug, Clone)]
pub struct NodePublishVolumeRequest {
    pub volume_id: String,
    pub staging_target_path: String,
    pub target_path: String,
    pub volume_capability: VolumeCapability,
    pub readonly: bool,
    pub volume_context: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct NodePublishVolumeResponse;

#[derive(Debug, Clone)]
pub struct NodeUnpublishVolumeRequest {
    pub volume_id: String,
    pub target_path: String,
}

#[derive(Debug, Clone, Default)]
pub struct NodeUnpublishVolumeResponse;

#[derive(Debug, Clone)]
pub struct NodeUnstageVolumeRequest {
    pub volume_id: String,
    pub staging_target_path: String,
}

#[derive(Debug, Clone, Default)]
pub struct NodeUnstageVolumeResponse;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeServiceCapability {
    StageUnstageVolume,
    GetVolumeStats,
}

pub const NODE_SERVICE_CAPABILITIES: &[NodeServiceCapability] = &[
    NodeServiceCapability::StageUnstageVolume,
    NodeServiceCapability::GetVolumeStats,
];
