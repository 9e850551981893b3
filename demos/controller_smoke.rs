//! Minimal sketch of driving `ControllerService` directly, without a real
//! gRPC transport in front of it. Exercises CreateVolume twice (showing
//! idempotent return of the same VolumeID) then DeleteVolume.
//!
//! This will not succeed against a real cluster without a reachable `ceph`
//! CLI on $PATH; it exists to show the call shape, not as an integration
//! test.

use std::collections::HashMap;

use cephfs_csi_core::controller::ControllerService;
use cephfs_csi_core::csi_types::{AccessMode, AccessType, CreateVolumeRequest, DeleteVolumeRequest, VolumeCapability};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let controller = ControllerService::new(
        "cephfs_metadata".to_string(),
        "myfs".to_string(),
        "csi".to_string(),
        1,
    );

    let mut parameters = HashMap::new();
    parameters.insert("clusterID".to_string(), "CID-1".to_string());
    parameters.insert("fsName".to_string(), "myfs".to_string());

    let request = CreateVolumeRequest {
        name: "pvc-alpha".to_string(),
        capacity_bytes: 5 * 1024 * 1024 * 1024,
        volume_capabilities: vec![VolumeCapability {
            access_mode: AccessMode::SingleNodeWriter,
            access_type: AccessType::Mount {
                fs_type: "".to_string(),
                mount_flags: Vec::new(),
            },
        }],
        parameters,
        secrets: HashMap::new(),
        content_source: None,
    };

    match controller.create_volume(request.clone()).await {
        Ok(resp) => {
            let vol_id = resp.volume.volume_id.clone();
            tracing::info!(vol_id, "created (or found existing) volume");

            // Repeating the identical request should return the same VolumeID.
            let again = controller.create_volume(request).await.unwrap();
            assert_eq!(again.volume.volume_id, vol_id);

            controller
                .delete_volume(DeleteVolumeRequest {
                    volume_id: vol_id,
                    secrets: HashMap::new(),
                })
                .await
                .unwrap();
        }
        Err(e) => {
            tracing::warn!(error = %e, "create_volume failed (expected without a live ceph CLI)");
        }
    }
}
