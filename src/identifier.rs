//! CSI identifier codec.
//!
//! Bijective encoding/decoding of the opaque string returned to the
//! orchestrator. Pure, no I/O. Two encoding versions, distinguished by the
//! leading 16-bit version field:
//!
//!   V1 (legacy decode only): `<ver:4hex>-<clen:4hex>-<clusterID>-<locID:16hex>-<uuid:36>`
//!   V2 (encode):             V1 with `<plen:4hex>-<namePrefix>` inserted
//!                            before the trailing UUID.
//!
//! The newer version is treated as authoritative; V1 decoding is attempted
//! only after V2 decoding fails explicitly on the version-field check.

use crate::error::{DriverError, DriverResult};

pub const ENCODING_VERSION_V1: u16 = 1;
pub const ENCODING_VERSION_V2: u16 = 2;
pub const MAX_VOLUME_ID_LEN: usize = 128;
const UUID_LEN: usize = 36;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsiIdentifier {
    pub encoding_version: u16,
    pub cluster_id: String,
    pub location_id: i64,
    pub object_uuid: String,
    pub name_prefix: Option<String>,
}

impl CsiIdentifier {
    pub fn new(cluster_id: impl Into<String>, location_id: i64, object_uuid: impl Into<String>) -> Self {
        CsiIdentifier {
            encoding_version: ENCODING_VERSION_V2,
            cluster_id: cluster_id.into(),
            location_id,
            object_uuid: object_uuid.into(),
            name_prefix: None,
        }
    }

    pub fn with_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = Some(prefix.into());
        self
    }

    /// Encodes as V2 (current, authoritative encoding). Fails iff the
    /// cluster ID + name prefix pushes the total length over
    /// `MAX_VOLUME_ID_LEN`.
    pub fn encode(&self) -> DriverResult<String> {
        let prefix = self.name_prefix.clone().unwrap_or_default();
        // V2 layout always carries all six dash-separated segments, even
        // when the name-prefix is empty (yielding a `-plen--uuid` double
        // dash) so that decoding does not need to special-case length 0.
        let id = format!(
            "{:04x}-{:04x}-{}-{:016x}-{:04x}-{}-{}",
            self.encoding_version,
            self.cluster_id.len(),
            self.cluster_id,
            self.location_id,
            prefix.len(),
            prefix,
            self.object_uuid,
        );
        if id.len() > MAX_VOLUME_ID_LEN {
            return Err(DriverError::InvalidArgument(format!(
                "encoded CSI ID length {} exceeds max {}",
                id.len(),
                MAX_VOLUME_ID_LEN
            )));
        }
        Ok(id)
    }

    /// Decodes `id`, dispatching to V1 or V2 by inspecting the leading
    /// version field. Fails with `InvalidVolId` on underflow/overflow or bad
    /// hex at any step.
    pub fn decode(id: &str) -> DriverResult<CsiIdentifier> {
        let parts: Vec<&str> = id.split('-').collect();
        let version = parse_hex_u16(id, parts.first())?;
        match version {
            ENCODING_VERSION_V2 => decode_v2(id, &parts),
            ENCODING_VERSION_V1 => decode_v1(id, &parts),
            other => Err(DriverError::InvalidVolId {
                id: id.to_string(),
                reason: format!("unsupported encoding version {other}"),
            }),
        }
    }
}

fn parse_hex_u16(id: &str, field: Option<&&str>) -> DriverResult<u16> {
    let field = field.ok_or_else(|| DriverError::InvalidVolId {
        id: id.to_string(),
        reason: "missing version field".to_string(),
    })?;
    u16::from_str_radix(field, 16).map_err(|e| DriverError::InvalidVolId {
        id: id.to_string(),
        reason: format!("bad version hex: {e}"),
    })
}

fn decode_v1(id: &str, parts: &[&str]) -> DriverResult<CsiIdentifier> {
    // <ver>-<clen>-<clusterID...>-<locID>-<uuid>
    // The UUID itself contains dashes, so it is carved off the tail of the
    // string by fixed length rather than via `parts.last()`.
    if parts.len() < 4 {
        return Err(DriverError::InvalidVolId {
            id: id.to_string(),
            reason: "V1 id has too few fields".to_string(),
        });
    }
    let clen: usize = parts[1].parse().map_err(|_| DriverError::InvalidVolId {
        id: id.to_string(),
        reason: "bad cluster-id length field".to_string(),
    })?;
    if id.len() < UUID_LEN + 1 {
        return Err(DriverError::InvalidVolId {
            id: id.to_string(),
            reason: "id shorter than a uuid field".to_string(),
        });
    }
    let uuid = &id[id.len() - UUID_LEN..];
    let before_uuid = &id[..id.len() - UUID_LEN];
    let before_uuid = before_uuid.strip_suffix('-').ok_or_else(|| DriverError::InvalidVolId {
        id: id.to_string(),
        reason: "missing separator before uuid".to_string(),
    })?;
    let loc_start = before_uuid.rfind('-').ok_or_else(|| DriverError::InvalidVolId {
        id: id.to_string(),
        reason: "missing separator before location id".to_string(),
    })?;
    let loc_field = &before_uuid[loc_start + 1..];
    let location_id = i64::from_str_radix(loc_field, 16).map_err(|e| DriverError::InvalidVolId {
        id: id.to_string(),
        reason: format!("bad location-id hex: {e}"),
    })?;
    let header_len = parts[0].len() + 1 + parts[1].len() + 1;
    if loc_start < header_len + 1 {
        return Err(DriverError::InvalidVolId {
            id: id.to_string(),
            reason: "cluster-id field underflows id length".to_string(),
        });
    }
    let cluster_id = &before_uuid[header_len..loc_start - 1];
    if cluster_id.len() != clen {
        return Err(DriverError::InvalidVolId {
            id: id.to_string(),
            reason: "cluster-id length mismatch".to_string(),
        });
    }
    Ok(CsiIdentifier {
        encoding_version: ENCODING_VERSION_V1,
        cluster_id: cluster_id.to_string(),
        location_id,
        object_uuid: uuid.to_string(),
        name_prefix: None,
    })
}

fn decode_v2(id: &str, parts: &[&str]) -> DriverResult<CsiIdentifier> {
    // <ver>-<clen>-<clusterID...>-<locID>-<plen>-<prefix...>-<uuid>
    if parts.len() < 5 {
        return Err(DriverError::InvalidVolId {
            id: id.to_string(),
            reason: "V2 id has too few fields".to_string(),
        });
    }
    let clen: usize = parts[1].parse().map_err(|_| DriverError::InvalidVolId {
        id: id.to_string(),
        reason: "bad cluster-id length field".to_string(),
    })?;
    // Walk from the front: version, clen, then clen-chars worth of cluster
    // id (rejoined across any embedded dashes), then locID, then plen, then
    // plen-chars worth of prefix, then uuid.
    let header_len = parts[0].len() + 1 + parts[1].len() + 1;
    let rest = &id[header_len..];
    if rest.len() < clen {
        return Err(DriverError::InvalidVolId {
            id: id.to_string(),
            reason: "cluster-id field underflows id length".to_string(),
        });
    }
    let cluster_id = &rest[..clen];
    let after_cluster = &rest[clen..];
    let after_cluster = after_cluster.strip_prefix('-').ok_or_else(|| DriverError::InvalidVolId {
        id: id.to_string(),
        reason: "missing separator after cluster id".to_string(),
    })?;
    let loc_end = after_cluster.find('-').ok_or_else(|| DriverError::InvalidVolId {
        id: id.to_string(),
        reason: "missing separator after location id".to_string(),
    })?;
    let loc_field = &after_cluster[..loc_end];
    let location_id = i64::from_str_radix(loc_field, 16).map_err(|e| DriverError::InvalidVolId {
        id: id.to_string(),
        reason: format!("bad location-id hex: {e}"),
    })?;
    let after_loc = &after_cluster[loc_end + 1..];
    let plen_end = after_loc.find('-').ok_or_else(|| DriverError::InvalidVolId {
        id: id.to_string(),
        reason: "missing separator after name-prefix length".to_string(),
    })?;
    let plen: usize = usize::from_str_radix(&after_loc[..plen_end], 16).map_err(|e| DriverError::InvalidVolId {
        id: id.to_string(),
        reason: format!("bad name-prefix length hex: {e}"),
    })?;
    let after_plen = &after_loc[plen_end + 1..];
    if after_plen.len() < plen + 1 + UUID_LEN {
        return Err(DriverError::InvalidVolId {
            id: id.to_string(),
            reason: "name-prefix/uuid fields overflow id length".to_string(),
        });
    }
    let prefix = &after_plen[..plen];
    let remainder = &after_plen[plen..];
    let uuid = remainder.strip_prefix('-').ok_or_else(|| DriverError::InvalidVolId {
        id: id.to_string(),
        reason: "missing separator before uuid".to_string(),
    })?;
    if uuid.len() != UUID_LEN {
        return Err(DriverError::InvalidVolId {
            id: id.to_string(),
            reason: "uuid field is not 36 chars".to_string(),
        });
    }

    Ok(CsiIdentifier {
        encoding_version: ENCODING_VERSION_V2,
        cluster_id: cluster_id.to_string(),
        location_id,
        object_uuid: uuid.to_string(),
        name_prefix: if prefix.is_empty() {
            None
        } else {
            Some(prefix.to_string())
        },
    })
}
