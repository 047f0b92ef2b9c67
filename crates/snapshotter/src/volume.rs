//! In-memory views of volumes and snapshots known to the plugin.

use control_client::{CasSpec, OpStatus};

/// Cached view of one volume.
#[derive(Debug, Clone, Default)]
pub struct Volume {
    /// Persistent-volume name.
    pub name: String,
    /// Source volume when this one is a local clone.
    pub src_volume: Option<String>,
    /// Namespace of the bound claim.
    pub namespace: String,
    /// Volume name used in remote object keys; differs from `name` after a
    /// restore into a fresh claim.
    pub snapshot_tag: String,
    /// Snapshot currently being worked on for this volume.
    pub backup_name: String,
    pub storage_class: String,
    /// Size as the claim requests it (a quantity string such as `1Gi`).
    pub size: String,
    /// Created by the engine's CSI driver (as opposed to the legacy
    /// external provisioner).
    pub is_csi: bool,
    /// iSCSI access parameters, set while restoring a non-CSI volume.
    pub iscsi: Option<CasSpec>,
    pub backup_status: OpStatus,
    pub restore_status: OpStatus,
}

/// Snapshot info resolved from a snapshot id.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub volume: String,
    pub backup: String,
    pub namespace: String,
    pub schedule: Option<String>,
}
