//! Volume snapshotter plugin core.
//!
//! Implements the backup tool's volume-snapshotter contract for a
//! cStor-style block-storage engine. One plugin instance owns a cloud
//! connection, a control-plane client, and in-memory volume/snapshot
//! tables; each `create_snapshot`/`create_volume_from_snapshot` call runs
//! one reconciliation: issue the engine request, stand up the data-plane
//! transfer server, poll the control plane to a terminal status, and wind
//! the server down.

mod config;
mod incremental;
mod k8s;
mod plugin;
mod pv;
mod snapshot_id;
mod velero;
mod volume;

pub use config::PluginConfig;
pub use incremental::{previous_snapshot, restore_chain, schedule_name};
pub use k8s::{ClaimPhase, ClaimView, KubeClientOps, KubeOps, NamespaceState, ReplicaView};
pub use plugin::{CstorPlugin, CSTOR_SNAPSHOT_TYPE};
pub use pv::{CAS_TYPE_LABEL, CSTOR_CSI_DRIVER};
pub use snapshot_id::SnapshotId;
pub use velero::{restore_namespace, RestoreInfo, RESTORE_PHASE_IN_PROGRESS};
pub use volume::{Snapshot, Volume};

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;

/// The contract the plugin host drives.
///
/// `init` is the constructor ([`CstorPlugin::init`]); everything else maps
/// one to one onto the host's snapshotter calls. Snapshot ids returned from
/// [`create_snapshot`](Self::create_snapshot) are opaque to the host and
/// round-trip through the PV operations.
#[async_trait]
pub trait VolumeSnapshotter: Send + Sync {
    /// Snapshot `volume_id` and upload it. Returns the snapshot id.
    async fn create_snapshot(
        &self,
        volume_id: &str,
        volume_az: &str,
        tags: &HashMap<String, String>,
    ) -> Result<String>;

    /// Delete the engine-side backup and the remote bytes object.
    /// An empty snapshot id is a no-op.
    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<()>;

    /// Create a replacement volume and stream the snapshot back into it.
    /// Returns the new volume's name.
    async fn create_volume_from_snapshot(
        &self,
        snapshot_id: &str,
        volume_type: &str,
        volume_az: &str,
        iops: Option<i64>,
    ) -> Result<String>;

    /// Identify the volume behind an unstructured PV map, registering it
    /// in the volume table. `None` means the PV is not ours.
    fn get_volume_id(&self, pv: &serde_json::Value) -> Result<Option<String>>;

    /// Patch an unstructured PV map to point at `volume_id`.
    fn set_volume_id(&self, pv: &serde_json::Value, volume_id: &str) -> Result<serde_json::Value>;

    /// Volume type (and IOPS, never set for this engine) for the host.
    async fn get_volume_info(&self, volume_id: &str, volume_az: &str)
        -> Result<(String, Option<i64>)>;

    /// Whether the engine reports the volume healthy.
    async fn is_volume_ready(&self, volume_id: &str, volume_az: &str) -> Result<bool>;
}
