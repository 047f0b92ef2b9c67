//! Operations on unstructured persistent-volume maps.
//!
//! The host hands PV specs over as loose JSON; these helpers decide
//! ownership and patch the volume identity without a typed schema.

use anyhow::{bail, Result};
use control_client::CasSpec;
use serde_json::Value;

/// Driver name on PVs provisioned by the engine's CSI driver.
pub const CSTOR_CSI_DRIVER: &str = "cstor.csi.openebs.io";

/// Label carried by PVs provisioned by the legacy external provisioner.
pub const CAS_TYPE_LABEL: &str = "openebs.io/cas-type";

const CAS_TYPE: &str = "cstor";

/// Identity of a PV the plugin owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PvInfo {
    pub name: String,
    pub namespace: String,
    pub storage_class: String,
    pub is_csi: bool,
}

/// Decide whether `pv` belongs to the engine and extract its identity.
///
/// `Ok(None)` means "not ours, skip": foreign driver, missing basics, or
/// not bound yet. A PV in `Released`/`Failed` phase is an error.
pub fn volume_info_from_pv(pv: &Value) -> Result<Option<PvInfo>> {
    let name = pv["metadata"]["name"].as_str().unwrap_or_default();
    let storage_class = pv["spec"]["storageClassName"].as_str().unwrap_or_default();
    if name.is_empty() || storage_class.is_empty() {
        return Ok(None);
    }

    let is_csi = pv["spec"]["csi"]["driver"].as_str() == Some(CSTOR_CSI_DRIVER);
    let labeled = pv["metadata"]["labels"][CAS_TYPE_LABEL].as_str() == Some(CAS_TYPE);
    if !is_csi && !labeled {
        return Ok(None);
    }

    let phase = pv["status"]["phase"].as_str().unwrap_or_default();
    if phase == "Released" || phase == "Failed" {
        bail!("pv {} is in {} state", name, phase);
    }

    let namespace = pv["spec"]["claimRef"]["namespace"]
        .as_str()
        .unwrap_or_default();
    if namespace.is_empty() || phase != "Bound" {
        return Ok(None);
    }

    Ok(Some(PvInfo {
        name: name.to_string(),
        namespace: namespace.to_string(),
        storage_class: storage_class.to_string(),
        is_csi,
    }))
}

/// Rewrite `pv` to point at `volume_id`: the PV name, the CSI volume
/// handle when present, and the iSCSI target parameters when the restore
/// produced them.
pub fn set_volume_id_in_pv(pv: &Value, volume_id: &str, iscsi: Option<&CasSpec>) -> Result<Value> {
    let mut pv = pv.clone();

    if !pv["metadata"].is_object() {
        bail!("pv spec has no metadata");
    }
    pv["metadata"]["name"] = Value::String(volume_id.to_string());

    if pv["spec"]["csi"].is_object() {
        pv["spec"]["csi"]["volumeHandle"] = Value::String(volume_id.to_string());
    } else if let Some(cas) = iscsi {
        pv["spec"]["iscsi"] = serde_json::json!({
            "targetPortal": cas.target_portal,
            "iqn": cas.iqn,
            "lun": cas.lun,
            "fsType": cas.fs_type,
            "readOnly": false,
        });
    }

    Ok(pv)
}
