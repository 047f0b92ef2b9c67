//! Wire types for the engine's backup/restore resources.

use serde::{Deserialize, Serialize};

/// Progress of a backup or restore resource.
///
/// `Done`, `Failed`, and `Invalid` are terminal; everything else means the
/// engine is still working and the reconciler keeps polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum OpStatus {
    #[default]
    #[serde(rename = "")]
    Empty,
    Init,
    Pending,
    InProgress,
    Done,
    Failed,
    Invalid,
}

impl OpStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, OpStatus::Done | OpStatus::Failed | OpStatus::Invalid)
    }
}

/// The subset of resource metadata the engine cares about.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Metadata {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
}

/// Backup request body.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct BackupSpec {
    /// Backup name; the schedule name for scheduled backups.
    pub backup_name: String,
    pub volume_name: String,
    /// Snapshot name; differs from `backup_name` only for scheduled backups.
    pub snap_name: String,
    /// `host:port` of the transfer server replicas upload to.
    pub backup_dest: String,
    /// Parent snapshot for an incremental delta; empty means full.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_snap_name: Option<String>,
    /// Snapshot stays inside the engine, no remote upload.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub local_snap: bool,
}

/// A backup resource as the engine reports it.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BackupResource {
    #[serde(default)]
    pub metadata: Metadata,
    pub spec: BackupSpec,
    #[serde(default)]
    pub status: OpStatus,
}

impl BackupResource {
    pub fn new(namespace: impl Into<String>, spec: BackupSpec) -> Self {
        BackupResource {
            metadata: Metadata {
                name: String::new(),
                namespace: namespace.into(),
            },
            spec,
            status: OpStatus::default(),
        }
    }
}

/// Restore request body.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RestoreSpec {
    pub restore_name: String,
    pub volume_name: String,
    /// `host:port` of the transfer server replicas download from.
    pub restore_src: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub storage_class: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub size: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub local_restore: bool,
}

/// A restore resource as the engine reports it.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RestoreResource {
    #[serde(default)]
    pub metadata: Metadata,
    pub spec: RestoreSpec,
    #[serde(default)]
    pub status: OpStatus,
}

impl RestoreResource {
    pub fn new(namespace: impl Into<String>, spec: RestoreSpec) -> Self {
        RestoreResource {
            metadata: Metadata {
                name: String::new(),
                namespace: namespace.into(),
            },
            spec,
            status: OpStatus::default(),
        }
    }
}

/// iSCSI access parameters the engine returns when restoring a non-CSI
/// volume.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CasInfo {
    #[serde(default)]
    pub spec: CasSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CasSpec {
    #[serde(default)]
    pub target_portal: String,
    #[serde(default)]
    pub iqn: String,
    #[serde(default)]
    pub lun: i32,
    #[serde(default)]
    pub fs_type: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_terminality() {
        assert!(OpStatus::Done.is_terminal());
        assert!(OpStatus::Failed.is_terminal());
        assert!(OpStatus::Invalid.is_terminal());
        assert!(!OpStatus::Empty.is_terminal());
        assert!(!OpStatus::Init.is_terminal());
        assert!(!OpStatus::InProgress.is_terminal());
        assert!(!OpStatus::Pending.is_terminal());
    }

    #[test]
    fn backup_spec_wire_shape() {
        let spec = BackupSpec {
            backup_name: "sch".to_string(),
            volume_name: "pv-1".to_string(),
            snap_name: "sch-20240103000000".to_string(),
            backup_dest: "10.0.0.5:9001".to_string(),
            prev_snap_name: Some("sch-20240102000000".to_string()),
            local_snap: false,
        };
        let value = serde_json::to_value(&spec).unwrap();
        assert_eq!(value["backupName"], "sch");
        assert_eq!(value["snapName"], "sch-20240103000000");
        assert_eq!(value["backupDest"], "10.0.0.5:9001");
        assert_eq!(value["prevSnapName"], "sch-20240102000000");
        // localSnap is elided when false.
        assert!(value.get("localSnap").is_none());
    }

    #[test]
    fn status_accepts_engine_strings() {
        let resource: BackupResource = serde_json::from_str(
            r#"{"metadata":{"namespace":"openebs"},"spec":{"backupName":"b1","volumeName":"pv-1","snapName":"b1","backupDest":"1.2.3.4:9001"},"status":"InProgress"}"#,
        )
        .unwrap();
        assert_eq!(resource.status, OpStatus::InProgress);
        assert_eq!(resource.metadata.namespace, "openebs");
    }
}
