//! The opaque snapshot id handed to the plugin host.
//!
//! Encodes `{volume, backup}` as `<volume>-velero-bkp-<backup>`. For
//! scheduled backups the schedule is recoverable from the backup name's
//! fixed-width timestamp suffix; ids from older releases that spell the
//! schedule out as `<volume>-velero-bkp-<schedule>-velero-bkp-<backup>`
//! still decode.

use anyhow::{bail, Result};

use crate::incremental::schedule_name;

const SEPARATOR: &str = "-velero-bkp-";

/// Decoded snapshot id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotId {
    pub volume: String,
    /// Schedule the backup belongs to; `None` for one-off backups.
    pub schedule: Option<String>,
    pub backup: String,
}

impl SnapshotId {
    pub fn new(volume: impl Into<String>, backup: impl Into<String>) -> Self {
        let backup = backup.into();
        SnapshotId {
            volume: volume.into(),
            schedule: schedule_name(&backup),
            backup,
        }
    }

    /// Render the id the host stores.
    pub fn encode(&self) -> String {
        format!("{}{}{}", self.volume, SEPARATOR, self.backup)
    }

    /// Parse an id produced by [`encode`](Self::encode) or by an older
    /// release.
    pub fn decode(snapshot_id: &str) -> Result<Self> {
        let parts: Vec<&str> = snapshot_id.split(SEPARATOR).collect();
        let (volume, schedule, backup) = match parts.as_slice() {
            [volume, backup] => (*volume, schedule_name(backup), backup.to_string()),
            [volume, schedule, backup] => {
                (*volume, Some(schedule.to_string()), backup.to_string())
            }
            _ => bail!("invalid snapshot id '{}'", snapshot_id),
        };

        if volume.is_empty() || backup.is_empty() {
            bail!("invalid snapshot id '{}'", snapshot_id);
        }

        Ok(SnapshotId {
            volume: volume.to_string(),
            schedule: schedule.filter(|s| !s.is_empty()),
            backup,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_the_host_visible_shape() {
        let id = SnapshotId::new("pv-1", "b1");
        assert_eq!(id.encode(), "pv-1-velero-bkp-b1");
    }

    #[test]
    fn round_trips_non_scheduled_ids() {
        let id = SnapshotId::new("pv-1", "b1");
        let decoded = SnapshotId::decode(&id.encode()).unwrap();
        assert_eq!(decoded, id);
        assert_eq!(decoded.schedule, None);
    }

    #[test]
    fn round_trips_scheduled_ids() {
        let id = SnapshotId::new("pv-1", "sch-20240103000000");
        assert_eq!(id.schedule.as_deref(), Some("sch"));

        let decoded = SnapshotId::decode("pv-1-velero-bkp-sch-20240103000000").unwrap();
        assert_eq!(decoded.volume, "pv-1");
        assert_eq!(decoded.schedule.as_deref(), Some("sch"));
        assert_eq!(decoded.backup, "sch-20240103000000");
    }

    #[test]
    fn decodes_the_explicit_schedule_shape() {
        let decoded =
            SnapshotId::decode("pv-1-velero-bkp-sch-velero-bkp-sch-20240103000000").unwrap();
        assert_eq!(decoded.volume, "pv-1");
        assert_eq!(decoded.schedule.as_deref(), Some("sch"));
        assert_eq!(decoded.backup, "sch-20240103000000");
    }

    #[test]
    fn rejects_malformed_ids() {
        assert!(SnapshotId::decode("justonepiece").is_err());
        assert!(SnapshotId::decode("-velero-bkp-b1").is_err());
        assert!(SnapshotId::decode("pv-1-velero-bkp-").is_err());
        assert!(SnapshotId::decode("a-velero-bkp-b-velero-bkp-c-velero-bkp-d").is_err());
    }
}
