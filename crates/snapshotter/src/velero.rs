//! Namespace resolution against the backup tool's restore resources.
//!
//! The host does not tell the plugin which restore it is working for, so
//! the plugin finds the relevant restore itself: the newest in-progress
//! restore whose backup matches the snapshot id. That works because the
//! host runs restores sequentially.

use std::collections::HashMap;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};

/// Phase string of an in-progress restore resource.
pub const RESTORE_PHASE_IN_PROGRESS: &str = "InProgress";

/// The fields of one restore resource the plugin consumes.
#[derive(Debug, Clone)]
pub struct RestoreInfo {
    pub name: String,
    pub backup_name: String,
    pub phase: String,
    pub namespace_mapping: HashMap<String, String>,
    pub created: DateTime<Utc>,
}

/// Target namespace for restoring a claim that lived in `source_ns`.
///
/// Picks the newest in-progress restore of `backup_name` (creation
/// timestamp descending, name as tie-break) and applies its namespace
/// mapping; an unmapped namespace restores into itself.
pub fn restore_namespace(
    mut restores: Vec<RestoreInfo>,
    source_ns: &str,
    backup_name: &str,
) -> Result<String> {
    restores.sort_by(|a, b| b.created.cmp(&a.created).then(b.name.cmp(&a.name)));

    for restore in &restores {
        if restore.phase == RESTORE_PHASE_IN_PROGRESS && restore.backup_name == backup_name {
            return Ok(restore
                .namespace_mapping
                .get(source_ns)
                .cloned()
                .unwrap_or_else(|| source_ns.to_string()));
        }
    }
    bail!("restore not found for backup {}", backup_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn restore(name: &str, backup: &str, phase: &str, secs: i64) -> RestoreInfo {
        RestoreInfo {
            name: name.to_string(),
            backup_name: backup.to_string(),
            phase: phase.to_string(),
            namespace_mapping: HashMap::new(),
            created: Utc.timestamp_opt(secs, 0).unwrap(),
        }
    }

    #[test]
    fn unmapped_namespace_restores_into_itself() {
        let restores = vec![restore("r1", "b1", RESTORE_PHASE_IN_PROGRESS, 100)];
        let ns = restore_namespace(restores, "apps", "b1").unwrap();
        assert_eq!(ns, "apps");
    }

    #[test]
    fn mapping_of_the_newest_in_progress_restore_wins() {
        let mut old = restore("r1", "b1", RESTORE_PHASE_IN_PROGRESS, 100);
        old.namespace_mapping
            .insert("apps".to_string(), "stale".to_string());
        let mut new = restore("r2", "b1", RESTORE_PHASE_IN_PROGRESS, 200);
        new.namespace_mapping
            .insert("apps".to_string(), "apps-restored".to_string());

        let ns = restore_namespace(vec![old, new], "apps", "b1").unwrap();
        assert_eq!(ns, "apps-restored");
    }

    #[test]
    fn completed_restores_are_ignored() {
        let restores = vec![
            restore("r1", "b1", "Completed", 300),
            restore("r2", "b1", RESTORE_PHASE_IN_PROGRESS, 100),
        ];
        let ns = restore_namespace(restores, "apps", "b1").unwrap();
        assert_eq!(ns, "apps");
    }

    #[test]
    fn no_matching_restore_is_an_error() {
        let restores = vec![restore("r1", "other", RESTORE_PHASE_IN_PROGRESS, 100)];
        assert!(restore_namespace(restores, "apps", "b1").is_err());
    }

    #[test]
    fn name_breaks_creation_time_ties() {
        let mut a = restore("r-a", "b1", RESTORE_PHASE_IN_PROGRESS, 100);
        a.namespace_mapping
            .insert("apps".to_string(), "from-a".to_string());
        let mut b = restore("r-b", "b1", RESTORE_PHASE_IN_PROGRESS, 100);
        b.namespace_mapping
            .insert("apps".to_string(), "from-b".to_string());

        let ns = restore_namespace(vec![a, b], "apps", "b1").unwrap();
        assert_eq!(ns, "from-b");
    }
}
