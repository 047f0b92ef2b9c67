//! Incremental-backup bookkeeping.
//!
//! Scheduled backups are named `<schedule>-<yyyymmddhhmmss>`. The suffix is
//! fixed width, so lexicographic order over the names is chronological
//! order; everything here leans on that.

use anyhow::{bail, Result};
use chrono::NaiveDateTime;

const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";
const TIMESTAMP_LEN: usize = 14;

/// Schedule a backup name belongs to: everything before a valid
/// `-yyyymmddhhmmss` suffix. `None` when the name carries no timestamp,
/// i.e. the backup was not created by a schedule.
pub fn schedule_name(backup: &str) -> Option<String> {
    let (schedule, suffix) = backup.rsplit_once('-')?;
    if schedule.is_empty() || suffix.len() != TIMESTAMP_LEN {
        return None;
    }
    NaiveDateTime::parse_from_str(suffix, TIMESTAMP_FORMAT).ok()?;
    Some(schedule.to_string())
}

/// Parent snapshot for the next backup of a schedule, given the names of
/// the prior successful backups.
///
/// `None` means the next backup is a full one: either incremental backups
/// are disabled, or this backup's position starts a new group (every
/// `increments + 1`'th backup of the schedule is full).
pub fn previous_snapshot(prior_successful: &[String], increments: u64) -> Option<String> {
    if increments == 0 || prior_successful.is_empty() {
        return None;
    }

    let group = increments + 1;
    if (prior_successful.len() as u64 + 1) % group == 0 {
        return None;
    }

    let mut sorted = prior_successful.to_vec();
    sorted.sort();
    sorted.pop()
}

/// Snapshots to replay, in order, to reconstruct `target`: the schedule's
/// snapshots from the base up to and including the target.
pub fn restore_chain(snapshots: &[String], target: &str) -> Result<Vec<String>> {
    let mut sorted = snapshots.to_vec();
    sorted.sort();

    let position = match sorted.iter().position(|name| name == target) {
        Some(position) => position,
        None => bail!("targeted backup={} not found in snapshot list", target),
    };

    sorted.truncate(position + 1);
    Ok(sorted)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn schedule_name_requires_a_timestamp_suffix() {
        assert_eq!(schedule_name("sch-20240103000000").as_deref(), Some("sch"));
        assert_eq!(
            schedule_name("daily-db-20240103235959").as_deref(),
            Some("daily-db")
        );
        assert_eq!(schedule_name("b1"), None);
        assert_eq!(schedule_name("sch-2024"), None);
        assert_eq!(schedule_name("sch-2024010300000x"), None);
        // 14 digits that are not a valid datetime
        assert_eq!(schedule_name("sch-20241399000000"), None);
    }

    #[test]
    fn full_backup_when_incremental_disabled() {
        let prior = names(&["sch-20240101000000"]);
        assert_eq!(previous_snapshot(&prior, 0), None);
    }

    #[test]
    fn first_backup_of_a_schedule_is_full() {
        assert_eq!(previous_snapshot(&[], 1), None);
    }

    #[test]
    fn third_backup_rides_on_the_second() {
        let prior = names(&["sch-20240101000000", "sch-20240102000000"]);
        assert_eq!(
            previous_snapshot(&prior, 1).as_deref(),
            Some("sch-20240102000000")
        );
    }

    #[test]
    fn group_boundary_forces_a_full_backup() {
        // Second backup with increments=1: total count 2 divides the group
        // size, so a new full group starts.
        let prior = names(&["sch-20240101000000"]);
        assert_eq!(previous_snapshot(&prior, 1), None);

        let prior = names(&[
            "sch-20240101000000",
            "sch-20240102000000",
            "sch-20240103000000",
        ]);
        // Fourth backup with increments=1 starts a new group too.
        assert_eq!(previous_snapshot(&prior, 1), None);
    }

    #[test]
    fn parent_is_the_chronologically_last_regardless_of_input_order() {
        let prior = names(&["sch-20240102000000", "sch-20240101000000"]);
        assert_eq!(
            previous_snapshot(&prior, 1).as_deref(),
            Some("sch-20240102000000")
        );
    }

    #[test]
    fn chain_runs_from_base_to_target_in_ascending_order() {
        let snapshots = names(&[
            "sch-20240102000000",
            "sch-20240103000000",
            "sch-20240101000000",
        ]);
        let chain = restore_chain(&snapshots, "sch-20240103000000").unwrap();
        assert_eq!(
            chain,
            names(&[
                "sch-20240101000000",
                "sch-20240102000000",
                "sch-20240103000000",
            ])
        );
    }

    #[test]
    fn chain_stops_at_the_target() {
        let snapshots = names(&[
            "sch-20240101000000",
            "sch-20240102000000",
            "sch-20240103000000",
        ]);
        let chain = restore_chain(&snapshots, "sch-20240102000000").unwrap();
        assert_eq!(
            chain,
            names(&["sch-20240101000000", "sch-20240102000000"])
        );
    }

    #[test]
    fn chain_requires_the_target_to_exist() {
        let snapshots = names(&["sch-20240101000000"]);
        assert!(restore_chain(&snapshots, "sch-20240109000000").is_err());
    }
}
