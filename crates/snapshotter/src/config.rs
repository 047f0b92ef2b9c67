//! Plugin configuration.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use transfer_server::{BACKUP_PORT, RESTORE_PORT};

/// Environment variable carrying the backup tool's install namespace; used
/// to look up restores for namespace mapping.
pub const VELERO_NAMESPACE_ENV: &str = "VELERO_NAMESPACE";

// Configuration map keys (the blob-store keys are parsed separately).
const NAMESPACE: &str = "namespace";
const LOCAL: &str = "local";
const RESTORE_ALL_INCREMENTAL: &str = "restoreAllIncrementalSnapshots";
const AUTO_SET_TARGET_IP: &str = "autoSetTargetIP";
const INCREMENTAL: &str = "incremental";
const REST_API_TIMEOUT: &str = "restApiTimeout";

/// Parsed plugin options.
#[derive(Debug, Clone)]
pub struct PluginConfig {
    /// Engine install namespace; scopes API-service discovery and replica
    /// lookups.
    pub namespace: String,
    /// Skip all remote I/O; snapshots exist only inside the engine.
    pub local: bool,
    /// Restore the whole chain from the schedule's base instead of the
    /// single target snapshot.
    pub restore_all_snapshots: bool,
    /// Annotate replicas `restore-completed` after a restore and wait for
    /// them to come back healthy.
    pub auto_set_target_ip: bool,
    /// Every `incremental + 1`'th backup of a schedule is a full one;
    /// 0 disables incremental backups.
    pub incremental: u64,
    /// Control-plane request timeout.
    pub rest_api_timeout: Duration,
    /// Backup tool's install namespace, from `VELERO_NAMESPACE`.
    pub velero_namespace: String,

    pub backup_port: u16,
    pub restore_port: u16,

    /// Status poll cadence.
    pub poll_interval: Duration,
    /// Claim-bound / replica-ready wait: `wait_count` steps of
    /// `wait_interval`.
    pub wait_count: u32,
    pub wait_interval: Duration,
    /// Cap on waiting for a namespace to become usable.
    pub namespace_create_timeout: Duration,
}

impl PluginConfig {
    pub fn from_map(config: &HashMap<String, String>) -> Result<Self> {
        let namespace = config
            .get(NAMESPACE)
            .cloned()
            .filter(|ns| !ns.is_empty())
            .context("namespace not provided in plugin configuration")?;

        let rest_api_timeout = match config.get(REST_API_TIMEOUT) {
            None => control_client::DEFAULT_TIMEOUT,
            Some(raw) => humantime::parse_duration(raw)
                .with_context(|| format!("failed to parse {}='{}'", REST_API_TIMEOUT, raw))?,
        };

        let incremental = match config.get(INCREMENTAL) {
            None => 0,
            Some(raw) => raw
                .parse::<u64>()
                .with_context(|| format!("failed to parse {}='{}'", INCREMENTAL, raw))?,
        };

        Ok(PluginConfig {
            namespace,
            local: parse_flag(config.get(LOCAL))?,
            restore_all_snapshots: parse_flag(config.get(RESTORE_ALL_INCREMENTAL))?,
            auto_set_target_ip: parse_flag(config.get(AUTO_SET_TARGET_IP))?,
            incremental,
            rest_api_timeout,
            velero_namespace: std::env::var(VELERO_NAMESPACE_ENV).unwrap_or_default(),
            backup_port: BACKUP_PORT,
            restore_port: RESTORE_PORT,
            poll_interval: Duration::from_secs(5),
            wait_count: 100,
            wait_interval: Duration::from_secs(5),
            namespace_create_timeout: Duration::from_secs(5 * 60),
        })
    }
}

fn parse_flag(value: Option<&String>) -> Result<bool> {
    match value.map(|v| v.to_ascii_lowercase()) {
        None => Ok(false),
        Some(v) if v.is_empty() => Ok(false),
        Some(v) => match v.as_str() {
            "true" | "yes" | "1" => Ok(true),
            "false" | "no" | "0" => Ok(false),
            other => bail!("failed to parse flag value '{}'", other),
        },
    }
}
