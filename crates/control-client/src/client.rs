//! HTTP plumbing for the engine's REST API.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::{Method, StatusCode};
use tracing::{debug, warn};

use crate::types::{BackupResource, CasInfo, OpStatus, RestoreResource};

const BACKUP_ENDPOINT: &str = "/latest/backups/";
const RESTORE_ENDPOINT: &str = "/latest/restore/";

/// Default request timeout; overridable through `restApiTimeout`.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// JSON-over-HTTP client against the engine's control plane.
#[derive(Clone)]
pub struct ControlClient {
    base_url: String,
    http: reqwest::Client,
}

impl ControlClient {
    /// `base_url` is the engine API address, e.g. `http://10.0.0.2:5656`.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build control-plane HTTP client")?;
        Ok(ControlClient {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Ask the engine to start a backup.
    pub async fn create_backup(&self, backup: &BackupResource) -> Result<()> {
        let url = format!("{}{}", self.base_url, BACKUP_ENDPOINT);
        let response = self
            .http
            .request(Method::POST, &url)
            .json(backup)
            .send()
            .await
            .context("error when connecting to the engine API server")?;
        Self::expect_success(response.status())?;
        Ok(())
    }

    /// Current status of `backup`.
    pub async fn backup_status(&self, backup: &BackupResource) -> Result<OpStatus> {
        let url = format!("{}{}", self.base_url, BACKUP_ENDPOINT);
        let response = self
            .http
            .request(Method::GET, &url)
            .json(backup)
            .send()
            .await
            .context("error when connecting to the engine API server")?;
        Self::expect_success(response.status())?;

        let resource: BackupResource = response
            .json()
            .await
            .context("unable to decode backup status response")?;
        debug!(snap = %backup.spec.snap_name, status = ?resource.status, "polled backup");
        Ok(resource.status)
    }

    /// Delete the backup resource (and the engine-side snapshot) named
    /// `snap_name`.
    pub async fn delete_backup(
        &self,
        snap_name: &str,
        volume: &str,
        namespace: &str,
        schedule: &str,
    ) -> Result<()> {
        let url = format!("{}{}{}", self.base_url, BACKUP_ENDPOINT, snap_name);
        let response = self
            .http
            .request(Method::DELETE, &url)
            .query(&[
                ("volume", volume),
                ("namespace", namespace),
                ("schedule", schedule),
            ])
            .send()
            .await
            .context("error when connecting to the engine API server")?;
        Self::expect_success(response.status())
    }

    /// Ask the engine to start a restore. Non-CSI volumes answer with the
    /// iSCSI access parameters of the freshly created target.
    pub async fn create_restore(&self, restore: &RestoreResource) -> Result<Option<CasInfo>> {
        let url = format!("{}{}", self.base_url, RESTORE_ENDPOINT);
        let response = self
            .http
            .request(Method::POST, &url)
            .json(restore)
            .send()
            .await
            .context("error when connecting to the engine API server")?;
        Self::expect_success(response.status())?;

        let body = response
            .text()
            .await
            .context("unable to read restore response")?;
        if body.trim().is_empty() || body.trim() == "null" {
            return Ok(None);
        }
        match serde_json::from_str::<CasInfo>(&body) {
            Ok(info) => Ok(Some(info)),
            Err(err) => {
                warn!(error = %err, "restore response carried no usable cas-info");
                Ok(None)
            }
        }
    }

    /// Current status of `restore`.
    pub async fn restore_status(&self, restore: &RestoreResource) -> Result<OpStatus> {
        let url = format!("{}{}", self.base_url, RESTORE_ENDPOINT);
        let response = self
            .http
            .request(Method::GET, &url)
            .json(restore)
            .send()
            .await
            .context("error when connecting to the engine API server")?;
        Self::expect_success(response.status())?;

        let resource: RestoreResource = response
            .json()
            .await
            .context("unable to decode restore status response")?;
        debug!(restore = %restore.spec.restore_name, status = ?resource.status, "polled restore");
        Ok(resource.status)
    }

    fn expect_success(status: StatusCode) -> Result<()> {
        if !status.is_success() {
            bail!("engine API returned status {}", status);
        }
        Ok(())
    }
}
