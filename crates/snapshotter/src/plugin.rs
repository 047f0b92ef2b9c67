//! The reconciler behind the host-facing snapshotter surface.

use std::collections::HashMap;
use std::net::{IpAddr, UdpSocket};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use blob_store::{parse_quantity, CloudConfig, PVC_SUFFIX};
use control_client::{
    BackupResource, BackupSpec, ControlClient, OpStatus, RestoreResource, RestoreSpec,
};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use transfer_server::{CloudConn, TransferCounts};
use uuid::Uuid;

use crate::config::PluginConfig;
use crate::incremental::{previous_snapshot, restore_chain, schedule_name};
use crate::k8s::{ClaimPhase, KubeClientOps, KubeOps, NamespaceState};
use crate::pv::{set_volume_id_in_pv, volume_info_from_pv};
use crate::snapshot_id::SnapshotId;
use crate::velero::restore_namespace;
use crate::volume::{Snapshot, Volume};
use crate::VolumeSnapshotter;

/// Snapshot type literal the host passes for this engine.
pub const CSTOR_SNAPSHOT_TYPE: &str = "cstor-snapshot";

const BACKUP_TAG: &str = "velero.io/backup";
const SCHEDULE_TAG: &str = "velero.io/schedule-name";

const CLONE_PREFIX: &str = "cstor-clone-";
const CREATED_THROUGH_ANNOTATION: &str = "openebs.io/created-through";
const RESTORE_COMPLETED_ANNOTATION: &str = "openebs.io/restore-completed";
const BETA_STORAGE_CLASS_ANNOTATION: &str = "volume.beta.kubernetes.io/storage-class";

const REPLICA_HEALTHY_PHASES: &[&str] = &["Online", "Degraded"];
const REPLICA_SETTLED_PHASES: &[&str] = &["Online", "Degraded", "Error"];

/// Snapshotter plugin for the cStor engine.
pub struct CstorPlugin {
    config: PluginConfig,
    conn: CloudConn,
    control: ControlClient,
    kube: Arc<dyn KubeOps>,
    /// Address replicas dial to reach the transfer servers.
    server_address: String,
    volumes: Mutex<HashMap<String, Volume>>,
    snapshots: Mutex<HashMap<String, Snapshot>>,
}

impl CstorPlugin {
    /// Initialise against the in-cluster Kubernetes API.
    pub async fn init(config: &HashMap<String, String>) -> Result<Self> {
        let kube = Arc::new(KubeClientOps::new().await?);
        Self::init_with_kube(config, kube).await
    }

    /// Initialise with an explicit Kubernetes seam.
    pub async fn init_with_kube(
        config: &HashMap<String, String>,
        kube: Arc<dyn KubeOps>,
    ) -> Result<Self> {
        let plugin_config = PluginConfig::from_map(config)?;

        let api_url = kube.engine_api_url(&plugin_config.namespace).await?;
        let control = ControlClient::new(api_url, plugin_config.rest_api_timeout)?;

        let cloud_config = CloudConfig::from_map(config)?;
        let conn = CloudConn::new(&cloud_config)?;

        let server_address = local_server_ip()
            .context("error fetching the transfer server address")?
            .to_string();

        Ok(Self::with_parts(
            plugin_config,
            conn,
            control,
            kube,
            server_address,
        ))
    }

    /// Assemble from prebuilt parts; the seam test harnesses use.
    pub fn with_parts(
        config: PluginConfig,
        conn: CloudConn,
        control: ControlClient,
        kube: Arc<dyn KubeOps>,
        server_address: String,
    ) -> Self {
        CstorPlugin {
            config,
            conn,
            control,
            kube,
            server_address,
            volumes: Mutex::new(HashMap::new()),
            snapshots: Mutex::new(HashMap::new()),
        }
    }

    fn volume(&self, volume_id: &str) -> Option<Volume> {
        self.volumes.lock().unwrap().get(volume_id).cloned()
    }

    fn store_volume(&self, volume: Volume) {
        self.volumes
            .lock()
            .unwrap()
            .insert(volume.name.clone(), volume);
    }

    fn dest_addr(&self, port: u16) -> String {
        format!("{}:{}", self.server_address, port)
    }

    /// Wait for the transfer server to settle after the exit signal.
    async fn join_transfer(&self, task: JoinHandle<Result<TransferCounts>>) {
        match task.await {
            Ok(Ok(counts)) => info!(
                accepted = counts.accepted,
                success = counts.success,
                failed = counts.failed,
                "transfer server finished"
            ),
            Ok(Err(err)) => warn!(error = %err, "transfer server failed"),
            Err(err) => warn!(error = %err, "transfer server task died"),
        }
    }

    // ------------------------------------------------------------------
    // Backup
    // ------------------------------------------------------------------

    /// Upload the source claim's manifest next to the snapshot bytes.
    async fn backup_claim(&self, volume: &mut Volume) -> Result<()> {
        let manifest = self
            .kube
            .claim_for_volume(&volume.namespace, &volume.name)
            .await?
            .with_context(|| format!("failed to find claim for volume {}", volume.name))?;

        let manifest = scrub_claim(manifest)?;
        volume.size = claim_size(&manifest);
        volume.storage_class = manifest["spec"]["storageClassName"]
            .as_str()
            .unwrap_or_default()
            .to_string();

        let key = self
            .conn
            .layout()
            .sidecar_name(&volume.snapshot_tag, &volume.backup_name, PVC_SUFFIX);
        let data = serde_json::to_vec_pretty(&manifest).context("error doing json parsing")?;
        self.conn
            .store()
            .put(&key, data.into())
            .await
            .context("failed to upload claim manifest")?;
        Ok(())
    }

    /// Create the backup resource and poll it to a terminal status.
    /// Transport errors during a poll are retried on the next tick.
    async fn run_backup_to_terminal(&self, resource: &BackupResource) -> Result<OpStatus> {
        self.control
            .create_backup(resource)
            .await
            .context("error calling REST api")?;

        loop {
            tokio::time::sleep(self.config.poll_interval).await;
            match self.control.backup_status(resource).await {
                Err(err) => warn!(error = %err, "failed to fetch backup status"),
                Ok(status) => {
                    if let Some(volume) = self
                        .volumes
                        .lock()
                        .unwrap()
                        .get_mut(&resource.spec.volume_name)
                    {
                        volume.backup_status = status;
                    }
                    if status.is_terminal() {
                        return Ok(status);
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Restore
    // ------------------------------------------------------------------

    async fn ensure_namespace(&self, namespace: &str) -> Result<()> {
        let deadline = Instant::now() + self.config.namespace_create_timeout;
        loop {
            match self.kube.namespace_state(namespace).await? {
                NamespaceState::Active => return Ok(()),
                NamespaceState::Missing => break,
                NamespaceState::Terminating => {
                    if Instant::now() >= deadline {
                        bail!("namespace {} stayed terminating", namespace);
                    }
                    tokio::time::sleep(self.config.wait_interval).await;
                }
            }
        }

        info!(namespace, "creating namespace");
        self.kube
            .create_namespace(namespace)
            .await
            .context("failed to create namespace")
    }

    /// Reuse the original claim when it is already bound in the target
    /// namespace, otherwise create it and wait for a volume to bind.
    async fn claim_volume(&self, mut manifest: Value, id: &SnapshotId) -> Result<Volume> {
        let name = manifest["metadata"]["name"]
            .as_str()
            .context("claim manifest has no name")?
            .to_string();
        let namespace = manifest["metadata"]["namespace"]
            .as_str()
            .unwrap_or_default()
            .to_string();

        if let Some(existing) = self.kube.get_claim(&namespace, &name).await? {
            match existing.phase {
                ClaimPhase::Bound => {
                    info!(claim = %name, volume = %existing.volume_name, "reusing bound claim");
                    return Ok(Volume {
                        name: existing.volume_name,
                        namespace,
                        snapshot_tag: id.volume.clone(),
                        backup_name: id.backup.clone(),
                        storage_class: existing.storage_class,
                        size: existing.size,
                        ..Default::default()
                    });
                }
                phase => bail!("claim {}/{} is not bound ({:?})", namespace, name, phase),
            }
        }

        manifest["metadata"]["annotations"] = serde_json::json!({
            CREATED_THROUGH_ANNOTATION: "restore",
        });
        info!(claim = %name, namespace = %namespace, "creating claim for restore");
        self.kube
            .create_claim(&manifest)
            .await
            .with_context(|| format!("failed to create claim {}/{}", namespace, name))?;

        for _ in 0..self.config.wait_count {
            match self.kube.get_claim(&namespace, &name).await? {
                Some(claim) if claim.phase == ClaimPhase::Bound => {
                    info!(claim = %name, volume = %claim.volume_name, "claim bound");
                    return Ok(Volume {
                        name: claim.volume_name,
                        namespace,
                        snapshot_tag: id.volume.clone(),
                        backup_name: id.backup.clone(),
                        storage_class: claim.storage_class,
                        size: claim.size,
                        ..Default::default()
                    });
                }
                Some(claim) if claim.phase == ClaimPhase::Lost => {
                    if let Err(err) = self.kube.delete_claim(&namespace, &name).await {
                        warn!(claim = %name, error = %err, "failed to delete lost claim");
                    }
                    bail!("claim {}/{} was lost", namespace, name);
                }
                _ => {}
            }
            tokio::time::sleep(self.config.wait_interval).await;
        }
        bail!("claim {}/{} is not bound", namespace, name)
    }

    /// Stream one snapshot of the chain into `volume`.
    async fn restore_one(&self, volume: &mut Volume, id: &SnapshotId, snap: &str) -> Result<()> {
        let key = self.conn.remote_file_name(&id.volume, snap);

        self.conn.reset();
        let (ready_tx, ready_rx) = oneshot::channel();
        let server = {
            let conn = self.conn.clone();
            let key = key.clone();
            let port = self.config.restore_port;
            tokio::spawn(async move { conn.download(&key, port, ready_tx).await })
        };

        match ready_rx.await {
            Ok(Some(_)) => {}
            _ => {
                self.conn.request_exit();
                self.join_transfer(server).await;
                bail!("restore server is not ready");
            }
        }

        let resource = RestoreResource::new(
            self.config.namespace.clone(),
            RestoreSpec {
                restore_name: snap.to_string(),
                volume_name: volume.name.clone(),
                restore_src: self.dest_addr(self.config.restore_port),
                storage_class: volume.storage_class.clone(),
                size: volume.size.clone(),
                local_restore: false,
            },
        );

        let status = self.run_restore_to_terminal(&resource, volume).await;
        self.conn.request_exit();
        self.join_transfer(server).await;

        let status = status?;
        if status != OpStatus::Done {
            bail!("failed to restore snapshot={}, status:{:?}", snap, status);
        }
        info!(snap, volume = %volume.name, "restore of snapshot completed");
        Ok(())
    }

    async fn run_restore_to_terminal(
        &self,
        resource: &RestoreResource,
        volume: &mut Volume,
    ) -> Result<OpStatus> {
        let cas = self
            .control
            .create_restore(resource)
            .await
            .context("restore request to the engine API failed")?;
        if let Some(cas) = cas {
            if !volume.is_csi {
                volume.iscsi = Some(cas.spec);
            }
        }

        loop {
            tokio::time::sleep(self.config.poll_interval).await;
            match self.control.restore_status(resource).await {
                Err(err) => warn!(error = %err, "failed to fetch restore status"),
                Ok(status) => {
                    volume.restore_status = status;
                    if status.is_terminal() {
                        return Ok(status);
                    }
                }
            }
        }
    }

    async fn wait_for_replicas(&self, volume: &Volume, phases: &[&str]) -> Result<()> {
        let replica_count = self
            .kube
            .replica_count(&self.config.namespace, &volume.name)
            .await
            .with_context(|| format!("failed to fetch replica count for {}", volume.name))?;

        for _ in 0..self.config.wait_count {
            let replicas = self
                .kube
                .list_replicas(&self.config.namespace, &volume.name)
                .await?;
            if replicas.len() == replica_count
                && replicas.iter().all(|r| phases.contains(&r.phase.as_str()))
            {
                return Ok(());
            }
            tokio::time::sleep(self.config.wait_interval).await;
        }
        bail!("replicas for volume {} are not ready", volume.name)
    }

    /// Annotate every replica `restore-completed` and wait for the volume
    /// to come back healthy.
    async fn mark_replicas_restored(&self, volume: &Volume) -> Result<()> {
        self.wait_for_replicas(volume, REPLICA_SETTLED_PHASES).await?;

        let replicas = self
            .kube
            .list_replicas(&self.config.namespace, &volume.name)
            .await?;
        for replica in &replicas {
            info!(replica = %replica.name, "marking replica restore-completed");
            self.kube
                .annotate_replica(
                    &self.config.namespace,
                    &replica.name,
                    RESTORE_COMPLETED_ANNOTATION,
                    "true",
                )
                .await?;
        }

        self.wait_for_replicas(volume, REPLICA_HEALTHY_PHASES).await
    }

    async fn restore_local(&self, id: &SnapshotId) -> Result<String> {
        let manifest = self
            .kube
            .volume_manifest(&id.volume)
            .await?
            .with_context(|| format!("error fetching pv {}", id.volume))?;

        let clone_name = format!("{}{}", CLONE_PREFIX, Uuid::new_v4());
        info!(source = %id.volume, clone = %clone_name, "restoring volume locally");

        let resource = RestoreResource::new(
            self.config.namespace.clone(),
            RestoreSpec {
                restore_name: id.backup.clone(),
                volume_name: clone_name.clone(),
                restore_src: id.volume.clone(),
                storage_class: manifest["spec"]["storageClassName"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string(),
                size: manifest["spec"]["capacity"]["storage"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string(),
                local_restore: true,
            },
        );
        self.control
            .create_restore(&resource)
            .await
            .context("restore request to the engine API failed")?;

        self.store_volume(Volume {
            name: clone_name.clone(),
            src_volume: Some(id.volume.clone()),
            snapshot_tag: id.volume.clone(),
            backup_name: id.backup.clone(),
            restore_status: OpStatus::Done,
            ..Default::default()
        });
        Ok(clone_name)
    }

    /// Namespace the restored claim should land in.
    async fn target_namespace(&self, source_ns: &str, backup: &str) -> Result<String> {
        if self.config.velero_namespace.is_empty() {
            warn!("VELERO_NAMESPACE is not set, restoring into the source namespace");
            return Ok(source_ns.to_string());
        }
        let restores = self
            .kube
            .list_restores(&self.config.velero_namespace)
            .await?;
        restore_namespace(restores, source_ns, backup)
    }
}

#[async_trait]
impl VolumeSnapshotter for CstorPlugin {
    async fn create_snapshot(
        &self,
        volume_id: &str,
        _volume_az: &str,
        tags: &HashMap<String, String>,
    ) -> Result<String> {
        let backup_name = tags
            .get(BACKUP_TAG)
            .filter(|b| !b.trim().is_empty())
            .context("failed to get backup name")?
            .clone();
        let schedule = tags
            .get(SCHEDULE_TAG)
            .filter(|s| !s.is_empty())
            .cloned()
            .or_else(|| schedule_name(&backup_name));

        let mut volume = self.volume(volume_id).context("volume is not found")?;
        volume.backup_name = backup_name.clone();
        if volume.snapshot_tag.is_empty() {
            volume.snapshot_tag = volume.name.clone();
        }

        info!(volume = volume_id, backup = %backup_name, "creating snapshot");

        let remote = !self.config.local;
        let mut prev_snapshot = None;
        let mut stale_snapshot = None;
        if remote {
            self.backup_claim(&mut volume).await?;

            if let Some(schedule) = &schedule {
                if self.config.incremental > 0 {
                    let mut prior = self
                        .conn
                        .snapshot_list(&volume.snapshot_tag, schedule)
                        .await
                        .context("failed to list prior backups")?;
                    prior.sort();
                    prev_snapshot = previous_snapshot(&prior, self.config.incremental);
                    // Once this delta lands, only its parent stays
                    // relevant on the engine; the one before it does not.
                    if prev_snapshot.is_some() && prior.len() >= 2 {
                        stale_snapshot = Some(prior[prior.len() - 2].clone());
                    }
                }
            }
        }
        self.store_volume(volume.clone());

        // Stand the data plane up before asking the engine to dial it.
        self.conn.reset();
        let server = if remote {
            let (ready_tx, ready_rx) = oneshot::channel();
            let key = self.conn.remote_file_name(&volume.snapshot_tag, &backup_name);
            let size = parse_quantity(&volume.size).unwrap_or(0);
            let task = {
                let conn = self.conn.clone();
                let key = key.clone();
                let port = self.config.backup_port;
                tokio::spawn(async move { conn.upload(&key, size, port, ready_tx).await })
            };
            match ready_rx.await {
                Ok(Some(_)) => {}
                _ => {
                    self.conn.request_exit();
                    self.join_transfer(task).await;
                    bail!("failed to upload snapshot: server is not ready");
                }
            }
            Some((task, key))
        } else {
            None
        };

        let resource = BackupResource::new(
            volume.namespace.clone(),
            BackupSpec {
                backup_name: schedule.clone().unwrap_or_else(|| backup_name.clone()),
                volume_name: volume_id.to_string(),
                snap_name: backup_name.clone(),
                backup_dest: self.dest_addr(self.config.backup_port),
                prev_snap_name: prev_snapshot.clone(),
                local_snap: self.config.local,
            },
        );

        let status = self.run_backup_to_terminal(&resource).await;
        self.conn.request_exit();
        let key = match server {
            Some((task, key)) => {
                self.join_transfer(task).await;
                Some(key)
            }
            None => None,
        };
        let status = status?;

        if status == OpStatus::Done {
            if let (Some(schedule), Some(stale)) = (&schedule, &stale_snapshot) {
                if let Err(err) = self
                    .control
                    .delete_backup(stale, volume_id, &volume.namespace, schedule)
                    .await
                {
                    warn!(snapshot = %stale, error = %err, "failed to clean up superseded snapshot");
                }
            }
        } else {
            if let Err(err) = self
                .control
                .delete_backup(
                    &backup_name,
                    volume_id,
                    &volume.namespace,
                    schedule.as_deref().unwrap_or_default(),
                )
                .await
            {
                warn!(backup = %backup_name, error = %err, "failed to clean up failed backup");
            }
            if let Some(key) = &key {
                if let Err(err) = self.conn.store().delete(key).await {
                    warn!(key = %key, error = %err, "failed to remove snapshot object");
                }
            }
            bail!("failed to upload snapshot, status:{:?}", status);
        }

        let id = SnapshotId::new(volume_id, backup_name);
        let encoded = id.encode();
        self.snapshots.lock().unwrap().insert(
            encoded.clone(),
            Snapshot {
                volume: id.volume.clone(),
                backup: id.backup.clone(),
                namespace: volume.namespace.clone(),
                schedule,
            },
        );
        info!(snapshot_id = %encoded, "snapshot created");
        Ok(encoded)
    }

    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<()> {
        if snapshot_id.is_empty() {
            warn!("empty snapshot id, nothing to delete");
            return Ok(());
        }

        let id = SnapshotId::decode(snapshot_id)?;
        info!(snapshot_id, "deleting snapshot");

        let namespace = match self.snapshots.lock().unwrap().get(snapshot_id) {
            Some(snapshot) => Some(snapshot.namespace.clone()),
            None => None,
        };
        let namespace = match namespace {
            Some(ns) => ns,
            None => {
                let manifest = self
                    .kube
                    .volume_manifest(&id.volume)
                    .await?
                    .with_context(|| format!("error fetching namespace for volume {}", id.volume))?;
                let ns = manifest["spec"]["claimRef"]["namespace"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string();
                if ns.is_empty() {
                    bail!("no namespace in claim ref for pv {}", id.volume);
                }
                ns
            }
        };

        self.control
            .delete_backup(
                &id.backup,
                &id.volume,
                &namespace,
                id.schedule.as_deref().unwrap_or_default(),
            )
            .await
            .context("failed to delete backup resource")?;

        if !self.config.local {
            let key = self.conn.remote_file_name(&id.volume, &id.backup);
            self.conn
                .store()
                .delete(&key)
                .await
                .context("failed to remove snapshot")?;
        }

        self.snapshots.lock().unwrap().remove(snapshot_id);
        Ok(())
    }

    async fn create_volume_from_snapshot(
        &self,
        snapshot_id: &str,
        volume_type: &str,
        _volume_az: &str,
        _iops: Option<i64>,
    ) -> Result<String> {
        if volume_type != CSTOR_SNAPSHOT_TYPE {
            bail!("invalid volume type {}", volume_type);
        }

        let id = SnapshotId::decode(snapshot_id)?;
        info!(snapshot = %id.backup, volume = %id.volume, "restoring snapshot");

        if self.config.local {
            return self.restore_local(&id).await;
        }

        // Bring the claim back first so there is a volume to stream into.
        let sidecar_key =
            self.conn
                .layout()
                .sidecar_name(&id.volume, &id.backup, PVC_SUFFIX);
        let data = self
            .conn
            .store()
            .get(&sidecar_key)
            .await
            .with_context(|| format!("failed to download claim file={}", sidecar_key))?;
        let mut manifest: Value =
            serde_json::from_slice(&data).context("failed to decode claim manifest")?;

        let source_ns = manifest["metadata"]["namespace"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        let target_ns = self.target_namespace(&source_ns, &id.backup).await?;
        self.ensure_namespace(&target_ns)
            .await
            .context("error verifying namespace")?;
        manifest["metadata"]["namespace"] = Value::String(target_ns.clone());

        let mut volume = self.claim_volume(manifest, &id).await?;
        self.store_volume(volume.clone());

        let chain = match (&id.schedule, self.config.restore_all_snapshots) {
            (Some(schedule), true) => {
                let snapshots = self
                    .conn
                    .snapshot_list(&id.volume, schedule)
                    .await
                    .context("failed to list snapshots for restore")?;
                restore_chain(&snapshots, &id.backup)?
            }
            _ => vec![id.backup.clone()],
        };
        info!(?chain, "restoring snapshot chain");

        for snap in &chain {
            let key = self.conn.remote_file_name(&id.volume, snap);
            // A failed backup can leave a directory with sidecars but no
            // bytes; later deltas still apply, so keep walking the chain.
            if !self.conn.store().exists(&key).await? {
                warn!(snap = %snap, "remote snapshot does not exist, skipping");
                continue;
            }
            self.restore_one(&mut volume, &id, snap)
                .await
                .with_context(|| format!("failed to restore snapshot={}", snap))?;
        }
        self.store_volume(volume.clone());

        if self.config.auto_set_target_ip {
            self.mark_replicas_restored(&volume).await?;
        }

        info!(volume = %volume.name, "restore completed");
        Ok(volume.name.clone())
    }

    fn get_volume_id(&self, pv: &Value) -> Result<Option<String>> {
        let info = match volume_info_from_pv(pv)? {
            Some(info) => info,
            None => return Ok(None),
        };

        let mut volumes = self.volumes.lock().unwrap();
        volumes.entry(info.name.clone()).or_insert_with(|| Volume {
            name: info.name.clone(),
            snapshot_tag: info.name.clone(),
            namespace: info.namespace.clone(),
            storage_class: info.storage_class.clone(),
            is_csi: info.is_csi,
            ..Default::default()
        });
        Ok(Some(info.name))
    }

    fn set_volume_id(&self, pv: &Value, volume_id: &str) -> Result<Value> {
        let iscsi = self
            .volumes
            .lock()
            .unwrap()
            .get(volume_id)
            .and_then(|v| v.iscsi.clone());
        set_volume_id_in_pv(pv, volume_id, iscsi.as_ref())
    }

    async fn get_volume_info(
        &self,
        _volume_id: &str,
        _volume_az: &str,
    ) -> Result<(String, Option<i64>)> {
        Ok((CSTOR_SNAPSHOT_TYPE.to_string(), None))
    }

    async fn is_volume_ready(&self, volume_id: &str, _volume_az: &str) -> Result<bool> {
        self.kube
            .engine_volume_healthy(&self.config.namespace, volume_id)
            .await
    }
}

/// Strip the server-side fields from a claim manifest so it can be
/// re-created in another cluster, recovering the storage class from the
/// legacy annotation when the spec does not carry one.
fn scrub_claim(mut manifest: Value) -> Result<Value> {
    let storage_class = manifest["spec"]["storageClassName"]
        .as_str()
        .unwrap_or_default()
        .to_string();
    if storage_class.is_empty() {
        if let Some(annotated) = manifest["metadata"]["annotations"]
            [BETA_STORAGE_CLASS_ANNOTATION]
            .as_str()
        {
            manifest["spec"]["storageClassName"] = Value::String(annotated.to_string());
        }
    }

    if let Some(metadata) = manifest["metadata"].as_object_mut() {
        for field in [
            "resourceVersion",
            "selfLink",
            "uid",
            "annotations",
            "managedFields",
            "creationTimestamp",
        ] {
            metadata.remove(field);
        }
    }
    if let Some(spec) = manifest["spec"].as_object_mut() {
        spec.remove("volumeName");
    }
    Ok(manifest)
}

/// Requested storage of a claim manifest, as a quantity string.
fn claim_size(manifest: &Value) -> String {
    manifest["spec"]["resources"]["requests"]["storage"]
        .as_str()
        .unwrap_or_default()
        .to_string()
}

/// The first routable IPv4 address of this host; replicas dial it to reach
/// the transfer servers.
fn local_server_ip() -> Result<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").context("failed to probe local address")?;
    socket
        .connect("8.8.8.8:80")
        .context("failed to probe local address")?;
    let addr = socket
        .local_addr()
        .context("failed to probe local address")?
        .ip();
    if addr.is_loopback() {
        bail!("no routable interface address found");
    }
    Ok(addr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scrub_claim_drops_server_side_fields() {
        let manifest = json!({
            "metadata": {
                "name": "data",
                "namespace": "apps",
                "uid": "abc-123",
                "resourceVersion": "42",
                "selfLink": "/api/v1/x",
                "annotations": {"pv.kubernetes.io/bind-completed": "yes"},
            },
            "spec": {
                "storageClassName": "cstor-sc",
                "volumeName": "pv-1",
                "resources": {"requests": {"storage": "1Gi"}},
            },
        });

        let scrubbed = scrub_claim(manifest).unwrap();
        assert_eq!(scrubbed["metadata"]["name"], "data");
        assert!(scrubbed["metadata"].get("uid").is_none());
        assert!(scrubbed["metadata"].get("resourceVersion").is_none());
        assert!(scrubbed["metadata"].get("annotations").is_none());
        assert!(scrubbed["spec"].get("volumeName").is_none());
        assert_eq!(claim_size(&scrubbed), "1Gi");
    }

    #[test]
    fn scrub_claim_recovers_storage_class_from_annotation() {
        let manifest = json!({
            "metadata": {
                "name": "data",
                "namespace": "apps",
                "annotations": {BETA_STORAGE_CLASS_ANNOTATION: "legacy-sc"},
            },
            "spec": {
                "resources": {"requests": {"storage": "5Gi"}},
            },
        });

        let scrubbed = scrub_claim(manifest).unwrap();
        assert_eq!(scrubbed["spec"]["storageClassName"], "legacy-sc");
    }
}
