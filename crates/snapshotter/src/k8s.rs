//! Kubernetes access seam.
//!
//! Everything the reconciler needs from the cluster sits behind [`KubeOps`]
//! so the reconciliation logic can run against fakes. [`KubeClientOps`] is
//! the in-cluster implementation.

use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Namespace, PersistentVolume, PersistentVolumeClaim, Service};
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    Client,
};
use serde_json::{json, Value};

use crate::velero::RestoreInfo;

const ENGINE_API_SERVICE_LABEL: &str = "openebs.io/component-name=maya-apiserver-svc";
const ENGINE_API_SERVICE_NAME: &str = "maya-apiserver-service";
const REPLICA_PV_LABEL: &str = "openebs.io/persistent-volume";
const ENGINE_VOLUME_HEALTHY: &str = "Healthy";

/// Lifecycle state of a namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamespaceState {
    Missing,
    Active,
    Terminating,
}

/// Phase of a claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimPhase {
    Pending,
    Bound,
    Lost,
}

/// The claim fields the reconciler consumes.
#[derive(Debug, Clone)]
pub struct ClaimView {
    pub name: String,
    pub namespace: String,
    pub volume_name: String,
    pub storage_class: String,
    /// Requested storage, as a quantity string.
    pub size: String,
    pub phase: ClaimPhase,
}

/// One engine replica of a volume.
#[derive(Debug, Clone)]
pub struct ReplicaView {
    pub name: String,
    /// Engine phase string: `Online`, `Degraded`, `Error`, ...
    pub phase: String,
}

/// Control-plane reads and writes the reconciler depends on.
#[async_trait]
pub trait KubeOps: Send + Sync {
    /// Base URL of the engine's REST API, discovered through its service.
    async fn engine_api_url(&self, namespace: &str) -> Result<String>;

    /// Full manifest of the claim bound to `volume`, if any.
    async fn claim_for_volume(&self, namespace: &str, volume: &str) -> Result<Option<Value>>;

    async fn get_claim(&self, namespace: &str, name: &str) -> Result<Option<ClaimView>>;

    /// Create the claim described by `manifest` (namespace inside).
    async fn create_claim(&self, manifest: &Value) -> Result<()>;

    async fn delete_claim(&self, namespace: &str, name: &str) -> Result<()>;

    /// Full manifest of the persistent volume `name`, if it exists.
    async fn volume_manifest(&self, name: &str) -> Result<Option<Value>>;

    async fn namespace_state(&self, name: &str) -> Result<NamespaceState>;

    async fn create_namespace(&self, name: &str) -> Result<()>;

    /// Restore resources of the backup tool in its install namespace.
    async fn list_restores(&self, namespace: &str) -> Result<Vec<RestoreInfo>>;

    /// Replication factor of the engine volume.
    async fn replica_count(&self, namespace: &str, volume: &str) -> Result<usize>;

    async fn list_replicas(&self, namespace: &str, volume: &str) -> Result<Vec<ReplicaView>>;

    async fn annotate_replica(
        &self,
        namespace: &str,
        replica: &str,
        key: &str,
        value: &str,
    ) -> Result<()>;

    /// Whether the engine reports the volume itself healthy.
    async fn engine_volume_healthy(&self, namespace: &str, volume: &str) -> Result<bool>;
}

/// In-cluster [`KubeOps`] implementation.
#[derive(Clone)]
pub struct KubeClientOps {
    client: Client,
}

impl KubeClientOps {
    pub async fn new() -> Result<Self> {
        let client = Client::try_default()
            .await
            .context("error fetching cluster config")?;
        Ok(KubeClientOps { client })
    }

    fn restores_resource() -> ApiResource {
        ApiResource::from_gvk(&GroupVersionKind::gvk("velero.io", "v1", "Restore"))
    }

    fn replica_resource() -> ApiResource {
        ApiResource::from_gvk(&GroupVersionKind::gvk(
            "cstor.openebs.io",
            "v1",
            "CStorVolumeReplica",
        ))
    }

    fn volume_resource() -> ApiResource {
        ApiResource::from_gvk(&GroupVersionKind::gvk("cstor.openebs.io", "v1", "CStorVolume"))
    }

    async fn engine_volume(&self, namespace: &str, volume: &str) -> Result<DynamicObject> {
        let api = Api::<DynamicObject>::namespaced_with(
            self.client.clone(),
            namespace,
            &Self::volume_resource(),
        );
        api.get(volume)
            .await
            .with_context(|| format!("failed to fetch engine volume {}", volume))
    }

    fn service_url(service: &Service) -> Option<String> {
        let spec = service.spec.as_ref()?;
        let cluster_ip = spec.cluster_ip.as_ref().filter(|ip| !ip.is_empty())?;
        let port = spec.ports.as_ref()?.first()?.port;
        Some(format!("http://{}:{}", cluster_ip, port))
    }
}

#[async_trait]
impl KubeOps for KubeClientOps {
    async fn engine_api_url(&self, namespace: &str) -> Result<String> {
        let services = Api::<Service>::namespaced(self.client.clone(), namespace);

        let labelled = services
            .list(&ListParams::default().labels(ENGINE_API_SERVICE_LABEL))
            .await
            .context("failed to list engine API services")?;
        if let Some(url) = labelled.items.iter().find_map(Self::service_url) {
            return Ok(url);
        }

        // No labelled service; fall back to the well-known name.
        let named = services
            .list(&ListParams::default().fields(&format!("metadata.name={}", ENGINE_API_SERVICE_NAME)))
            .await
            .with_context(|| format!("failed to look up service {}", ENGINE_API_SERVICE_NAME))?;
        if let Some(url) = named.items.iter().find_map(Self::service_url) {
            return Ok(url);
        }

        bail!("error fetching the engine API server address")
    }

    async fn claim_for_volume(&self, namespace: &str, volume: &str) -> Result<Option<Value>> {
        let claims = Api::<PersistentVolumeClaim>::namespaced(self.client.clone(), namespace);
        let list = claims
            .list(&ListParams::default())
            .await
            .context("failed to fetch claim list")?;

        for claim in list.items {
            let bound = claim
                .spec
                .as_ref()
                .and_then(|s| s.volume_name.as_deref())
                .map(|v| v == volume)
                .unwrap_or(false);
            if bound {
                return Ok(Some(
                    serde_json::to_value(&claim).context("failed to serialise claim")?,
                ));
            }
        }
        Ok(None)
    }

    async fn get_claim(&self, namespace: &str, name: &str) -> Result<Option<ClaimView>> {
        let claims = Api::<PersistentVolumeClaim>::namespaced(self.client.clone(), namespace);
        let claim = match claims
            .get_opt(name)
            .await
            .with_context(|| format!("failed to fetch claim {}/{}", namespace, name))?
        {
            Some(claim) => claim,
            None => return Ok(None),
        };

        let phase = match claim
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .unwrap_or("Pending")
        {
            "Bound" => ClaimPhase::Bound,
            "Lost" => ClaimPhase::Lost,
            _ => ClaimPhase::Pending,
        };

        let spec = claim.spec.as_ref();
        Ok(Some(ClaimView {
            name: name.to_string(),
            namespace: namespace.to_string(),
            volume_name: spec
                .and_then(|s| s.volume_name.clone())
                .unwrap_or_default(),
            storage_class: spec
                .and_then(|s| s.storage_class_name.clone())
                .unwrap_or_default(),
            size: spec
                .and_then(|s| s.resources.as_ref())
                .and_then(|r| r.requests.as_ref())
                .and_then(|requests| requests.get("storage"))
                .map(|q| q.0.clone())
                .unwrap_or_default(),
            phase,
        }))
    }

    async fn create_claim(&self, manifest: &Value) -> Result<()> {
        let claim: PersistentVolumeClaim =
            serde_json::from_value(manifest.clone()).context("failed to decode claim manifest")?;
        let namespace = claim
            .metadata
            .namespace
            .clone()
            .context("claim manifest has no namespace")?;

        let claims = Api::<PersistentVolumeClaim>::namespaced(self.client.clone(), &namespace);
        claims
            .create(&PostParams::default(), &claim)
            .await
            .with_context(|| {
                format!(
                    "failed to create claim {}/{}",
                    namespace,
                    claim.metadata.name.as_deref().unwrap_or_default()
                )
            })?;
        Ok(())
    }

    async fn delete_claim(&self, namespace: &str, name: &str) -> Result<()> {
        let claims = Api::<PersistentVolumeClaim>::namespaced(self.client.clone(), namespace);
        claims
            .delete(name, &DeleteParams::default())
            .await
            .with_context(|| format!("failed to delete claim {}/{}", namespace, name))?;
        Ok(())
    }

    async fn volume_manifest(&self, name: &str) -> Result<Option<Value>> {
        let volumes = Api::<PersistentVolume>::all(self.client.clone());
        let pv = volumes
            .get_opt(name)
            .await
            .with_context(|| format!("failed to fetch pv {}", name))?;
        pv.map(|pv| serde_json::to_value(&pv).context("failed to serialise pv"))
            .transpose()
    }

    async fn namespace_state(&self, name: &str) -> Result<NamespaceState> {
        let namespaces = Api::<Namespace>::all(self.client.clone());
        let ns = match namespaces
            .get_opt(name)
            .await
            .with_context(|| format!("failed to fetch namespace {}", name))?
        {
            Some(ns) => ns,
            None => return Ok(NamespaceState::Missing),
        };

        let terminating = ns.metadata.deletion_timestamp.is_some()
            || ns
                .status
                .as_ref()
                .and_then(|s| s.phase.as_deref())
                .map(|p| p == "Terminating")
                .unwrap_or(false);

        Ok(if terminating {
            NamespaceState::Terminating
        } else {
            NamespaceState::Active
        })
    }

    async fn create_namespace(&self, name: &str) -> Result<()> {
        let namespaces = Api::<Namespace>::all(self.client.clone());
        let ns: Namespace = serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": {"name": name},
        }))
        .context("failed to build namespace manifest")?;
        namespaces
            .create(&PostParams::default(), &ns)
            .await
            .with_context(|| format!("failed to create namespace {}", name))?;
        Ok(())
    }

    async fn list_restores(&self, namespace: &str) -> Result<Vec<RestoreInfo>> {
        let api = Api::<DynamicObject>::namespaced_with(
            self.client.clone(),
            namespace,
            &Self::restores_resource(),
        );
        let list = api
            .list(&ListParams::default())
            .await
            .context("failed to get list of restores")?;

        let mut restores = Vec::with_capacity(list.items.len());
        for item in list.items {
            let mapping: HashMap<String, String> = item.data["spec"]["namespaceMapping"]
                .as_object()
                .map(|m| {
                    m.iter()
                        .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                        .collect()
                })
                .unwrap_or_default();

            restores.push(RestoreInfo {
                name: item.metadata.name.clone().unwrap_or_default(),
                backup_name: item.data["spec"]["backupName"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string(),
                phase: item.data["status"]["phase"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string(),
                namespace_mapping: mapping,
                created: item
                    .metadata
                    .creation_timestamp
                    .as_ref()
                    .map(|t| t.0)
                    .unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
            });
        }
        Ok(restores)
    }

    async fn replica_count(&self, namespace: &str, volume: &str) -> Result<usize> {
        let volume_obj = self.engine_volume(namespace, volume).await?;
        volume_obj.data["spec"]["replicationFactor"]
            .as_u64()
            .map(|count| count as usize)
            .with_context(|| format!("engine volume {} has no replication factor", volume))
    }

    async fn list_replicas(&self, namespace: &str, volume: &str) -> Result<Vec<ReplicaView>> {
        let api = Api::<DynamicObject>::namespaced_with(
            self.client.clone(),
            namespace,
            &Self::replica_resource(),
        );
        let selector = format!("{}={}", REPLICA_PV_LABEL, volume);
        let list = api
            .list(&ListParams::default().labels(&selector))
            .await
            .with_context(|| format!("failed to fetch replicas for volume {}", volume))?;

        Ok(list
            .items
            .into_iter()
            .map(|item| ReplicaView {
                name: item.metadata.name.clone().unwrap_or_default(),
                phase: item.data["status"]["phase"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string(),
            })
            .collect())
    }

    async fn annotate_replica(
        &self,
        namespace: &str,
        replica: &str,
        key: &str,
        value: &str,
    ) -> Result<()> {
        let api = Api::<DynamicObject>::namespaced_with(
            self.client.clone(),
            namespace,
            &Self::replica_resource(),
        );
        let patch = json!({"metadata": {"annotations": {key: value}}});
        api.patch(replica, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .with_context(|| format!("could not update replica {}", replica))?;
        Ok(())
    }

    async fn engine_volume_healthy(&self, namespace: &str, volume: &str) -> Result<bool> {
        let volume_obj = self.engine_volume(namespace, volume).await?;
        Ok(volume_obj.data["status"]["phase"].as_str() == Some(ENGINE_VOLUME_HEALTHY))
    }
}
