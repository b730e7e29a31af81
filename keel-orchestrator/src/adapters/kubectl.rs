//! Kubernetes workload deployer
//!
//! Applies manifest sets with `kubectl` and tags every applied Deployment
//! with the id of the deployment it belongs to. Manifest sets are recorded
//! under `<state dir>/deployments/` before they are applied, so a later
//! rollback can restore them and an interrupted apply can still be removed.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use keel_core::domain::deployment::{DeploymentRef, HealthStatus, ManifestSet};
use keel_core::domain::secret::BundleRef;
use keel_core::domain::stage::IdempotencyKey;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::command::Invocation;
use super::{AdapterError, AdapterResult, Deployer};

const DEPLOYMENT_ANNOTATION: &str = "keel.dev/deployment";
const BUNDLES_ANNOTATION: &str = "keel.dev/bundles";

/// What was applied under one deployment id
#[derive(Debug, Serialize, Deserialize)]
struct DeploymentRecord {
    deployment: DeploymentRef,
    manifests: ManifestSet,
    /// False until every manifest was applied and tagged
    applied: bool,
}

pub struct KubectlDeployer {
    kubectl: String,
    state_dir: PathBuf,
}

impl KubectlDeployer {
    pub fn new(kubectl: impl Into<String>, state_dir: impl Into<PathBuf>) -> Self {
        Self {
            kubectl: kubectl.into(),
            state_dir: state_dir.into(),
        }
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.state_dir
            .join("deployments")
            .join(format!("{}.json", id))
    }

    async fn read_record(&self, id: &str) -> AdapterResult<Option<DeploymentRecord>> {
        let path = self.record_path(id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|e| {
                AdapterError::Rejected(format!("corrupt deployment record {}: {}", path.display(), e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AdapterError::Transient(format!("{}: {}", path.display(), e))),
        }
    }

    async fn write_record(&self, record: &DeploymentRecord) -> AdapterResult<()> {
        let path = self.record_path(&record.deployment.id);
        let dir = path.parent().unwrap_or(Path::new("."));
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| AdapterError::Transient(format!("{}: {}", dir.display(), e)))?;
        let json = serde_json::to_vec_pretty(record)
            .map_err(|e| AdapterError::Rejected(format!("failed to encode record: {}", e)))?;
        tokio::fs::write(&path, json)
            .await
            .map_err(|e| AdapterError::Transient(format!("{}: {}", path.display(), e)))
    }

    async fn required_record(&self, id: &str) -> AdapterResult<DeploymentRecord> {
        self.read_record(id).await?.ok_or_else(|| {
            AdapterError::Rejected(format!("no manifests recorded for deployment {}", id))
        })
    }

    fn kubectl(&self, manifests: &ManifestSet) -> Invocation {
        Invocation::new(&self.kubectl)
            .arg(format!("--context={}", manifests.cluster))
            .arg(format!("--namespace={}", manifests.namespace))
    }

    /// Apply a manifest set and tag it with its deployment id and bundles
    async fn apply_tagged(&self, manifests: &ManifestSet, deployment: &DeploymentRef) -> AdapterResult<()> {
        let stream = render(manifests);

        self.kubectl(manifests)
            .args(["apply", "-f", "-"])
            .stdin(stream.clone())
            .run_checked()
            .await?;

        let bundles = deployment
            .bundles
            .iter()
            .map(|b| format!("{}@v{}", b.name, b.version))
            .collect::<Vec<_>>()
            .join(",");

        self.kubectl(manifests)
            .args(["annotate", "--overwrite", "-f", "-"])
            .arg(format!("{}={}", DEPLOYMENT_ANNOTATION, deployment.id))
            .arg(format!("{}={}", BUNDLES_ANNOTATION, bundles))
            .stdin(stream)
            .run_checked()
            .await?;

        Ok(())
    }
}

/// Concatenate manifests into one multi-document stream
fn render(manifests: &ManifestSet) -> String {
    manifests
        .documents
        .iter()
        .map(|d| d.content.trim_end())
        .collect::<Vec<_>>()
        .join("\n---\n")
}

/// Health of the Deployments tagged with `deployment_id` in a
/// `kubectl get deployments -o json` listing
fn assess(listing: &serde_json::Value, deployment_id: &str) -> HealthStatus {
    let items = listing["items"].as_array().cloned().unwrap_or_default();
    let ours: Vec<&serde_json::Value> = items
        .iter()
        .filter(|d| d["metadata"]["annotations"][DEPLOYMENT_ANNOTATION] == deployment_id)
        .collect();

    let mut healthy = true;
    for d in ours {
        let conditions = d["status"]["conditions"].as_array().cloned().unwrap_or_default();
        if conditions.iter().any(|c| {
            c["type"] == "Progressing" && c["reason"] == "ProgressDeadlineExceeded"
        }) {
            return HealthStatus::Failed;
        }

        let desired = d["spec"]["replicas"].as_i64().unwrap_or(1);
        let ready = d["status"]["readyReplicas"].as_i64().unwrap_or(0);
        let updated = d["status"]["updatedReplicas"].as_i64().unwrap_or(0);
        let generation = d["metadata"]["generation"].as_i64().unwrap_or(0);
        let observed = d["status"]["observedGeneration"].as_i64().unwrap_or(0);

        if observed < generation || ready < desired || updated < desired {
            healthy = false;
        }
    }

    if healthy {
        HealthStatus::Healthy
    } else {
        HealthStatus::Degraded
    }
}

#[async_trait]
impl Deployer for KubectlDeployer {
    async fn apply(
        &self,
        manifests: &ManifestSet,
        bundles: &[BundleRef],
        key: &IdempotencyKey,
    ) -> AdapterResult<DeploymentRef> {
        if let Some(existing) = self.find_deployment(key).await? {
            info!("Apply {} already performed", key);
            return Ok(existing);
        }

        let deployment = DeploymentRef {
            id: key.to_string(),
            environment: manifests.environment.clone(),
            cluster: manifests.cluster.clone(),
            namespace: manifests.namespace.clone(),
            manifest_hash: manifests.content_hash.clone(),
            bundles: bundles.to_vec(),
        };
        let mut record = DeploymentRecord {
            deployment: deployment.clone(),
            manifests: manifests.clone(),
            applied: false,
        };

        self.write_record(&record).await?;
        self.apply_tagged(manifests, &deployment).await?;
        record.applied = true;
        self.write_record(&record).await?;

        info!(
            "Applied {} manifests to {}/{}",
            manifests.documents.len(),
            manifests.cluster,
            manifests.namespace
        );
        Ok(deployment)
    }

    async fn health_check(&self, deployment: &DeploymentRef) -> AdapterResult<HealthStatus> {
        let output = Invocation::new(&self.kubectl)
            .arg(format!("--context={}", deployment.cluster))
            .arg(format!("--namespace={}", deployment.namespace))
            .args(["get", "deployments", "-o", "json"])
            .quiet()
            .run_checked()
            .await?;

        let listing: serde_json::Value = serde_json::from_str(&output.stdout)
            .map_err(|e| AdapterError::Transient(format!("unreadable deployment listing: {}", e)))?;

        let status = assess(&listing, &deployment.id);
        debug!("Deployment {} is {}", deployment.id, status);
        Ok(status)
    }

    async fn rollback(&self, previous: &DeploymentRef, key: &IdempotencyKey) -> AdapterResult<()> {
        let record = self.required_record(&previous.id).await?;
        self.apply_tagged(&record.manifests, &record.deployment).await?;
        info!("Restored deployment {} ({})", previous.id, key);
        Ok(())
    }

    async fn remove(&self, deployment: &DeploymentRef, key: &IdempotencyKey) -> AdapterResult<()> {
        let record = self.required_record(&deployment.id).await?;
        self.kubectl(&record.manifests)
            .args(["delete", "--ignore-not-found", "-f", "-"])
            .stdin(render(&record.manifests))
            .run_checked()
            .await?;
        info!("Removed deployment {} ({})", deployment.id, key);
        Ok(())
    }

    async fn find_deployment(&self, key: &IdempotencyKey) -> AdapterResult<Option<DeploymentRef>> {
        Ok(self
            .read_record(&key.to_string())
            .await?
            .filter(|r| r.applied)
            .map(|r| r.deployment))
    }

    async fn find_started(&self, key: &IdempotencyKey) -> AdapterResult<Option<DeploymentRef>> {
        Ok(self
            .read_record(&key.to_string())
            .await?
            .map(|r| r.deployment))
    }
}
