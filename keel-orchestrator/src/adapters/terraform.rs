//! Terraform provisioner
//!
//! Each environment gets its own working directory under the state dir, so the
//! local terraform state persists between Runs. Desired-state documents are
//! archived by content hash at plan time, which lets a rollback re-plan an
//! older desired state after the workspace moved on.
//!
//! Layout under the state dir:
//! - `desired/<hash>/` archived documents
//! - `terraform/<environment>/` working directory
//! - `plans/<plan id>.tfplan`, `plans/<plan id>.json` saved plans
//! - `snapshots/<key>.json` applied snapshots, one per idempotency key
//! - `fences/<key>` completed destroys

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use keel_core::domain::infra::{DesiredState, InfrastructureSnapshot, PlanId};
use keel_core::domain::stage::IdempotencyKey;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::command::{Invocation, classify};
use super::{AdapterError, AdapterResult, Provisioner};
use crate::workspace::{documents_hash, read_documents};

/// What was planned, stored next to the plan file
#[derive(Debug, Serialize, Deserialize)]
struct PlanMeta {
    environment: String,
    desired_state: DesiredState,
}

pub struct TerraformProvisioner {
    binary: String,
    state_dir: PathBuf,
}

impl TerraformProvisioner {
    pub fn new(binary: impl Into<String>, state_dir: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            state_dir: state_dir.into(),
        }
    }

    fn workdir(&self, environment: &str) -> PathBuf {
        self.state_dir.join("terraform").join(environment)
    }

    fn plan_path(&self, plan: &PlanId, extension: &str) -> PathBuf {
        self.state_dir
            .join("plans")
            .join(format!("{}.{}", plan, extension))
    }

    fn snapshot_path(&self, key: &IdempotencyKey) -> PathBuf {
        self.state_dir
            .join("snapshots")
            .join(format!("{}.json", key))
    }

    fn fence_path(&self, key: &IdempotencyKey) -> PathBuf {
        self.state_dir.join("fences").join(key.to_string())
    }

    /// Copy the desired-state documents into the archive, once per hash
    async fn archive(&self, desired: &DesiredState) -> AdapterResult<PathBuf> {
        let archive = self.state_dir.join("desired").join(&desired.content_hash);
        if archive.is_dir() {
            return Ok(archive);
        }

        let documents = read_documents(Path::new(&desired.location))
            .await
            .map_err(|e| AdapterError::Rejected(e.to_string()))?;
        if documents_hash(&documents) != desired.content_hash {
            return Err(AdapterError::Rejected(format!(
                "desired state at {} no longer matches hash {}",
                desired.location, desired.content_hash
            )));
        }

        let staging = self
            .state_dir
            .join("desired")
            .join(format!(".{}.partial", desired.content_hash));
        create_dir(&staging).await?;
        for doc in &documents {
            write_file(&staging.join(&doc.name), doc.content.as_bytes()).await?;
        }
        tokio::fs::rename(&staging, &archive)
            .await
            .map_err(|e| io_error(&archive, e))?;

        Ok(archive)
    }

    /// Replace the configuration files of an environment's working directory
    async fn checkout(&self, environment: &str, archive: &Path) -> AdapterResult<PathBuf> {
        let workdir = self.workdir(environment);
        create_dir(&workdir).await?;

        let mut entries = tokio::fs::read_dir(&workdir)
            .await
            .map_err(|e| io_error(&workdir, e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_error(&workdir, e))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            let is_file = entry.file_type().await.is_ok_and(|t| t.is_file());
            if is_file && !name.starts_with('.') && !name.starts_with("terraform.tfstate") {
                tokio::fs::remove_file(entry.path())
                    .await
                    .map_err(|e| io_error(&entry.path(), e))?;
            }
        }

        let mut entries = tokio::fs::read_dir(archive)
            .await
            .map_err(|e| io_error(archive, e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_error(archive, e))?
        {
            let target = workdir.join(entry.file_name());
            tokio::fs::copy(entry.path(), &target)
                .await
                .map_err(|e| io_error(&target, e))?;
        }

        Invocation::new(&self.binary)
            .args(["init", "-input=false", "-no-color"])
            .current_dir(&workdir)
            .run_checked()
            .await?;

        Ok(workdir)
    }
}

#[async_trait]
impl Provisioner for TerraformProvisioner {
    async fn plan(&self, environment: &str, desired: &DesiredState) -> AdapterResult<PlanId> {
        let archive = self.archive(desired).await?;
        let workdir = self.checkout(environment, &archive).await?;

        let short_hash: String = desired.content_hash.chars().take(12).collect();
        let plan = PlanId(format!(
            "{}-{}-{}",
            environment,
            short_hash,
            Utc::now().format("%Y%m%d%H%M%S%3f")
        ));
        let plan_file = self.plan_path(&plan, "tfplan");
        create_dir(&self.state_dir.join("plans")).await?;

        Invocation::new(&self.binary)
            .args(["plan", "-input=false", "-no-color"])
            .arg(format!("-out={}", plan_file.display()))
            .current_dir(&workdir)
            .run_checked()
            .await?;

        let meta = PlanMeta {
            environment: environment.to_string(),
            desired_state: desired.clone(),
        };
        write_json(&self.plan_path(&plan, "json"), &meta).await?;

        info!("Planned {} for environment {}", plan, environment);
        Ok(plan)
    }

    async fn apply(
        &self,
        plan: &PlanId,
        key: &IdempotencyKey,
    ) -> AdapterResult<InfrastructureSnapshot> {
        if let Some(snapshot) = self.find_snapshot(key).await? {
            info!("Apply {} already performed, reusing snapshot", key);
            return Ok(snapshot);
        }

        let meta: PlanMeta = match read_json(&self.plan_path(plan, "json")).await? {
            Some(meta) => meta,
            None => {
                return Err(AdapterError::Drift(format!(
                    "plan {} no longer exists",
                    plan
                )));
            }
        };

        let workdir = self.workdir(&meta.environment);
        let invocation = Invocation::new(&self.binary)
            .args(["apply", "-input=false", "-no-color", "-auto-approve"])
            .arg(self.plan_path(plan, "tfplan").display().to_string())
            .current_dir(&workdir);
        let output = invocation.run().await?;

        if !output.success {
            if output.stderr.contains("Saved plan is stale") {
                warn!("Plan {} is stale", plan);
                return Err(AdapterError::Drift(format!(
                    "plan {} is stale: state changed since it was computed",
                    plan
                )));
            }
            return Err(classify("terraform apply", &output));
        }

        let snapshot = InfrastructureSnapshot {
            id: key.to_string(),
            environment: meta.environment,
            plan_id: plan.clone(),
            desired_state: meta.desired_state,
            applied_at: Utc::now(),
        };
        create_dir(&self.state_dir.join("snapshots")).await?;
        write_json(&self.snapshot_path(key), &snapshot).await?;

        info!("Applied {} as snapshot {}", plan, snapshot.id);
        Ok(snapshot)
    }

    async fn destroy(
        &self,
        snapshot: &InfrastructureSnapshot,
        key: &IdempotencyKey,
    ) -> AdapterResult<()> {
        let fence = self.fence_path(key);
        if fence.exists() {
            info!("Destroy {} already performed", key);
            return Ok(());
        }

        let archive = self.archive(&snapshot.desired_state).await?;
        let workdir = self.checkout(&snapshot.environment, &archive).await?;

        Invocation::new(&self.binary)
            .args(["destroy", "-input=false", "-no-color", "-auto-approve"])
            .current_dir(&workdir)
            .run_checked()
            .await?;

        create_dir(&self.state_dir.join("fences")).await?;
        write_file(&fence, snapshot.id.as_bytes()).await?;

        info!("Destroyed snapshot {}", snapshot.id);
        Ok(())
    }

    async fn find_snapshot(
        &self,
        key: &IdempotencyKey,
    ) -> AdapterResult<Option<InfrastructureSnapshot>> {
        read_json(&self.snapshot_path(key)).await
    }
}

fn io_error(path: &Path, err: std::io::Error) -> AdapterError {
    AdapterError::Transient(format!("{}: {}", path.display(), err))
}

async fn create_dir(path: &Path) -> AdapterResult<()> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| io_error(path, e))
}

async fn write_file(path: &Path, content: &[u8]) -> AdapterResult<()> {
    tokio::fs::write(path, content)
        .await
        .map_err(|e| io_error(path, e))
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> AdapterResult<()> {
    let json = serde_json::to_vec_pretty(value)
        .map_err(|e| AdapterError::Rejected(format!("failed to encode {}: {}", path.display(), e)))?;
    write_file(path, &json).await
}

async fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> AdapterResult<Option<T>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|e| {
            AdapterError::Rejected(format!("corrupt state file {}: {}", path.display(), e))
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(io_error(path, e)),
    }
}
