//! Adapters
//!
//! Narrow interfaces to the external systems the engine sequences: the secret
//! sealing controller, the infrastructure provisioner and the workload
//! deployer. Every mutating call takes an [`IdempotencyKey`]; implementations
//! must treat a repeated call with the same key as a no-op.

pub mod command;
pub mod kubectl;
pub mod kubeseal;
pub mod terraform;

#[cfg(test)]
pub mod fake;

use std::time::Duration;

use async_trait::async_trait;
use keel_core::domain::deployment::{DeploymentRef, HealthStatus, ManifestSet};
use keel_core::domain::infra::{DesiredState, InfrastructureSnapshot, PlanId};
use keel_core::domain::secret::{BundleRef, SecretBundle, SecretPayload, TargetKey};
use keel_core::domain::stage::{ErrorKind, IdempotencyKey, StageError};
use thiserror::Error;

pub use kubectl::KubectlDeployer;
pub use kubeseal::KubesealSealer;
pub use terraform::TerraformProvisioner;

/// Adapter failure, classified for the engine's retry policy
#[derive(Debug, Clone, Error)]
pub enum AdapterError {
    /// Temporary failure; the same call may succeed later
    #[error("transient failure: {0}")]
    Transient(String),

    /// Actual infrastructure diverged from what the plan was computed against
    #[error("drift detected: {0}")]
    Drift(String),

    /// The target cluster's public key could not be retrieved
    #[error("key fetch failed: {0}")]
    KeyFetch(String),

    /// The external system refused the request; retrying will not help
    #[error("rejected: {0}")]
    Rejected(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl AdapterError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AdapterError::Transient(_) => ErrorKind::AdapterTransient,
            AdapterError::Drift(_) => ErrorKind::DriftDetected,
            AdapterError::KeyFetch(_) => ErrorKind::KeyFetch,
            AdapterError::Rejected(_) => ErrorKind::Validation,
            AdapterError::Timeout(_) => ErrorKind::Timeout,
        }
    }
}

impl From<AdapterError> for StageError {
    fn from(err: AdapterError) -> Self {
        StageError::new(err.kind(), err.to_string())
    }
}

pub type AdapterResult<T> = Result<T, AdapterError>;

/// Wraps the external seal primitive and the publication of sealed bundles
#[async_trait]
pub trait SecretSealer: Send + Sync {
    /// Fetch the sealing public key of a cluster
    async fn fetch_public_key(&self, cluster: &str) -> AdapterResult<TargetKey>;

    /// Seal a payload into bundle `version`. Must never log plaintext.
    async fn seal(
        &self,
        payload: &SecretPayload,
        version: u32,
        key: &TargetKey,
    ) -> AdapterResult<SecretBundle>;

    /// Make a bundle the one the cluster unseals
    async fn publish(&self, bundle: &SecretBundle, key: &IdempotencyKey) -> AdapterResult<()>;

    /// Remove a bundle that has no predecessor to restore
    async fn withdraw(
        &self,
        cluster: &str,
        bundle: &BundleRef,
        key: &IdempotencyKey,
    ) -> AdapterResult<()>;
}

/// Wraps the external provisioning tool
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn plan(&self, environment: &str, desired: &DesiredState) -> AdapterResult<PlanId>;

    /// Apply a plan. Fails with [`AdapterError::Drift`] when the plan is stale.
    async fn apply(
        &self,
        plan: &PlanId,
        key: &IdempotencyKey,
    ) -> AdapterResult<InfrastructureSnapshot>;

    async fn destroy(
        &self,
        snapshot: &InfrastructureSnapshot,
        key: &IdempotencyKey,
    ) -> AdapterResult<()>;

    /// Snapshot produced by an apply fenced with `key`, if that apply happened
    async fn find_snapshot(
        &self,
        key: &IdempotencyKey,
    ) -> AdapterResult<Option<InfrastructureSnapshot>>;
}

/// Wraps the external workload orchestration API
#[async_trait]
pub trait Deployer: Send + Sync {
    async fn apply(
        &self,
        manifests: &ManifestSet,
        bundles: &[BundleRef],
        key: &IdempotencyKey,
    ) -> AdapterResult<DeploymentRef>;

    async fn health_check(&self, deployment: &DeploymentRef) -> AdapterResult<HealthStatus>;

    /// Restore a previously applied deployment
    async fn rollback(&self, previous: &DeploymentRef, key: &IdempotencyKey) -> AdapterResult<()>;

    /// Delete a deployment that has no predecessor to restore
    async fn remove(&self, deployment: &DeploymentRef, key: &IdempotencyKey) -> AdapterResult<()>;

    /// Deployment produced by an apply fenced with `key`, if that apply happened
    async fn find_deployment(&self, key: &IdempotencyKey) -> AdapterResult<Option<DeploymentRef>>;

    /// Deployment an apply fenced with `key` began, whether or not it finished
    async fn find_started(&self, key: &IdempotencyKey) -> AdapterResult<Option<DeploymentRef>>;
}
