//! Deployment domain types

use serde::{Deserialize, Serialize};

use super::secret::BundleRef;

/// One opaque workload manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestDocument {
    pub name: String,
    pub content: String,
}

/// The set of manifests deployed to one environment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestSet {
    pub environment: String,
    /// Cluster context the manifests are applied to
    pub cluster: String,
    pub namespace: String,
    pub documents: Vec<ManifestDocument>,
    pub content_hash: String,
}

/// Reference to an applied deployment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRef {
    pub id: String,
    pub environment: String,
    pub cluster: String,
    pub namespace: String,
    pub manifest_hash: String,
    /// Exact secret bundle versions the deployment was applied with
    pub bundles: Vec<BundleRef>,
}

/// Result of a deployment health check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Failed,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "Healthy"),
            HealthStatus::Degraded => write!(f, "Degraded"),
            HealthStatus::Failed => write!(f, "Failed"),
        }
    }
}
