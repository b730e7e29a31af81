//! Infrastructure domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Declared desired state for one environment
///
/// The document itself is opaque to the engine; only the environment name,
/// its location and its content hash are interpreted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredState {
    pub environment: String,
    /// Where the provisioner reads the document from (e.g. a directory)
    pub location: String,
    pub content_hash: String,
}

/// Identifier of a computed provisioning plan
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlanId(pub String);

impl std::fmt::Display for PlanId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of applying a plan: the provisioned state of an environment
///
/// Snapshots are never mutated. A later apply produces a new snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfrastructureSnapshot {
    pub id: String,
    pub environment: String,
    pub plan_id: PlanId,
    pub desired_state: DesiredState,
    pub applied_at: DateTime<Utc>,
}
