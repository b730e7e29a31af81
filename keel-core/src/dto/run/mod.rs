//! Run DTOs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::run::{Phase, Run, RunStatus};
use crate::domain::trigger::TriggerEvent;

/// Request to start a Run from a trigger event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRun {
    pub trigger: TriggerEvent,

    /// Target environment. Resolved from the target catalog when absent.
    #[serde(default)]
    pub environment: Option<String>,
}

/// Result of a submit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub run_id: Uuid,

    /// False when an identical trigger had already created this Run
    pub created: bool,
}

/// Summary information about a Run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub id: Uuid,
    pub environment: String,
    pub repository: String,
    pub commit_sha: String,
    pub branch: String,
    pub phase: Phase,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub error: Option<String>,
}

impl From<&Run> for RunSummary {
    fn from(run: &Run) -> Self {
        RunSummary {
            id: run.id,
            environment: run.environment.clone(),
            repository: run.trigger.repository.clone(),
            commit_sha: run.trigger.commit_sha.clone(),
            branch: run.trigger.branch.clone(),
            phase: run.phase,
            status: run.status,
            created_at: run.created_at,
            updated_at: run.updated_at,
            error: run.error.clone(),
        }
    }
}

/// How a cancel request was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The Run will stop at its next checkpoint and roll back
    Accepted,
    /// The Run had already finished; nothing changed
    AlreadyTerminal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelResponse {
    pub run_id: Uuid,
    pub outcome: CancelOutcome,
    pub status: RunStatus,
}
