//! Stage domain types
//!
//! A Run advances through a fixed sequence of stages. Every attempt at a
//! stage, and every inverse action taken while rolling back, is captured as an
//! append-only [`StageRecord`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::deployment::{DeploymentRef, HealthStatus};
use super::infra::{InfrastructureSnapshot, PlanId};
use super::secret::SecretBundle;

/// Pipeline stage, ordered by execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Stage {
    Validating,
    Provisioning,
    SealingSecrets,
    Deploying,
    VerifyingHealth,
    RollingBack,
}

impl Stage {
    /// Forward stages in execution order
    pub const FORWARD: [Stage; 5] = [
        Stage::Validating,
        Stage::Provisioning,
        Stage::SealingSecrets,
        Stage::Deploying,
        Stage::VerifyingHealth,
    ];

    /// Stages that change external state and have an inverse action
    pub fn is_mutating(self) -> bool {
        matches!(
            self,
            Stage::Provisioning | Stage::SealingSecrets | Stage::Deploying
        )
    }

    /// Whether the stage runs under the environment lease
    pub fn requires_lease(self) -> bool {
        !matches!(self, Stage::Validating)
    }

    /// Stages that must have succeeded before this one may start
    pub fn prerequisites(self) -> &'static [Stage] {
        match self {
            Stage::Validating | Stage::RollingBack => &[],
            Stage::Provisioning => &[Stage::Validating],
            Stage::SealingSecrets => &[Stage::Validating, Stage::Provisioning],
            Stage::Deploying => &[
                Stage::Validating,
                Stage::Provisioning,
                Stage::SealingSecrets,
            ],
            Stage::VerifyingHealth => &[
                Stage::Validating,
                Stage::Provisioning,
                Stage::SealingSecrets,
                Stage::Deploying,
            ],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Validating => "Validating",
            Stage::Provisioning => "Provisioning",
            Stage::SealingSecrets => "SealingSecrets",
            Stage::Deploying => "Deploying",
            Stage::VerifyingHealth => "VerifyingHealth",
            Stage::RollingBack => "RollingBack",
        }
    }

    pub fn parse(s: &str) -> Option<Stage> {
        match s {
            "Validating" => Some(Stage::Validating),
            "Provisioning" => Some(Stage::Provisioning),
            "SealingSecrets" => Some(Stage::SealingSecrets),
            "Deploying" => Some(Stage::Deploying),
            "VerifyingHealth" => Some(Stage::VerifyingHealth),
            "RollingBack" => Some(Stage::RollingBack),
            _ => None,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome carried by a stage record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageOutcome {
    /// The attempt began; the adapter call may or may not have happened
    Started,
    Succeeded,
    Failed,
    /// A cancel request was accepted while the Run was at this stage
    CancelRequested,
}

impl StageOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            StageOutcome::Started => "Started",
            StageOutcome::Succeeded => "Succeeded",
            StageOutcome::Failed => "Failed",
            StageOutcome::CancelRequested => "CancelRequested",
        }
    }

    pub fn parse(s: &str) -> Option<StageOutcome> {
        match s {
            "Started" => Some(StageOutcome::Started),
            "Succeeded" => Some(StageOutcome::Succeeded),
            "Failed" => Some(StageOutcome::Failed),
            "CancelRequested" => Some(StageOutcome::CancelRequested),
            _ => None,
        }
    }
}

/// Error taxonomy for stage failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Bad trigger, configuration or workspace. Never retried.
    Validation,
    /// Adapter reported a temporary failure. Retried with backoff.
    AdapterTransient,
    /// Actual infrastructure diverged from the plan. The next attempt re-plans.
    DriftDetected,
    /// The target cluster key could not be fetched. The next attempt re-fetches.
    KeyFetch,
    /// An adapter call, the health deadline or the Run deadline was exceeded
    Timeout,
    /// The deployment reported itself failed
    Unhealthy,
    /// The Run was cancelled on request
    Cancelled,
    /// An inverse action could not be completed
    RollbackFailure,
}

impl ErrorKind {
    /// Whether another attempt of the same stage may follow
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::AdapterTransient | ErrorKind::DriftDetected | ErrorKind::KeyFetch
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Validation => "Validation",
            ErrorKind::AdapterTransient => "AdapterTransient",
            ErrorKind::DriftDetected => "DriftDetected",
            ErrorKind::KeyFetch => "KeyFetch",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::Unhealthy => "Unhealthy",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::RollbackFailure => "RollbackFailure",
        }
    }

    pub fn parse(s: &str) -> Option<ErrorKind> {
        match s {
            "Validation" => Some(ErrorKind::Validation),
            "AdapterTransient" => Some(ErrorKind::AdapterTransient),
            "DriftDetected" => Some(ErrorKind::DriftDetected),
            "KeyFetch" => Some(ErrorKind::KeyFetch),
            "Timeout" => Some(ErrorKind::Timeout),
            "Unhealthy" => Some(ErrorKind::Unhealthy),
            "Cancelled" => Some(ErrorKind::Cancelled),
            "RollbackFailure" => Some(ErrorKind::RollbackFailure),
            _ => None,
        }
    }
}

/// Classified failure of a stage attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageError {
    pub kind: ErrorKind,
    pub message: String,
}

impl StageError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }
}

impl std::fmt::Display for StageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

/// Adapter-specific result of a successful stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StageOutput {
    Validated {
        desired_state_hash: String,
        manifest_hash: String,
        secrets: Vec<String>,
    },
    Provisioned {
        plan_id: PlanId,
        snapshot: InfrastructureSnapshot,
        /// Snapshot of the last successful Run, restored on rollback
        previous: Option<InfrastructureSnapshot>,
    },
    Sealed {
        bundles: Vec<SecretBundle>,
        /// Bundles of the last successful Run, re-published on rollback
        previous: Vec<SecretBundle>,
    },
    Deployed {
        deployment: DeploymentRef,
        /// Deployment of the last successful Run, restored on rollback
        previous: Option<DeploymentRef>,
    },
    Verified {
        health: HealthStatus,
        polls: u32,
    },
    Reverted {
        action: String,
    },
}

/// One durable entry of a Run's history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRecord {
    pub run_id: Uuid,
    /// Position in the log, assigned by the state store on append
    pub seq: i64,
    pub stage: Stage,
    /// For rollback records: the forward stage being inverted.
    /// `None` on a rollback record marks the start or end of the rollback.
    pub inverse_of: Option<Stage>,
    pub attempt: u32,
    pub outcome: StageOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub output: Option<StageOutput>,
    pub error: Option<StageError>,
}

impl StageRecord {
    fn new(run_id: Uuid, stage: Stage, inverse_of: Option<Stage>, attempt: u32) -> Self {
        Self {
            run_id,
            seq: 0,
            stage,
            inverse_of,
            attempt,
            outcome: StageOutcome::Started,
            started_at: Utc::now(),
            finished_at: None,
            output: None,
            error: None,
        }
    }

    /// Start of a forward stage attempt
    pub fn started(run_id: Uuid, stage: Stage, attempt: u32) -> Self {
        Self::new(run_id, stage, None, attempt)
    }

    /// Start of the rollback, carrying the failure that caused it
    pub fn rollback_started(run_id: Uuid, cause: StageError) -> Self {
        Self {
            error: Some(cause),
            ..Self::new(run_id, Stage::RollingBack, None, 1)
        }
    }

    /// Start of an inverse action for `stage`
    pub fn inverse_started(run_id: Uuid, stage: Stage, attempt: u32) -> Self {
        Self::new(run_id, Stage::RollingBack, Some(stage), attempt)
    }

    /// Marker that a cancel request was accepted at `stage`
    pub fn cancel_requested(run_id: Uuid, stage: Stage) -> Self {
        let now = Utc::now();
        Self {
            outcome: StageOutcome::CancelRequested,
            finished_at: Some(now),
            ..Self::new(run_id, stage, None, 0)
        }
    }

    /// Successful completion of this started record
    pub fn succeeded(&self, output: Option<StageOutput>) -> Self {
        Self {
            seq: 0,
            outcome: StageOutcome::Succeeded,
            finished_at: Some(Utc::now()),
            output,
            error: None,
            ..self.clone()
        }
    }

    /// Failed completion of this started record
    pub fn failed(&self, error: StageError) -> Self {
        Self {
            seq: 0,
            outcome: StageOutcome::Failed,
            finished_at: Some(Utc::now()),
            output: None,
            error: Some(error),
            ..self.clone()
        }
    }

    pub fn is_forward(&self) -> bool {
        self.stage != Stage::RollingBack
    }

    /// Whether this record ends the Run
    pub fn is_terminal(&self) -> bool {
        match (self.stage, self.inverse_of, self.outcome) {
            (Stage::VerifyingHealth, None, StageOutcome::Succeeded) => true,
            (Stage::RollingBack, None, StageOutcome::Succeeded | StageOutcome::Failed) => true,
            _ => false,
        }
    }
}

/// Fencing token for an adapter call
///
/// Derived from (Run, stage, attempt). Reusing the same key on a resumed
/// attempt lets adapters recognise a call they already performed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey {
    pub run_id: Uuid,
    pub stage: Stage,
    pub attempt: u32,
    pub inverse: bool,
    /// Content hash of the document the call acts on, when there is one
    pub content: Option<String>,
}

impl IdempotencyKey {
    pub fn new(run_id: Uuid, stage: Stage, attempt: u32) -> Self {
        Self {
            run_id,
            stage,
            attempt,
            inverse: false,
            content: None,
        }
    }

    pub fn inverse(run_id: Uuid, stage: Stage, attempt: u32) -> Self {
        Self {
            inverse: true,
            ..Self::new(run_id, stage, attempt)
        }
    }

    pub fn with_content(mut self, content_hash: &str) -> Self {
        self.content = Some(content_hash.chars().take(12).collect());
        self
    }
}

impl std::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.run_id, self.stage.as_str(), self.attempt)?;
        if self.inverse {
            write!(f, ".inverse")?;
        }
        if let Some(content) = &self.content {
            write!(f, ".{}", content)?;
        }
        Ok(())
    }
}
