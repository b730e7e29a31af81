//! Run domain types
//!
//! A Run is never stored as a mutable row. It is rebuilt by replaying its
//! append-only stage records on top of the immutable [`RunHeader`], which is
//! what makes resuming after a crash exact.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::stage::{ErrorKind, Stage, StageError, StageOutcome, StageOutput, StageRecord};
use super::trigger::TriggerEvent;

/// Immutable part of a Run, written once at submit time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunHeader {
    pub id: Uuid,
    pub trigger: TriggerEvent,
    pub environment: String,
    /// Deduplication key of the trigger that created this Run
    pub trigger_key: String,
    pub created_at: DateTime<Utc>,
}

/// Externally visible Run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    RolledBack,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::RolledBack
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Pending => write!(f, "pending"),
            RunStatus::Running => write!(f, "running"),
            RunStatus::Succeeded => write!(f, "succeeded"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::RolledBack => write!(f, "rolled_back"),
        }
    }
}

/// State machine position of a Run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Validating,
    Provisioning,
    SealingSecrets,
    Deploying,
    VerifyingHealth,
    Succeeded,
    RollingBack,
    Failed,
}

impl From<Stage> for Phase {
    fn from(stage: Stage) -> Self {
        match stage {
            Stage::Validating => Phase::Validating,
            Stage::Provisioning => Phase::Provisioning,
            Stage::SealingSecrets => Phase::SealingSecrets,
            Stage::Deploying => Phase::Deploying,
            Stage::VerifyingHealth => Phase::VerifyingHealth,
            Stage::RollingBack => Phase::RollingBack,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Timestamps and attempt count of one stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTiming {
    pub stage: Stage,
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: Option<StageOutcome>,
}

/// Where a Run has to continue from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cursor {
    /// Execute `stage` as `attempt`. `resuming` means the attempt was started
    /// before and its outcome was never recorded.
    Forward {
        stage: Stage,
        attempt: u32,
        resuming: bool,
    },
    /// The rollback has begun (or must begin) and is not finished
    Rollback,
    /// The Run is terminal
    Done,
}

/// One pipeline execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub trigger: TriggerEvent,
    pub environment: String,
    pub trigger_key: String,
    pub phase: Phase,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub timings: Vec<StageTiming>,
    /// Human-readable error detail; always set on a failed Run
    pub error: Option<String>,
    pub manual_intervention_required: bool,
    pub cancel_requested: bool,
    pub records: Vec<StageRecord>,
}

impl Run {
    /// A freshly submitted Run with no history
    pub fn new(header: RunHeader) -> Self {
        Self {
            id: header.id,
            trigger: header.trigger,
            environment: header.environment,
            trigger_key: header.trigger_key,
            phase: Phase::Validating,
            status: RunStatus::Pending,
            created_at: header.created_at,
            updated_at: header.created_at,
            timings: Vec::new(),
            error: None,
            manual_intervention_required: false,
            cancel_requested: false,
            records: Vec::new(),
        }
    }

    /// Rebuild a Run from its header and ordered history
    pub fn replay(header: RunHeader, records: impl IntoIterator<Item = StageRecord>) -> Self {
        let mut run = Self::new(header);
        for record in records {
            run.records.push(record);
        }
        run.refresh();
        run
    }

    pub fn header(&self) -> RunHeader {
        RunHeader {
            id: self.id,
            trigger: self.trigger.clone(),
            environment: self.environment.clone(),
            trigger_key: self.trigger_key.clone(),
            created_at: self.created_at,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Fold one more durable record into the Run
    pub fn apply(&mut self, record: StageRecord) {
        self.records.push(record);
        self.refresh();
    }

    /// Check that `record` is a legal next entry in this Run's history
    ///
    /// Forward stages may only start once all their prerequisites succeeded,
    /// completions must close the currently open attempt, and nothing may be
    /// appended to a terminal Run.
    pub fn admits(&self, record: &StageRecord) -> Result<(), String> {
        if record.run_id != self.id {
            return Err(format!("record belongs to run {}", record.run_id));
        }
        if self.is_terminal() {
            return Err(format!("run {} is already {}", self.id, self.status));
        }

        if record.outcome == StageOutcome::CancelRequested {
            return Ok(());
        }

        if record.is_forward() {
            if self.rollback_started() {
                return Err(format!(
                    "cannot record {} after rollback started",
                    record.stage
                ));
            }
            if self.forward_succeeded(record.stage) {
                return Err(format!("stage {} already succeeded", record.stage));
            }
            match record.outcome {
                StageOutcome::Started => {
                    if let Some(missing) = record
                        .stage
                        .prerequisites()
                        .iter()
                        .find(|p| !self.forward_succeeded(**p))
                    {
                        return Err(format!(
                            "stage {} cannot start before {} succeeded",
                            record.stage, missing
                        ));
                    }
                    if self.pending_attempt(record.stage, None).is_some() {
                        return Err(format!("stage {} already has an open attempt", record.stage));
                    }
                    Ok(())
                }
                _ => self.closes_open_attempt(record),
            }
        } else {
            match (record.inverse_of, record.outcome) {
                (None, StageOutcome::Started) => {
                    if self.rollback_started() {
                        Err("rollback already started".to_string())
                    } else {
                        Ok(())
                    }
                }
                (None, _) => {
                    if self.rollback_started() {
                        Ok(())
                    } else {
                        Err("rollback has not started".to_string())
                    }
                }
                (Some(stage), outcome) => {
                    if !self.rollback_started() {
                        return Err("rollback has not started".to_string());
                    }
                    if !stage.is_mutating() {
                        return Err(format!("stage {} has no inverse", stage));
                    }
                    if outcome == StageOutcome::Started {
                        if self.pending_attempt(Stage::RollingBack, Some(stage)).is_some() {
                            return Err(format!("inverse of {} already has an open attempt", stage));
                        }
                        Ok(())
                    } else {
                        self.closes_open_attempt(record)
                    }
                }
            }
        }
    }

    fn closes_open_attempt(&self, record: &StageRecord) -> Result<(), String> {
        match self.pending_attempt(record.stage, record.inverse_of) {
            Some(attempt) if attempt == record.attempt => Ok(()),
            Some(attempt) => Err(format!(
                "open attempt of {} is {}, not {}",
                record.stage, attempt, record.attempt
            )),
            None => Err(format!("{} has no open attempt to close", record.stage)),
        }
    }

    /// Where execution has to continue
    pub fn cursor(&self) -> Cursor {
        if self.is_terminal() {
            return Cursor::Done;
        }
        if self.rollback_started() {
            return Cursor::Rollback;
        }
        match Stage::FORWARD
            .iter()
            .copied()
            .find(|s| !self.forward_succeeded(*s))
        {
            Some(stage) => match self.pending_attempt(stage, None) {
                Some(attempt) => Cursor::Forward {
                    stage,
                    attempt,
                    resuming: true,
                },
                None => Cursor::Forward {
                    stage,
                    attempt: self.failed_attempts(stage, None) + 1,
                    resuming: false,
                },
            },
            None => Cursor::Done,
        }
    }

    fn attempt_records(
        &self,
        stage: Stage,
        inverse_of: Option<Stage>,
    ) -> impl Iterator<Item = &StageRecord> {
        self.records.iter().filter(move |r| {
            r.stage == stage
                && r.inverse_of == inverse_of
                && r.outcome != StageOutcome::CancelRequested
        })
    }

    /// The started record whose outcome was never recorded, if any
    pub fn open_record(&self, stage: Stage, inverse_of: Option<Stage>) -> Option<&StageRecord> {
        self.attempt_records(stage, inverse_of)
            .last()
            .filter(|r| r.outcome == StageOutcome::Started)
    }

    /// Attempt number of a started attempt whose outcome was never recorded
    pub fn pending_attempt(&self, stage: Stage, inverse_of: Option<Stage>) -> Option<u32> {
        self.open_record(stage, inverse_of).map(|r| r.attempt)
    }

    /// Number of attempts that ended in failure
    pub fn failed_attempts(&self, stage: Stage, inverse_of: Option<Stage>) -> u32 {
        self.attempt_records(stage, inverse_of)
            .filter(|r| r.outcome == StageOutcome::Failed)
            .count() as u32
    }

    pub fn forward_succeeded(&self, stage: Stage) -> bool {
        self.forward_record(stage).is_some()
    }

    fn forward_record(&self, stage: Stage) -> Option<&StageRecord> {
        self.records.iter().find(|r| {
            r.stage == stage && r.inverse_of.is_none() && r.outcome == StageOutcome::Succeeded
        })
    }

    /// Output of a forward stage that succeeded
    pub fn stage_output(&self, stage: Stage) -> Option<&StageOutput> {
        self.forward_record(stage).and_then(|r| r.output.as_ref())
    }

    fn rollback_marker(&self, outcome: StageOutcome) -> Option<&StageRecord> {
        self.records.iter().find(|r| {
            r.stage == Stage::RollingBack && r.inverse_of.is_none() && r.outcome == outcome
        })
    }

    pub fn rollback_started(&self) -> bool {
        self.rollback_marker(StageOutcome::Started).is_some()
    }

    /// The failure that sent the Run into rollback
    pub fn rollback_cause(&self) -> Option<&StageError> {
        self.rollback_marker(StageOutcome::Started)
            .and_then(|r| r.error.as_ref())
    }

    /// Whether the inverse action of `stage` completed
    pub fn inverse_done(&self, stage: Stage) -> bool {
        self.records.iter().any(|r| {
            r.stage == Stage::RollingBack
                && r.inverse_of == Some(stage)
                && r.outcome == StageOutcome::Succeeded
        })
    }

    /// Attempt numbers of every forward attempt of `stage` that started
    pub fn attempts(&self, stage: Stage) -> Vec<u32> {
        self.attempt_records(stage, None)
            .filter(|r| r.outcome == StageOutcome::Started)
            .map(|r| r.attempt)
            .collect()
    }

    /// Mutating stages that started at least one attempt, in reverse
    /// execution order
    ///
    /// A failed or interrupted attempt may have changed the target as much as
    /// a successful one, so both count.
    pub fn mutated_stages(&self) -> Vec<Stage> {
        Stage::FORWARD
            .iter()
            .rev()
            .copied()
            .filter(|s| s.is_mutating() && !self.attempts(*s).is_empty())
            .collect()
    }

    /// Most recent failure recorded for any attempt
    fn latest_failure(&self) -> Option<&StageError> {
        self.records
            .iter()
            .rev()
            .filter(|r| r.outcome == StageOutcome::Failed)
            .find_map(|r| r.error.as_ref())
    }

    fn refresh(&mut self) {
        if let Some(last) = self.records.last() {
            self.updated_at = last.finished_at.unwrap_or(last.started_at);
        }
        self.cancel_requested = self
            .records
            .iter()
            .any(|r| r.outcome == StageOutcome::CancelRequested);
        self.timings = self.compute_timings();

        let rollback_end = self
            .rollback_marker(StageOutcome::Failed)
            .or_else(|| self.rollback_marker(StageOutcome::Succeeded))
            .cloned();

        if let Some(end) = rollback_end {
            let cause = self.rollback_cause().cloned();
            self.phase = Phase::Failed;
            self.manual_intervention_required = end.outcome == StageOutcome::Failed;
            let cancelled = matches!(&cause, Some(c) if c.kind == ErrorKind::Cancelled);
            self.status = if cancelled && !self.manual_intervention_required {
                RunStatus::RolledBack
            } else {
                RunStatus::Failed
            };
            let mut detail = cause
                .map(|c| c.to_string())
                .unwrap_or_else(|| "run failed".to_string());
            if let Some(err) = end.error.filter(|_| self.manual_intervention_required) {
                detail = format!("{}; {}", detail, err);
            }
            self.error = Some(detail);
        } else if self.forward_succeeded(Stage::VerifyingHealth) {
            self.phase = Phase::Succeeded;
            self.status = RunStatus::Succeeded;
            self.error = None;
        } else if self.rollback_started() {
            self.phase = Phase::RollingBack;
            self.status = RunStatus::Running;
            self.error = self.rollback_cause().map(|c| c.to_string());
        } else {
            let started = self
                .records
                .iter()
                .any(|r| r.outcome != StageOutcome::CancelRequested);
            self.status = if started {
                RunStatus::Running
            } else {
                RunStatus::Pending
            };
            self.phase = Stage::FORWARD
                .iter()
                .copied()
                .find(|s| !self.forward_succeeded(*s))
                .map(Phase::from)
                .unwrap_or(Phase::Succeeded);
            self.error = self.latest_failure().map(|e| e.to_string());
        }
    }

    fn compute_timings(&self) -> Vec<StageTiming> {
        Stage::FORWARD
            .iter()
            .chain(std::iter::once(&Stage::RollingBack))
            .filter_map(|stage| {
                let records: Vec<&StageRecord> = self
                    .records
                    .iter()
                    .filter(|r| r.stage == *stage && r.outcome != StageOutcome::CancelRequested)
                    .collect();
                let first = records.first()?;
                let last = records.last()?;
                Some(StageTiming {
                    stage: *stage,
                    attempts: records
                        .iter()
                        .filter(|r| r.outcome == StageOutcome::Started)
                        .count() as u32,
                    started_at: Some(first.started_at),
                    finished_at: last.finished_at,
                    outcome: Some(last.outcome),
                })
            })
            .collect()
    }
}
