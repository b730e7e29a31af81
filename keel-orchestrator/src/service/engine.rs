//! Orchestration Engine
//!
//! Public entry point of the orchestrator: accepts triggers, drives each Run
//! on its own task and answers status and cancel requests. All history goes
//! through [`Engine::record`], which checks the transition against the Run's
//! replayed history before appending it.

use std::collections::HashMap;
use std::sync::Arc;

use keel_core::domain::lease::Lease;
use keel_core::domain::run::{Cursor, Phase, Run, RunHeader, RunStatus};
use keel_core::domain::stage::{Stage, StageOutcome, StageRecord};
use keel_core::domain::trigger::TriggerEvent;
use keel_core::dto::environment::EnvironmentStatus;
use keel_core::dto::run::{CancelOutcome, CancelResponse, SubmitResponse};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::worker::Worker;
use crate::adapters::{Deployer, Provisioner, SecretSealer};
use crate::config::{EngineSettings, TargetCatalog};
use crate::repository::{StateStore, StoreError};
use crate::workspace::{SecretResolver, Workspace};

/// Engine error type
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("run {0} not found")]
    NotFound(Uuid),

    #[error("unknown environment '{0}'")]
    UnknownEnvironment(String),

    /// The trigger does not create a Run
    #[error("{0}")]
    Rejected(String),

    #[error("invalid transition for run {run_id}: {reason}")]
    InvalidTransition { run_id: Uuid, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// The three external systems a Run is driven through
#[derive(Clone)]
pub struct Adapters {
    pub sealer: Arc<dyn SecretSealer>,
    pub provisioner: Arc<dyn Provisioner>,
    pub deployer: Arc<dyn Deployer>,
}

/// A record that was durably appended to a Run's history
#[derive(Debug, Clone, Serialize)]
pub struct RunEvent {
    pub run_id: Uuid,
    pub record: StageRecord,
    pub phase: Phase,
    pub status: RunStatus,
}

pub(crate) struct Inner {
    pub(crate) store: Arc<dyn StateStore>,
    pub(crate) adapters: Adapters,
    pub(crate) catalog: TargetCatalog,
    pub(crate) workspace: Workspace,
    pub(crate) secrets: SecretResolver,
    pub(crate) settings: EngineSettings,
    slots: Arc<Semaphore>,
    /// Cancellation tokens of Runs currently being driven
    workers: Mutex<HashMap<Uuid, CancellationToken>>,
    /// Per-Run locks serializing load-check-append of history
    histories: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
    events: broadcast::Sender<RunEvent>,
}

#[derive(Clone)]
pub struct Engine {
    pub(crate) inner: Arc<Inner>,
}

impl Engine {
    pub fn new(
        store: Arc<dyn StateStore>,
        adapters: Adapters,
        catalog: TargetCatalog,
        workspace: Workspace,
        secrets: SecretResolver,
        settings: EngineSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                store,
                adapters,
                catalog,
                workspace,
                secrets,
                slots: Arc::new(Semaphore::new(settings.max_parallel_runs.max(1))),
                settings,
                workers: Mutex::new(HashMap::new()),
                histories: Mutex::new(HashMap::new()),
                events,
            }),
        }
    }

    pub fn catalog(&self) -> &TargetCatalog {
        &self.inner.catalog
    }

    /// Receive every record appended from now on
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.inner.events.subscribe()
    }

    /// Accept a trigger and start driving its Run
    ///
    /// A trigger that was already accepted returns the existing Run instead
    /// of creating another one.
    pub async fn submit(
        &self,
        trigger: TriggerEvent,
        environment: Option<&str>,
    ) -> Result<SubmitResponse> {
        if !trigger.event_type.creates_run() {
            return Err(EngineError::Rejected(format!(
                "event type '{}' does not create runs",
                trigger.event_type
            )));
        }
        trigger.check().map_err(EngineError::Rejected)?;

        let target = self
            .inner
            .catalog
            .resolve(&trigger, environment)
            .map_err(EngineError::Rejected)?;

        let header = RunHeader {
            id: Uuid::new_v4(),
            trigger_key: trigger.dedup_key(&target.name),
            environment: target.name.clone(),
            trigger,
            created_at: chrono::Utc::now(),
        };

        let (header, created) = self.inner.store.create_run(header).await?;

        if created {
            info!(
                "Run {} created for {}@{} on {} -> {}",
                header.id,
                header.trigger.repository,
                header.trigger.commit_sha,
                header.trigger.branch,
                header.environment
            );
            self.spawn(header.id);
        } else {
            info!(
                "Trigger {} already accepted as run {}",
                header.trigger_key, header.id
            );
        }

        Ok(SubmitResponse {
            run_id: header.id,
            created,
        })
    }

    /// Latest durable state of a Run
    pub async fn status(&self, run_id: Uuid) -> Result<Run> {
        self.inner
            .store
            .load(run_id)
            .await?
            .ok_or(EngineError::NotFound(run_id))
    }

    pub async fn list(&self, environment: Option<&str>, limit: usize) -> Result<Vec<Run>> {
        Ok(self.inner.store.list_runs(environment, limit).await?)
    }

    /// Ask a Run to stop and roll back at its next checkpoint
    pub async fn cancel(&self, run_id: Uuid) -> Result<CancelResponse> {
        let run = {
            let lock = self.history_lock(run_id).await;
            let _guard = lock.lock().await;
            let run = self.status(run_id).await?;

            if run.is_terminal() {
                info!("Cancel of run {} ignored: already {}", run_id, run.status);
                return Ok(CancelResponse {
                    run_id,
                    outcome: CancelOutcome::AlreadyTerminal,
                    status: run.status,
                });
            }

            let stage = match run.cursor() {
                Cursor::Forward { stage, .. } => stage,
                Cursor::Rollback | Cursor::Done => Stage::RollingBack,
            };
            let stored = self
                .append_checked(run, StageRecord::cancel_requested(run_id, stage))
                .await?;
            self.publish(&stored.0, stored.1);
            stored.0
        };

        if let Some(token) = self.inner.workers.lock().await.get(&run_id) {
            token.cancel();
        }

        info!("Cancel requested for run {} at {}", run_id, run.phase);
        Ok(CancelResponse {
            run_id,
            outcome: CancelOutcome::Accepted,
            status: run.status,
        })
    }

    /// Lease holder and unfinished Runs of a configured environment
    pub async fn environment(&self, name: &str) -> Result<EnvironmentStatus> {
        if self.inner.catalog.get(name).is_none() {
            return Err(EngineError::UnknownEnvironment(name.to_string()));
        }
        Ok(EnvironmentStatus {
            environment: name.to_string(),
            lease: self.lease(name).await?,
            in_flight: self.inner.store.list_in_flight(name).await?,
        })
    }

    pub async fn lease(&self, environment: &str) -> Result<Option<Lease>> {
        Ok(self.inner.store.lease(environment).await?)
    }

    /// Resume every Run that had not finished when the engine last stopped
    pub async fn recover(&self) -> Result<usize> {
        let unfinished = self.inner.store.list_unfinished().await?;
        for run_id in &unfinished {
            info!("Resuming unfinished run {}", run_id);
            self.spawn(*run_id);
        }
        Ok(unfinished.len())
    }

    /// Drive a Run on its own task once a worker slot is free
    fn spawn(&self, run_id: Uuid) {
        let engine = self.clone();
        tokio::spawn(async move {
            let permit = match Arc::clone(&engine.inner.slots).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            if let Err(e) = engine.drive(run_id).await {
                error!("Run {} stopped: {}", run_id, e);
            }
            drop(permit);
        });
    }

    /// Drive a Run to a terminal state on the current task
    pub async fn drive(&self, run_id: Uuid) -> Result<()> {
        let token = {
            let mut workers = self.inner.workers.lock().await;
            if workers.contains_key(&run_id) {
                debug!("Run {} is already being driven", run_id);
                return Ok(());
            }
            let token = CancellationToken::new();
            workers.insert(run_id, token.clone());
            token
        };

        let result = match Worker::start(self.clone(), run_id, token).await {
            Ok(worker) => worker.run().await,
            Err(e) => Err(e),
        };

        self.inner.workers.lock().await.remove(&run_id);
        result
    }

    /// Durably append `record` to the Run's history and refresh `run`
    pub(crate) async fn record(&self, run: &mut Run, record: StageRecord) -> Result<StageRecord> {
        let lock = self.history_lock(run.id).await;
        let _guard = lock.lock().await;
        let fresh = self.status(run.id).await?;
        let (fresh, stored) = self.append_checked(fresh, record).await?;
        self.publish(&fresh, stored.clone());
        *run = fresh;
        Ok(stored)
    }

    /// The lock guarding one Run's history
    ///
    /// Locks nobody else holds are dropped on the way.
    async fn history_lock(&self, run_id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.inner.histories.lock().await;
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        Arc::clone(locks.entry(run_id).or_default())
    }

    /// Check and append; the caller holds the Run's history lock
    async fn append_checked(&self, mut run: Run, record: StageRecord) -> Result<(Run, StageRecord)> {
        run.admits(&record)
            .map_err(|reason| EngineError::InvalidTransition {
                run_id: run.id,
                reason,
            })?;

        let stored = self.inner.store.append(record).await?;
        run.apply(stored.clone());

        let label = match stored.inverse_of {
            Some(stage) => format!("{}({})", stored.stage, stage),
            None => stored.stage.to_string(),
        };
        match stored.outcome {
            StageOutcome::Failed => warn!(
                "Run {} {} attempt {} failed: {}",
                run.id,
                label,
                stored.attempt,
                stored
                    .error
                    .as_ref()
                    .map(|e| e.to_string())
                    .unwrap_or_default()
            ),
            outcome => info!(
                "Run {} {} attempt {} {}",
                run.id,
                label,
                stored.attempt,
                outcome.as_str()
            ),
        }

        Ok((run, stored))
    }

    fn publish(&self, run: &Run, record: StageRecord) {
        // no subscribers is fine
        let _ = self.inner.events.send(RunEvent {
            run_id: run.id,
            record,
            phase: run.phase,
            status: run.status,
        });
    }
}
