//! Run worker
//!
//! Drives a single Run from wherever its history says it is to a terminal
//! state. Every decision is taken from the replayed [`Run`], so a worker
//! started after a crash continues exactly where the previous one stopped.

use std::future::Future;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use keel_core::domain::run::{Cursor, Run};
use keel_core::domain::stage::{ErrorKind, Stage, StageError, StageRecord};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use super::engine::{Engine, Result};
use super::lease::LeaseGuard;
use crate::adapters::{AdapterError, AdapterResult};

pub(crate) struct Worker {
    pub(super) engine: Engine,
    pub(super) run: Run,
    token: CancellationToken,
    /// Instant the whole Run must be finished by
    deadline: Instant,
    lease: Option<LeaseGuard>,
}

impl Worker {
    pub(super) async fn start(engine: Engine, run_id: Uuid, token: CancellationToken) -> Result<Self> {
        let run = engine.status(run_id).await?;

        let elapsed = (Utc::now() - run.created_at).to_std().unwrap_or_default();
        let remaining = engine.inner.settings.run_timeout.saturating_sub(elapsed);

        if run.cancel_requested {
            token.cancel();
        }

        Ok(Self {
            engine,
            run,
            token,
            deadline: Instant::now() + remaining,
            lease: None,
        })
    }

    pub(super) async fn run(mut self) -> Result<()> {
        let result = self.drive().await;
        if let Some(lease) = self.lease.take() {
            lease.release().await;
        }
        result
    }

    async fn drive(&mut self) -> Result<()> {
        loop {
            match self.run.cursor() {
                Cursor::Done => {
                    info!(
                        "Run {} finished: {}{}",
                        self.run.id,
                        self.run.status,
                        self.run
                            .error
                            .as_ref()
                            .map(|e| format!(" ({})", e))
                            .unwrap_or_default()
                    );
                    return Ok(());
                }
                Cursor::Rollback => self.roll_back().await?,
                Cursor::Forward {
                    stage,
                    attempt,
                    resuming,
                } => {
                    if let Some(cause) = self.interruption() {
                        self.begin_rollback(cause).await?;
                        continue;
                    }
                    if stage.requires_lease() && !self.hold_lease(true).await? {
                        continue;
                    }
                    self.step(stage, attempt, resuming).await?;
                }
            }
        }
    }

    /// Execute one attempt of a forward stage and record its outcome
    async fn step(&mut self, stage: Stage, attempt: u32, resuming: bool) -> Result<()> {
        let started = match self.run.open_record(stage, None) {
            Some(open) if resuming => {
                info!(
                    "Run {} resuming {} attempt {}",
                    self.run.id, stage, attempt
                );
                open.clone()
            }
            _ => {
                let record = StageRecord::started(self.run.id, stage, attempt);
                self.engine.record(&mut self.run, record).await?
            }
        };

        match self.execute(stage, attempt, resuming).await {
            Ok(output) => {
                self.engine
                    .record(&mut self.run, started.succeeded(Some(output)))
                    .await?;
            }
            Err(error) => {
                self.engine
                    .record(&mut self.run, started.failed(error.clone()))
                    .await?;

                let retry = self.engine.inner.settings.retry;
                if error.kind.is_retryable() && attempt < retry.max_attempts {
                    let delay = retry.delay_for(attempt);
                    info!(
                        "Run {} retrying {} in {:?} ({}/{})",
                        self.run.id, stage, delay, attempt, retry.max_attempts
                    );
                    self.pause(delay).await;
                } else {
                    let cause = if error.kind.is_retryable() {
                        StageError::new(
                            error.kind,
                            format!("{} after {} attempts", error.message, attempt),
                        )
                    } else {
                        error
                    };
                    self.begin_rollback(cause).await?;
                }
            }
        }

        Ok(())
    }

    async fn begin_rollback(&mut self, cause: StageError) -> Result<()> {
        warn!("Run {} rolling back: {}", self.run.id, cause);
        let record = StageRecord::rollback_started(self.run.id, cause);
        self.engine.record(&mut self.run, record).await?;
        Ok(())
    }

    /// Why the Run must stop moving forward, if it must
    pub(super) fn interruption(&self) -> Option<StageError> {
        if self.token.is_cancelled() || self.run.cancel_requested {
            return Some(StageError::new(ErrorKind::Cancelled, "cancelled on request"));
        }
        if Instant::now() >= self.deadline {
            return Some(StageError::new(
                ErrorKind::Timeout,
                format!(
                    "run exceeded its deadline of {:?}",
                    self.engine.inner.settings.run_timeout
                ),
            ));
        }
        None
    }

    /// Wait for `duration` unless the Run is cancelled or out of time first
    ///
    /// Returns false when the wait was cut short.
    pub(super) async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.token.cancelled() => false,
            _ = tokio::time::sleep_until(self.deadline) => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    /// Make sure this Run holds its environment's lease
    ///
    /// Queues behind the current holder. An interruptible wait returns false
    /// when the Run is cancelled or out of time while queued.
    pub(super) async fn hold_lease(&mut self, interruptible: bool) -> Result<bool> {
        if let Some(guard) = &self.lease {
            if !guard.is_lost() {
                return Ok(true);
            }
            warn!(
                "Run {} re-acquiring its lease on {}",
                self.run.id, self.run.environment
            );
            self.lease = None;
        }

        let inner = Arc::clone(&self.engine.inner);
        let ttl = inner.settings.lease_ttl;
        let mut queued = false;

        loop {
            if let Some(lease) = inner
                .store
                .acquire_lease(&self.run.environment, self.run.id, ttl)
                .await?
            {
                info!(
                    "Run {} acquired lease on {}",
                    self.run.id, self.run.environment
                );
                self.lease = Some(LeaseGuard::start(Arc::clone(&inner.store), lease, ttl));
                return Ok(true);
            }

            if !queued {
                let holder = inner.store.lease(&self.run.environment).await?;
                let in_flight = inner.store.list_in_flight(&self.run.environment).await?;
                info!(
                    "Run {} queued for {} behind {} ({} runs in flight)",
                    self.run.id,
                    self.run.environment,
                    holder
                        .map(|l| l.holder.to_string())
                        .unwrap_or_else(|| "an expiring lease".to_string()),
                    in_flight.len()
                );
                queued = true;
            }

            if interruptible {
                if !self.pause(inner.settings.lease_poll).await {
                    return Ok(false);
                }
            } else {
                tokio::time::sleep(inner.settings.lease_poll).await;
            }
        }
    }

    /// Await an adapter call, bounded by the adapter timeout
    ///
    /// A call that overruns gets one more timeout period to settle before it
    /// is dropped, and dropping a command-backed call kills its child. Either
    /// way nothing the call started is still running when this returns, and
    /// the lease is still held. An overrun is reported as a timeout even when
    /// the call then completes; rollback looks up what it actually applied.
    pub(super) async fn call<T>(
        &self,
        call: impl Future<Output = AdapterResult<T>>,
    ) -> std::result::Result<T, StageError> {
        let limit = self.engine.inner.settings.adapter_timeout;
        let mut call = pin!(call);
        if let Ok(result) = tokio::time::timeout(limit, call.as_mut()).await {
            return result.map_err(StageError::from);
        }

        warn!(
            "Run {} adapter call exceeded {:?}, waiting for it to settle",
            self.run.id, limit
        );
        match tokio::time::timeout(limit, call).await {
            Ok(Ok(_)) => info!("Run {} overrunning adapter call completed", self.run.id),
            Ok(Err(e)) => warn!("Run {} overrunning adapter call failed: {}", self.run.id, e),
            Err(_) => warn!(
                "Run {} abandoned adapter call after {:?}",
                self.run.id,
                limit * 2
            ),
        }
        Err(AdapterError::Timeout(limit).into())
    }
}
