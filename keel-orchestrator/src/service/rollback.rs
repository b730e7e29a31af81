//! Reverse-order rollback
//!
//! Inverts every mutating stage that started, newest first. Rollback holds
//! the environment lease and is never interrupted by cancel or the Run
//! deadline. An inverse that cannot be completed stops the rollback and
//! leaves the Run flagged for manual intervention.

use keel_core::domain::infra::InfrastructureSnapshot;
use keel_core::domain::secret::{BundleRef, SecretBundle};
use keel_core::domain::stage::{ErrorKind, IdempotencyKey, Stage, StageError, StageOutput, StageRecord};
use tracing::{error, info, warn};

use super::engine::Result;
use super::stages::{next_version, previous_deployment, previous_snapshot, store_error};
use super::worker::Worker;

impl Worker {
    pub(super) async fn roll_back(&mut self) -> Result<()> {
        let Some(marker) = self.run.open_record(Stage::RollingBack, None).cloned() else {
            return Ok(());
        };

        let pending: Vec<Stage> = self
            .run
            .mutated_stages()
            .into_iter()
            .filter(|s| !self.run.inverse_done(*s))
            .collect();
        info!(
            "Run {} reverting {:?}",
            self.run.id, pending
        );

        let mut failure = None;
        for stage in pending {
            self.hold_lease(false).await?;
            if let Err(e) = self.invert(stage).await? {
                failure = Some((stage, e));
                break;
            }
        }

        let outcome = match failure {
            Some((stage, e)) => {
                error!(
                    "Run {} could not revert {}; manual intervention required: {}",
                    self.run.id, stage, e
                );
                marker.failed(StageError::new(
                    ErrorKind::RollbackFailure,
                    format!("inverse of {} failed: {}", stage, e.message),
                ))
            }
            None => marker.succeeded(None),
        };
        self.engine.record(&mut self.run, outcome).await?;
        Ok(())
    }

    /// Run the inverse of `stage` until it succeeds or its attempts run out
    async fn invert(&mut self, stage: Stage) -> Result<std::result::Result<(), StageError>> {
        let retry = self.engine.inner.settings.retry;

        loop {
            let started = match self.run.open_record(Stage::RollingBack, Some(stage)) {
                Some(open) => open.clone(),
                None => {
                    let failed = self.run.failed_attempts(Stage::RollingBack, Some(stage));
                    if failed >= retry.max_attempts {
                        return Ok(Err(StageError::new(
                            ErrorKind::RollbackFailure,
                            format!("gave up after {} attempts", failed),
                        )));
                    }
                    let record = StageRecord::inverse_started(self.run.id, stage, failed + 1);
                    self.engine.record(&mut self.run, record).await?
                }
            };
            let attempt = started.attempt;

            match self.inverse_action(stage, attempt).await {
                Ok(action) => {
                    info!("Run {} reverted {}: {}", self.run.id, stage, action);
                    self.engine
                        .record(
                            &mut self.run,
                            started.succeeded(Some(StageOutput::Reverted { action })),
                        )
                        .await?;
                    return Ok(Ok(()));
                }
                Err(e) => {
                    self.engine
                        .record(&mut self.run, started.failed(e.clone()))
                        .await?;
                    if e.kind == ErrorKind::Validation || attempt >= retry.max_attempts {
                        return Ok(Err(e));
                    }
                    let delay = retry.delay_for(attempt);
                    warn!(
                        "Run {} retrying inverse of {} in {:?}",
                        self.run.id, stage, delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Restore what `stage` replaced, or remove what it created
    async fn inverse_action(&self, stage: Stage, attempt: u32) -> std::result::Result<String, StageError> {
        let key = IdempotencyKey::inverse(self.run.id, stage, attempt);
        match self.run.stage_output(stage) {
            Some(output) => self.revert_output(stage, output, &key).await,
            None => self.revert_attempts(stage, &key).await,
        }
    }

    /// Revert a stage from the output it recorded on success
    async fn revert_output(
        &self,
        stage: Stage,
        output: &StageOutput,
        key: &IdempotencyKey,
    ) -> std::result::Result<String, StageError> {
        let adapters = &self.engine.inner.adapters;

        match output {
            StageOutput::Deployed {
                deployment,
                previous,
            } => match previous {
                Some(previous) => {
                    self.call(adapters.deployer.rollback(previous, key)).await?;
                    Ok(format!("restored deployment {}", previous.id))
                }
                None => {
                    self.call(adapters.deployer.remove(deployment, key)).await?;
                    Ok(format!("removed deployment {}", deployment.id))
                }
            },
            StageOutput::Sealed { bundles, previous } => {
                let mut actions = Vec::with_capacity(bundles.len());
                for bundle in bundles {
                    let before = previous
                        .iter()
                        .find(|p| p.name == bundle.name && p.namespace == bundle.namespace);
                    match before {
                        Some(before) => {
                            self.call(adapters.sealer.publish(before, key)).await?;
                            actions.push(format!("republished {}", before.reference()));
                        }
                        None => {
                            self.call(adapters.sealer.withdraw(
                                &bundle.cluster,
                                &bundle.reference(),
                                key,
                            ))
                            .await?;
                            actions.push(format!("withdrew {}", bundle.reference()));
                        }
                    }
                }
                if actions.is_empty() {
                    actions.push("no bundles to revert".to_string());
                }
                Ok(actions.join(", "))
            }
            StageOutput::Provisioned {
                snapshot, previous, ..
            } => match previous {
                Some(previous) => self.restore_snapshot(previous, key).await,
                None => {
                    self.call(adapters.provisioner.destroy(snapshot, key)).await?;
                    Ok(format!("destroyed snapshot {}", snapshot.id))
                }
            },
            _ => Err(StageError::validation(format!(
                "no recorded output to revert {}",
                stage
            ))),
        }
    }

    /// Revert a stage that never succeeded
    ///
    /// Its attempts may still have changed the target before failing, so
    /// everything they could have touched is put back the way the last
    /// successful Run on the environment left it.
    async fn revert_attempts(
        &self,
        stage: Stage,
        key: &IdempotencyKey,
    ) -> std::result::Result<String, StageError> {
        let adapters = &self.engine.inner.adapters;
        let baseline = self.baseline().await?;
        let (desired_hash, manifest_hash) = self.validated_hashes()?;
        // newest attempt first
        let attempts: Vec<u32> = self.run.attempts(stage).into_iter().rev().collect();

        match stage {
            Stage::Provisioning => {
                if let Some(previous) = baseline.as_ref().and_then(previous_snapshot) {
                    return self.restore_snapshot(&previous, key).await;
                }
                for attempt in attempts {
                    let forward = IdempotencyKey::new(self.run.id, stage, attempt)
                        .with_content(&desired_hash);
                    if let Some(snapshot) =
                        self.call(adapters.provisioner.find_snapshot(&forward)).await?
                    {
                        self.call(adapters.provisioner.destroy(&snapshot, key)).await?;
                        return Ok(format!("destroyed snapshot {}", snapshot.id));
                    }
                }
                Ok("no snapshot was applied".to_string())
            }
            Stage::SealingSecrets => {
                let secrets = match self.run.stage_output(Stage::Validating) {
                    Some(StageOutput::Validated { secrets, .. }) => secrets.clone(),
                    _ => return Err(StageError::validation("run has no validation output")),
                };
                let before: Vec<SecretBundle> = match baseline
                    .as_ref()
                    .and_then(|run| run.stage_output(Stage::SealingSecrets))
                {
                    Some(StageOutput::Sealed { bundles, .. }) => bundles.clone(),
                    _ => Vec::new(),
                };
                let history = self
                    .engine
                    .inner
                    .store
                    .stage_outputs(&self.run.environment, Stage::SealingSecrets)
                    .await
                    .map_err(store_error)?;
                let cluster = &self.target()?.cluster_key;

                let mut actions = Vec::with_capacity(secrets.len());
                for secret in &secrets {
                    let Some((namespace, name)) = secret.split_once('/') else {
                        return Err(StageError::validation(format!(
                            "malformed secret reference '{}'",
                            secret
                        )));
                    };
                    match before
                        .iter()
                        .find(|b| b.name == name && b.namespace == namespace)
                    {
                        Some(before) => {
                            self.call(adapters.sealer.publish(before, key)).await?;
                            actions.push(format!("republished {}", before.reference()));
                        }
                        None => {
                            let attempted = BundleRef {
                                name: name.to_string(),
                                namespace: namespace.to_string(),
                                version: next_version(&history, namespace, name),
                            };
                            self.call(adapters.sealer.withdraw(cluster, &attempted, key))
                                .await?;
                            actions.push(format!("withdrew {}", attempted));
                        }
                    }
                }
                if actions.is_empty() {
                    actions.push("no bundles to revert".to_string());
                }
                Ok(actions.join(", "))
            }
            Stage::Deploying => {
                if let Some(previous) = baseline.as_ref().and_then(previous_deployment) {
                    self.call(adapters.deployer.rollback(&previous, key)).await?;
                    return Ok(format!("restored deployment {}", previous.id));
                }
                let mut actions = Vec::new();
                for attempt in attempts {
                    let forward = IdempotencyKey::new(self.run.id, stage, attempt)
                        .with_content(&manifest_hash);
                    if let Some(deployment) =
                        self.call(adapters.deployer.find_started(&forward)).await?
                    {
                        self.call(adapters.deployer.remove(&deployment, key)).await?;
                        actions.push(format!("removed deployment {}", deployment.id));
                    }
                }
                if actions.is_empty() {
                    actions.push("no deployment was applied".to_string());
                }
                Ok(actions.join(", "))
            }
            _ => Err(StageError::validation(format!(
                "{} does not change the target",
                stage
            ))),
        }
    }

    async fn restore_snapshot(
        &self,
        previous: &InfrastructureSnapshot,
        key: &IdempotencyKey,
    ) -> std::result::Result<String, StageError> {
        let provisioner = &self.engine.inner.adapters.provisioner;
        let key = key.clone().with_content(&previous.desired_state.content_hash);
        if let Some(restored) = self.call(provisioner.find_snapshot(&key)).await? {
            return Ok(format!(
                "restored snapshot {} as {}",
                previous.id, restored.id
            ));
        }
        let plan = self
            .call(provisioner.plan(&self.run.environment, &previous.desired_state))
            .await?;
        let restored = self.call(provisioner.apply(&plan, &key)).await?;
        Ok(format!(
            "restored snapshot {} as {}",
            previous.id, restored.id
        ))
    }
}
