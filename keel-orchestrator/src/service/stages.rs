//! Forward stages
//!
//! One method per stage. Each returns the output recorded on success or a
//! classified [`StageError`]; recording and retrying is the worker's job.

use chrono::{TimeDelta, Utc};
use keel_core::domain::deployment::{DeploymentRef, HealthStatus};
use keel_core::domain::infra::InfrastructureSnapshot;
use keel_core::domain::run::Run;
use keel_core::domain::secret::{BundleRef, SecretBundle};
use keel_core::domain::stage::{ErrorKind, IdempotencyKey, Stage, StageError, StageOutput};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::worker::Worker;
use crate::config::Target;
use crate::repository::StoreError;

type StageResult = Result<StageOutput, StageError>;

pub(super) fn store_error(err: StoreError) -> StageError {
    StageError::new(ErrorKind::AdapterTransient, format!("state store: {}", err))
}

impl Worker {
    pub(super) async fn execute(&self, stage: Stage, attempt: u32, resuming: bool) -> StageResult {
        let target = self.target()?;

        match stage {
            Stage::Validating => self.validate(target).await,
            Stage::Provisioning => self.provision(target, attempt, resuming).await,
            Stage::SealingSecrets => self.seal_secrets(target, attempt).await,
            Stage::Deploying => self.deploy(target, attempt, resuming).await,
            Stage::VerifyingHealth => self.verify_health().await,
            Stage::RollingBack => Err(StageError::validation("rollback is not a forward stage")),
        }
    }

    async fn validate(&self, target: &Target) -> StageResult {
        let inner = &self.engine.inner;
        self.run.trigger.check().map_err(StageError::validation)?;

        let desired = inner
            .workspace
            .desired_state(target)
            .await
            .map_err(|e| StageError::validation(format!("infrastructure definition: {}", e)))?;
        let manifests = inner
            .workspace
            .manifests(target)
            .await
            .map_err(|e| StageError::validation(format!("manifests: {}", e)))?;
        let payloads = inner
            .secrets
            .resolve(target)
            .map_err(StageError::validation)?;

        Ok(StageOutput::Validated {
            desired_state_hash: desired.content_hash,
            manifest_hash: manifests.content_hash,
            secrets: payloads
                .iter()
                .map(|p| format!("{}/{}", p.namespace, p.name))
                .collect(),
        })
    }

    async fn provision(&self, target: &Target, attempt: u32, resuming: bool) -> StageResult {
        let inner = &self.engine.inner;
        let (validated_hash, _) = self.validated_hashes()?;

        let desired = inner
            .workspace
            .desired_state(target)
            .await
            .map_err(|e| StageError::validation(format!("infrastructure definition: {}", e)))?;
        if desired.content_hash != validated_hash {
            return Err(StageError::validation(
                "infrastructure definition changed since validation",
            ));
        }

        let key = IdempotencyKey::new(self.run.id, Stage::Provisioning, attempt)
            .with_content(&desired.content_hash);
        let previous = self
            .baseline()
            .await?
            .and_then(|run| previous_snapshot(&run));

        if resuming {
            if let Some(snapshot) = self.call(inner.adapters.provisioner.find_snapshot(&key)).await? {
                info!("Run {} found snapshot {} from {}", self.run.id, snapshot.id, key);
                return Ok(StageOutput::Provisioned {
                    plan_id: snapshot.plan_id.clone(),
                    snapshot,
                    previous,
                });
            }
        }

        // fresh plan per attempt; a drifted plan is never re-applied
        let plan_id = self
            .call(inner.adapters.provisioner.plan(&self.run.environment, &desired))
            .await?;
        debug!("Run {} planned {}", self.run.id, plan_id);
        let snapshot = self
            .call(inner.adapters.provisioner.apply(&plan_id, &key))
            .await?;

        Ok(StageOutput::Provisioned {
            plan_id,
            snapshot,
            previous,
        })
    }

    async fn seal_secrets(&self, target: &Target, attempt: u32) -> StageResult {
        let inner = &self.engine.inner;
        let payloads = inner
            .secrets
            .resolve(target)
            .map_err(StageError::validation)?;

        let target_key = self
            .call(inner.adapters.sealer.fetch_public_key(&target.cluster_key))
            .await?;
        let max_age = TimeDelta::from_std(inner.settings.max_key_age).unwrap_or(TimeDelta::MAX);
        if target_key.is_stale(Utc::now(), max_age) {
            return Err(StageError::validation(format!(
                "public key of {} fetched at {} is stale",
                target.cluster_key, target_key.fetched_at
            )));
        }

        let history = inner
            .store
            .stage_outputs(&self.run.environment, Stage::SealingSecrets)
            .await
            .map_err(store_error)?;
        let key = IdempotencyKey::new(self.run.id, Stage::SealingSecrets, attempt);

        let mut bundles = Vec::with_capacity(payloads.len());
        for payload in &payloads {
            let version = next_version(&history, &payload.namespace, &payload.name);
            let bundle = self
                .call(inner.adapters.sealer.seal(payload, version, &target_key))
                .await?;
            self.call(inner.adapters.sealer.publish(&bundle, &key)).await?;
            bundles.push(bundle);
        }

        let previous = match self.baseline().await? {
            Some(run) => match run.stage_output(Stage::SealingSecrets) {
                Some(StageOutput::Sealed { bundles: before, .. }) => before
                    .iter()
                    .filter(|b| {
                        bundles
                            .iter()
                            .any(|n| n.name == b.name && n.namespace == b.namespace)
                    })
                    .cloned()
                    .collect(),
                _ => Vec::new(),
            },
            None => Vec::new(),
        };

        Ok(StageOutput::Sealed { bundles, previous })
    }

    async fn deploy(&self, target: &Target, attempt: u32, resuming: bool) -> StageResult {
        let inner = &self.engine.inner;
        let (_, validated_hash) = self.validated_hashes()?;

        let manifests = inner
            .workspace
            .manifests(target)
            .await
            .map_err(|e| StageError::validation(format!("manifests: {}", e)))?;
        if manifests.content_hash != validated_hash {
            return Err(StageError::validation("manifests changed since validation"));
        }

        let bundles: Vec<BundleRef> = match self.run.stage_output(Stage::SealingSecrets) {
            Some(StageOutput::Sealed { bundles, .. }) => {
                bundles.iter().map(SecretBundle::reference).collect()
            }
            _ => return Err(StageError::validation("no sealed bundles recorded")),
        };

        let key = IdempotencyKey::new(self.run.id, Stage::Deploying, attempt)
            .with_content(&manifests.content_hash);
        let previous = self
            .baseline()
            .await?
            .and_then(|run| previous_deployment(&run));

        if resuming {
            if let Some(deployment) = self.call(inner.adapters.deployer.find_deployment(&key)).await? {
                info!("Run {} found deployment {}", self.run.id, deployment.id);
                return Ok(StageOutput::Deployed {
                    deployment,
                    previous,
                });
            }
        }

        let deployment = self
            .call(inner.adapters.deployer.apply(&manifests, &bundles, &key))
            .await?;

        Ok(StageOutput::Deployed {
            deployment,
            previous,
        })
    }

    async fn verify_health(&self) -> StageResult {
        let inner = &self.engine.inner;
        let deployment = match self.run.stage_output(Stage::Deploying) {
            Some(StageOutput::Deployed { deployment, .. }) => deployment.clone(),
            _ => return Err(StageError::validation("no deployment recorded")),
        };

        let policy = inner.settings.health;
        let deadline = Instant::now() + policy.deadline;
        let mut polls = 0;

        loop {
            polls += 1;
            match self.call(inner.adapters.deployer.health_check(&deployment)).await {
                Ok(HealthStatus::Healthy) => {
                    return Ok(StageOutput::Verified {
                        health: HealthStatus::Healthy,
                        polls,
                    });
                }
                Ok(HealthStatus::Failed) => {
                    return Err(StageError::new(
                        ErrorKind::Unhealthy,
                        format!("deployment {} reported Failed", deployment.id),
                    ));
                }
                Ok(HealthStatus::Degraded) => {
                    debug!("Deployment {} degraded after {} polls", deployment.id, polls)
                }
                Err(e) => warn!("Health check of {} failed: {}", deployment.id, e),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(StageError::new(
                    ErrorKind::Timeout,
                    format!(
                        "deployment {} not healthy within {:?} ({} polls)",
                        deployment.id, policy.deadline, polls
                    ),
                ));
            }

            let wait = policy.interval_for(polls).min(deadline - now);
            if !self.pause(wait).await {
                return Err(self.interruption().unwrap_or_else(|| {
                    StageError::new(ErrorKind::Cancelled, "health verification interrupted")
                }));
            }
        }
    }

    pub(super) fn target(&self) -> Result<&Target, StageError> {
        self.engine
            .inner
            .catalog
            .get(&self.run.environment)
            .ok_or_else(|| {
                StageError::validation(format!(
                    "environment '{}' is no longer configured",
                    self.run.environment
                ))
            })
    }

    /// Content hashes captured when the Run was validated
    pub(super) fn validated_hashes(&self) -> Result<(String, String), StageError> {
        match self.run.stage_output(Stage::Validating) {
            Some(StageOutput::Validated {
                desired_state_hash,
                manifest_hash,
                ..
            }) => Ok((desired_state_hash.clone(), manifest_hash.clone())),
            _ => Err(StageError::validation("run has no validation output")),
        }
    }

    /// Last Run that succeeded on the same environment
    pub(super) async fn baseline(&self) -> Result<Option<Run>, StageError> {
        self.engine
            .inner
            .store
            .last_succeeded(&self.run.environment, self.run.id)
            .await
            .map_err(store_error)
    }
}

pub(super) fn previous_snapshot(run: &Run) -> Option<InfrastructureSnapshot> {
    match run.stage_output(Stage::Provisioning) {
        Some(StageOutput::Provisioned { snapshot, .. }) => Some(snapshot.clone()),
        _ => None,
    }
}

pub(super) fn previous_deployment(run: &Run) -> Option<DeploymentRef> {
    match run.stage_output(Stage::Deploying) {
        Some(StageOutput::Deployed { deployment, .. }) => Some(deployment.clone()),
        _ => None,
    }
}

/// Version following every bundle ever sealed under `namespace/name`
pub(super) fn next_version(history: &[StageOutput], namespace: &str, name: &str) -> u32 {
    history
        .iter()
        .filter_map(|output| match output {
            StageOutput::Sealed { bundles, .. } => Some(bundles),
            _ => None,
        })
        .flatten()
        .filter(|b| b.name == name && b.namespace == namespace)
        .map(|b| b.version)
        .max()
        .unwrap_or(0)
        + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle(name: &str, version: u32) -> SecretBundle {
        SecretBundle {
            name: name.to_string(),
            namespace: "shop".to_string(),
            cluster: "prod".to_string(),
            version,
            ciphertext: "sealed".to_string(),
            key_fingerprint: "ff".to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_first_bundle_is_version_one() {
        assert_eq!(next_version(&[], "shop", "db"), 1);
    }

    #[test]
    fn test_version_follows_highest_sealed() {
        let history = vec![
            StageOutput::Sealed {
                bundles: vec![bundle("db", 3), bundle("api", 9)],
                previous: vec![],
            },
            StageOutput::Sealed {
                bundles: vec![bundle("db", 1)],
                previous: vec![],
            },
        ];
        assert_eq!(next_version(&history, "shop", "db"), 4);
        assert_eq!(next_version(&history, "shop", "cache"), 1);
        assert_eq!(next_version(&history, "billing", "db"), 1);
    }
}
