//! In-memory adapters for engine tests
//!
//! Each fake records its calls in a shared [`CallLog`] and honours
//! idempotency keys the way a real adapter must.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use keel_core::domain::deployment::{DeploymentRef, HealthStatus, ManifestSet};
use keel_core::domain::infra::{DesiredState, InfrastructureSnapshot, PlanId};
use keel_core::domain::secret::{BundleRef, SecretBundle, SecretPayload, TargetKey};
use keel_core::domain::stage::IdempotencyKey;

use super::{AdapterError, AdapterResult, Deployer, Provisioner, SecretSealer};

/// Ordered names of adapter calls across all fakes
#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn push(&self, entry: &str) {
        self.0.lock().unwrap().push(entry.to_string());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.0.lock().unwrap().iter().filter(|e| *e == entry).count()
    }

    /// Index of the first occurrence of `entry`
    pub fn position(&self, entry: &str) -> Option<usize> {
        self.0.lock().unwrap().iter().position(|e| e == entry)
    }
}

/// Consume one unit of a failure budget
fn take(budget: &AtomicU32) -> bool {
    budget
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[derive(Default)]
pub struct FakeProvisioner {
    log: CallLog,
    plans: Mutex<HashMap<String, DesiredState>>,
    snapshots: Mutex<HashMap<String, InfrastructureSnapshot>>,
    mutations: AtomicU32,
    drift: AtomicU32,
    transient: AtomicU32,
    fail_inverse: AtomicBool,
    apply_delay: Mutex<Duration>,
    in_flight: AtomicU32,
    max_in_flight: AtomicU32,
}

impl FakeProvisioner {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            ..Default::default()
        }
    }

    /// The next `n` applies report drift
    pub fn drift_next(&self, n: u32) {
        self.drift.store(n, Ordering::SeqCst);
    }

    /// The next `n` applies fail transiently
    pub fn transient_next(&self, n: u32) {
        self.transient.store(n, Ordering::SeqCst);
    }

    pub fn fail_inverse(&self) {
        self.fail_inverse.store(true, Ordering::SeqCst);
    }

    pub fn set_apply_delay(&self, delay: Duration) {
        *self.apply_delay.lock().unwrap() = delay;
    }

    /// Applies that actually changed infrastructure
    pub fn mutations(&self) -> u32 {
        self.mutations.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> u32 {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provisioner for FakeProvisioner {
    async fn plan(&self, _environment: &str, desired: &DesiredState) -> AdapterResult<PlanId> {
        self.log.push("provisioner.plan");
        let mut plans = self.plans.lock().unwrap();
        let id = format!("plan-{}", plans.len() + 1);
        plans.insert(id.clone(), desired.clone());
        Ok(PlanId(id))
    }

    async fn apply(
        &self,
        plan: &PlanId,
        key: &IdempotencyKey,
    ) -> AdapterResult<InfrastructureSnapshot> {
        self.log.push("provisioner.apply");
        if let Some(existing) = self.snapshots.lock().unwrap().get(&key.to_string()) {
            return Ok(existing.clone());
        }
        if key.inverse && self.fail_inverse.load(Ordering::SeqCst) {
            return Err(AdapterError::Rejected("restore refused".to_string()));
        }

        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);
        let delay = *self.apply_delay.lock().unwrap();
        tokio::time::sleep(delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if take(&self.drift) {
            return Err(AdapterError::Drift("saved plan is stale".to_string()));
        }
        if take(&self.transient) {
            return Err(AdapterError::Transient("provider returned 503".to_string()));
        }

        let desired = self
            .plans
            .lock()
            .unwrap()
            .get(&plan.0)
            .cloned()
            .ok_or_else(|| AdapterError::Drift(format!("unknown plan {}", plan)))?;

        let n = self.mutations.fetch_add(1, Ordering::SeqCst) + 1;
        let snapshot = InfrastructureSnapshot {
            id: format!("snap-{}", n),
            environment: desired.environment.clone(),
            plan_id: plan.clone(),
            desired_state: desired,
            applied_at: Utc::now(),
        };
        self.snapshots
            .lock()
            .unwrap()
            .insert(key.to_string(), snapshot.clone());
        self.log.push("provisioner.applied");
        Ok(snapshot)
    }

    async fn destroy(
        &self,
        _snapshot: &InfrastructureSnapshot,
        _key: &IdempotencyKey,
    ) -> AdapterResult<()> {
        self.log.push("provisioner.destroy");
        if self.fail_inverse.load(Ordering::SeqCst) {
            return Err(AdapterError::Rejected("destroy refused".to_string()));
        }
        Ok(())
    }

    async fn find_snapshot(
        &self,
        key: &IdempotencyKey,
    ) -> AdapterResult<Option<InfrastructureSnapshot>> {
        Ok(self.snapshots.lock().unwrap().get(&key.to_string()).cloned())
    }
}

#[derive(Default)]
pub struct FakeSealer {
    log: CallLog,
    key_failures: AtomicU32,
    stale: AtomicBool,
    fail_inverse: AtomicBool,
    /// Currently published bundle per `namespace/name`
    published: Mutex<HashMap<String, SecretBundle>>,
    fences: Mutex<HashSet<String>>,
    publishes: AtomicU32,
    /// Bundle names whose forward publish is refused
    refused: Mutex<HashSet<String>>,
}

impl FakeSealer {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            ..Default::default()
        }
    }

    pub fn fail_key_fetch(&self, n: u32) {
        self.key_failures.store(n, Ordering::SeqCst);
    }

    /// Hand out keys that were fetched an hour ago
    pub fn serve_stale_keys(&self) {
        self.stale.store(true, Ordering::SeqCst);
    }

    pub fn fail_inverse(&self) {
        self.fail_inverse.store(true, Ordering::SeqCst);
    }

    /// Refuse every forward publish of bundles called `name`
    pub fn refuse_publish(&self, name: &str) {
        self.refused.lock().unwrap().insert(name.to_string());
    }

    pub fn current(&self, namespace: &str, name: &str) -> Option<SecretBundle> {
        self.published
            .lock()
            .unwrap()
            .get(&format!("{}/{}", namespace, name))
            .cloned()
    }

    /// Publishes that actually changed the cluster
    pub fn publishes(&self) -> u32 {
        self.publishes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SecretSealer for FakeSealer {
    async fn fetch_public_key(&self, cluster: &str) -> AdapterResult<TargetKey> {
        self.log.push("sealer.fetch_key");
        if take(&self.key_failures) {
            return Err(AdapterError::KeyFetch(format!("{} unreachable", cluster)));
        }
        let fetched_at = if self.stale.load(Ordering::SeqCst) {
            Utc::now() - TimeDelta::hours(1)
        } else {
            Utc::now()
        };
        Ok(TargetKey {
            key_id: cluster.to_string(),
            fingerprint: format!("fp-{}", cluster),
            certificate: "-----BEGIN CERTIFICATE-----".to_string(),
            fetched_at,
            expires_at: None,
        })
    }

    async fn seal(
        &self,
        payload: &SecretPayload,
        version: u32,
        key: &TargetKey,
    ) -> AdapterResult<SecretBundle> {
        self.log.push("sealer.seal");
        Ok(SecretBundle {
            name: payload.name.clone(),
            namespace: payload.namespace.clone(),
            cluster: key.key_id.clone(),
            version,
            ciphertext: format!("sealed:{}:{}", payload.name, version),
            key_fingerprint: key.fingerprint.clone(),
            created_at: Utc::now(),
        })
    }

    async fn publish(&self, bundle: &SecretBundle, key: &IdempotencyKey) -> AdapterResult<()> {
        self.log.push("sealer.publish");
        if key.inverse && self.fail_inverse.load(Ordering::SeqCst) {
            return Err(AdapterError::Rejected("publish refused".to_string()));
        }
        if !key.inverse && self.refused.lock().unwrap().contains(&bundle.name) {
            return Err(AdapterError::Rejected(format!(
                "admission webhook denied {}",
                bundle.reference()
            )));
        }
        let slot = format!("{}/{}", bundle.namespace, bundle.name);
        if !self
            .fences
            .lock()
            .unwrap()
            .insert(format!("{}:{}", key, slot))
        {
            return Ok(());
        }
        self.published.lock().unwrap().insert(slot, bundle.clone());
        self.publishes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn withdraw(
        &self,
        _cluster: &str,
        bundle: &BundleRef,
        _key: &IdempotencyKey,
    ) -> AdapterResult<()> {
        self.log.push("sealer.withdraw");
        if self.fail_inverse.load(Ordering::SeqCst) {
            return Err(AdapterError::Rejected("withdraw refused".to_string()));
        }
        self.published
            .lock()
            .unwrap()
            .remove(&format!("{}/{}", bundle.namespace, bundle.name));
        Ok(())
    }
}

pub struct FakeDeployer {
    log: CallLog,
    /// Scripted health results, consumed before `default_health`
    health: Mutex<VecDeque<HealthStatus>>,
    default_health: Mutex<HealthStatus>,
    deployments: Mutex<HashMap<String, DeploymentRef>>,
    /// Applies that changed the cluster but never finished
    interrupted: Mutex<HashMap<String, DeploymentRef>>,
    interruptions: AtomicU32,
    current: Mutex<Option<DeploymentRef>>,
    applies: AtomicU32,
    fail_inverse: AtomicBool,
}

impl FakeDeployer {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            health: Mutex::new(VecDeque::new()),
            default_health: Mutex::new(HealthStatus::Healthy),
            deployments: Mutex::new(HashMap::new()),
            interrupted: Mutex::new(HashMap::new()),
            interruptions: AtomicU32::new(0),
            current: Mutex::new(None),
            applies: AtomicU32::new(0),
            fail_inverse: AtomicBool::new(false),
        }
    }

    pub fn script_health(&self, statuses: impl IntoIterator<Item = HealthStatus>) {
        self.health.lock().unwrap().extend(statuses);
    }

    pub fn set_default_health(&self, status: HealthStatus) {
        *self.default_health.lock().unwrap() = status;
    }

    pub fn fail_inverse(&self) {
        self.fail_inverse.store(true, Ordering::SeqCst);
    }

    /// The next `n` applies roll half the workload out, then fail transiently
    pub fn interrupt_next(&self, n: u32) {
        self.interruptions.store(n, Ordering::SeqCst);
    }

    /// Deployment currently running on the cluster
    pub fn current(&self) -> Option<DeploymentRef> {
        self.current.lock().unwrap().clone()
    }

    pub fn applies(&self) -> u32 {
        self.applies.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Deployer for FakeDeployer {
    async fn apply(
        &self,
        manifests: &ManifestSet,
        bundles: &[BundleRef],
        key: &IdempotencyKey,
    ) -> AdapterResult<DeploymentRef> {
        self.log.push("deployer.apply");
        if let Some(existing) = self.deployments.lock().unwrap().get(&key.to_string()) {
            return Ok(existing.clone());
        }
        let deployment = DeploymentRef {
            id: key.to_string(),
            environment: manifests.environment.clone(),
            cluster: manifests.cluster.clone(),
            namespace: manifests.namespace.clone(),
            manifest_hash: manifests.content_hash.clone(),
            bundles: bundles.to_vec(),
        };
        if take(&self.interruptions) {
            self.interrupted
                .lock()
                .unwrap()
                .insert(key.to_string(), deployment.clone());
            *self.current.lock().unwrap() = Some(deployment);
            return Err(AdapterError::Transient("rollout interrupted".to_string()));
        }
        self.applies.fetch_add(1, Ordering::SeqCst);
        self.deployments
            .lock()
            .unwrap()
            .insert(key.to_string(), deployment.clone());
        *self.current.lock().unwrap() = Some(deployment.clone());
        Ok(deployment)
    }

    async fn health_check(&self, _deployment: &DeploymentRef) -> AdapterResult<HealthStatus> {
        self.log.push("deployer.health");
        let scripted = self.health.lock().unwrap().pop_front();
        Ok(scripted.unwrap_or(*self.default_health.lock().unwrap()))
    }

    async fn rollback(&self, previous: &DeploymentRef, _key: &IdempotencyKey) -> AdapterResult<()> {
        self.log.push("deployer.rollback");
        if self.fail_inverse.load(Ordering::SeqCst) {
            return Err(AdapterError::Rejected("rollback refused".to_string()));
        }
        *self.current.lock().unwrap() = Some(previous.clone());
        Ok(())
    }

    async fn remove(&self, _deployment: &DeploymentRef, _key: &IdempotencyKey) -> AdapterResult<()> {
        self.log.push("deployer.remove");
        if self.fail_inverse.load(Ordering::SeqCst) {
            return Err(AdapterError::Rejected("remove refused".to_string()));
        }
        *self.current.lock().unwrap() = None;
        Ok(())
    }

    async fn find_deployment(&self, key: &IdempotencyKey) -> AdapterResult<Option<DeploymentRef>> {
        Ok(self.deployments.lock().unwrap().get(&key.to_string()).cloned())
    }

    async fn find_started(&self, key: &IdempotencyKey) -> AdapterResult<Option<DeploymentRef>> {
        if let Some(found) = self.find_deployment(key).await? {
            return Ok(Some(found));
        }
        Ok(self.interrupted.lock().unwrap().get(&key.to_string()).cloned())
    }
}
