//! End-to-end engine scenarios against in-memory adapters and store

use std::time::Duration;

use chrono::Utc;
use keel_core::domain::deployment::HealthStatus;
use keel_core::domain::run::{Phase, Run, RunHeader, RunStatus};
use keel_core::domain::stage::{IdempotencyKey, Stage, StageOutcome, StageOutput, StageRecord};
use keel_core::domain::trigger::EventType;
use keel_core::dto::run::CancelOutcome;
use uuid::Uuid;

use super::engine::EngineError;
use super::testing::{CATALOG, Harness, ms, settings, trigger};
use crate::adapters::Provisioner;
use crate::config::TargetCatalog;
use crate::repository::StateStore;
use crate::workspace::Workspace;

fn attempts(run: &Run, stage: Stage) -> usize {
    run.records
        .iter()
        .filter(|r| r.stage == stage && r.inverse_of.is_none() && r.outcome == StageOutcome::Started)
        .count()
}

#[tokio::test]
async fn test_run_walks_every_stage_in_order() {
    let h = Harness::new();
    let run = h.finished(h.submit("abc1234").await).await;

    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(run.phase, Phase::Succeeded);
    assert!(run.error.is_none());
    for stage in Stage::FORWARD {
        assert!(run.forward_succeeded(stage), "{} did not succeed", stage);
        assert_eq!(attempts(&run, stage), 1);
    }

    assert!(h.before("provisioner.apply", "sealer.publish"));
    assert!(h.before("sealer.publish", "deployer.apply"));
    assert!(h.before("deployer.apply", "deployer.health"));
    assert_eq!(h.sealer.current("shop", "db").unwrap().version, 1);
    assert_eq!(h.sealer.current("shop", "api").unwrap().version, 1);
}

#[tokio::test]
async fn test_duplicate_trigger_maps_to_one_run() {
    let h = Harness::new();
    let first = h.engine.submit(trigger("abc1234"), None).await.unwrap();
    let second = h.engine.submit(trigger("abc1234"), None).await.unwrap();

    assert!(first.created);
    assert!(!second.created);
    assert_eq!(first.run_id, second.run_id);

    h.finished(first.run_id).await;
    assert_eq!(h.provisioner.mutations(), 1);
    assert_eq!(h.deployer.applies(), 1);
    assert_eq!(h.engine.list(Some("production"), 10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_triggers_that_create_no_run_are_rejected() {
    let h = Harness::new();

    let mut tag = trigger("abc1234");
    tag.event_type = EventType::Other;
    assert!(matches!(
        h.engine.submit(tag, None).await,
        Err(EngineError::Rejected(_))
    ));

    let mut feature = trigger("abc1234");
    feature.branch = "feature/x".to_string();
    assert!(matches!(
        h.engine.submit(feature, None).await,
        Err(EngineError::Rejected(_))
    ));

    assert!(matches!(
        h.engine.submit(trigger("nothex"), None).await,
        Err(EngineError::Rejected(_))
    ));
    assert!(matches!(
        h.engine.submit(trigger("abc1234"), Some("staging")).await,
        Err(EngineError::Rejected(_))
    ));
    assert!(h.engine.list(None, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_recovered_run_resumes_without_repeating_work() {
    let h = Harness::new();
    let catalog = TargetCatalog::parse(CATALOG).unwrap();
    let target = catalog.get("production").unwrap();
    let workspace = Workspace::new(h.workspace.path());
    let desired = workspace.desired_state(target).await.unwrap();
    let manifests = workspace.manifests(target).await.unwrap();

    let trigger = trigger("abc1234");
    let header = RunHeader {
        id: Uuid::new_v4(),
        trigger_key: trigger.dedup_key("production"),
        trigger,
        environment: "production".to_string(),
        created_at: Utc::now(),
    };
    let run_id = header.id;
    h.store.create_run(header).await.unwrap();

    let validating = StageRecord::started(run_id, Stage::Validating, 1);
    h.store.append(validating.clone()).await.unwrap();
    h.store
        .append(validating.succeeded(Some(StageOutput::Validated {
            desired_state_hash: desired.content_hash.clone(),
            manifest_hash: manifests.content_hash.clone(),
            secrets: vec!["shop/db".to_string(), "shop/api".to_string()],
        })))
        .await
        .unwrap();
    h.store
        .append(StageRecord::started(run_id, Stage::Provisioning, 1))
        .await
        .unwrap();

    // the apply went through before the crash; its outcome was never recorded
    let key = IdempotencyKey::new(run_id, Stage::Provisioning, 1).with_content(&desired.content_hash);
    let plan = h.provisioner.plan("production", &desired).await.unwrap();
    h.provisioner.apply(&plan, &key).await.unwrap();

    assert_eq!(h.engine.recover().await.unwrap(), 1);
    let run = h.finished(run_id).await;

    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(attempts(&run, Stage::Validating), 1);
    assert_eq!(attempts(&run, Stage::Provisioning), 1);
    assert_eq!(h.provisioner.mutations(), 1);
    assert_eq!(h.log.count("provisioner.plan"), 1);
}

#[tokio::test]
async fn test_runs_on_one_environment_never_overlap() {
    let h = Harness::new();
    h.provisioner.set_apply_delay(ms(50));

    let first = h.submit("abc1234").await;
    let second = h.submit("def5678").await;
    let first = h.finished(first).await;
    let second = h.finished(second).await;

    assert_eq!(first.status, RunStatus::Succeeded);
    assert_eq!(second.status, RunStatus::Succeeded);
    assert_eq!(h.provisioner.max_in_flight(), 1);

    // whichever ran second saw the other as its baseline
    let baselines = [&first, &second]
        .iter()
        .filter(|run| {
            matches!(
                run.stage_output(Stage::Provisioning),
                Some(StageOutput::Provisioned { previous: Some(_), .. })
            )
        })
        .count();
    assert_eq!(baselines, 1);
}

#[tokio::test]
async fn test_unhealthy_deployment_rolls_back_in_reverse_order() {
    let h = Harness::new();
    h.deployer.set_default_health(HealthStatus::Failed);

    let run = h.finished(h.submit("abc1234").await).await;

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.phase, Phase::Failed);
    assert!(!run.manual_intervention_required);
    assert!(run.error.as_deref().unwrap().contains("Unhealthy"));
    for stage in [Stage::Provisioning, Stage::SealingSecrets, Stage::Deploying] {
        assert!(run.inverse_done(stage), "{} was not reverted", stage);
    }

    assert!(h.before("deployer.remove", "sealer.withdraw"));
    assert!(h.before("sealer.withdraw", "provisioner.destroy"));
    assert!(h.deployer.current().is_none());
    assert!(h.sealer.current("shop", "db").is_none());
}

#[tokio::test]
async fn test_rollback_restores_previous_release() {
    let h = Harness::new();
    let good = h.finished(h.submit("abc1234").await).await;
    assert_eq!(good.status, RunStatus::Succeeded);
    let good_deployment = h.deployer.current().unwrap();

    h.deployer.set_default_health(HealthStatus::Failed);
    let bad = h.finished(h.submit("def5678").await).await;

    assert_eq!(bad.status, RunStatus::Failed);
    assert_eq!(h.log.count("deployer.rollback"), 1);
    assert_eq!(h.deployer.current().unwrap(), good_deployment);

    let restored = h.sealer.current("shop", "db").unwrap();
    assert_eq!(restored.version, 1);
    match bad.stage_output(Stage::SealingSecrets) {
        Some(StageOutput::Sealed { bundles, .. }) => assert_eq!(bundles[0].version, 2),
        other => panic!("unexpected output {:?}", other),
    }
    assert_eq!(h.log.count("provisioner.destroy"), 0);
}

#[tokio::test]
async fn test_drift_replans_before_retrying() {
    let h = Harness::new();
    h.provisioner.drift_next(1);

    let run = h.finished(h.submit("abc1234").await).await;

    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(attempts(&run, Stage::Provisioning), 2);
    assert_eq!(h.log.count("provisioner.plan"), 2);
    assert_eq!(h.provisioner.mutations(), 1);
}

#[tokio::test]
async fn test_transient_failure_is_retried() {
    let h = Harness::new();
    h.provisioner.transient_next(2);

    let run = h.finished(h.submit("abc1234").await).await;

    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(run.failed_attempts(Stage::Provisioning, None), 2);
}

#[tokio::test]
async fn test_exhausted_retries_fail_the_run() {
    let h = Harness::new();
    h.provisioner.transient_next(10);

    let run = h.finished(h.submit("abc1234").await).await;

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.failed_attempts(Stage::Provisioning, None), 3);
    assert!(run.error.as_deref().unwrap().contains("after 3 attempts"));
    // no attempt got as far as applying, so there is nothing to destroy
    assert!(run.inverse_done(Stage::Provisioning));
    assert_eq!(h.log.count("provisioner.destroy"), 0);
}

#[tokio::test]
async fn test_stale_key_fails_without_retry() {
    let h = Harness::new();
    h.sealer.serve_stale_keys();

    let run = h.finished(h.submit("abc1234").await).await;

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(h.log.count("sealer.fetch_key"), 1);
    assert_eq!(h.sealer.publishes(), 0);
    assert!(run.inverse_done(Stage::Provisioning));
    assert_eq!(h.log.count("provisioner.destroy"), 1);
}

#[tokio::test]
async fn test_key_fetch_failure_is_retried() {
    let h = Harness::new();
    h.sealer.fail_key_fetch(1);

    let run = h.finished(h.submit("abc1234").await).await;

    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(h.log.count("sealer.fetch_key"), 2);
}

#[tokio::test]
async fn test_cancel_rolls_back_and_is_idempotent() {
    let h = Harness::new();
    h.deployer.set_default_health(HealthStatus::Degraded);

    let run_id = h.submit("abc1234").await;
    h.wait_for(run_id, |run| run.phase == Phase::VerifyingHealth)
        .await;

    let response = h.engine.cancel(run_id).await.unwrap();
    assert_eq!(response.outcome, CancelOutcome::Accepted);

    let run = h.finished(run_id).await;
    assert_eq!(run.status, RunStatus::RolledBack);
    assert!(run.cancel_requested);
    assert!(!run.manual_intervention_required);
    assert!(run.inverse_done(Stage::Deploying));

    let again = h.engine.cancel(run_id).await.unwrap();
    assert_eq!(again.outcome, CancelOutcome::AlreadyTerminal);
    assert_eq!(again.status, RunStatus::RolledBack);
}

#[tokio::test]
async fn test_health_deadline_fails_the_run() {
    let mut settings = settings();
    settings.health.deadline = ms(50);
    let h = Harness::with_settings(settings);
    h.deployer.set_default_health(HealthStatus::Degraded);

    let run = h.finished(h.submit("abc1234").await).await;

    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.error.as_deref().unwrap().contains("Timeout"));
    assert!(h.log.count("deployer.health") > 1);
    assert!(run.inverse_done(Stage::Deploying));
}

#[tokio::test]
async fn test_run_deadline_stops_before_any_mutation() {
    let mut settings = settings();
    settings.run_timeout = Duration::ZERO;
    let h = Harness::with_settings(settings);

    let run = h.finished(h.submit("abc1234").await).await;

    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.error.as_deref().unwrap().contains("deadline"));
    assert!(h.log.entries().is_empty());
}

#[tokio::test]
async fn test_failed_inverse_requires_manual_intervention() {
    let h = Harness::new();
    h.deployer.set_default_health(HealthStatus::Failed);
    h.deployer.fail_inverse();

    let run = h.finished(h.submit("abc1234").await).await;

    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.manual_intervention_required);
    assert!(run.error.as_deref().unwrap().contains("RollbackFailure"));
    // rollback stops at the first inverse that cannot complete
    assert_eq!(h.log.count("sealer.withdraw"), 0);
    assert_eq!(h.log.count("provisioner.destroy"), 0);
}

#[tokio::test]
async fn test_records_are_broadcast_as_they_land() {
    let h = Harness::new();
    let mut events = h.engine.subscribe();
    let run_id = h.submit("abc1234").await;

    let first = events.recv().await.unwrap();
    assert_eq!(first.run_id, run_id);
    assert_eq!(first.record.stage, Stage::Validating);
    assert_eq!(first.record.outcome, StageOutcome::Started);

    let last = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let event = events.recv().await.unwrap();
            if event.status.is_terminal() {
                return event;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(last.status, RunStatus::Succeeded);
    assert_eq!(last.record.stage, Stage::VerifyingHealth);
}

#[tokio::test]
async fn test_environment_status() {
    let h = Harness::new();
    let run_id = h.submit("abc1234").await;
    h.finished(run_id).await;

    let status = h.engine.environment("production").await.unwrap();
    assert_eq!(status.environment, "production");
    assert!(status.in_flight.is_empty());

    assert!(matches!(
        h.engine.environment("staging").await,
        Err(EngineError::UnknownEnvironment(_))
    ));
}

#[tokio::test]
async fn test_partially_published_secrets_are_restored() {
    let h = Harness::new();
    let good = h.finished(h.submit("abc1234").await).await;
    assert_eq!(good.status, RunStatus::Succeeded);

    // db v2 goes out, then api v2 is refused
    h.sealer.refuse_publish("api");
    let bad = h.finished(h.submit("def5678").await).await;

    assert_eq!(bad.status, RunStatus::Failed);
    assert!(!bad.manual_intervention_required);
    assert!(!bad.forward_succeeded(Stage::SealingSecrets));
    assert!(bad.inverse_done(Stage::SealingSecrets));
    assert!(bad.inverse_done(Stage::Provisioning));
    assert!(bad.error.as_deref().unwrap().contains("admission webhook denied"));

    assert_eq!(h.sealer.current("shop", "db").unwrap().version, 1);
    assert_eq!(h.sealer.current("shop", "api").unwrap().version, 1);
    assert_eq!(h.deployer.applies(), 1);
}

#[tokio::test]
async fn test_partially_published_secrets_without_predecessor_are_withdrawn() {
    let h = Harness::new();
    h.sealer.refuse_publish("api");

    let run = h.finished(h.submit("abc1234").await).await;

    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.inverse_done(Stage::SealingSecrets));
    assert_eq!(h.sealer.publishes(), 1);
    assert!(h.sealer.current("shop", "db").is_none());
    assert!(h.sealer.current("shop", "api").is_none());
    assert!(h.before("sealer.withdraw", "provisioner.destroy"));
}

#[tokio::test]
async fn test_interrupted_rollout_restores_previous_release() {
    let h = Harness::new();
    h.finished(h.submit("abc1234").await).await;
    let good_deployment = h.deployer.current().unwrap();

    h.deployer.interrupt_next(10);
    let bad = h.finished(h.submit("def5678").await).await;

    assert_eq!(bad.status, RunStatus::Failed);
    assert_eq!(bad.failed_attempts(Stage::Deploying, None), 3);
    assert!(bad.inverse_done(Stage::Deploying));
    assert_eq!(h.log.count("deployer.rollback"), 1);
    assert_eq!(h.deployer.current().unwrap(), good_deployment);
}

#[tokio::test]
async fn test_interrupted_first_rollout_is_removed() {
    let h = Harness::new();
    h.deployer.interrupt_next(10);

    let run = h.finished(h.submit("abc1234").await).await;

    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.inverse_done(Stage::Deploying));
    // one half-applied deployment per attempt
    assert_eq!(h.log.count("deployer.remove"), 3);
    assert!(h.deployer.current().is_none());
    assert_eq!(h.deployer.applies(), 0);
}

#[tokio::test]
async fn test_overrunning_apply_settles_before_rollback() {
    let mut settings = settings();
    settings.adapter_timeout = ms(100);
    let h = Harness::with_settings(settings);
    h.provisioner.set_apply_delay(ms(150));

    let run = h.finished(h.submit("abc1234").await).await;

    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.error.as_deref().unwrap().contains("timed out"));
    assert_eq!(run.failed_attempts(Stage::Provisioning, None), 1);

    // the late apply landed and was found and destroyed by rollback
    assert_eq!(h.provisioner.mutations(), 1);
    assert!(h.before("provisioner.applied", "provisioner.destroy"));
    assert_eq!(h.log.count("provisioner.destroy"), 1);
    assert!(run.inverse_done(Stage::Provisioning));
    assert!(h.engine.lease("production").await.unwrap().is_none());
}

#[tokio::test]
async fn test_expired_lease_is_taken_over() {
    let h = Harness::new();
    let stale = h
        .store
        .acquire_lease("production", Uuid::new_v4(), ms(200))
        .await
        .unwrap()
        .unwrap();

    let run = h.finished(h.submit("abc1234").await).await;

    assert_eq!(run.status, RunStatus::Succeeded);
    let provisioning = run
        .records
        .iter()
        .find(|r| r.stage == Stage::Provisioning && r.outcome == StageOutcome::Started)
        .unwrap();
    assert!(provisioning.started_at >= stale.expires_at);
    assert!(h.engine.lease("production").await.unwrap().is_none());
}

#[tokio::test]
async fn test_degraded_deployment_is_polled_until_healthy() {
    let h = Harness::new();
    h.deployer
        .script_health([HealthStatus::Degraded, HealthStatus::Degraded]);

    let run = h.finished(h.submit("abc1234").await).await;

    assert_eq!(run.status, RunStatus::Succeeded);
    match run.stage_output(Stage::VerifyingHealth) {
        Some(StageOutput::Verified { health, polls }) => {
            assert_eq!(*health, HealthStatus::Healthy);
            assert_eq!(*polls, 3);
        }
        other => panic!("unexpected output {:?}", other),
    }
    assert_eq!(h.log.count("deployer.health"), 3);
}
