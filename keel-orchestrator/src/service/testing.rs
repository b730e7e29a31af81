//! Engine fixture over in-memory adapters and store

use std::sync::Arc;
use std::time::Duration;

use keel_core::domain::run::Run;
use keel_core::domain::trigger::{EventType, TriggerEvent};
use uuid::Uuid;

use super::backoff::{HealthPolicy, RetryPolicy};
use super::engine::{Adapters, Engine};
use crate::adapters::fake::{CallLog, FakeDeployer, FakeProvisioner, FakeSealer};
use crate::config::{EngineSettings, TargetCatalog};
use crate::repository::{MemoryStateStore, StateStore};
use crate::workspace::{SecretResolver, Workspace};

pub const CATALOG: &str = r#"
[[target]]
name = "production"
branches = ["main"]
cluster_key = "prod"
namespace = "shop"
infrastructure = "infra"
manifests = "deploy"

[[target.secrets]]
name = "db"
keys = { PASSWORD = "DB_PASSWORD" }

[[target.secrets]]
name = "api"
keys = { TOKEN = "API_TOKEN" }
"#;

pub fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

pub fn settings() -> EngineSettings {
    EngineSettings {
        max_parallel_runs: 4,
        run_timeout: Duration::from_secs(30),
        adapter_timeout: Duration::from_secs(5),
        retry: RetryPolicy {
            max_attempts: 3,
            initial_delay: ms(5),
            max_delay: ms(20),
        },
        health: HealthPolicy {
            deadline: Duration::from_secs(3),
            initial_interval: ms(5),
            max_interval: ms(20),
        },
        lease_ttl: Duration::from_secs(5),
        lease_poll: ms(10),
        max_key_age: Duration::from_secs(300),
    }
}

pub struct Harness {
    pub engine: Engine,
    pub store: Arc<MemoryStateStore>,
    pub log: CallLog,
    pub provisioner: Arc<FakeProvisioner>,
    pub sealer: Arc<FakeSealer>,
    pub deployer: Arc<FakeDeployer>,
    pub workspace: tempfile::TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(settings())
    }

    pub fn with_settings(settings: EngineSettings) -> Self {
        let workspace = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(workspace.path().join("infra")).unwrap();
        std::fs::write(
            workspace.path().join("infra/main.tf"),
            "resource \"null_resource\" \"app\" {}\n",
        )
        .unwrap();
        std::fs::create_dir_all(workspace.path().join("deploy")).unwrap();
        std::fs::write(
            workspace.path().join("deploy/app.yaml"),
            "kind: Deployment\nmetadata:\n  name: web\n",
        )
        .unwrap();

        let log = CallLog::default();
        let store = Arc::new(MemoryStateStore::new());
        let provisioner = Arc::new(FakeProvisioner::new(log.clone()));
        let sealer = Arc::new(FakeSealer::new(log.clone()));
        let deployer = Arc::new(FakeDeployer::new(log.clone()));

        let secrets = SecretResolver::new(Arc::new(|name: &str| match name {
            "DB_PASSWORD" => Some("hunter2".to_string()),
            "API_TOKEN" => Some("t0ken".to_string()),
            _ => None,
        }));
        let state: Arc<dyn StateStore> = store.clone();

        let engine = Engine::new(
            state,
            Adapters {
                sealer: sealer.clone(),
                provisioner: provisioner.clone(),
                deployer: deployer.clone(),
            },
            TargetCatalog::parse(CATALOG).unwrap(),
            Workspace::new(workspace.path()),
            secrets,
            settings,
        );

        Self {
            engine,
            store,
            log,
            provisioner,
            sealer,
            deployer,
            workspace,
        }
    }

    pub async fn submit(&self, sha: &str) -> Uuid {
        self.engine.submit(trigger(sha), None).await.unwrap().run_id
    }

    pub async fn wait_for(&self, run_id: Uuid, done: impl Fn(&Run) -> bool) -> Run {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let run = self.engine.status(run_id).await.unwrap();
                if done(&run) {
                    return run;
                }
                tokio::time::sleep(ms(5)).await;
            }
        })
        .await
        .expect("run did not reach the expected state")
    }

    pub async fn finished(&self, run_id: Uuid) -> Run {
        self.wait_for(run_id, |run| run.is_terminal()).await
    }

    /// Whether `first` was called before `second`
    pub fn before(&self, first: &str, second: &str) -> bool {
        match (self.log.position(first), self.log.position(second)) {
            (Some(a), Some(b)) => a < b,
            _ => false,
        }
    }
}

pub fn trigger(sha: &str) -> TriggerEvent {
    TriggerEvent {
        repository: "acme/shop".to_string(),
        commit_sha: sha.to_string(),
        branch: "main".to_string(),
        actor: "dev".to_string(),
        event_type: EventType::Push,
        delivery_id: None,
    }
}
