use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub mod adapters;
pub mod api;
pub mod config;
pub mod db;
pub mod repository;
pub mod service;
pub mod workspace;

use adapters::{KubectlDeployer, KubesealSealer, TerraformProvisioner};
use config::{Config, StoreKind, TargetCatalog};
use repository::{MemoryStateStore, PgStateStore, StateStore};
use service::{Adapters, Engine};
use workspace::{SecretResolver, Workspace};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "keel_orchestrator=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Keel Orchestrator...");

    let config = Config::from_env().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    let catalog = TargetCatalog::load(&config.targets_path)?;
    tracing::info!(
        "Loaded {} environments from {}",
        catalog.targets.len(),
        config.targets_path.display()
    );

    let store: Arc<dyn StateStore> = match config.store {
        StoreKind::Postgres => {
            tracing::info!("Connecting to database...");
            let pool = db::create_pool(&config.database_url)
                .await
                .context("Failed to create database pool")?;
            db::run_migrations(&pool)
                .await
                .context("Failed to run database migrations")?;
            tracing::info!("Database ready");
            Arc::new(PgStateStore::new(pool))
        }
        StoreKind::Memory => {
            tracing::warn!("Using the in-memory state store; runs will not survive a restart");
            Arc::new(MemoryStateStore::new())
        }
    };

    std::fs::create_dir_all(&config.state_dir).with_context(|| {
        format!(
            "Failed to create state directory {}",
            config.state_dir.display()
        )
    })?;

    let adapters = Adapters {
        sealer: Arc::new(KubesealSealer::default()),
        provisioner: Arc::new(TerraformProvisioner::new("terraform", &config.state_dir)),
        deployer: Arc::new(KubectlDeployer::new("kubectl", &config.state_dir)),
    };

    let engine = Engine::new(
        store,
        adapters,
        catalog,
        Workspace::new(&config.workspace),
        SecretResolver::from_env(),
        config.engine.clone(),
    );

    let resumed = engine
        .recover()
        .await
        .context("Failed to resume unfinished runs")?;
    if resumed > 0 {
        tracing::info!("Resuming {} unfinished runs", resumed);
    }

    // Build router with all API endpoints
    let app = api::create_router(api::AppState {
        engine,
        webhook_token: config.webhook_token.clone(),
    });

    tracing::info!("Listening on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind_addr))?;

    axum::serve(listener, app)
        .await
        .context("Failed to start server")?;

    Ok(())
}
