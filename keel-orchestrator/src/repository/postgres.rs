//! Postgres-backed state store

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use keel_core::domain::lease::Lease;
use keel_core::domain::run::{Run, RunHeader};
use keel_core::domain::stage::{Stage, StageOutput, StageRecord};
use sqlx::PgPool;
use uuid::Uuid;

use super::{Result, StateStore, StoreError};
use super::{lease as lease_repository, run as run_repository, stage as stage_repository};

/// State store persisting to Postgres
#[derive(Clone)]
pub struct PgStateStore {
    pool: PgPool,
}

impl PgStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StateStore for PgStateStore {
    async fn create_run(&self, header: RunHeader) -> Result<(RunHeader, bool)> {
        if run_repository::insert(&self.pool, &header).await? {
            return Ok((header, true));
        }

        let existing = run_repository::find_by_trigger_key(&self.pool, &header.trigger_key)
            .await?
            .ok_or_else(|| {
                StoreError::Corrupt(format!(
                    "trigger key {} conflicted but no run holds it",
                    header.trigger_key
                ))
            })?;

        Ok((existing, false))
    }

    async fn append(&self, record: StageRecord) -> Result<StageRecord> {
        stage_repository::append(&self.pool, &record).await
    }

    async fn load(&self, run_id: Uuid) -> Result<Option<Run>> {
        let Some(header) = run_repository::find_by_id(&self.pool, run_id).await? else {
            return Ok(None);
        };
        let records = stage_repository::list_for_run(&self.pool, run_id).await?;
        Ok(Some(Run::replay(header, records)))
    }

    async fn list_runs(&self, environment: Option<&str>, limit: usize) -> Result<Vec<Run>> {
        let headers = run_repository::list(&self.pool, environment, limit as i64).await?;
        let ids: Vec<Uuid> = headers.iter().map(|h| h.id).collect();

        let mut histories: HashMap<Uuid, Vec<StageRecord>> = HashMap::new();
        for record in stage_repository::list_for_runs(&self.pool, &ids).await? {
            histories.entry(record.run_id).or_default().push(record);
        }

        Ok(headers
            .into_iter()
            .map(|header| {
                let records = histories.remove(&header.id).unwrap_or_default();
                Run::replay(header, records)
            })
            .collect())
    }

    async fn list_in_flight(&self, environment: &str) -> Result<Vec<Uuid>> {
        Ok(run_repository::list_unfinished(&self.pool, Some(environment)).await?)
    }

    async fn list_unfinished(&self) -> Result<Vec<Uuid>> {
        Ok(run_repository::list_unfinished(&self.pool, None).await?)
    }

    async fn last_succeeded(&self, environment: &str, excluding: Uuid) -> Result<Option<Run>> {
        match run_repository::last_succeeded_id(&self.pool, environment, excluding).await? {
            Some(id) => self.load(id).await,
            None => Ok(None),
        }
    }

    async fn stage_outputs(&self, environment: &str, stage: Stage) -> Result<Vec<StageOutput>> {
        stage_repository::succeeded_outputs(&self.pool, environment, stage).await
    }

    async fn acquire_lease(
        &self,
        environment: &str,
        holder: Uuid,
        ttl: Duration,
    ) -> Result<Option<Lease>> {
        Ok(lease_repository::acquire(&self.pool, environment, holder, ttl).await?)
    }

    async fn renew_lease(&self, environment: &str, holder: Uuid, ttl: Duration) -> Result<bool> {
        Ok(lease_repository::renew(&self.pool, environment, holder, ttl).await?)
    }

    async fn release_lease(&self, environment: &str, holder: Uuid) -> Result<()> {
        Ok(lease_repository::release(&self.pool, environment, holder).await?)
    }

    async fn lease(&self, environment: &str) -> Result<Option<Lease>> {
        Ok(lease_repository::find(&self.pool, environment).await?)
    }
}
