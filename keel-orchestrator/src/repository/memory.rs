//! In-memory state store
//!
//! Same semantics as the Postgres store, without durability across process
//! restarts. Used for development (`KEEL_STORE=memory`) and tests.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use keel_core::domain::lease::Lease;
use keel_core::domain::run::{Run, RunHeader};
use keel_core::domain::stage::{Stage, StageOutcome, StageOutput, StageRecord};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{Result, StateStore, lease_expiry};

#[derive(Default)]
struct Tables {
    /// Headers in insertion order
    runs: Vec<RunHeader>,
    trigger_keys: HashMap<String, Uuid>,
    /// The whole log, in append order
    records: Vec<StageRecord>,
    leases: HashMap<String, Lease>,
}

impl Tables {
    fn header(&self, run_id: Uuid) -> Option<&RunHeader> {
        self.runs.iter().find(|h| h.id == run_id)
    }

    fn history(&self, run_id: Uuid) -> Vec<StageRecord> {
        self.records
            .iter()
            .filter(|r| r.run_id == run_id)
            .cloned()
            .collect()
    }

    fn run(&self, run_id: Uuid) -> Option<Run> {
        self.header(run_id)
            .map(|h| Run::replay(h.clone(), self.history(run_id)))
    }

    fn is_finished(&self, run_id: Uuid) -> bool {
        self.records
            .iter()
            .any(|r| r.run_id == run_id && r.is_terminal())
    }

    fn unfinished(&self, environment: Option<&str>) -> Vec<Uuid> {
        self.runs
            .iter()
            .filter(|h| environment.is_none_or(|env| h.environment == env))
            .filter(|h| !self.is_finished(h.id))
            .map(|h| h.id)
            .collect()
    }
}

/// State store kept in process memory
#[derive(Default)]
pub struct MemoryStateStore {
    tables: Mutex<Tables>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn create_run(&self, header: RunHeader) -> Result<(RunHeader, bool)> {
        let mut tables = self.tables.lock().await;

        if let Some(existing) = tables
            .trigger_keys
            .get(&header.trigger_key)
            .and_then(|id| tables.header(*id))
        {
            return Ok((existing.clone(), false));
        }

        tables
            .trigger_keys
            .insert(header.trigger_key.clone(), header.id);
        tables.runs.push(header.clone());
        Ok((header, true))
    }

    async fn append(&self, record: StageRecord) -> Result<StageRecord> {
        let mut tables = self.tables.lock().await;
        let stored = StageRecord {
            seq: tables.records.len() as i64 + 1,
            ..record
        };
        tables.records.push(stored.clone());
        Ok(stored)
    }

    async fn load(&self, run_id: Uuid) -> Result<Option<Run>> {
        Ok(self.tables.lock().await.run(run_id))
    }

    async fn list_runs(&self, environment: Option<&str>, limit: usize) -> Result<Vec<Run>> {
        let tables = self.tables.lock().await;
        let mut headers: Vec<&RunHeader> = tables
            .runs
            .iter()
            .filter(|h| environment.is_none_or(|env| h.environment == env))
            .collect();
        headers.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        Ok(headers
            .into_iter()
            .take(limit)
            .map(|h| Run::replay(h.clone(), tables.history(h.id)))
            .collect())
    }

    async fn list_in_flight(&self, environment: &str) -> Result<Vec<Uuid>> {
        Ok(self.tables.lock().await.unfinished(Some(environment)))
    }

    async fn list_unfinished(&self) -> Result<Vec<Uuid>> {
        Ok(self.tables.lock().await.unfinished(None))
    }

    async fn last_succeeded(&self, environment: &str, excluding: Uuid) -> Result<Option<Run>> {
        let tables = self.tables.lock().await;
        let winner = tables
            .records
            .iter()
            .rev()
            .filter(|r| {
                r.stage == Stage::VerifyingHealth && r.is_terminal() && r.run_id != excluding
            })
            .find(|r| {
                tables
                    .header(r.run_id)
                    .is_some_and(|h| h.environment == environment)
            })
            .map(|r| r.run_id);

        Ok(winner.and_then(|id| tables.run(id)))
    }

    async fn stage_outputs(&self, environment: &str, stage: Stage) -> Result<Vec<StageOutput>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .records
            .iter()
            .filter(|r| {
                r.stage == stage
                    && r.inverse_of.is_none()
                    && r.outcome == StageOutcome::Succeeded
                    && tables
                        .header(r.run_id)
                        .is_some_and(|h| h.environment == environment)
            })
            .filter_map(|r| r.output.clone())
            .collect())
    }

    async fn acquire_lease(
        &self,
        environment: &str,
        holder: Uuid,
        ttl: Duration,
    ) -> Result<Option<Lease>> {
        let mut tables = self.tables.lock().await;
        let now = chrono::Utc::now();

        let acquired_at = match tables.leases.get(environment) {
            Some(current) if current.holder == holder => current.acquired_at,
            Some(current) if !current.is_expired(now) => return Ok(None),
            _ => now,
        };

        let lease = Lease {
            environment: environment.to_string(),
            holder,
            acquired_at,
            expires_at: lease_expiry(now, ttl),
        };
        tables
            .leases
            .insert(environment.to_string(), lease.clone());
        Ok(Some(lease))
    }

    async fn renew_lease(&self, environment: &str, holder: Uuid, ttl: Duration) -> Result<bool> {
        let mut tables = self.tables.lock().await;
        match tables.leases.get_mut(environment) {
            Some(lease) if lease.holder == holder => {
                lease.expires_at = lease_expiry(chrono::Utc::now(), ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_lease(&self, environment: &str, holder: Uuid) -> Result<()> {
        let mut tables = self.tables.lock().await;
        if tables
            .leases
            .get(environment)
            .is_some_and(|l| l.holder == holder)
        {
            tables.leases.remove(environment);
        }
        Ok(())
    }

    async fn lease(&self, environment: &str) -> Result<Option<Lease>> {
        Ok(self.tables.lock().await.leases.get(environment).cloned())
    }
}
