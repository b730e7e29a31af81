//! Repository Module
//!
//! The Pipeline State Store. Runs are persisted as an immutable header plus an
//! append-only log of stage records, next to a lease table keyed by
//! environment. Writes are durable when the returned future resolves.

pub mod lease;
pub mod memory;
pub mod postgres;
pub mod run;
pub mod stage;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use keel_core::domain::lease::Lease;
use keel_core::domain::run::{Run, RunHeader};
use keel_core::domain::stage::{Stage, StageOutput, StageRecord};
use thiserror::Error;
use uuid::Uuid;

pub use memory::MemoryStateStore;
pub use postgres::PgStateStore;

/// State store error type
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Durable storage for Runs, their stage history and environment leases
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Insert a Run header unless one with the same trigger key exists
    ///
    /// Returns the stored header and whether it was created by this call.
    async fn create_run(&self, header: RunHeader) -> Result<(RunHeader, bool)>;

    /// Durably append a record, returning it with its assigned sequence number
    async fn append(&self, record: StageRecord) -> Result<StageRecord>;

    /// Rebuild a Run from its full history
    async fn load(&self, run_id: Uuid) -> Result<Option<Run>>;

    /// Most recent Runs first
    async fn list_runs(&self, environment: Option<&str>, limit: usize) -> Result<Vec<Run>>;

    /// Runs of an environment that have not reached a terminal record
    async fn list_in_flight(&self, environment: &str) -> Result<Vec<Uuid>>;

    /// Every Run, in any environment, that has not reached a terminal record
    async fn list_unfinished(&self) -> Result<Vec<Uuid>>;

    /// The Run of `environment` that most recently succeeded, other than `excluding`
    async fn last_succeeded(&self, environment: &str, excluding: Uuid) -> Result<Option<Run>>;

    /// Outputs of every successful forward `stage` in `environment`, oldest first
    async fn stage_outputs(&self, environment: &str, stage: Stage) -> Result<Vec<StageOutput>>;

    /// Take the environment lease if it is free, expired or already ours
    ///
    /// Returns `None` while another holder has a live lease.
    async fn acquire_lease(
        &self,
        environment: &str,
        holder: Uuid,
        ttl: Duration,
    ) -> Result<Option<Lease>>;

    /// Extend a lease we hold. `false` means it was lost to another holder.
    async fn renew_lease(&self, environment: &str, holder: Uuid, ttl: Duration) -> Result<bool>;

    async fn release_lease(&self, environment: &str, holder: Uuid) -> Result<()>;

    async fn lease(&self, environment: &str) -> Result<Option<Lease>>;
}

/// When a lease granted at `now` for `ttl` lapses
pub(crate) fn lease_expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    now + TimeDelta::from_std(ttl).unwrap_or(TimeDelta::hours(1))
}
