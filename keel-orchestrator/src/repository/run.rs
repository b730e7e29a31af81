//! Run Repository
//!
//! Database operations on Run headers.

use keel_core::domain::run::RunHeader;
use keel_core::domain::trigger::{EventType, TriggerEvent};
use sqlx::PgPool;
use uuid::Uuid;

/// Insert a header; returns false when the trigger key is already taken
pub async fn insert(pool: &PgPool, header: &RunHeader) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        INSERT INTO runs (id, trigger_key, environment, repository, commit_sha, branch,
                          actor, event_type, delivery_id, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        ON CONFLICT (trigger_key) DO NOTHING
        "#,
    )
    .bind(header.id)
    .bind(&header.trigger_key)
    .bind(&header.environment)
    .bind(&header.trigger.repository)
    .bind(&header.trigger.commit_sha)
    .bind(&header.trigger.branch)
    .bind(&header.trigger.actor)
    .bind(header.trigger.event_type.as_str())
    .bind(&header.trigger.delivery_id)
    .bind(header.created_at)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<RunHeader>, sqlx::Error> {
    let row = sqlx::query_as::<_, RunRow>(
        r#"
        SELECT id, trigger_key, environment, repository, commit_sha, branch,
               actor, event_type, delivery_id, created_at
        FROM runs
        WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|r| r.into()))
}

pub async fn find_by_trigger_key(
    pool: &PgPool,
    trigger_key: &str,
) -> Result<Option<RunHeader>, sqlx::Error> {
    let row = sqlx::query_as::<_, RunRow>(
        r#"
        SELECT id, trigger_key, environment, repository, commit_sha, branch,
               actor, event_type, delivery_id, created_at
        FROM runs
        WHERE trigger_key = $1
        "#,
    )
    .bind(trigger_key)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|r| r.into()))
}

/// List headers newest first, optionally for one environment
pub async fn list(
    pool: &PgPool,
    environment: Option<&str>,
    limit: i64,
) -> Result<Vec<RunHeader>, sqlx::Error> {
    let rows = sqlx::query_as::<_, RunRow>(
        r#"
        SELECT id, trigger_key, environment, repository, commit_sha, branch,
               actor, event_type, delivery_id, created_at
        FROM runs
        WHERE $1::VARCHAR IS NULL OR environment = $1
        ORDER BY created_at DESC
        LIMIT $2
        "#,
    )
    .bind(environment)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|r| r.into()).collect())
}

/// IDs of Runs without a terminal record, oldest first
pub async fn list_unfinished(
    pool: &PgPool,
    environment: Option<&str>,
) -> Result<Vec<Uuid>, sqlx::Error> {
    sqlx::query_scalar::<_, Uuid>(
        r#"
        SELECT r.id
        FROM runs r
        WHERE ($1::VARCHAR IS NULL OR r.environment = $1)
          AND NOT EXISTS (
              SELECT 1 FROM stage_records s WHERE s.run_id = r.id AND s.terminal
          )
        ORDER BY r.created_at ASC
        "#,
    )
    .bind(environment)
    .fetch_all(pool)
    .await
}

/// The Run whose VerifyingHealth stage succeeded most recently
pub async fn last_succeeded_id(
    pool: &PgPool,
    environment: &str,
    excluding: Uuid,
) -> Result<Option<Uuid>, sqlx::Error> {
    sqlx::query_scalar::<_, Uuid>(
        r#"
        SELECT r.id
        FROM runs r
        JOIN stage_records s ON s.run_id = r.id
        WHERE r.environment = $1
          AND r.id <> $2
          AND s.terminal
          AND s.stage = 'VerifyingHealth'
        ORDER BY s.seq DESC
        LIMIT 1
        "#,
    )
    .bind(environment)
    .bind(excluding)
    .fetch_optional(pool)
    .await
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct RunRow {
    id: Uuid,
    trigger_key: String,
    environment: String,
    repository: String,
    commit_sha: String,
    branch: String,
    actor: String,
    event_type: String,
    delivery_id: Option<String>,
    created_at: chrono::DateTime<chrono::Utc>,
}

impl From<RunRow> for RunHeader {
    fn from(row: RunRow) -> Self {
        RunHeader {
            id: row.id,
            trigger: TriggerEvent {
                repository: row.repository,
                commit_sha: row.commit_sha,
                branch: row.branch,
                actor: row.actor,
                event_type: EventType::parse(&row.event_type),
                delivery_id: row.delivery_id,
            },
            environment: row.environment,
            trigger_key: row.trigger_key,
            created_at: row.created_at,
        }
    }
}
