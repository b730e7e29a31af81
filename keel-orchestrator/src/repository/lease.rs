//! Lease Repository
//!
//! Environment leases. A lease row is only taken over once it has expired.

use std::time::Duration;

use keel_core::domain::lease::Lease;
use sqlx::PgPool;
use uuid::Uuid;

use super::lease_expiry;

/// Take the lease if free, expired or already held by `holder`
pub async fn acquire(
    pool: &PgPool,
    environment: &str,
    holder: Uuid,
    ttl: Duration,
) -> Result<Option<Lease>, sqlx::Error> {
    let now = chrono::Utc::now();

    let row = sqlx::query_as::<_, LeaseRow>(
        r#"
        INSERT INTO environment_leases (environment, holder, acquired_at, expires_at)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (environment) DO UPDATE SET
            holder = EXCLUDED.holder,
            acquired_at = CASE
                WHEN environment_leases.holder = EXCLUDED.holder
                THEN environment_leases.acquired_at
                ELSE EXCLUDED.acquired_at
            END,
            expires_at = EXCLUDED.expires_at
        WHERE environment_leases.holder = EXCLUDED.holder
           OR environment_leases.expires_at <= EXCLUDED.acquired_at
        RETURNING environment, holder, acquired_at, expires_at
        "#,
    )
    .bind(environment)
    .bind(holder)
    .bind(now)
    .bind(lease_expiry(now, ttl))
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|r| r.into()))
}

/// Extend the lease; returns false if `holder` no longer holds it
pub async fn renew(
    pool: &PgPool,
    environment: &str,
    holder: Uuid,
    ttl: Duration,
) -> Result<bool, sqlx::Error> {
    let now = chrono::Utc::now();

    let result = sqlx::query(
        r#"
        UPDATE environment_leases
        SET expires_at = $3
        WHERE environment = $1 AND holder = $2
        "#,
    )
    .bind(environment)
    .bind(holder)
    .bind(lease_expiry(now, ttl))
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

pub async fn release(pool: &PgPool, environment: &str, holder: Uuid) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM environment_leases WHERE environment = $1 AND holder = $2")
        .bind(environment)
        .bind(holder)
        .execute(pool)
        .await?;

    Ok(())
}

pub async fn find(pool: &PgPool, environment: &str) -> Result<Option<Lease>, sqlx::Error> {
    let row = sqlx::query_as::<_, LeaseRow>(
        r#"
        SELECT environment, holder, acquired_at, expires_at
        FROM environment_leases
        WHERE environment = $1
        "#,
    )
    .bind(environment)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|r| r.into()))
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct LeaseRow {
    environment: String,
    holder: Uuid,
    acquired_at: chrono::DateTime<chrono::Utc>,
    expires_at: chrono::DateTime<chrono::Utc>,
}

impl From<LeaseRow> for Lease {
    fn from(row: LeaseRow) -> Self {
        Lease {
            environment: row.environment,
            holder: row.holder,
            acquired_at: row.acquired_at,
            expires_at: row.expires_at,
        }
    }
}
