use sqlx::{PgPool, postgres::PgPoolOptions};
use std::time::Duration;

pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    // Immutable run headers; one row per accepted trigger
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS runs (
            id UUID PRIMARY KEY,
            trigger_key VARCHAR(255) NOT NULL UNIQUE,
            environment VARCHAR(255) NOT NULL,
            repository VARCHAR(255) NOT NULL,
            commit_sha VARCHAR(64) NOT NULL,
            branch VARCHAR(255) NOT NULL,
            actor VARCHAR(255) NOT NULL,
            event_type VARCHAR(20) NOT NULL,
            delivery_id VARCHAR(255),
            created_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Append-only stage history
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS stage_records (
            seq BIGSERIAL PRIMARY KEY,
            run_id UUID NOT NULL REFERENCES runs(id),
            stage VARCHAR(50) NOT NULL,
            inverse_of VARCHAR(50),
            attempt INTEGER NOT NULL,
            outcome VARCHAR(50) NOT NULL,
            started_at TIMESTAMPTZ NOT NULL,
            finished_at TIMESTAMPTZ,
            output JSONB,
            error_kind VARCHAR(50),
            error_message TEXT,
            terminal BOOLEAN NOT NULL DEFAULT FALSE,
            recorded_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS environment_leases (
            environment VARCHAR(255) PRIMARY KEY,
            holder UUID NOT NULL,
            acquired_at TIMESTAMPTZ NOT NULL,
            expires_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_runs_environment ON runs(environment, created_at DESC)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_runs_created_at ON runs(created_at DESC)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_stage_records_run_id ON stage_records(run_id, seq)")
        .execute(pool)
        .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_stage_records_terminal ON stage_records(run_id) WHERE terminal",
    )
    .execute(pool)
    .await?;

    tracing::info!("Database migrations completed successfully");
    Ok(())
}
