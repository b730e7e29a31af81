//! Stage Record Repository
//!
//! Append-only access to the stage history of Runs.

use keel_core::domain::stage::{
    ErrorKind, Stage, StageError, StageOutcome, StageOutput, StageRecord,
};
use sqlx::PgPool;
use uuid::Uuid;

use super::StoreError;

/// Append a record and return it with its sequence number
pub async fn append(pool: &PgPool, record: &StageRecord) -> Result<StageRecord, StoreError> {
    let output = record
        .output
        .as_ref()
        .map(serde_json::to_value)
        .transpose()?;

    let seq = sqlx::query_scalar::<_, i64>(
        r#"
        INSERT INTO stage_records (run_id, stage, inverse_of, attempt, outcome, started_at,
                                   finished_at, output, error_kind, error_message, terminal)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        RETURNING seq
        "#,
    )
    .bind(record.run_id)
    .bind(record.stage.as_str())
    .bind(record.inverse_of.map(|s| s.as_str()))
    .bind(record.attempt as i32)
    .bind(record.outcome.as_str())
    .bind(record.started_at)
    .bind(record.finished_at)
    .bind(output)
    .bind(record.error.as_ref().map(|e| e.kind.as_str()))
    .bind(record.error.as_ref().map(|e| e.message.as_str()))
    .bind(record.is_terminal())
    .fetch_one(pool)
    .await?;

    Ok(StageRecord {
        seq,
        ..record.clone()
    })
}

/// Full history of one Run in append order
pub async fn list_for_run(pool: &PgPool, run_id: Uuid) -> Result<Vec<StageRecord>, StoreError> {
    let rows = sqlx::query_as::<_, StageRecordRow>(
        r#"
        SELECT seq, run_id, stage, inverse_of, attempt, outcome, started_at,
               finished_at, output, error_kind, error_message
        FROM stage_records
        WHERE run_id = $1
        ORDER BY seq ASC
        "#,
    )
    .bind(run_id)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(StageRecord::try_from).collect()
}

/// Histories of several Runs, in append order
pub async fn list_for_runs(
    pool: &PgPool,
    run_ids: &[Uuid],
) -> Result<Vec<StageRecord>, StoreError> {
    let rows = sqlx::query_as::<_, StageRecordRow>(
        r#"
        SELECT seq, run_id, stage, inverse_of, attempt, outcome, started_at,
               finished_at, output, error_kind, error_message
        FROM stage_records
        WHERE run_id = ANY($1)
        ORDER BY seq ASC
        "#,
    )
    .bind(run_ids)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(StageRecord::try_from).collect()
}

/// Outputs of successful forward attempts of `stage` in one environment
pub async fn succeeded_outputs(
    pool: &PgPool,
    environment: &str,
    stage: Stage,
) -> Result<Vec<StageOutput>, StoreError> {
    let values = sqlx::query_scalar::<_, serde_json::Value>(
        r#"
        SELECT s.output
        FROM stage_records s
        JOIN runs r ON r.id = s.run_id
        WHERE r.environment = $1
          AND s.stage = $2
          AND s.inverse_of IS NULL
          AND s.outcome = 'Succeeded'
          AND s.output IS NOT NULL
        ORDER BY s.seq ASC
        "#,
    )
    .bind(environment)
    .bind(stage.as_str())
    .fetch_all(pool)
    .await?;

    values
        .into_iter()
        .map(|v| serde_json::from_value(v).map_err(StoreError::from))
        .collect()
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct StageRecordRow {
    seq: i64,
    run_id: Uuid,
    stage: String,
    inverse_of: Option<String>,
    attempt: i32,
    outcome: String,
    started_at: chrono::DateTime<chrono::Utc>,
    finished_at: Option<chrono::DateTime<chrono::Utc>>,
    output: Option<serde_json::Value>,
    error_kind: Option<String>,
    error_message: Option<String>,
}

fn parse_stage(value: &str) -> Result<Stage, StoreError> {
    Stage::parse(value).ok_or_else(|| StoreError::Corrupt(format!("unknown stage '{}'", value)))
}

impl TryFrom<StageRecordRow> for StageRecord {
    type Error = StoreError;

    fn try_from(row: StageRecordRow) -> Result<Self, Self::Error> {
        let outcome = StageOutcome::parse(&row.outcome).ok_or_else(|| {
            StoreError::Corrupt(format!("unknown outcome '{}' at seq {}", row.outcome, row.seq))
        })?;

        let error = match row.error_kind {
            Some(kind) => Some(StageError {
                kind: ErrorKind::parse(&kind).ok_or_else(|| {
                    StoreError::Corrupt(format!("unknown error kind '{}' at seq {}", kind, row.seq))
                })?,
                message: row.error_message.unwrap_or_default(),
            }),
            None => None,
        };

        Ok(StageRecord {
            run_id: row.run_id,
            seq: row.seq,
            stage: parse_stage(&row.stage)?,
            inverse_of: row.inverse_of.as_deref().map(parse_stage).transpose()?,
            attempt: row.attempt.max(0) as u32,
            outcome,
            started_at: row.started_at,
            finished_at: row.finished_at,
            output: row.output.map(serde_json::from_value).transpose()?,
            error,
        })
    }
}
