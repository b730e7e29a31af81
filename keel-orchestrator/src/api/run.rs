//! Run API Handlers
//!
//! HTTP endpoints for submitting, inspecting and cancelling Runs.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use keel_core::domain::run::Run;
use keel_core::dto::run::{CancelOutcome, CancelResponse, RunSummary, SubmitResponse, SubmitRun};
use serde::Deserialize;
use uuid::Uuid;

use crate::api::AppState;
use crate::api::error::ApiResult;

const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 500;

/// POST /runs
/// Submit a trigger and start its Run
pub async fn submit_run(
    State(state): State<AppState>,
    Json(req): Json<SubmitRun>,
) -> ApiResult<Json<SubmitResponse>> {
    tracing::info!(
        "Submitting {} of {}@{} on {}",
        req.trigger.event_type,
        req.trigger.repository,
        req.trigger.commit_sha,
        req.trigger.branch
    );

    let response = state
        .engine
        .submit(req.trigger, req.environment.as_deref())
        .await?;

    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
pub struct ListRunsQuery {
    pub environment: Option<String>,
    pub limit: Option<usize>,
}

/// GET /runs
/// List run summaries, newest first
///
/// Query parameters:
/// - `environment` (optional): only Runs targeting this environment
/// - `limit` (optional): at most this many Runs
pub async fn list_runs(
    State(state): State<AppState>,
    Query(params): Query<ListRunsQuery>,
) -> ApiResult<Json<Vec<RunSummary>>> {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .min(MAX_LIST_LIMIT);
    tracing::debug!("Listing {} runs for {:?}", limit, params.environment);

    let runs = state
        .engine
        .list(params.environment.as_deref(), limit)
        .await?;

    Ok(Json(runs.iter().map(RunSummary::from).collect()))
}

/// GET /runs/{id}
/// Full Run record with its stage history
pub async fn get_run(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Json<Run>> {
    tracing::debug!("Getting run: {}", id);

    let run = state.engine.status(id).await?;
    Ok(Json(run))
}

/// POST /runs/{id}/cancel
/// Request cancellation; 409 when the Run already finished
pub async fn cancel_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<(StatusCode, Json<CancelResponse>)> {
    tracing::info!("Cancelling run: {}", id);

    let response = state.engine.cancel(id).await?;
    let status = match response.outcome {
        CancelOutcome::Accepted => StatusCode::OK,
        CancelOutcome::AlreadyTerminal => StatusCode::CONFLICT,
    };

    Ok((status, Json(response)))
}
