//! Environment API Handlers

use axum::{
    Json,
    extract::{Path, State},
};
use keel_core::domain::lease::Lease;
use keel_core::dto::environment::EnvironmentStatus;

use crate::api::AppState;
use crate::api::error::{ApiError, ApiResult};

/// GET /environments/{name}
/// Lease holder and unfinished Runs of an environment
pub async fn get_environment(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<EnvironmentStatus>> {
    let status = state.engine.environment(&name).await?;
    Ok(Json(status))
}

/// GET /environments/{name}/lease
/// Current lease holder, or `null` when the environment is free
pub async fn get_lease(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<Option<Lease>>> {
    if state.engine.catalog().get(&name).is_none() {
        return Err(ApiError::NotFound(format!("Environment '{}' not found", name)));
    }
    let lease = state.engine.lease(&name).await?;
    Ok(Json(lease))
}
