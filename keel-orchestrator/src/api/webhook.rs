//! Webhook API Handler
//!
//! Inbound push/merge events from the source-control system. Events that do
//! not create a Run are acknowledged with `accepted = false` so the sender
//! does not redeliver them.

use axum::{
    Json,
    extract::State,
    http::{HeaderMap, StatusCode},
};
use keel_core::domain::trigger::TriggerEvent;
use keel_core::dto::webhook::WebhookResponse;

use crate::api::AppState;
use crate::api::error::{ApiError, ApiResult};
use crate::service::EngineError;

pub const TOKEN_HEADER: &str = "x-keel-token";
pub const DELIVERY_HEADER: &str = "x-keel-delivery";

/// POST /webhook
pub async fn receive(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(mut trigger): Json<TriggerEvent>,
) -> ApiResult<(StatusCode, Json<WebhookResponse>)> {
    if let Some(expected) = &state.webhook_token {
        let given = headers.get(TOKEN_HEADER).and_then(|v| v.to_str().ok());
        if given != Some(expected.as_str()) {
            tracing::warn!("Rejected webhook from {} without a valid token", trigger.actor);
            return Err(ApiError::Unauthorized("invalid webhook token".to_string()));
        }
    }

    if trigger.delivery_id.is_none() {
        trigger.delivery_id = headers
            .get(DELIVERY_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
    }

    tracing::info!(
        "Webhook {} from {} for {}@{}",
        trigger.event_type,
        trigger.actor,
        trigger.branch,
        trigger.commit_sha
    );

    match state.engine.submit(trigger, None).await {
        Ok(response) => Ok((StatusCode::OK, Json(WebhookResponse::accepted(response.run_id)))),
        Err(EngineError::Rejected(reason)) => {
            tracing::info!("Webhook ignored: {}", reason);
            Ok((StatusCode::OK, Json(WebhookResponse::ignored(reason))))
        }
        Err(e) => Err(e.into()),
    }
}
