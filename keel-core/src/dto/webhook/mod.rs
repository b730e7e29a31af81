//! Webhook DTOs

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Reply to a source-control webhook delivery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookResponse {
    /// Whether the event started (or matched) a Run
    pub accepted: bool,

    pub run_id: Option<Uuid>,

    /// Why the event was ignored
    pub reason: Option<String>,
}

impl WebhookResponse {
    pub fn accepted(run_id: Uuid) -> Self {
        Self {
            accepted: true,
            run_id: Some(run_id),
            reason: None,
        }
    }

    pub fn ignored(reason: impl Into<String>) -> Self {
        Self {
            accepted: false,
            run_id: None,
            reason: Some(reason.into()),
        }
    }
}
