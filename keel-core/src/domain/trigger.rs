//! Trigger domain types
//!
//! A trigger is the inbound push/merge event that may create a Run.

use serde::{Deserialize, Serialize};

use crate::digest;

/// Inbound source-control event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub repository: String,
    pub commit_sha: String,
    pub branch: String,
    pub actor: String,
    pub event_type: EventType,
    /// Delivery identifier supplied by the webhook sender, used to
    /// deduplicate redelivered events.
    #[serde(default)]
    pub delivery_id: Option<String>,
}

/// Kind of source-control event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Push,
    Merge,
    /// Any other event type (tag, pull request opened, ...). Never creates a Run.
    #[serde(other)]
    Other,
}

impl EventType {
    /// Whether this event type is allowed to create a Run
    pub fn creates_run(self) -> bool {
        matches!(self, EventType::Push | EventType::Merge)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Push => "push",
            EventType::Merge => "merge",
            EventType::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "push" => EventType::Push,
            "merge" => EventType::Merge,
            _ => EventType::Other,
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TriggerEvent {
    /// Check the shape of the event
    ///
    /// Returns a human-readable reason when the event is malformed.
    pub fn check(&self) -> Result<(), String> {
        if self.repository.trim().is_empty() {
            return Err("repository cannot be empty".to_string());
        }
        if self.branch.trim().is_empty() {
            return Err("branch cannot be empty".to_string());
        }
        if self.actor.trim().is_empty() {
            return Err("actor cannot be empty".to_string());
        }
        let sha = &self.commit_sha;
        if sha.len() < 7 || sha.len() > 64 || !sha.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(format!(
                "commit SHA '{}' must be 7 to 64 hexadecimal characters",
                sha
            ));
        }
        Ok(())
    }

    /// Deduplication key for this trigger targeting `environment`
    ///
    /// The delivery ID wins when present; otherwise the key is derived from
    /// the event content so that a redelivered event maps to the same Run.
    pub fn dedup_key(&self, environment: &str) -> String {
        match &self.delivery_id {
            Some(id) if !id.trim().is_empty() => format!("delivery:{}", id.trim()),
            _ => format!(
                "event:{}",
                digest::hash_parts([
                    ("repository", self.repository.as_bytes()),
                    ("commit", self.commit_sha.as_bytes()),
                    ("branch", self.branch.as_bytes()),
                    ("event", self.event_type.as_str().as_bytes()),
                    ("environment", environment.as_bytes()),
                ])
            ),
        }
    }
}
