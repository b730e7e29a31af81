//! Environment DTOs

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::lease::Lease;

/// Lease holder and unfinished Runs of one environment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentStatus {
    pub environment: String,

    /// Current lease, which may already have expired
    pub lease: Option<Lease>,

    /// Runs that have not reached a terminal state, oldest first
    pub in_flight: Vec<Uuid>,
}
