//! Lease domain model
//!
//! A lease is a time-bounded mutual-exclusion grant over an environment.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current holder of an environment lease
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Environment the lease guards
    pub environment: String,

    /// Run holding the lease
    pub holder: Uuid,

    /// When the current holder first acquired the lease
    pub acquired_at: DateTime<Utc>,

    /// When the lease lapses unless renewed
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}
