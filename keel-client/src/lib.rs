//! Keel HTTP Client
//!
//! A small, type-safe HTTP client for the Keel orchestrator API, used by the
//! `keel` CLI and by anything else that needs to submit or inspect Runs.
//!
//! # Example
//!
//! ```no_run
//! use keel_client::OrchestratorClient;
//!
//! # async fn example() -> keel_client::Result<()> {
//! let client = OrchestratorClient::new("http://localhost:8080");
//! for run in client.list_runs(Some("production"), None).await? {
//!     println!("{} {} {}", run.id, run.phase, run.status);
//! }
//! # Ok(())
//! # }
//! ```

pub mod error;
mod environments;
mod runs;

pub use error::{ClientError, Result};

use reqwest::Client;
use serde::Deserialize;
use serde::de::DeserializeOwned;

/// HTTP client for the Keel orchestrator API
///
/// Endpoints are grouped by resource:
/// - Runs (submit, list, get, cancel)
/// - Environments (status, lease holder)
#[derive(Debug, Clone)]
pub struct OrchestratorClient {
    /// Base URL of the orchestrator (e.g., "http://localhost:8080")
    base_url: String,
    client: Client,
}

/// Error body rendered by the orchestrator
#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

impl OrchestratorClient {
    /// Create a new orchestrator client
    ///
    /// # Example
    /// ```
    /// use keel_client::OrchestratorClient;
    ///
    /// let client = OrchestratorClient::new("http://localhost:8080");
    /// ```
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, Client::new())
    }

    /// Create a client around a configured reqwest `Client` (timeouts,
    /// proxies, TLS settings)
    pub fn with_client(base_url: impl Into<String>, client: Client) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    /// Get the base URL of the orchestrator
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    // =============================================================================
    // Response Handlers
    // =============================================================================

    /// Check the status code and deserialize the JSON body
    async fn handle_response<T: DeserializeOwned>(&self, response: reqwest::Response) -> Result<T> {
        let status = response.status();

        if !status.is_success() {
            return Err(Self::error_from(response).await);
        }

        response
            .json()
            .await
            .map_err(|e| ClientError::ParseError(format!("Failed to parse JSON response: {}", e)))
    }

    /// Turn a non-success response into a `ClientError`, preferring the
    /// message from the `{"error": ...}` body
    async fn error_from(response: reqwest::Response) -> ClientError {
        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        let message = serde_json::from_str::<ErrorBody>(&text)
            .map(|body| body.error)
            .unwrap_or(text);
        tracing::debug!("Orchestrator returned {}: {}", status, message);

        match status {
            404 => ClientError::NotFound(message),
            _ => ClientError::api_error(status, message),
        }
    }
}
