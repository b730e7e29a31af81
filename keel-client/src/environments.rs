//! Environment-related API endpoints

use keel_core::domain::lease::Lease;
use keel_core::dto::environment::EnvironmentStatus;

use crate::OrchestratorClient;
use crate::error::Result;

impl OrchestratorClient {
    /// Lease holder and unfinished Runs of an environment
    pub async fn get_environment(&self, name: &str) -> Result<EnvironmentStatus> {
        let response = self
            .client
            .get(self.url(&format!("/environments/{}", name)))
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Current lease of an environment, `None` when nobody holds it
    pub async fn get_lease(&self, name: &str) -> Result<Option<Lease>> {
        let response = self
            .client
            .get(self.url(&format!("/environments/{}/lease", name)))
            .send()
            .await?;

        self.handle_response(response).await
    }
}
