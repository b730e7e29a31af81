//! Run-related API endpoints

use keel_core::domain::run::Run;
use keel_core::dto::run::{CancelResponse, RunSummary, SubmitResponse, SubmitRun};
use reqwest::StatusCode;
use uuid::Uuid;

use crate::OrchestratorClient;
use crate::error::Result;

impl OrchestratorClient {
    /// Submit a trigger event and start (or find) its Run
    ///
    /// # Example
    /// ```no_run
    /// # use keel_client::OrchestratorClient;
    /// # use keel_core::domain::trigger::{EventType, TriggerEvent};
    /// # use keel_core::dto::run::SubmitRun;
    /// # async fn example() -> keel_client::Result<()> {
    /// let client = OrchestratorClient::new("http://localhost:8080");
    /// let submitted = client.submit_run(&SubmitRun {
    ///     trigger: TriggerEvent {
    ///         repository: "acme/shop".to_string(),
    ///         commit_sha: "9fceb02".to_string(),
    ///         branch: "main".to_string(),
    ///         actor: "dev".to_string(),
    ///         event_type: EventType::Push,
    ///         delivery_id: None,
    ///     },
    ///     environment: None,
    /// }).await?;
    /// println!("{}", submitted.run_id);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn submit_run(&self, req: &SubmitRun) -> Result<SubmitResponse> {
        let response = self.client.post(self.url("/runs")).json(req).send().await?;

        self.handle_response(response).await
    }

    /// List run summaries, newest first
    pub async fn list_runs(
        &self,
        environment: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<RunSummary>> {
        let mut query: Vec<(&str, String)> = Vec::new();
        if let Some(environment) = environment {
            query.push(("environment", environment.to_string()));
        }
        if let Some(limit) = limit {
            query.push(("limit", limit.to_string()));
        }

        let response = self
            .client
            .get(self.url("/runs"))
            .query(&query)
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Get a Run with its full stage history
    pub async fn get_run(&self, run_id: Uuid) -> Result<Run> {
        let response = self
            .client
            .get(self.url(&format!("/runs/{}", run_id)))
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Request cancellation of a Run
    ///
    /// A Run that already finished is reported through
    /// `CancelOutcome::AlreadyTerminal`, not as an error.
    pub async fn cancel_run(&self, run_id: Uuid) -> Result<CancelResponse> {
        let response = self
            .client
            .post(self.url(&format!("/runs/{}/cancel", run_id)))
            .send()
            .await?;

        if response.status() == StatusCode::CONFLICT {
            if let Ok(body) = response.json::<CancelResponse>().await {
                return Ok(body);
            }
            return Err(crate::ClientError::api_error(
                409,
                format!("Run {} cannot be cancelled", run_id),
            ));
        }

        self.handle_response(response).await
    }
}
