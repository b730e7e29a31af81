//! API Module
//!
//! HTTP API layer for the orchestrator.
//! Each submodule handles endpoints for a specific domain.

pub mod environment;
pub mod error;
pub mod health;
pub mod run;
pub mod webhook;

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

use crate::service::Engine;

/// Shared state of every handler
#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
    /// Shared secret expected in `X-Keel-Token` on webhook deliveries
    pub webhook_token: Option<String>,
}

/// Create the main API router with all endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health::health_check))
        // Inbound triggers
        .route("/webhook", post(webhook::receive))
        // Run endpoints
        .route("/runs", post(run::submit_run))
        .route("/runs", get(run::list_runs))
        .route("/runs/{id}", get(run::get_run))
        .route("/runs/{id}/cancel", post(run::cancel_run))
        // Environment endpoints
        .route("/environments/{name}", get(environment::get_environment))
        .route("/environments/{name}/lease", get(environment::get_lease))
        // Add state and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use keel_core::dto::run::SubmitRun;
    use tower::ServiceExt;

    use crate::service::testing::{Harness, trigger};

    fn app(h: &Harness, token: Option<&str>) -> Router {
        create_router(AppState {
            engine: h.engine.clone(),
            webhook_token: token.map(str::to_string),
        })
    }

    async fn json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: &impl serde::Serialize) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(body).unwrap()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let h = Harness::new();
        let response = app(&h, None)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json(response).await["environments"], 1);
    }

    #[tokio::test]
    async fn test_submit_then_get_run() {
        let h = Harness::new();
        let body = SubmitRun {
            trigger: trigger("abc1234"),
            environment: None,
        };
        let response = app(&h, None).oneshot(post_json("/runs", &body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let submitted = json(response).await;
        assert_eq!(submitted["created"], true);

        let run_id = submitted["run_id"].as_str().unwrap().to_string();
        h.finished(run_id.parse().unwrap()).await;

        let response = app(&h, None)
            .oneshot(
                Request::get(format!("/runs/{}", run_id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let run = json(response).await;
        assert_eq!(run["status"], "succeeded");
        assert_eq!(run["phase"], "Succeeded");
        assert!(!run["records"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_undesignated_submit_is_bad_request() {
        let h = Harness::new();
        let mut trigger = trigger("abc1234");
        trigger.branch = "feature/x".to_string();
        let body = SubmitRun {
            trigger,
            environment: None,
        };
        let response = app(&h, None).oneshot(post_json("/runs", &body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(json(response).await["error"].as_str().unwrap().contains("feature/x"));
    }

    #[tokio::test]
    async fn test_unknown_run_is_not_found() {
        let h = Harness::new();
        let response = app(&h, None)
            .oneshot(
                Request::get(format!("/runs/{}", uuid::Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_cancel_of_finished_run_conflicts() {
        let h = Harness::new();
        let run_id = h.submit("abc1234").await;
        h.finished(run_id).await;

        let response = app(&h, None)
            .oneshot(
                Request::post(format!("/runs/{}/cancel", run_id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(json(response).await["outcome"], "already_terminal");
    }

    #[tokio::test]
    async fn test_list_runs_filters_by_environment() {
        let h = Harness::new();
        let run_id = h.submit("abc1234").await;
        h.finished(run_id).await;

        let response = app(&h, None)
            .oneshot(
                Request::get("/runs?environment=production&limit=5")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let runs = json(response).await;
        assert_eq!(runs.as_array().unwrap().len(), 1);
        assert_eq!(runs[0]["id"], run_id.to_string());

        let response = app(&h, None)
            .oneshot(
                Request::get("/runs?environment=staging")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(json(response).await.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_webhook_requires_token() {
        let h = Harness::new();
        let response = app(&h, Some("s3cret"))
            .oneshot(post_json("/webhook", &trigger("abc1234")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(h.engine.list(None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_webhook_accepts_and_ignores() {
        let h = Harness::new();

        let mut request = post_json("/webhook", &trigger("abc1234"));
        request
            .headers_mut()
            .insert("x-keel-token", "s3cret".parse().unwrap());
        let response = app(&h, Some("s3cret")).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json(response).await;
        assert_eq!(body["accepted"], true);
        h.finished(body["run_id"].as_str().unwrap().parse().unwrap())
            .await;

        let mut tag = trigger("abc1234");
        tag.branch = "release".to_string();
        let response = app(&h, None)
            .oneshot(post_json("/webhook", &tag))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json(response).await;
        assert_eq!(body["accepted"], false);
        assert!(body["reason"].as_str().unwrap().contains("release"));
    }

    #[tokio::test]
    async fn test_webhook_delivery_header_deduplicates() {
        let h = Harness::new();
        let mut first_sha = post_json("/webhook", &trigger("abc1234"));
        first_sha
            .headers_mut()
            .insert("x-keel-delivery", "d-1".parse().unwrap());
        let mut other_sha = post_json("/webhook", &trigger("def5678"));
        other_sha
            .headers_mut()
            .insert("x-keel-delivery", "d-1".parse().unwrap());

        let first = json(app(&h, None).oneshot(first_sha).await.unwrap()).await;
        let second = json(app(&h, None).oneshot(other_sha).await.unwrap()).await;
        assert_eq!(first["run_id"], second["run_id"]);
    }

    #[tokio::test]
    async fn test_environment_lease_endpoint() {
        let h = Harness::new();
        let response = app(&h, None)
            .oneshot(
                Request::get("/environments/production/lease")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(json(response).await.is_null());

        let response = app(&h, None)
            .oneshot(
                Request::get("/environments/staging/lease")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
