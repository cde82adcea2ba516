//! Common test utilities and helpers for orchestrate-api tests

#![allow(dead_code)]

use axum::{body::Body, http::Request, Router};
use orchestrate_api::AppState;
use orchestrate_engine::test_utils::create_test_db;
use orchestrate_engine::{RequestKind, RetryPolicy, SubmitRequest, WorkflowEngine};
use orchestrate_identity::{LocalIam, TrustStore};
use serde_json::json;
use std::sync::Arc;

pub const OPERATOR_KEY: &str = "operator-test-key";

/// Create app state over a fresh in-memory database
pub async fn create_test_state() -> AppState {
    create_test_state_with_policy(RetryPolicy::default()).await
}

pub async fn create_test_state_with_policy(policy: RetryPolicy) -> AppState {
    let pool = create_test_db().await;

    let trust = TrustStore::open(
        pool.clone(),
        Arc::new(LocalIam::new()),
        "test-passphrase",
        "orchestrate-main",
        OPERATOR_KEY,
    )
    .await
    .expect("Failed to open trust store");

    AppState::new(WorkflowEngine::new(pool, policy), Arc::new(trust))
}

pub fn create_test_app(state: AppState) -> Router {
    orchestrate_api::create_app(state)
}

/// Fixture: register a project and return its API key
pub async fn fixture_project(state: &AppState, project_id: &str) -> String {
    state
        .trust
        .register(project_id)
        .await
        .expect("Failed to register fixture project")
        .api_key
        .expect("First registration returns a key")
}

pub fn image_request(project_id: &str) -> SubmitRequest {
    SubmitRequest {
        kind: RequestKind::Image,
        target_project: project_id.to_string(),
        parameters: json!({
            "name": "studio-base",
            "zone": "us-central1-a",
            "image_project": "windows-cloud",
            "image_family": "windows-2019",
            "network": "workstations",
            "os_type": "Windows",
            "disk_size": 200
        }),
    }
}

/// Helper to extract JSON body from axum response
pub async fn extract_json_body<T>(response: axum::response::Response) -> T
where
    T: serde::de::DeserializeOwned,
{
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("Failed to read response body");

    serde_json::from_slice(&body).expect("Failed to deserialize JSON")
}

pub fn auth_headers(api_key: &str) -> Vec<(&'static str, &str)> {
    vec![("x-api-key", api_key)]
}

/// TestClient to encapsulate API interaction logic
pub struct TestClient {
    pub app: Router,
    pub state: AppState,
}

impl TestClient {
    pub async fn new() -> Self {
        Self::with_state(create_test_state().await)
    }

    pub fn with_state(state: AppState) -> Self {
        Self {
            app: create_test_app(state.clone()),
            state,
        }
    }

    pub async fn send_request(
        &self,
        request: Request<Body>,
    ) -> axum::http::Response<Body> {
        use tower::ServiceExt;
        self.app.clone().oneshot(request).await.unwrap()
    }

    fn builder(method: &str, uri: &str, headers: Option<Vec<(&str, &str)>>) -> axum::http::request::Builder {
        let mut builder = Request::builder().method(method).uri(uri);

        if let Some(h) = headers {
            for (k, v) in h {
                builder = builder.header(k, v);
            }
        }

        builder
    }

    /// Post JSON to an endpoint
    pub async fn post<T: serde::Serialize>(
        &self,
        uri: &str,
        body: &T,
        headers: Option<Vec<(&str, &str)>>,
    ) -> axum::http::Response<Body> {
        let req_body = serde_json::to_string(body).expect("Failed to serialize request body");
        let request = Self::builder("POST", uri, headers)
            .header("content-type", "application/json")
            .body(Body::from(req_body))
            .unwrap();
        self.send_request(request).await
    }

    /// Post a body verbatim, for payloads that are not valid JSON
    pub async fn post_raw(
        &self,
        uri: &str,
        body: &str,
        headers: Option<Vec<(&str, &str)>>,
    ) -> axum::http::Response<Body> {
        let request = Self::builder("POST", uri, headers)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        self.send_request(request).await
    }

    pub async fn get(
        &self,
        uri: &str,
        headers: Option<Vec<(&str, &str)>>,
    ) -> axum::http::Response<Body> {
        let request = Self::builder("GET", uri, headers)
            .body(Body::empty())
            .unwrap();
        self.send_request(request).await
    }

    pub async fn delete(
        &self,
        uri: &str,
        headers: Option<Vec<(&str, &str)>>,
    ) -> axum::http::Response<Body> {
        let request = Self::builder("DELETE", uri, headers)
            .body(Body::empty())
            .unwrap();
        self.send_request(request).await
    }
}
