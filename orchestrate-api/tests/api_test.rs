//! Integration tests for the request endpoints

mod common;

use axum::http::StatusCode;
use common::{auth_headers, fixture_project, image_request, TestClient, OPERATOR_KEY};
use orchestrate_engine::{
    CancelOutcome, CancelResult, RequestState, RequestStatus, Stage, StageEvent, Transition,
};
use serde_json::{json, Value};

#[tokio::test]
async fn test_health_endpoints_need_no_auth() {
    let client = TestClient::new().await;

    let response = client.get("/health", None).await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = client.get("/health/ready", None).await;
    let body: Value = common::extract_json_body(response).await;
    assert_eq!(body["status"], "ready");
    assert_eq!(body["database"], "connected");
}

#[tokio::test]
async fn test_openapi_document() {
    let client = TestClient::new().await;

    let response = client.get("/api-docs/openapi.json", None).await;
    assert_eq!(response.status(), StatusCode::OK);

    let doc: Value = common::extract_json_body(response).await;
    assert!(doc["paths"]["/api/v1/requests"].is_object());
    assert!(doc["paths"]["/api/v1/projects/{id}/keys"].is_object());
}

#[tokio::test]
async fn test_submit_request_returns_immediately() {
    let client = TestClient::new().await;
    let key = fixture_project(&client.state, "tenant-p1").await;

    let response = client
        .post("/api/v1/requests", &image_request("tenant-p1"), Some(auth_headers(&key)))
        .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let status: RequestStatus = common::extract_json_body(response).await;
    assert_eq!(status.state, RequestState::StartDispatched);
    assert_eq!(status.stage, Some(Stage::Start));
    assert_eq!(status.attempt, 1);
    assert!(!status.terminal);

    let response = client
        .get(
            &format!("/api/v1/requests/{}", status.request_id),
            Some(auth_headers(&key)),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let fetched: RequestStatus = common::extract_json_body(response).await;
    assert_eq!(fetched.request_id, status.request_id);
}

#[tokio::test]
async fn test_submit_invalid_parameters() {
    let client = TestClient::new().await;
    let key = fixture_project(&client.state, "tenant-p1").await;

    let mut req = image_request("tenant-p1");
    req.parameters = json!({"name": "studio-base"});

    let response = client
        .post("/api/v1/requests", &req, Some(auth_headers(&key)))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let body: Value = common::extract_json_body(response).await;
    assert_eq!(body["code"], "invalid_parameters");
}

#[tokio::test]
async fn test_malformed_bodies_use_error_envelope() {
    let client = TestClient::new().await;
    let key = fixture_project(&client.state, "tenant-p1").await;

    let response = client
        .post_raw("/api/v1/requests", "{\"kind\": ", Some(auth_headers(&key)))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = common::extract_json_body(response).await;
    assert_eq!(body["code"], "invalid_parameters");

    // Well-formed JSON missing required fields
    let response = client
        .post(
            "/api/v1/requests",
            &json!({"kind": "image"}),
            Some(auth_headers(&key)),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = common::extract_json_body(response).await;
    assert_eq!(body["code"], "invalid_parameters");

    let response = client
        .post_raw("/api/v1/projects", "not json", Some(auth_headers(OPERATOR_KEY)))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = common::extract_json_body(response).await;
    assert_eq!(body["code"], "invalid_parameters");
}

#[tokio::test]
async fn test_submit_to_unregistered_project() {
    let client = TestClient::new().await;

    let response = client
        .post(
            "/api/v1/requests",
            &image_request("tenant-p9"),
            Some(auth_headers(OPERATOR_KEY)),
        )
        .await;
    assert_eq!(response.status(), StatusCode::PRECONDITION_FAILED);

    let body: Value = common::extract_json_body(response).await;
    assert_eq!(body["code"], "not_registered");
}

#[tokio::test]
async fn test_tenant_cannot_submit_to_other_project() {
    let client = TestClient::new().await;
    let p1_key = fixture_project(&client.state, "tenant-p1").await;
    fixture_project(&client.state, "tenant-p2").await;

    let response = client
        .post(
            "/api/v1/requests",
            &image_request("tenant-p2"),
            Some(auth_headers(&p1_key)),
        )
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let body: Value = common::extract_json_body(response).await;
    assert_eq!(body["code"], "permission_denied");
}

#[tokio::test]
async fn test_tenant_cannot_read_other_projects_request() {
    let client = TestClient::new().await;
    fixture_project(&client.state, "tenant-p1").await;
    let p2_key = fixture_project(&client.state, "tenant-p2").await;
    let request = client
        .state
        .engine
        .submit(image_request("tenant-p1"))
        .await
        .unwrap();

    let response = client
        .get(
            &format!("/api/v1/requests/{}", request.id),
            Some(auth_headers(&p2_key)),
        )
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = client
        .post(
            &format!("/api/v1/requests/{}/cancel", request.id),
            &json!({}),
            Some(auth_headers(&p2_key)),
        )
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_get_unknown_request() {
    let client = TestClient::new().await;

    let response = client
        .get("/api/v1/requests/missing", Some(auth_headers(OPERATOR_KEY)))
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let body: Value = common::extract_json_body(response).await;
    assert_eq!(body["code"], "not_found");
}

#[tokio::test]
async fn test_list_requests_is_scoped_to_caller() {
    let client = TestClient::new().await;
    let p1_key = fixture_project(&client.state, "tenant-p1").await;
    fixture_project(&client.state, "tenant-p2").await;
    for project in ["tenant-p1", "tenant-p1", "tenant-p2"] {
        client
            .state
            .engine
            .submit(image_request(project))
            .await
            .unwrap();
    }

    let response = client
        .get("/api/v1/requests", Some(auth_headers(&p1_key)))
        .await;
    let own: Vec<RequestStatus> = common::extract_json_body(response).await;
    assert_eq!(own.len(), 2);
    assert!(own.iter().all(|r| r.target_project == "tenant-p1"));

    let response = client
        .get(
            "/api/v1/requests?target_project=tenant-p2",
            Some(auth_headers(&p1_key)),
        )
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = client
        .get("/api/v1/requests", Some(auth_headers(OPERATOR_KEY)))
        .await;
    let all: Vec<RequestStatus> = common::extract_json_body(response).await;
    assert_eq!(all.len(), 3);

    let response = client
        .get(
            "/api/v1/requests?state=start_dispatched&kind=image",
            Some(auth_headers(OPERATOR_KEY)),
        )
        .await;
    let filtered: Vec<RequestStatus> = common::extract_json_body(response).await;
    assert_eq!(filtered.len(), 3);
}

#[tokio::test]
async fn test_cancel_request() {
    let client = TestClient::new().await;
    let key = fixture_project(&client.state, "tenant-p1").await;
    let request = client
        .state
        .engine
        .submit(image_request("tenant-p1"))
        .await
        .unwrap();

    let response = client
        .post(
            &format!("/api/v1/requests/{}/cancel", request.id),
            &json!({}),
            Some(auth_headers(&key)),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let outcome: CancelOutcome = common::extract_json_body(response).await;
    assert_eq!(outcome.outcome, CancelResult::Cancelling);
    assert_eq!(outcome.state, RequestState::Cancelling);

    // The in-flight start stage fails: the cancellation takes effect
    client
        .state
        .engine
        .apply_event(&StageEvent::failed(
            &request.id,
            Stage::Start,
            1,
            &orchestrate_engine::StageError::new(
                orchestrate_engine::ErrorCode::StageFailed,
                "zone exhausted",
            ),
        ))
        .await
        .unwrap();

    let response = client
        .get(
            &format!("/api/v1/requests/{}", request.id),
            Some(auth_headers(&key)),
        )
        .await;
    let status: RequestStatus = common::extract_json_body(response).await;
    assert_eq!(status.state, RequestState::Cancelled);
    assert!(status.terminal);
}

#[tokio::test]
async fn test_cancel_after_end_dispatched_is_ineffective() {
    let client = TestClient::new().await;
    let key = fixture_project(&client.state, "tenant-p1").await;
    let engine = &client.state.engine;
    let request = engine.submit(image_request("tenant-p1")).await.unwrap();
    engine
        .apply_event(&StageEvent::succeeded(&request.id, Stage::Start, 1, json!({})))
        .await
        .unwrap();

    let response = client
        .post(
            &format!("/api/v1/requests/{}/cancel", request.id),
            &json!({}),
            Some(auth_headers(&key)),
        )
        .await;
    let outcome: CancelOutcome = common::extract_json_body(response).await;
    assert_eq!(outcome.outcome, CancelResult::Ineffective);
    assert_eq!(outcome.state, RequestState::EndDispatched);

    let response = client
        .get(
            &format!("/api/v1/requests/{}", request.id),
            Some(auth_headers(&key)),
        )
        .await;
    let status: Value = common::extract_json_body(response).await;
    assert_eq!(status["cancellation"], "ineffective");
}

#[tokio::test]
async fn test_request_transitions() {
    let client = TestClient::new().await;
    let key = fixture_project(&client.state, "tenant-p1").await;
    let request = client
        .state
        .engine
        .submit(image_request("tenant-p1"))
        .await
        .unwrap();

    let response = client
        .get(
            &format!("/api/v1/requests/{}/transitions", request.id),
            Some(auth_headers(&key)),
        )
        .await;
    let transitions: Vec<Transition> = common::extract_json_body(response).await;

    let states: Vec<RequestState> = transitions.iter().map(|t| t.to_state).collect();
    assert_eq!(
        states,
        vec![RequestState::Pending, RequestState::StartDispatched]
    );
}
