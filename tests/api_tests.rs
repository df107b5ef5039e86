use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

use gridx::api::{self, ApiState};
use gridx::db;
use gridx::ledger::{Credits, Ledger};
use gridx::registry::WorkerRegistry;
use gridx::scheduler::{DispatchSignal, Scheduler};
use gridx::store::JobStore;

struct TestApi {
    app: Router,
    ledger: Ledger,
    store: JobStore,
    // Keeps the signal channel open so enqueue succeeds.
    _signal_rx: tokio::sync::mpsc::UnboundedReceiver<DispatchSignal>,
}

async fn test_api_with(initial_credits: f64) -> TestApi {
    let pool = db::connect_memory().await.unwrap();
    let ledger = Ledger::new(pool.clone(), initial_credits);
    let store = JobStore::new(pool);
    let registry = Arc::new(WorkerRegistry::new());
    let (scheduler, signal_rx) = Scheduler::new(
        store.clone(),
        ledger.clone(),
        Arc::clone(&registry),
        0.8,
        3,
        Duration::from_secs(1),
        64 * 1024,
    );
    let app = api::router(ApiState {
        ledger: ledger.clone(),
        store: store.clone(),
        registry,
        scheduler,
        job_cost: Credits::from_f64(1.0),
        max_code_bytes: 1024,
        default_timeout_s: 300,
    });
    TestApi {
        app,
        ledger,
        store,
        _signal_rx: signal_rx,
    }
}

async fn test_api() -> TestApi {
    test_api_with(100.0).await
}

async fn post_json(app: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(
            Request::post(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

async fn get(app: &Router, uri: &str) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(Request::get(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

fn submit_body(submitter: &str, code: &str) -> Value {
    json!({ "submitter": submitter, "code": code, "language": "python" })
}

#[tokio::test]
async fn health_reports_healthy() {
    let api = test_api().await;
    let (status, body) = get(&api.app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn submit_then_fetch_round_trips() {
    let api = test_api().await;
    let (status, body) = post_json(&api.app, "/jobs", submit_body("alice", "print(2+2)")).await;
    assert_eq!(status, StatusCode::CREATED);
    let job_id = body["job_id"].as_str().unwrap().to_string();

    let (status, body) = get(&api.app, &format!("/jobs/{job_id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], job_id.as_str());
    assert_eq!(body["state"], "queued");
    assert_eq!(body["submitter"], "alice");

    // Submission charged the account.
    assert_eq!(
        api.ledger.balance("alice").await.unwrap().unwrap(),
        Credits::from_f64(99.0)
    );
}

#[tokio::test]
async fn validation_failures_are_400() {
    let api = test_api().await;

    let (status, body) = post_json(&api.app, "/jobs", submit_body("alice", "")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_input");

    let (status, _) = post_json(
        &api.app,
        "/jobs",
        json!({ "submitter": "alice", "code": "x", "language": "cobol" }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = post_json(&api.app, "/jobs", submit_body("bad submitter!", "x")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Over the configured code cap (1 KiB in this harness).
    let (status, _) = post_json(&api.app, "/jobs", submit_body("alice", &"x".repeat(2048))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn insufficient_credits_is_402_with_no_job_record() {
    let api = test_api_with(0.5).await;
    let (status, body) = post_json(&api.app, "/jobs", submit_body("alice", "print(1)")).await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body["code"], "insufficient_credits");

    // Balance unchanged, nothing persisted.
    assert_eq!(
        api.ledger.balance("alice").await.unwrap().unwrap(),
        Credits::from_f64(0.5)
    );
    assert!(api
        .store
        .list_by_submitter("alice", 50)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn job_lookup_errors() {
    let api = test_api().await;

    let (status, body) = get(&api.app, "/jobs/not-a-uuid").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_input");

    let (status, body) = get(&api.app, &format!("/jobs/{}", Uuid::new_v4())).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "not_found");
}

#[tokio::test]
async fn credits_endpoint_creates_account_with_starting_balance() {
    let api = test_api().await;
    let (status, body) = get(&api.app, "/credits/alice").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["account_id"], "alice");
    assert_eq!(body["balance"], 100.0);

    let (status, _) = get(&api.app, "/credits/bad%20id").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn list_jobs_is_scoped_to_submitter() {
    let api = test_api().await;
    post_json(&api.app, "/jobs", submit_body("alice", "print(1)")).await;
    post_json(&api.app, "/jobs", submit_body("alice", "print(2)")).await;
    post_json(&api.app, "/jobs", submit_body("bob", "print(3)")).await;

    let (status, body) = get(&api.app, "/jobs?submitter=alice").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 2);

    let (status, _) = get(&api.app, "/jobs").await;
    // submitter is required.
    assert_ne!(status, StatusCode::OK);
}

#[tokio::test]
async fn workers_endpoint_shape() {
    let api = test_api().await;
    let (status, body) = get(&api.app, "/workers").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["workers"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn cancel_is_queued_only() {
    let api = test_api().await;
    let (_, body) = post_json(&api.app, "/jobs", submit_body("alice", "print(1)")).await;
    let job_id = body["job_id"].as_str().unwrap().to_string();

    let (status, body) = post_json(&api.app, &format!("/jobs/{job_id}/cancel"), json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "cancelled");

    // Cancelling a terminal job is rejected.
    let (status, _) = post_json(&api.app, &format!("/jobs/{job_id}/cancel"), json!({})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = post_json(
        &api.app,
        &format!("/jobs/{}/cancel", Uuid::new_v4()),
        json!({}),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn status_endpoint_counts() {
    let api = test_api().await;
    post_json(&api.app, "/jobs", submit_body("alice", "print(1)")).await;

    let (status, body) = get(&api.app, "/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["workers"]["total"], 0);
    assert_eq!(body["queue_size"], 1);
    assert_eq!(body["jobs"]["queued"], 1);
}
