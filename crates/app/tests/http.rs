mod common;

use app::server::router;
use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use common::fake_broker;
use serde_json::{Value, json};
use tower::ServiceExt;

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, headers, body)
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn delete(uri: &str) -> Request<Body> {
    Request::builder()
        .method("DELETE")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn healthz_reports_healthy() {
    let (broker, _provider) = fake_broker(1);
    let app = router(broker, 8);
    let (status, headers, body) = send(&app, get("/healthz")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"status": "healthy"}));
    assert_eq!(headers[header::CACHE_CONTROL], "no-store");
}

#[tokio::test]
async fn run_returns_the_structured_outcome() {
    let (broker, _provider) = fake_broker(1);
    let app = router(broker, 8);
    let (status, _, body) = send(
        &app,
        post(
            "/v1/code_interpreter/run",
            json!({"code": "cat a.txt", "language": "fake", "files": {"a.txt": "2\n"}}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["output"], "2\n");
    assert_eq!(body["error"], "");
    assert_eq!(body["exit_code"], 0);
    assert!(body["execution_id"].as_str().is_some());
    assert!(body["duration_ms"].as_u64().is_some());
    assert!(body.get("session_id").is_none());
    assert!(body.get("failure").is_none());
}

#[tokio::test]
async fn unsupported_language_is_a_bad_request() {
    let (broker, _provider) = fake_broker(1);
    let app = router(broker, 8);
    let (status, _, body) = send(
        &app,
        post(
            "/v1/code_interpreter/run",
            json!({"code": "x", "language": "cobol"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["type"], "unsupported_language");
    assert_eq!(body["error"]["message"], "unsupported language: cobol");
}

#[tokio::test]
async fn malformed_payload_uses_the_error_envelope() {
    let (broker, _provider) = fake_broker(1);
    let app = router(broker, 8);
    let (status, _, body) = send(
        &app,
        post("/v1/code_interpreter/run", json!({"language": "fake"})),
    )
    .await;
    assert!(status.is_client_error());
    assert_eq!(body["error"]["type"], "invalid_request_error");
}

#[tokio::test]
async fn timeout_is_a_successful_response() {
    let (broker, _provider) = fake_broker(1);
    let app = router(broker, 8);
    let (status, _, body) = send(
        &app,
        post(
            "/v1/code_interpreter/run",
            json!({"code": "hang", "language": "fake", "timeout": 1}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["failure"], "timeout");
    assert_eq!(body["exit_code"], -1);
    assert_eq!(body["error"], "Execution timed out");
}

#[tokio::test]
async fn infrastructure_failure_is_a_bad_gateway() {
    let (broker, _provider) = fake_broker(1);
    let app = router(broker, 8);
    let (status, _, body) = send(
        &app,
        post(
            "/v1/code_interpreter/run",
            json!({"code": "fail", "language": "fake"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["failure"], "infrastructure");
}

#[tokio::test]
async fn session_lifecycle_over_http() {
    let (broker, _provider) = fake_broker(2);
    let app = router(broker, 8);

    let (status, _, created) = send(
        &app,
        post(
            "/v1/code_interpreter/sessions",
            json!({"language": "fake", "user_id": "alice"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let session_id = created["session_id"].as_str().unwrap().to_owned();
    assert_eq!(created["language"], "fake");

    let (status, _, body) = send(
        &app,
        post(
            "/v1/code_interpreter/run",
            json!({"code": "ls", "language": "fake", "session_id": session_id, "files": {"x.txt": "1"}}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["output"], "x.txt");
    assert_eq!(body["session_id"], session_id.as_str());

    let (status, _, listed) = send(&app, get("/v1/code_interpreter/sessions?user_id=alice")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed.as_array().unwrap().len(), 1);
    assert_eq!(listed[0]["session_id"], session_id.as_str());

    let uri = format!("/v1/code_interpreter/sessions/{session_id}");
    let (status, _, info) = send(&app, get(&uri)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(info["user_id"], "alice");

    let (status, _, ended) = send(&app, delete(&uri)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ended["success"], true);

    let (status, _, body) = send(&app, delete(&uri)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["type"], "session_not_found");

    let (status, _, _) = send(
        &app,
        post(
            "/v1/code_interpreter/run",
            json!({"code": "ls", "language": "fake", "session_id": session_id}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn listing_sessions_requires_a_user() {
    let (broker, _provider) = fake_broker(1);
    let app = router(broker, 8);
    let (status, _, body) = send(&app, get("/v1/code_interpreter/sessions")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["type"], "invalid_request_error");
}

#[tokio::test]
async fn exhausted_capacity_is_retryable() {
    let (broker, _provider) = fake_broker(1);
    let app = router(broker, 8);
    let (status, _, _) = send(
        &app,
        post(
            "/v1/code_interpreter/sessions",
            json!({"language": "fake", "user_id": "alice"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, headers, body) = send(
        &app,
        post(
            "/v1/code_interpreter/run",
            json!({"code": "hello", "language": "fake"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(headers[header::RETRY_AFTER], "1");
    assert_eq!(body["error"]["type"], "capacity_exhausted");
}

#[tokio::test]
async fn pool_stats_are_exposed() {
    let (broker, _provider) = fake_broker(3);
    broker.pool().warm("fake", 2).await;
    let app = router(broker, 8);
    let (status, _, body) = send(&app, get("/v1/pool")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["capacity"], 3);
    assert_eq!(body["idle"]["fake"], 2);
    assert_eq!(body["total"], 2);
    assert_eq!(body["draining"], false);
}
