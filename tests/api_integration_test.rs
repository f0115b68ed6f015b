mod common;

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode},
};
use common::{harness, split};
use http_body_util::BodyExt;
use page_intake::config::IntakeConfig;
use page_intake::test_support::{PagePattern, page_png};
use page_intake::utils::hash::calculate_hash;
use page_intake::{AppState, create_app};
use serde_json::{Value, json};
use tower::ServiceExt;

fn app(h: &common::Harness) -> Router {
    create_app(AppState {
        intake: h.intake.clone(),
        config: IntakeConfig::development(),
    })
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap()
    };
    (status, json)
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("Content-Type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn empty_request(method: &str, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

fn chunk_request(uri: &str, total: u32, payload: &[u8], name: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("PUT")
        .uri(uri)
        .header("Content-Type", "application/octet-stream")
        .header("x-total-chunks", total.to_string())
        .header("x-chunk-checksum", calculate_hash(payload));
    if let Some(name) = name {
        builder = builder
            .header("x-file-name", name)
            .header("x-content-type", "image/png");
    }
    builder.body(Body::from(payload.to_vec())).unwrap()
}

#[tokio::test]
async fn test_upload_flow_over_http() {
    let h = harness();
    let app = app(&h);

    // 1. Open a session
    let (status, body) = send(
        &app,
        json_request(
            "POST",
            "/sessions",
            json!({ "owner_id": "scanner-7", "collection_ref": "atlas" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let sid = body["session_id"].as_str().unwrap().to_string();
    assert!(body["recommended_chunk_size"].as_u64().unwrap() > 0);

    // 2. Declare the file
    let data = page_png(PagePattern::Checkerboard);
    let (status, body) = send(
        &app,
        json_request(
            "POST",
            &format!("/sessions/{}/files/p1", sid),
            json!({ "total_size": data.len(), "total_chunks": 3 }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "pending");

    // 3. Send chunks out of order, one twice
    let pieces = split(&data, 3);
    let chunk_uri = |i: usize| format!("/sessions/{}/files/p1/chunks/{}", sid, i);
    let (status, body) = send(&app, chunk_request(&chunk_uri(2), 3, &pieces[2], Some("p1.png"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["received"], json!([2]));
    let (status, again) = send(&app, chunk_request(&chunk_uri(2), 3, &pieces[2], None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(again, body);

    let (status, body) = send(
        &app,
        empty_request("GET", &format!("/sessions/{}/files/p1/missing", sid)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["missing"], json!([0, 1]));

    for i in [0, 1] {
        let (status, _) = send(&app, chunk_request(&chunk_uri(i), 3, &pieces[i], None)).await;
        assert_eq!(status, StatusCode::OK);
    }

    // 4. Finalize and read the verdict back
    let (status, body) = send(
        &app,
        empty_request("POST", &format!("/sessions/{}/finalize", sid)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "completed");
    assert_eq!(body["files"][0]["verdict"], "accepted");

    let (status, body) = send(&app, empty_request("GET", &format!("/sessions/{}", sid))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["files"][0]["status"], "accepted");
    assert_eq!(body["files"][0]["content_digest"], calculate_hash(&data));
}

#[tokio::test]
async fn test_chunk_errors_map_to_status_codes() {
    let h = harness();
    let app = app(&h);
    let (_, body) = send(
        &app,
        json_request(
            "POST",
            "/sessions",
            json!({ "owner_id": "scanner-7", "collection_ref": "atlas" }),
        ),
    )
    .await;
    let sid = body["session_id"].as_str().unwrap().to_string();
    let uri = |i: u32| format!("/sessions/{}/files/p1/chunks/{}", sid, i);

    // Index past the end
    let (status, body) = send(&app, chunk_request(&uri(5), 3, b"abc", None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "OUT_OF_RANGE");

    // Checksum that does not match the payload
    let mut request = chunk_request(&uri(0), 3, b"abc", None);
    request
        .headers_mut()
        .insert("x-chunk-checksum", calculate_hash(b"xyz").parse().unwrap());
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "CHECKSUM_MISMATCH");
    assert_eq!(body["details"]["index"], 0);

    // Missing required header
    let request = Request::builder()
        .method("PUT")
        .uri(uri(0))
        .body(Body::from("abc"))
        .unwrap();
    let (status, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Unknown and malformed sessions
    let (status, body) = send(
        &app,
        empty_request("GET", &format!("/sessions/{}", uuid::Uuid::new_v4())),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "SESSION_NOT_FOUND");
    let (status, _) = send(&app, empty_request("GET", "/sessions/not-a-uuid")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Cancel, then uploads are refused
    let (status, body) = send(&app, empty_request("DELETE", &format!("/sessions/{}", sid))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "cancelled");
    let (status, body) = send(&app, chunk_request(&uri(0), 3, b"abc", None)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "SESSION_CLOSED");
}

#[tokio::test]
async fn test_health_reports_storage() {
    let h = harness();
    let app = app(&h);

    let response = app
        .clone()
        .oneshot(empty_request("GET", "/health"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));

    h.blobs.set_available(false);
    let (status, body) = send(&app, empty_request("GET", "/health")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["storage"], "unavailable");

    let (status, body) = send(
        &app,
        json_request(
            "POST",
            "/sessions",
            json!({ "owner_id": "scanner-7", "collection_ref": "atlas" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["code"], "STORAGE_UNAVAILABLE");
}

#[tokio::test]
async fn test_request_id_is_echoed() {
    let h = harness();
    let app = app(&h);
    let request = Request::builder()
        .uri("/health")
        .header("x-request-id", "scan-batch-42")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.headers()["x-request-id"], "scan-batch-42");
}
