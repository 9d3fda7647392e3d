/*
 * Meeting Pipeline - Ingest Daemon Integration Tests
 * Copyright (c) 2025 Meeting Pipeline Contributors
 *
 * This work is licensed under the Creative Commons Attribution-NonCommercial 4.0 International License.
 * To view a copy of this license, visit http://creativecommons.org/licenses/by-nc/4.0/
 *
 * You are free to share and adapt this work for non-commercial purposes with attribution.
 * Commercial use is prohibited without explicit written permission.
 *
 * For commercial licensing inquiries, please contact the project maintainers.
 */

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use tower::ServiceExt;

use meeting_pipeline::config::DaemonConfig;
use meeting_pipeline::ingest::{router, DaemonState, MAX_CALENDAR_SIZE, MAX_TRANSCRIPT_SIZE};
use meeting_pipeline::workspace::Workspace;

/// A daemon over a plain directory: git and sync disabled, so the
/// handlers only exercise validation, header injection and file writes.
fn app_for(dir: &Path) -> Router {
    let mut config = DaemonConfig::default();
    config.data_repo = Some(dir.to_string_lossy().into_owned());
    let workspace = Arc::new(Workspace::new(config));
    router(Arc::new(DaemonState { workspace }))
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

fn json_post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn health_reports_configuration() {
    let tmp = tempfile::tempdir().unwrap();
    let request = Request::builder()
        .method("GET")
        .uri("/")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(app_for(tmp.path()), request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["service"], "meetingnotesd");
    assert_eq!(body["processing_mode"], "relay");
    assert_eq!(body["sync"]["enabled"], false);
}

#[tokio::test]
async fn webhook_writes_inbox_file_with_injected_header() {
    let tmp = tempfile::tempdir().unwrap();
    let request = json_post(
        "/webhook",
        json!({"title": "Design Review", "transcript": "We should ship."}),
    );
    let (status, body) = send(app_for(tmp.path()), request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "success");
    let filename = body["filename"].as_str().unwrap();
    assert!(filename.ends_with("-design-review.txt"), "{}", filename);
    assert_eq!(body["git"]["enabled"], false);

    let path = tmp.path().join("inbox").join(filename);
    let content = std::fs::read_to_string(path).unwrap();
    assert!(content.starts_with("---\n"));
    assert!(content.contains("recording_source: macwhisper"));
    assert!(content.contains("received_at: "));
    assert!(content.ends_with("We should ship."));
}

#[tokio::test]
async fn webhook_preserves_existing_front_matter() {
    let tmp = tempfile::tempdir().unwrap();
    let transcript = "---\nmeeting_start: 2026-02-05T14:00:00-08:00\nmeeting_end: 2026-02-05T15:03:00-08:00\nrecording_source: transcriber\n---\n\nWe should ship.";
    let request = json_post(
        "/webhook",
        json!({"title": "Design Review", "transcript": transcript}),
    );
    let (status, body) = send(app_for(tmp.path()), request).await;

    assert_eq!(status, StatusCode::OK);
    let filename = body["filename"].as_str().unwrap();
    let content = std::fs::read_to_string(tmp.path().join("inbox").join(filename)).unwrap();
    // The appliance's header is taken as-is; nothing is re-injected.
    assert_eq!(content, transcript);
}

#[tokio::test]
async fn webhook_transcript_size_boundary() {
    let tmp = tempfile::tempdir().unwrap();

    // A transcript that already carries a header is not modified, so its
    // size on disk equals its payload size.
    let prefix = "---\nrecording_source: transcriber\n---\n";
    let at_limit = format!("{}{}", prefix, "x".repeat(MAX_TRANSCRIPT_SIZE - prefix.len()));
    assert_eq!(at_limit.len(), MAX_TRANSCRIPT_SIZE);

    let request = json_post("/webhook", json!({"title": "Big", "transcript": at_limit}));
    let (status, _) = send(app_for(tmp.path()), request).await;
    assert_eq!(status, StatusCode::OK);

    let over = format!(
        "{}{}",
        prefix,
        "x".repeat(MAX_TRANSCRIPT_SIZE - prefix.len() + 1)
    );
    let request = json_post("/webhook", json!({"title": "Too Big", "transcript": over}));
    let (status, body) = send(app_for(tmp.path()), request).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert!(body["message"].as_str().unwrap().contains("too large"));
}

#[tokio::test]
async fn webhook_rejects_wrong_content_type() {
    let tmp = tempfile::tempdir().unwrap();
    let request = Request::builder()
        .method("POST")
        .uri("/webhook")
        .header(header::CONTENT_TYPE, "text/plain")
        .body(Body::from("hello"))
        .unwrap();
    let (status, body) = send(app_for(tmp.path()), request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["message"]
        .as_str()
        .unwrap()
        .contains("application/json"));
}

#[tokio::test]
async fn webhook_rejects_missing_fields() {
    let tmp = tempfile::tempdir().unwrap();
    let request = json_post("/webhook", json!({"transcript": "body"}));
    let (status, body) = send(app_for(tmp.path()), request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["message"].as_str().unwrap().contains("'title'"));
}

#[tokio::test]
async fn concurrent_webhooks_get_distinct_filenames() {
    let tmp = tempfile::tempdir().unwrap();
    let app = app_for(tmp.path());

    let first = send(
        app.clone(),
        json_post("/webhook", json!({"title": "Race", "transcript": "one"})),
    );
    let second = send(
        app.clone(),
        json_post("/webhook", json!({"title": "Race", "transcript": "two"})),
    );
    let ((status_a, body_a), (status_b, body_b)) = tokio::join!(first, second);

    assert_eq!(status_a, StatusCode::OK);
    assert_eq!(status_b, StatusCode::OK);
    let name_a = body_a["filename"].as_str().unwrap();
    let name_b = body_b["filename"].as_str().unwrap();
    assert_ne!(name_a, name_b);
    assert!(tmp.path().join("inbox").join(name_a).exists());
    assert!(tmp.path().join("inbox").join(name_b).exists());
}

#[tokio::test]
async fn calendar_accepts_plain_text() {
    let tmp = tempfile::tempdir().unwrap();
    let request = Request::builder()
        .method("POST")
        .uri("/calendar")
        .header(header::CONTENT_TYPE, "text/plain")
        .body(Body::from("* Meeting <2026-01-22 Thu 10:00-11:00>"))
        .unwrap();
    let (status, body) = send(app_for(tmp.path()), request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "success");
    let content = std::fs::read_to_string(tmp.path().join("calendar.org")).unwrap();
    assert!(content.starts_with("* Meeting"));
}

#[tokio::test]
async fn calendar_accepts_json_field() {
    let tmp = tempfile::tempdir().unwrap();
    let request = json_post(
        "/calendar",
        json!({"calendar": "* Meeting <2026-01-22 Thu 10:00-11:00>"}),
    );
    let (status, body) = send(app_for(tmp.path()), request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["size"], 38);
}

#[tokio::test]
async fn calendar_size_boundary() {
    let tmp = tempfile::tempdir().unwrap();

    let at_limit = "x".repeat(MAX_CALENDAR_SIZE);
    let request = Request::builder()
        .method("POST")
        .uri("/calendar")
        .header(header::CONTENT_TYPE, "text/plain")
        .body(Body::from(at_limit))
        .unwrap();
    let (status, _) = send(app_for(tmp.path()), request).await;
    assert_eq!(status, StatusCode::OK);

    let over = "x".repeat(MAX_CALENDAR_SIZE + 1);
    let request = Request::builder()
        .method("POST")
        .uri("/calendar")
        .header(header::CONTENT_TYPE, "text/plain")
        .body(Body::from(over))
        .unwrap();
    let (status, _) = send(app_for(tmp.path()), request).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn calendar_rejects_empty_body() {
    let tmp = tempfile::tempdir().unwrap();
    let request = Request::builder()
        .method("POST")
        .uri("/calendar")
        .header(header::CONTENT_TYPE, "text/plain")
        .body(Body::from("   \n"))
        .unwrap();
    let (status, body) = send(app_for(tmp.path()), request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["message"].as_str().unwrap().contains("empty"));
}
